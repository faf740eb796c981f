use crate::value::PropValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub const TEXT_TAG: &str = "#text";
pub const FRAGMENT_TAG: &str = "#fragment";
pub const NULL_NODE_TAG: &str = "null-node";
pub const TEXT_NODE_TAG: &str = "text-node";

pub type Props = BTreeMap<String, PropValue>;

/// One element as described by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDomElem {
    #[serde(rename = "waveid", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Props>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<VDomElem>>,
}

impl VDomElem {
    pub fn new(id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tag: tag.into(),
            text: None,
            props: None,
            children: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: Some(content.into()),
            ..Self::new("", TEXT_TAG)
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: PropValue) -> Self {
        self.props
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_child(mut self, child: VDomElem) -> Self {
        self.children.get_or_insert_with(Vec::new).push(child);
        self
    }
}

/// Flat wire form of an element: children are named by id and resolved
/// against the rest of the update's transfer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VDomTransferElem {
    #[serde(rename = "waveid", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Props>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Transfer elements of one update, keyed by id. A later element with the
/// same id replaces an earlier one.
#[derive(Debug, Default)]
pub struct TransferElemSet {
    by_id: HashMap<String, VDomTransferElem>,
}

impl TransferElemSet {
    pub fn new(elems: Vec<VDomTransferElem>) -> Self {
        let by_id = elems
            .into_iter()
            .map(|elem| (elem.id.clone(), elem))
            .collect();
        Self { by_id }
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Rebuilds the nested element named `id`. Text elements lose their
    /// placeholder ids.
    pub fn materialize(&self, id: &str) -> Result<VDomElem, String> {
        let mut path = Vec::new();
        self.materialize_at(id, &mut path)
    }

    fn materialize_at(&self, id: &str, path: &mut Vec<String>) -> Result<VDomElem, String> {
        if path.iter().any(|seen| seen == id) {
            return Err(format!("transfer element '{id}' contains itself"));
        }
        let elem = self
            .by_id
            .get(id)
            .ok_or_else(|| format!("transfer element '{id}' not found"))?;

        path.push(id.to_string());
        let children = elem
            .children
            .iter()
            .map(|child| self.materialize_at(child, path))
            .collect::<Result<Vec<_>, _>>();
        path.pop();
        let children = children?;

        let is_text = elem.tag == TEXT_TAG;
        Ok(VDomElem {
            id: if is_text { String::new() } else { elem.id.clone() },
            tag: elem.tag.clone(),
            text: elem.text.clone(),
            props: elem.props.clone(),
            children: (!children.is_empty()).then_some(children),
        })
    }
}

/// Arena address of a live node. Never reused within one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub id: String,
    pub tag: String,
    pub text: Option<String>,
    pub props: Option<Props>,
    children: Option<Vec<NodeKey>>,
}

impl TreeNode {
    pub fn children(&self) -> &[NodeKey] {
        self.children.as_deref().unwrap_or_default()
    }

    pub fn prop(&self, key: &str) -> Option<&PropValue> {
        self.props.as_ref().and_then(|props| props.get(key))
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeEditError {
    #[error("parent node is not in the tree")]
    MissingParent,
    #[error("index {index} out of range for {len} children")]
    IndexOutOfRange { index: usize, len: usize },
}

/// The live element tree, held as an arena so stale lookups fail instead of
/// aliasing a different node.
#[derive(Debug, Default)]
pub struct ElementTree {
    root: Option<NodeKey>,
    nodes: HashMap<NodeKey, TreeNode>,
    next_key: u64,
}

impl ElementTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<NodeKey> {
        self.root
    }

    pub fn node(&self, key: NodeKey) -> Option<&TreeNode> {
        self.nodes.get(&key)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.nodes.clear();
    }

    pub fn set_root(&mut self, elem: VDomElem) -> NodeKey {
        if let Some(old) = self.root.take() {
            self.drop_subtree(old);
        }
        let key = self.alloc_subtree(elem);
        self.root = Some(key);
        key
    }

    pub fn append_child(&mut self, parent: NodeKey, elem: VDomElem) -> Result<(), TreeEditError> {
        let len = self.child_count(parent)?;
        self.insert_child(parent, len, elem)
    }

    pub fn insert_child(
        &mut self,
        parent: NodeKey,
        index: usize,
        elem: VDomElem,
    ) -> Result<(), TreeEditError> {
        let len = self.child_count(parent)?;
        if index > len {
            return Err(TreeEditError::IndexOutOfRange { index, len });
        }

        let child = self.alloc_subtree(elem);
        self.children_mut(parent)?.insert(index, child);
        Ok(())
    }

    pub fn replace_child(
        &mut self,
        parent: NodeKey,
        index: usize,
        elem: VDomElem,
    ) -> Result<(), TreeEditError> {
        self.check_existing_index(parent, index)?;

        let child = self.alloc_subtree(elem);
        let old = std::mem::replace(&mut self.children_mut(parent)?[index], child);
        self.drop_subtree(old);
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeKey, index: usize) -> Result<(), TreeEditError> {
        self.check_existing_index(parent, index)?;

        let old = self.children_mut(parent)?.remove(index);
        self.drop_subtree(old);
        Ok(())
    }

    /// Pre-order walk from the root; `visit` receives the depth of each node.
    pub fn walk<F>(&self, mut visit: F)
    where
        F: FnMut(usize, NodeKey, &TreeNode),
    {
        let mut stack: Vec<(usize, NodeKey)> = self.root.map(|root| (0, root)).into_iter().collect();

        while let Some((depth, key)) = stack.pop() {
            let Some(node) = self.nodes.get(&key) else {
                continue;
            };
            visit(depth, key, node);
            stack.extend(node.children().iter().rev().map(|child| (depth + 1, *child)));
        }
    }

    pub fn snapshot(&self) -> Option<VDomElem> {
        self.root.and_then(|root| self.snapshot_of(root))
    }

    pub fn snapshot_of(&self, key: NodeKey) -> Option<VDomElem> {
        let node = self.nodes.get(&key)?;
        Some(VDomElem {
            id: node.id.clone(),
            tag: node.tag.clone(),
            text: node.text.clone(),
            props: node.props.clone(),
            children: node.children.as_ref().map(|children| {
                children
                    .iter()
                    .filter_map(|child| self.snapshot_of(*child))
                    .collect()
            }),
        })
    }

    fn child_count(&self, parent: NodeKey) -> Result<usize, TreeEditError> {
        self.nodes
            .get(&parent)
            .map(|node| node.children().len())
            .ok_or(TreeEditError::MissingParent)
    }

    fn check_existing_index(&self, parent: NodeKey, index: usize) -> Result<(), TreeEditError> {
        let len = self.child_count(parent)?;
        if index >= len {
            return Err(TreeEditError::IndexOutOfRange { index, len });
        }
        Ok(())
    }

    fn children_mut(&mut self, parent: NodeKey) -> Result<&mut Vec<NodeKey>, TreeEditError> {
        self.nodes
            .get_mut(&parent)
            .map(|node| node.children.get_or_insert_with(Vec::new))
            .ok_or(TreeEditError::MissingParent)
    }

    fn alloc_subtree(&mut self, elem: VDomElem) -> NodeKey {
        let key = NodeKey(self.next_key);
        self.next_key += 1;

        let children = elem.children.map(|children| {
            children
                .into_iter()
                .map(|child| self.alloc_subtree(child))
                .collect()
        });

        self.nodes.insert(
            key,
            TreeNode {
                id: elem.id,
                tag: elem.tag,
                text: elem.text,
                props: elem.props,
                children,
            },
        );
        key
    }

    fn drop_subtree(&mut self, key: NodeKey) {
        let mut stack = vec![key];
        while let Some(key) = stack.pop() {
            if let Some(node) = self.nodes.remove(&key) {
                stack.extend(node.children.into_iter().flatten());
            }
        }
    }
}

/// Map from stable id to live node, derived from one full traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIndex {
    by_id: HashMap<String, NodeKey>,
    duplicates: Vec<String>,
}

impl NodeIndex {
    pub fn get(&self, id: &str) -> Option<NodeKey> {
        self.by_id.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.by_id.keys().map(String::as_str)
    }

    /// Ids seen more than once during the build; the first occurrence wins.
    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }
}

pub fn build_index(tree: &ElementTree) -> NodeIndex {
    let mut index = NodeIndex::default();

    tree.walk(|_, key, node| {
        if node.is_anonymous() {
            return;
        }
        if index.by_id.contains_key(&node.id) {
            index.duplicates.push(node.id.clone());
        } else {
            index.by_id.insert(node.id.clone(), key);
        }
    });

    index
}
