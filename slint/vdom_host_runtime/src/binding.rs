use crate::protocol::VDomStateSync;
use crate::revision::RevisionCounters;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// A named, remotely owned value that props can reference.
#[derive(Debug, Clone)]
pub struct BindingContainer {
    pub name: String,
    pub value: Value,
    pub last_confirmed: Value,
    consumers: HashMap<String, i64>,
}

impl BindingContainer {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Null,
            last_confirmed: Value::Null,
            consumers: HashMap::new(),
        }
    }

    pub fn is_consumer(&self, node_id: &str) -> bool {
        self.consumers.get(node_id).is_some_and(|balance| *balance > 0)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &str> {
        self.consumers
            .iter()
            .filter(|(_, balance)| **balance > 0)
            .map(|(node_id, _)| node_id.as_str())
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers().count()
    }

    fn adjust(&mut self, node_id: &str, delta: i64) {
        let balance = self.consumers.entry(node_id.to_string()).or_insert(0);
        *balance += delta;
        if *balance == 0 {
            self.consumers.remove(node_id);
        }
    }
}

/// Containers are created on first reference and live as long as the session.
#[derive(Debug, Default)]
pub struct BindingTable {
    bindings: HashMap<String, BindingContainer>,
    node_deps: HashMap<String, BTreeSet<String>>,
    dirty: BTreeSet<String>,
}

impl BindingTable {
    pub fn get_or_create(&mut self, name: &str) -> &mut BindingContainer {
        self.bindings
            .entry(name.to_string())
            .or_insert_with(|| BindingContainer::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&BindingContainer> {
        self.bindings.get(name)
    }

    pub fn value(&self, name: &str) -> Value {
        self.bindings
            .get(name)
            .map(|binding| binding.value.clone())
            .unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Stores `value`; remote values also become the confirmed value, local ones
    /// are queued for the next request. Consumers are bumped only when the value
    /// actually changed. Returns how many nodes were bumped.
    pub fn set_value(
        &mut self,
        name: &str,
        value: Value,
        from_remote: bool,
        revisions: &mut RevisionCounters,
    ) -> usize {
        let binding = self.get_or_create(name);
        let changed = binding.value != value;
        binding.value = value;

        if from_remote {
            binding.last_confirmed = binding.value.clone();
        }

        let bumped = if changed {
            let consumers: Vec<String> = binding.consumers().map(str::to_string).collect();
            for node_id in &consumers {
                revisions.bump(node_id);
            }
            consumers.len()
        } else {
            0
        };

        if from_remote {
            self.dirty.remove(name);
        } else {
            self.dirty.insert(name.to_string());
        }

        bumped
    }

    pub fn mark_consumer(&mut self, node_id: &str, name: &str) {
        self.get_or_create(name).adjust(node_id, 1);
    }

    pub fn unmark_consumer(&mut self, node_id: &str, name: &str) {
        self.get_or_create(name).adjust(node_id, -1);
    }

    /// Records the bindings `node_id` now depends on, touching only the ones
    /// that were added or dropped since the last call for that node.
    pub fn sync_node_dependencies(&mut self, node_id: &str, deps: BTreeSet<String>) {
        let previous = self.node_deps.remove(node_id).unwrap_or_default();

        for name in deps.difference(&previous) {
            self.mark_consumer(node_id, name);
        }
        for name in previous.difference(&deps) {
            self.unmark_consumer(node_id, name);
        }

        if !deps.is_empty() {
            self.node_deps.insert(node_id.to_string(), deps);
        }
    }

    pub fn release_node(&mut self, node_id: &str) {
        self.sync_node_dependencies(node_id, BTreeSet::new());
    }

    pub fn dependencies_of(&self, node_id: &str) -> Option<&BTreeSet<String>> {
        self.node_deps.get(node_id)
    }

    pub fn tracked_nodes(&self) -> impl Iterator<Item = &str> {
        self.node_deps.keys().map(String::as_str)
    }

    /// Whether any local write still differs from what the remote confirmed.
    pub fn has_unconfirmed_writes(&self) -> bool {
        self.dirty.iter().any(|name| {
            self.bindings
                .get(name)
                .is_some_and(|binding| binding.value != binding.last_confirmed)
        })
    }

    /// Drains dirty bindings into state-sync entries, dropping writes that
    /// already match the confirmed value.
    pub fn take_outgoing(&mut self) -> Vec<VDomStateSync> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|name| {
                let binding = self.bindings.get(&name)?;
                (binding.value != binding.last_confirmed).then(|| VDomStateSync {
                    name,
                    value: binding.value.clone(),
                })
            })
            .collect()
    }

    /// Puts back entries from a round that failed, unless the remote has since
    /// confirmed the binding.
    pub fn restore_outgoing(&mut self, entries: Vec<VDomStateSync>) {
        for entry in entries {
            if self
                .bindings
                .get(&entry.name)
                .is_some_and(|binding| binding.value != binding.last_confirmed)
            {
                self.dirty.insert(entry.name);
            }
        }
    }
}
