use crate::diagnostics::{DiagnosticLog, Severity};
use crate::protocol::{RenderUpdateKind, VDomRenderUpdate};
use crate::revision::RevisionCounters;
use crate::tree::{
    ElementTree, NodeIndex, NodeKey, TransferElemSet, TreeEditError, VDomTransferElem, build_index,
};
use tracing::{instrument, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Fills in the element of every op that names one by `vdom_id`. An op whose
/// element cannot be rebuilt is turned into `Invalid` and skipped later.
pub fn attach_transfer_elems(batch: &mut [VDomRenderUpdate], elems: Vec<VDomTransferElem>) {
    let set = TransferElemSet::new(elems);
    for update in batch
        .iter_mut()
        .filter(|update| update.vdom.is_none() && !update.vdom_id.is_empty())
    {
        match set.materialize(&update.vdom_id) {
            Ok(elem) => update.vdom = Some(elem),
            Err(reason) => update.kind = RenderUpdateKind::Invalid(reason),
        }
    }
}

/// Applies `batch` in order. Targets are resolved against an index built once,
/// before the first op, so an op may only name nodes that existed when the
/// batch started. A bad op is skipped with one diagnostic; the rest still apply.
#[instrument(skip_all, fields(ops = batch.len()))]
pub fn apply_patches(
    tree: &mut ElementTree,
    batch: Vec<VDomRenderUpdate>,
    revisions: &mut RevisionCounters,
    diagnostics: &mut DiagnosticLog,
) -> PatchReport {
    let index = build_index(tree);
    let mut report = PatchReport::default();

    for (position, update) in batch.into_iter().enumerate() {
        let kind = update.kind.clone();
        match apply_one(tree, &index, update, revisions) {
            Ok(()) => {
                trace!(position, ?kind, "applied render update");
                report.applied += 1;
            }
            Err(reason) => {
                diagnostics.local(
                    Severity::Warn,
                    format!("skipped render update #{position} ({kind:?}): {reason}"),
                );
                report.skipped += 1;
            }
        }
    }

    report
}

fn apply_one(
    tree: &mut ElementTree,
    index: &NodeIndex,
    update: VDomRenderUpdate,
    revisions: &mut RevisionCounters,
) -> Result<(), String> {
    let VDomRenderUpdate {
        kind,
        target_id,
        vdom,
        index: child_index,
        ..
    } = update;
    let parent = || resolve_parent(index, &target_id);

    let result = match kind {
        RenderUpdateKind::Root => {
            let vdom = vdom.ok_or("root update carries no element")?;
            let root_id = vdom.id.clone();
            tree.set_root(vdom);
            if !root_id.is_empty() {
                revisions.bump(&root_id);
            }
            return Ok(());
        }
        RenderUpdateKind::Unknown(raw) => return Err(format!("unknown update type '{raw}'")),
        RenderUpdateKind::Invalid(reason) => return Err(format!("malformed update: {reason}")),
        RenderUpdateKind::Append => {
            let parent = parent()?;
            let vdom = vdom.ok_or("append update carries no element")?;
            tree.append_child(parent, vdom)
        }
        RenderUpdateKind::Insert => {
            let parent = parent()?;
            let vdom = vdom.ok_or("insert update carries no element")?;
            tree.insert_child(parent, child_position(child_index)?, vdom)
        }
        RenderUpdateKind::Replace => {
            let parent = parent()?;
            let vdom = vdom.ok_or("replace update carries no element")?;
            tree.replace_child(parent, child_position(child_index)?, vdom)
        }
        RenderUpdateKind::Remove => tree.remove_child(parent()?, child_position(child_index)?),
    };

    match result {
        Ok(()) => {
            revisions.bump(&target_id);
            Ok(())
        }
        Err(TreeEditError::MissingParent) => {
            Err(format!("parent '{target_id}' is no longer in the tree"))
        }
        Err(err @ TreeEditError::IndexOutOfRange { .. }) => {
            Err(format!("parent '{target_id}': {err}"))
        }
    }
}

fn resolve_parent(index: &NodeIndex, target_id: &str) -> Result<NodeKey, String> {
    if target_id.is_empty() {
        return Err("update names no parent".to_string());
    }
    index
        .get(target_id)
        .ok_or_else(|| format!("parent '{target_id}' not found"))
}

fn child_position(raw: Option<i64>) -> Result<usize, String> {
    let raw = raw.ok_or("update carries no index")?;
    usize::try_from(raw).map_err(|_| format!("index {raw} is negative"))
}
