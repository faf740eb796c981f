use std::collections::HashMap;

/// Per-node change counters read by the rendering layer.
#[derive(Debug, Default)]
pub struct RevisionCounters {
    by_node: HashMap<String, u64>,
    epoch: u64,
}

impl RevisionCounters {
    pub fn get(&self, node_id: &str) -> u64 {
        self.by_node.get(node_id).copied().unwrap_or(0)
    }

    pub fn bump(&mut self, node_id: &str) -> u64 {
        self.epoch += 1;
        let counter = self.by_node.entry(node_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Total number of bumps across all nodes; changes whenever any counter does.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_bump_by_one() {
        let mut revisions = RevisionCounters::default();
        assert_eq!(revisions.get("n1"), 0);

        assert_eq!(revisions.bump("n1"), 1);
        assert_eq!(revisions.bump("n1"), 2);
        assert_eq!(revisions.get("n2"), 0);
        assert_eq!(revisions.epoch(), 2);
    }
}
