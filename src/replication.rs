//! Replication routing
//!
//! Decides whether a call in a replicated environment goes to the master or
//! to one of the slaves. Reads without an explicit override rotate through
//! the slave list; writes always stay on the master.

use crate::proxy::OperationKind;
use crate::shard::ReplicationTopology;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Read/write routing policy
#[derive(Debug)]
pub struct ReplicationPolicy {
    topology: Option<ReplicationTopology>,
    next_slave: AtomicUsize,
}

impl ReplicationPolicy {
    /// Create a policy; `None` makes [`refine`](Self::refine) the identity
    pub fn new(topology: Option<ReplicationTopology>) -> Self {
        Self {
            topology,
            next_slave: AtomicUsize::new(0),
        }
    }

    /// Whether replication routing is active
    pub fn is_replicated(&self) -> bool {
        self.topology.is_some()
    }

    /// Slave list, empty when not replicated
    pub fn slaves(&self) -> &[String] {
        self.topology
            .as_ref()
            .map(|t| t.slaves.as_slice())
            .unwrap_or(&[])
    }

    /// Effective shard for an operation on `base`
    ///
    /// Only applied when no explicit override is active; the caller passes
    /// overridden selections through untouched.
    pub fn refine<'a>(&'a self, base: &'a str, kind: OperationKind) -> &'a str {
        let Some(topology) = &self.topology else {
            return base;
        };

        match kind {
            OperationKind::Write => topology.master.as_str(),
            OperationKind::Read if topology.slaves.is_empty() => base,
            OperationKind::Read if base == topology.master => self.next_slave(topology),
            OperationKind::Read => base,
        }
    }

    fn next_slave<'a>(&self, topology: &'a ReplicationTopology) -> &'a str {
        let index = self.next_slave.fetch_add(1, Ordering::Relaxed) % topology.slaves.len();
        topology.slaves[index].as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> ReplicationTopology {
        ReplicationTopology {
            master: "master".to_string(),
            slaves: ["slave1", "slave2", "slave3", "slave4"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    #[test]
    fn reads_rotate_through_slaves() {
        let policy = ReplicationPolicy::new(Some(topology()));
        let picked: Vec<_> = (0..6)
            .map(|_| policy.refine("master", OperationKind::Read).to_string())
            .collect();
        assert_eq!(
            picked,
            vec!["slave1", "slave2", "slave3", "slave4", "slave1", "slave2"]
        );
    }

    #[test]
    fn writes_stay_on_master() {
        let policy = ReplicationPolicy::new(Some(topology()));
        for i in 0..10 {
            if i % 3 == 0 {
                policy.refine("master", OperationKind::Read);
            }
            assert_eq!(policy.refine("master", OperationKind::Write), "master");
        }
    }

    #[test]
    fn explicit_read_target_is_kept() {
        let policy = ReplicationPolicy::new(Some(topology()));
        assert_eq!(policy.refine("slave3", OperationKind::Read), "slave3");
    }

    #[test]
    fn reads_stay_on_master_without_slaves() {
        let policy = ReplicationPolicy::new(Some(ReplicationTopology {
            master: "master".to_string(),
            slaves: Vec::new(),
        }));
        assert_eq!(policy.refine("master", OperationKind::Read), "master");
        assert_eq!(policy.refine("master", OperationKind::Read), "master");
        assert_eq!(policy.refine("master", OperationKind::Write), "master");
    }

    #[test]
    fn identity_without_topology() {
        let policy = ReplicationPolicy::new(None);
        assert!(!policy.is_replicated());
        assert_eq!(policy.refine("master", OperationKind::Read), "master");
        assert_eq!(policy.refine("canada", OperationKind::Write), "canada");
    }
}
