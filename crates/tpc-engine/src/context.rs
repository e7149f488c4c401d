//! Collaborators the engine is built with.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tpc_core::address::Address;
use tpc_core::partition::{PartitionId, PartitionOwnership};

use crate::ops::OperationRegistry;

#[derive(Clone)]
pub struct EngineContext {
    pub ownership: Arc<dyn PartitionOwnership>,
    pub registry: OperationRegistry,
}

impl EngineContext {
    pub fn new(ownership: Arc<dyn PartitionOwnership>) -> Self {
        Self {
            ownership,
            registry: OperationRegistry::builtin(),
        }
    }

    pub fn with_registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = registry;
        self
    }
}

/// In-memory partition table with an optional default owner.
#[derive(Default)]
pub struct StaticOwnership {
    owners: RwLock<HashMap<PartitionId, Address>>,
    default: RwLock<Option<Address>>,
}

impl StaticOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every partition not assigned explicitly belongs to `owner`.
    pub fn all_to(owner: Address) -> Self {
        let table = Self::new();
        table.set_default(Some(owner));
        table
    }

    pub fn assign(&self, partition: PartitionId, owner: Address) {
        self.owners.write().insert(partition, owner);
    }

    pub fn unassign(&self, partition: PartitionId) {
        self.owners.write().remove(&partition);
    }

    pub fn set_default(&self, owner: Option<Address>) {
        *self.default.write() = owner;
    }
}

impl PartitionOwnership for StaticOwnership {
    fn owner_of(&self, partition: PartitionId) -> Option<Address> {
        if let Some(owner) = self.owners.read().get(&partition) {
            return Some(*owner);
        }
        *self.default.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_static_ownership() {
        let a = Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1000);
        let b = Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2000);

        let table = StaticOwnership::new();
        assert_eq!(table.owner_of(1), None);
        table.set_default(Some(a));
        table.assign(7, b);
        assert_eq!(table.owner_of(1), Some(a));
        assert_eq!(table.owner_of(7), Some(b));
        table.unassign(7);
        assert_eq!(table.owner_of(7), Some(a));
        assert_eq!(StaticOwnership::all_to(b).owner_of(-3), Some(b));
    }
}
