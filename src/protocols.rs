//! Seams between the lookup engine and the rest of a node.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`FindNodesRpc`] | issue one FIND_NODES request to a remote contact |
//! | [`ContactSource`] | supply seed contacts from local routing state |
//!
//! The engine only sees these traits, so the same code drives a real
//! transport, the in-process [`SimulatedNetwork`](crate::sim::SimulatedNetwork)
//! or a scripted test double.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Contact, Identity};
use crate::routing::RoutingTable;

/// Remote FIND_NODES operation.
#[async_trait]
pub trait FindNodesRpc: Send + Sync + 'static {
    /// Ask `to` for the contacts it knows closest to `target`.
    ///
    /// Any `Err` is treated as the contact being down for this lookup. The
    /// engine applies its own timeout, so implementations need not.
    async fn find_nodes(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>>;
}

/// Local source of seed contacts.
pub trait ContactSource: Send + Sync + 'static {
    /// Up to `count` known contacts nearest to `target`, nearest first,
    /// skipping anything in `exclude`.
    fn find_closest_contacts(
        &self,
        target: &Identity,
        count: usize,
        exclude: &HashSet<Identity>,
    ) -> Vec<Contact>;
}

impl ContactSource for RoutingTable {
    fn find_closest_contacts(
        &self,
        target: &Identity,
        count: usize,
        exclude: &HashSet<Identity>,
    ) -> Vec<Contact> {
        self.closest_excluding(target, count, exclude)
    }
}

impl ContactSource for RwLock<RoutingTable> {
    fn find_closest_contacts(
        &self,
        target: &Identity,
        count: usize,
        exclude: &HashSet<Identity>,
    ) -> Vec<Contact> {
        if let Ok(table) = self.read() {
            table.closest_excluding(target, count, exclude)
        } else {
            Vec::new()
        }
    }
}

/// A source with nothing in it. Useful when every lookup is seeded
/// explicitly.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoContacts;

impl ContactSource for NoContacts {
    fn find_closest_contacts(
        &self,
        _target: &Identity,
        _count: usize,
        _exclude: &HashSet<Identity>,
    ) -> Vec<Contact> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(first: u8) -> Contact {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        Contact::new(Identity::from_bytes(bytes), format!("node-{first}"))
    }

    #[test]
    fn locked_table_serves_closest_contacts() {
        let mut table = RoutingTable::new(contact(0xFF).identity, 20);
        for b in [0x10, 0x20, 0x30] {
            table.update(contact(b));
        }
        let locked = RwLock::new(table);
        let exclude: HashSet<Identity> = [contact(0x10).identity].into_iter().collect();
        let found = locked.find_closest_contacts(&contact(0).identity, 5, &exclude);
        assert_eq!(found, vec![contact(0x20), contact(0x30)]);
    }

    #[test]
    fn no_contacts_is_empty() {
        assert!(
            NoContacts
                .find_closest_contacts(&contact(0).identity, 5, &HashSet::new())
                .is_empty()
        );
    }
}
