//! # Contact Ledger
//!
//! Per-lookup record of every contact the lookup has heard of, with its
//! lifecycle state and the round it was dispatched in.
//!
//! ```text
//!   New ──select──▶ SelectedAlpha ──reply──▶ Contacted
//!                        │
//!                        └──fail/timeout──▶ Down (terminal)
//! ```
//!
//! One primary store keyed by identity plus two secondary indices
//! (state → identities, round → identities). Every mutation goes through a
//! method that updates all three together, so the views never disagree.
//!
//! Entries remember their insertion order; distance sorting breaks ties on it
//! so the output is deterministic even though the primary store is a hash map.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::identity::{Contact, Identity};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContactState {
    /// Known but never queried.
    New,
    /// Dispatched in some round, reply outstanding.
    SelectedAlpha,
    /// Replied successfully.
    Contacted,
    /// Failed or timed out. Excluded for the rest of the lookup.
    Down,
}

impl ContactState {
    #[inline]
    pub fn is_live(self) -> bool {
        self != ContactState::Down
    }
}

#[derive(Clone, Debug)]
pub struct LedgerEntry {
    pub contact: Contact,
    pub state: ContactState,
    /// Round the contact was dispatched in; `None` until selected.
    pub round: Option<u32>,
    /// Insertion sequence number.
    pub order: u64,
}

/// Result of a state mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkOutcome {
    Updated { previous: ContactState },
    /// No entry for the identity. Usually a stale or duplicate callback.
    NotFound,
    /// The entry is `Down` and cannot change again.
    Frozen,
}

/// Dispatch/reply counts for one round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundProgress {
    pub sent: usize,
    pub replied: usize,
}

#[derive(Debug, Default)]
pub struct ContactLedger {
    entries: HashMap<Identity, LedgerEntry>,
    by_state: HashMap<ContactState, HashSet<Identity>>,
    by_round: BTreeMap<u32, HashSet<Identity>>,
    next_order: u64,
}

impl ContactLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&LedgerEntry> {
        self.entries.get(identity)
    }

    pub fn state_of(&self, identity: &Identity) -> Option<ContactState> {
        self.entries.get(identity).map(|entry| entry.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Add `contact` in state `New`.
    ///
    /// Returns `false` (and leaves the existing entry untouched) if the
    /// identity is already present.
    pub fn insert(&mut self, contact: Contact) -> bool {
        let identity = contact.identity;
        if self.entries.contains_key(&identity) {
            return false;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(
            identity,
            LedgerEntry {
                contact,
                state: ContactState::New,
                round: None,
                order,
            },
        );
        self.by_state
            .entry(ContactState::New)
            .or_default()
            .insert(identity);
        true
    }

    /// Drop an entry and its index references.
    pub fn remove(&mut self, identity: &Identity) -> Option<LedgerEntry> {
        let entry = self.entries.remove(identity)?;
        self.unindex_state(identity, entry.state);
        if let Some(round) = entry.round {
            self.unindex_round(identity, round);
        }
        Some(entry)
    }

    /// Transition `identity` to `state`.
    pub fn mark_state(&mut self, identity: &Identity, state: ContactState) -> MarkOutcome {
        let Some(entry) = self.entries.get_mut(identity) else {
            return MarkOutcome::NotFound;
        };
        let previous = entry.state;
        if previous == ContactState::Down {
            return MarkOutcome::Frozen;
        }
        entry.state = state;
        if previous != state {
            self.unindex_state(identity, previous);
            self.by_state.entry(state).or_default().insert(*identity);
        }
        MarkOutcome::Updated { previous }
    }

    /// Mark `identity` as dispatched in `round`.
    pub fn select(&mut self, identity: &Identity, round: u32) -> MarkOutcome {
        let outcome = self.mark_state(identity, ContactState::SelectedAlpha);
        if let MarkOutcome::Updated { .. } = outcome
            && let Some(entry) = self.entries.get_mut(identity)
        {
            let old_round = entry.round.replace(round);
            if let Some(old) = old_round
                && old != round
            {
                self.unindex_round(identity, old);
            }
            self.by_round.entry(round).or_default().insert(*identity);
        }
        outcome
    }

    pub fn count_in_state(&self, state: ContactState) -> usize {
        self.by_state.get(&state).map_or(0, HashSet::len)
    }

    pub fn entries_in_state(&self, state: ContactState) -> Vec<&LedgerEntry> {
        self.collect_indexed(self.by_state.get(&state))
    }

    pub fn entries_in_round(&self, round: u32) -> Vec<&LedgerEntry> {
        self.collect_indexed(self.by_round.get(&round))
    }

    /// `sent` = entries tagged with `round`, `replied` = those now `Contacted`.
    pub fn round_progress(&self, round: u32) -> RoundProgress {
        self.entries_in_round(round)
            .iter()
            .fold(RoundProgress::default(), |mut progress, entry| {
                progress.sent += 1;
                if entry.state == ContactState::Contacted {
                    progress.replied += 1;
                }
                progress
            })
    }

    /// Every non-`Down` entry, nearest to `target` first.
    ///
    /// Equal distances (only possible for duplicate identities, which the
    /// ledger forbids, but handled anyway) fall back to insertion order.
    pub fn all_live_sorted_by_distance(&self, target: &Identity) -> Vec<&LedgerEntry> {
        let mut live: Vec<&LedgerEntry> = self
            .entries
            .values()
            .filter(|entry| entry.state.is_live())
            .collect();
        live.sort_by(|a, b| {
            a.contact
                .cmp_distance(&b.contact, target)
                .then(a.order.cmp(&b.order))
        });
        live
    }

    /// The `k` nearest live entries.
    pub fn closest_live(&self, target: &Identity, k: usize) -> Vec<&LedgerEntry> {
        let mut live = self.all_live_sorted_by_distance(target);
        live.truncate(k);
        live
    }

    fn collect_indexed(&self, ids: Option<&HashSet<Identity>>) -> Vec<&LedgerEntry> {
        let mut out: Vec<&LedgerEntry> = ids
            .map(|ids| ids.iter().filter_map(|id| self.entries.get(id)).collect())
            .unwrap_or_default();
        out.sort_by_key(|entry| entry.order);
        out
    }

    fn unindex_state(&mut self, identity: &Identity, state: ContactState) {
        if let Some(set) = self.by_state.get_mut(&state) {
            set.remove(identity);
        }
    }

    fn unindex_round(&mut self, identity: &Identity, round: u32) {
        if let Some(set) = self.by_round.get_mut(&round) {
            set.remove(identity);
            if set.is_empty() {
                self.by_round.remove(&round);
            }
        }
    }

    #[cfg(test)]
    fn assert_indices_consistent(&self) {
        let indexed_states: usize = self.by_state.values().map(HashSet::len).sum();
        assert_eq!(indexed_states, self.entries.len());
        for (id, entry) in &self.entries {
            assert!(self.by_state[&entry.state].contains(id));
            match entry.round {
                Some(round) => assert!(self.by_round[&round].contains(id)),
                None => assert!(self.by_round.values().all(|set| !set.contains(id))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::distance_cmp;

    fn contact(first: u8) -> Contact {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        Contact::new(Identity::from_bytes(bytes), format!("node-{first}"))
    }

    #[test]
    fn insert_is_idempotent() {
        let mut ledger = ContactLedger::new();
        assert!(ledger.insert(contact(1)));
        ledger.select(&contact(1).identity, 0);
        assert!(!ledger.insert(contact(1)));
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.state_of(&contact(1).identity),
            Some(ContactState::SelectedAlpha)
        );
        ledger.assert_indices_consistent();
    }

    #[test]
    fn mark_state_reports_missing_contacts() {
        let mut ledger = ContactLedger::new();
        assert_eq!(
            ledger.mark_state(&contact(9).identity, ContactState::Contacted),
            MarkOutcome::NotFound
        );
    }

    #[test]
    fn down_is_terminal() {
        let mut ledger = ContactLedger::new();
        let id = contact(3).identity;
        ledger.insert(contact(3));
        ledger.select(&id, 0);
        assert_eq!(
            ledger.mark_state(&id, ContactState::Down),
            MarkOutcome::Updated { previous: ContactState::SelectedAlpha }
        );
        assert_eq!(ledger.mark_state(&id, ContactState::Contacted), MarkOutcome::Frozen);
        assert_eq!(ledger.select(&id, 1), MarkOutcome::Frozen);
        assert_eq!(ledger.state_of(&id), Some(ContactState::Down));
        assert_eq!(ledger.get(&id).and_then(|e| e.round), Some(0));
        ledger.assert_indices_consistent();
    }

    #[test]
    fn state_index_tracks_transitions() {
        let mut ledger = ContactLedger::new();
        for b in 1..=4 {
            ledger.insert(contact(b));
        }
        ledger.select(&contact(1).identity, 0);
        ledger.select(&contact(2).identity, 0);
        ledger.mark_state(&contact(2).identity, ContactState::Contacted);

        assert_eq!(ledger.count_in_state(ContactState::New), 2);
        assert_eq!(ledger.count_in_state(ContactState::SelectedAlpha), 1);
        assert_eq!(ledger.count_in_state(ContactState::Contacted), 1);
        assert_eq!(ledger.count_in_state(ContactState::Down), 0);
        let new_ids: Vec<_> = ledger
            .entries_in_state(ContactState::New)
            .iter()
            .map(|e| e.contact.identity)
            .collect();
        assert_eq!(new_ids, vec![contact(3).identity, contact(4).identity]);
        ledger.assert_indices_consistent();
    }

    #[test]
    fn round_index_counts_sent_and_replied() {
        let mut ledger = ContactLedger::new();
        for b in 1..=5 {
            ledger.insert(contact(b));
        }
        for b in 1..=3 {
            ledger.select(&contact(b).identity, 0);
        }
        ledger.select(&contact(4).identity, 1);
        ledger.mark_state(&contact(1).identity, ContactState::Contacted);
        ledger.mark_state(&contact(2).identity, ContactState::Down);

        assert_eq!(ledger.round_progress(0), RoundProgress { sent: 3, replied: 1 });
        assert_eq!(ledger.round_progress(1), RoundProgress { sent: 1, replied: 0 });
        assert_eq!(ledger.round_progress(7), RoundProgress::default());
        assert_eq!(ledger.entries_in_round(0).len(), 3);
        // Unselected entries belong to no round.
        assert!(ledger.get(&contact(5).identity).is_some_and(|e| e.round.is_none()));
    }

    #[test]
    fn live_sort_excludes_down_and_orders_by_distance() {
        let mut ledger = ContactLedger::new();
        for b in [0x90u8, 0x10, 0x50, 0x30, 0x70] {
            ledger.insert(contact(b));
        }
        ledger.select(&contact(0x30).identity, 0);
        ledger.mark_state(&contact(0x30).identity, ContactState::Down);

        let target = contact(0x00).identity;
        let sorted = ledger.all_live_sorted_by_distance(&target);
        let firsts: Vec<u8> = sorted.iter().map(|e| e.contact.identity.as_bytes()[0]).collect();
        assert_eq!(firsts, vec![0x10, 0x50, 0x70, 0x90]);
        for pair in sorted.windows(2) {
            let da = pair[0].contact.distance_to(&target);
            let db = pair[1].contact.distance_to(&target);
            assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }

        let closest = ledger.closest_live(&target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].contact, contact(0x10));
    }

    #[test]
    fn closest_live_returns_everything_when_fewer_than_k() {
        let mut ledger = ContactLedger::new();
        ledger.insert(contact(1));
        ledger.insert(contact(2));
        assert_eq!(ledger.closest_live(&contact(0).identity, 20).len(), 2);
    }

    #[test]
    fn remove_clears_indices() {
        let mut ledger = ContactLedger::new();
        ledger.insert(contact(1));
        ledger.insert(contact(2));
        ledger.select(&contact(1).identity, 0);

        let removed = ledger.remove(&contact(1).identity).expect("entry exists");
        assert_eq!(removed.state, ContactState::SelectedAlpha);
        assert_eq!(ledger.count_in_state(ContactState::SelectedAlpha), 0);
        assert!(ledger.entries_in_round(0).is_empty());
        assert!(ledger.remove(&contact(1).identity).is_none());
        ledger.assert_indices_consistent();
    }

    #[test]
    fn reselection_moves_round_tag() {
        let mut ledger = ContactLedger::new();
        let id = contact(1).identity;
        ledger.insert(contact(1));
        ledger.select(&id, 0);
        ledger.mark_state(&id, ContactState::New);
        ledger.select(&id, 2);
        assert!(ledger.entries_in_round(0).is_empty());
        assert_eq!(ledger.entries_in_round(2).len(), 1);
        ledger.assert_indices_consistent();
    }
}
