//! Per-lookup state.
//!
//! A [`LookupSession`] is owned by exactly one lookup. The orchestrator keeps
//! it behind a `tokio::sync::Mutex` inside an `Arc`; each in-flight RPC task
//! holds a clone of that `Arc` for the duration of its single call. All
//! reads and writes go through the round driver while the lock is held.

use std::collections::HashSet;

use crate::config::LookupConfig;
use crate::identity::{Contact, Identity};
use crate::ledger::{ContactLedger, ContactState};

/// Receives the final closest-K list. Invoked at most once per session.
pub type LookupCallback = Box<dyn FnOnce(Vec<Contact>) + Send + 'static>;

/// Upper bound on contacts absorbed from a single response.
/// Keeps a misbehaving peer from inflating the ledger.
pub const MAX_DISCOVERED_PER_RESPONSE: usize = 256;

pub struct LookupSession {
    target: Identity,
    k: usize,
    alpha: usize,
    beta: usize,
    ledger: ContactLedger,
    round: u32,
    /// Identity of the K-th closest live contact at the last full round.
    kth_closest: Option<Identity>,
    completed: bool,
    callback: Option<LookupCallback>,
    excluded: HashSet<Identity>,
}

/// Snapshot of a session's progress, for logging and introspection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub round: u32,
    pub known: usize,
    pub pending: usize,
    pub contacted: usize,
    pub down: usize,
}

impl LookupSession {
    pub fn new(target: Identity, config: &LookupConfig, callback: LookupCallback) -> Self {
        Self {
            target,
            k: config.k,
            alpha: config.alpha,
            beta: config.beta,
            ledger: ContactLedger::new(),
            round: 0,
            kth_closest: None,
            completed: false,
            callback: Some(callback),
            excluded: HashSet::new(),
        }
    }

    pub fn target(&self) -> &Identity {
        &self.target
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn alpha(&self) -> usize {
        self.alpha
    }

    pub fn beta(&self) -> usize {
        self.beta
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn kth_closest(&self) -> Option<Identity> {
        self.kth_closest
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn ledger(&self) -> &ContactLedger {
        &self.ledger
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut ContactLedger {
        &mut self.ledger
    }

    /// Never admit `identity` into this lookup. Removes it if already present.
    pub fn exclude(&mut self, identity: Identity) {
        self.ledger.remove(&identity);
        self.excluded.insert(identity);
    }

    pub fn is_excluded(&self, identity: &Identity) -> bool {
        self.excluded.contains(identity)
    }

    pub fn excluded(&self) -> &HashSet<Identity> {
        &self.excluded
    }

    /// Insert seed contacts as `New`, skipping excluded and already-known
    /// ones. Returns how many entries were added.
    pub fn add_seeds<I>(&mut self, contacts: I) -> usize
    where
        I: IntoIterator<Item = Contact>,
    {
        let mut added = 0;
        for contact in contacts {
            if self.excluded.contains(&contact.identity) {
                continue;
            }
            if self.ledger.insert(contact) {
                added += 1;
            }
        }
        added
    }

    /// Like [`add_seeds`](Self::add_seeds), but reads at most
    /// [`MAX_DISCOVERED_PER_RESPONSE`] contacts. Used for RPC replies.
    pub fn absorb<I>(&mut self, contacts: I) -> usize
    where
        I: IntoIterator<Item = Contact>,
    {
        self.add_seeds(contacts.into_iter().take(MAX_DISCOVERED_PER_RESPONSE))
    }

    /// Number of dispatched RPCs still awaiting a reply.
    pub fn pending(&self) -> usize {
        self.ledger.count_in_state(ContactState::SelectedAlpha)
    }

    /// The current live top-K, nearest first.
    pub fn closest_live(&self) -> Vec<Contact> {
        self.ledger
            .closest_live(&self.target, self.k)
            .into_iter()
            .map(|entry| entry.contact.clone())
            .collect()
    }

    pub(crate) fn set_kth_closest(&mut self, identity: Option<Identity>) {
        self.kth_closest = identity;
    }

    pub(crate) fn advance_round(&mut self) -> u32 {
        self.round += 1;
        self.round
    }

    /// Flip the completed flag. Returns `false` if it was already set.
    pub(crate) fn complete(&mut self) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        true
    }

    pub(crate) fn take_callback(&mut self) -> Option<LookupCallback> {
        self.callback.take()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            round: self.round,
            known: self.ledger.len(),
            pending: self.pending(),
            contacted: self.ledger.count_in_state(ContactState::Contacted),
            down: self.ledger.count_in_state(ContactState::Down),
        }
    }
}

impl std::fmt::Debug for LookupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupSession")
            .field("target", &self.target)
            .field("round", &self.round)
            .field("kth_closest", &self.kth_closest)
            .field("completed", &self.completed)
            .field("known", &self.ledger.len())
            .finish_non_exhaustive()
    }
}
