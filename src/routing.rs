//! Kademlia routing table.
//!
//! 256 k-buckets indexed by the length of the common prefix between the
//! local identity and a contact. Buckets keep least-recently-seen contacts at
//! the head; a full bucket drops new contacts rather than evicting live ones.
//!
//! The lookup engine reads seeds from this table through
//! [`ContactSource`](crate::protocols::ContactSource). Each node in the
//! simulated network also answers FIND_NODES from its own table.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::identity::{distance_cmp, Contact, Identity, ID_LEN};

const BUCKET_COUNT: usize = ID_LEN * 8;

/// Result of offering a contact to the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    /// Already known; moved to the tail of its bucket.
    Refreshed,
    /// Bucket full; the contact was not added.
    BucketFull,
    /// The contact is the local node.
    Ignored,
}

#[derive(Debug, Default)]
struct Bucket {
    contacts: Vec<Contact>,
}

impl Bucket {
    fn touch(&mut self, contact: Contact, k: usize) -> UpdateOutcome {
        if let Some(pos) = self
            .contacts
            .iter()
            .position(|c| c.identity == contact.identity)
        {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            return UpdateOutcome::Refreshed;
        }
        if self.contacts.len() < k {
            self.contacts.push(contact);
            UpdateOutcome::Inserted
        } else {
            UpdateOutcome::BucketFull
        }
    }

    fn remove(&mut self, id: &Identity) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.identity == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Index of the first differing bit between `self_id` and `other`.
///
/// Identical identities map to the last bucket.
pub fn bucket_index(self_id: &Identity, other: &Identity) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: Identity,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: Identity, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, Bucket::default);
        Self {
            self_id,
            k,
            buckets,
        }
    }

    pub fn self_id(&self) -> &Identity {
        &self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.get(identity).is_some()
    }

    pub fn get(&self, identity: &Identity) -> Option<&Contact> {
        if *identity == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, identity);
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| c.identity == *identity)
    }

    pub fn update(&mut self, contact: Contact) -> UpdateOutcome {
        if contact.identity == self.self_id {
            return UpdateOutcome::Ignored;
        }
        let idx = bucket_index(&self.self_id, &contact.identity);
        self.buckets[idx].touch(contact, self.k)
    }

    pub fn remove(&mut self, identity: &Identity) -> bool {
        if *identity == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, identity);
        self.buckets[idx].remove(identity)
    }

    pub fn closest(&self, target: &Identity, count: usize) -> Vec<Contact> {
        self.closest_excluding(target, count, &HashSet::new())
    }

    /// Up to `count` contacts nearest `target`, nearest first.
    pub fn closest_excluding(
        &self,
        target: &Identity,
        count: usize,
        exclude: &HashSet<Identity>,
    ) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct Candidate<'a> {
            dist: [u8; ID_LEN],
            contact: &'a Contact,
        }

        impl Ord for Candidate<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for Candidate<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap on distance: the root is the farthest candidate kept so far.
        let mut heap: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(count + 1);
        for contact in self.buckets.iter().flat_map(|b| b.contacts.iter()) {
            if exclude.contains(&contact.identity) {
                continue;
            }
            let dist = contact.distance_to(target);
            if heap.len() < count {
                heap.push(Candidate { dist, contact });
            } else if let Some(farthest) = heap.peek()
                && distance_cmp(&dist, &farthest.dist) == Ordering::Less
            {
                heap.push(Candidate { dist, contact });
                heap.pop();
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|candidate| candidate.contact.clone())
            .collect()
    }
}
