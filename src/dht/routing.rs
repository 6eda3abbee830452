use std::net::SocketAddr;

use super::node::{Contact, NodeId};
use crate::constants::{ID_BITS, K};

/// Outcome of [`RoutingTable::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Added,
    /// Known id seen at a new address.
    Updated,
    Unchanged,
    /// The contact is ourselves.
    Rejected,
}

/// A contiguous range of the id space: every id sharing the first `depth`
/// bits of `min`.
#[derive(Debug)]
struct Bucket {
    min: NodeId,
    depth: usize,
    contacts: Vec<Contact>,
}

impl Bucket {
    fn contains(&self, id: &NodeId) -> bool {
        self.min.shares_prefix(id, self.depth)
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    /// Halves the range; contacts move to whichever half holds their id.
    fn split(self) -> (Bucket, Bucket) {
        let depth = self.depth + 1;
        let mut low = Bucket {
            min: self.min,
            depth,
            contacts: Vec::with_capacity(K),
        };
        let mut high = Bucket {
            min: self.min.with_bit(self.depth),
            depth,
            contacts: Vec::with_capacity(K),
        };

        for contact in self.contacts {
            if contact.id.bit(self.depth) {
                high.contacts.push(contact);
            } else {
                low.contacts.push(contact);
            }
        }

        (low, high)
    }
}

/// XOR-metric routing table.
///
/// Buckets tile the whole 160-bit space and are kept sorted by their lower
/// bound. A full bucket is split in two whenever a new contact falls into
/// it, regardless of whether it covers our own id, so the table never
/// evicts and never holds more than `K` contacts per bucket.
#[derive(Debug)]
pub struct RoutingTable {
    our_id: NodeId,
    local_addr: Option<SocketAddr>,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        Self {
            our_id,
            local_addr: None,
            buckets: vec![Bucket {
                min: NodeId::MIN,
                depth: 0,
                contacts: Vec::with_capacity(K),
            }],
        }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local_addr = Some(addr);
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        // First bucket's lower bound is zero, so the result is never 0 - 1.
        self.buckets.partition_point(|b| b.min <= *id) - 1
    }

    pub fn add(&mut self, contact: Contact) -> Insertion {
        if contact.id == self.our_id || Some(contact.addr) == self.local_addr {
            return Insertion::Rejected;
        }

        loop {
            let idx = self.bucket_index(&contact.id);
            let bucket = &mut self.buckets[idx];
            debug_assert!(bucket.contains(&contact.id));

            if let Some(pos) = bucket.position(&contact.id) {
                let existing = &mut bucket.contacts[pos];
                existing.touch();
                if existing.addr == contact.addr {
                    return Insertion::Unchanged;
                }
                existing.addr = contact.addr;
                return Insertion::Updated;
            }

            if bucket.contacts.len() < K {
                bucket.contacts.push(contact);
                return Insertion::Added;
            }

            // Distinct ids always separate before the prefix runs out.
            if bucket.depth >= ID_BITS {
                return Insertion::Rejected;
            }

            let full = self.buckets.remove(idx);
            let (low, high) = full.split();
            self.buckets.insert(idx, high);
            self.buckets.insert(idx, low);
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        let pos = bucket.position(id)?;
        Some(bucket.contacts.remove(pos))
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        let bucket = &self.buckets[self.bucket_index(id)];
        bucket.position(id).map(|pos| &bucket.contacts[pos])
    }

    /// Up to `count` contacts ordered by ascending distance to `target`.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<&Contact> = self.contacts().collect();
        contacts.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));
        contacts.into_iter().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Largest number of contacts held by a single bucket.
    pub fn max_bucket_len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.contacts.len())
            .max()
            .unwrap_or(0)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|b| b.contacts.iter())
    }

    /// Snapshot of the table for export, leaving out contacts that carry an
    /// attached item.
    pub fn snapshot(&self) -> Vec<Contact> {
        self.contacts()
            .filter(|c| c.value.is_none())
            .cloned()
            .collect()
    }
}
