//! Pending Interest Table.
//!
//! Entries live in a slab indexed by `PitIdx`; `PitRef` adds a
//! generation so a reference outliving its entry is detectably stale.
//! Each name-prefix entry owns a sentinel slot whose prev/next links
//! form a circular list of the pending interests for that prefix.

use crate::faces::FaceId;
use bitflags::bitflags;
use bytes::Bytes;
use rust_ccnd_common::interest::ParsedInterest;
use std::collections::HashMap;

pub type PitIdx = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitRef {
    pub idx: PitIdx,
    pub gen: u32,
}

bitflags! {
    pub struct PitFlags: u32 {
        /// Never transmitted anywhere yet.
        const UNSENT   = 1 << 0;
        /// Sent to one place; next tick re-costs the prediction.
        const WAIT1    = 1 << 1;
        /// First transmission happened by piggybacking.
        const STUFFED1 = 1 << 2;
    }
}

#[derive(Debug)]
pub struct PitEntry {
    /// Owned copy of the (nonce-bearing) Interest bytes; None once the
    /// entry has been consumed and only the tombstone remains.
    pub interest_msg: Option<Bytes>,
    /// Parsed offsets for `interest_msg`.
    pub pi: ParsedInterest,
    pub flags: PitFlags,
    /// Originating face; destination for matches.
    pub faceid: FaceId,
    /// Residual lifetime in microseconds.
    pub usec: i64,
    /// Lifetime the entry started with.
    pub lifetime_usec: i64,
    /// Faces still to be tried, popped from the tail.
    pub outbound: Option<Vec<FaceId>>,
    /// The Nonce element bytes keying this entry.
    pub nonce: Bytes,
    /// Reap passes the tombstone survives for duplicate suppression.
    pub tombstone_ttl: u8,
}

#[derive(Debug)]
struct Slot {
    gen: u32,
    prev: PitIdx,
    next: PitIdx,
    ent: Option<PitEntry>,
    live: bool,
}

pub struct PitTable {
    slots: Vec<Slot>,
    free: Vec<PitIdx>,
    pub by_nonce: HashMap<Bytes, PitRef>,
}

impl Default for PitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PitTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_nonce: HashMap::new(),
        }
    }

    fn alloc(&mut self) -> PitIdx {
        if let Some(idx) = self.free.pop() {
            let s = &mut self.slots[idx as usize];
            s.gen = s.gen.wrapping_add(1);
            s.live = true;
            s.prev = idx;
            s.next = idx;
            idx
        } else {
            let idx = self.slots.len() as PitIdx;
            self.slots.push(Slot {
                gen: 0,
                prev: idx,
                next: idx,
                ent: None,
                live: true,
            });
            idx
        }
    }

    /// Allocates the list head for one prefix entry.
    pub fn new_sentinel(&mut self) -> PitIdx {
        self.alloc()
    }

    /// Releases a sentinel whose list must already be empty.
    pub fn free_sentinel(&mut self, idx: PitIdx) {
        debug_assert_eq!(self.slots[idx as usize].next, idx);
        self.release_slot(idx);
    }

    fn release_slot(&mut self, idx: PitIdx) {
        let s = &mut self.slots[idx as usize];
        debug_assert!(s.live);
        s.ent = None;
        s.live = false;
        s.prev = idx;
        s.next = idx;
        self.free.push(idx);
    }

    /// Stores an entry, links it at the tail of `head`'s list, and keys
    /// it by its nonce.
    pub fn insert(&mut self, entry: PitEntry, head: PitIdx) -> PitRef {
        let nonce = entry.nonce.clone();
        let idx = self.alloc();
        self.slots[idx as usize].ent = Some(entry);
        self.link_before(idx, head);
        let r = PitRef {
            idx,
            gen: self.slots[idx as usize].gen,
        };
        self.by_nonce.insert(nonce, r);
        r
    }

    fn link_before(&mut self, idx: PitIdx, head: PitIdx) {
        let prev = self.slots[head as usize].prev;
        self.slots[idx as usize].next = head;
        self.slots[idx as usize].prev = prev;
        self.slots[prev as usize].next = idx;
        self.slots[head as usize].prev = idx;
    }

    /// Detaches a slot from its list; idempotent.
    pub fn unlink(&mut self, idx: PitIdx) {
        let (prev, next) = {
            let s = &self.slots[idx as usize];
            (s.prev, s.next)
        };
        if next != idx {
            self.slots[prev as usize].next = next;
            self.slots[next as usize].prev = prev;
            let s = &mut self.slots[idx as usize];
            s.prev = idx;
            s.next = idx;
        }
    }

    pub fn get(&self, r: PitRef) -> Option<&PitEntry> {
        let s = self.slots.get(r.idx as usize)?;
        if !s.live || s.gen != r.gen {
            return None;
        }
        s.ent.as_ref()
    }

    pub fn get_mut(&mut self, r: PitRef) -> Option<&mut PitEntry> {
        let s = self.slots.get_mut(r.idx as usize)?;
        if !s.live || s.gen != r.gen {
            return None;
        }
        s.ent.as_mut()
    }

    /// Entry at a raw slot index (list iteration).
    pub fn entry_at(&self, idx: PitIdx) -> Option<&PitEntry> {
        self.slots[idx as usize].ent.as_ref()
    }

    pub fn entry_at_mut(&mut self, idx: PitIdx) -> Option<&mut PitEntry> {
        self.slots[idx as usize].ent.as_mut()
    }

    pub fn ref_at(&self, idx: PitIdx) -> PitRef {
        PitRef {
            idx,
            gen: self.slots[idx as usize].gen,
        }
    }

    pub fn next_of(&self, idx: PitIdx) -> PitIdx {
        self.slots[idx as usize].next
    }

    pub fn prev_of(&self, idx: PitIdx) -> PitIdx {
        self.slots[idx as usize].prev
    }

    pub fn lookup_nonce(&self, nonce: &[u8]) -> Option<PitRef> {
        self.by_nonce.get(nonce).copied()
    }

    /// Frees a consumed entry outright (tombstone expiry or shutdown).
    pub fn release(&mut self, r: PitRef) {
        if let Some(s) = self.slots.get(r.idx as usize) {
            if !s.live || s.gen != r.gen || s.ent.is_none() {
                return;
            }
        } else {
            return;
        }
        self.unlink(r.idx);
        let nonce = self.slots[r.idx as usize]
            .ent
            .as_ref()
            .map(|e| e.nonce.clone());
        if let Some(nonce) = nonce {
            if self.by_nonce.get(&nonce) == Some(&r) {
                self.by_nonce.remove(&nonce);
            }
        }
        self.release_slot(r.idx);
    }

    /// Number of entries whose interest bytes are still live.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| {
                s.live
                    && s.ent
                        .as_ref()
                        .map_or(false, |e| e.interest_msg.is_some())
            })
            .count()
    }

    /// All current refs, for table sweeps.
    pub fn refs(&self) -> Vec<PitRef> {
        self.by_nonce.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_ccnd_common::interest::{parse_interest, InterestBuilder};
    use rust_ccnd_common::name::Name;

    fn entry(nonce: &[u8]) -> PitEntry {
        let msg = InterestBuilder::new(Name::from_uri("/t").unwrap())
            .nonce(nonce.to_vec())
            .build();
        let pi = parse_interest(&msg).unwrap();
        let nonce = msg.slice(pi.nonce.clone());
        PitEntry {
            interest_msg: Some(msg),
            pi,
            flags: PitFlags::empty(),
            faceid: FaceId(1),
            usec: 4_000_000,
            lifetime_usec: 4_000_000,
            outbound: None,
            nonce,
            tombstone_ttl: 0,
        }
    }

    #[test]
    fn list_links_and_unlink() {
        let mut pit = PitTable::new();
        let head = pit.new_sentinel();
        let a = pit.insert(entry(&[1, 1, 1, 1]), head);
        let b = pit.insert(entry(&[2, 2, 2, 2]), head);
        // tail insertion: head -> a -> b -> head
        assert_eq!(pit.next_of(head), a.idx);
        assert_eq!(pit.next_of(a.idx), b.idx);
        assert_eq!(pit.next_of(b.idx), head);
        pit.unlink(a.idx);
        assert_eq!(pit.next_of(head), b.idx);
        assert_eq!(pit.next_of(b.idx), head);
        pit.release(a);
        pit.release(b);
        assert_eq!(pit.next_of(head), head);
        pit.free_sentinel(head);
    }

    #[test]
    fn stale_ref_after_reuse() {
        let mut pit = PitTable::new();
        let head = pit.new_sentinel();
        let a = pit.insert(entry(&[1, 2, 3, 4]), head);
        pit.release(a);
        let b = pit.insert(entry(&[5, 6, 7, 8]), head);
        assert_eq!(a.idx, b.idx); // slot reused
        assert!(pit.get(a).is_none());
        assert!(pit.get(b).is_some());
    }

    #[test]
    fn nonce_index() {
        let mut pit = PitTable::new();
        let head = pit.new_sentinel();
        let a = pit.insert(entry(&[9, 9, 9, 9]), head);
        let nonce = pit.get(a).unwrap().nonce.clone();
        assert_eq!(pit.lookup_nonce(&nonce), Some(a));
        pit.release(a);
        assert_eq!(pit.lookup_nonce(&nonce), None);
    }
}
