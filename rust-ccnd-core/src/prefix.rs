//! Name-prefix table.
//!
//! A prefix entry anchors the pending interests for one exact prefix and
//! keeps a little adaptive state: a predicted response time and the two
//! most recent faces that produced matching content. Keys are the
//! byte-exact concatenation of the encoded Component elements, so
//! interests and content index the same entries.

use crate::faces::FaceId;
use crate::pit::{PitIdx, PitTable};
use bitflags::bitflags;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;

/// Bounds on the predicted response time.
pub const MIN_PREDICTED_USEC: u64 = 127;
pub const MAX_PREDICTED_USEC: u64 = 1_000_000;

bitflags! {
    pub struct ForwardingFlags: u32 {
        const ACTIVE        = 1 << 0;
        /// Entry also applies to longer prefixes.
        const CHILD_INHERIT = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardingEntry {
    pub faceid: FaceId,
    pub flags: ForwardingFlags,
    /// Seconds until the registration lapses.
    pub expires: i64,
}

#[derive(Debug)]
pub struct PrefixEntry {
    /// Sentinel slot of this prefix's PIT list.
    pub head: PitIdx,
    /// Face that most recently supplied matching content.
    pub src: Option<FaceId>,
    /// The one before that.
    pub osrc: Option<FaceId>,
    /// Predicted response time in microseconds.
    pub usec: u64,
    pub forwarding: Vec<ForwardingEntry>,
}

impl PrefixEntry {
    /// Multiplicative response-time update: slow decay on a hit, sharp
    /// increase on a miss, clamped to the working range.
    pub fn adjust_predicted(&mut self, up: bool) {
        let t = self.usec;
        let t = if up { t + (t >> 3) } else { t - (t >> 7) };
        self.usec = t.clamp(MIN_PREDICTED_USEC, MAX_PREDICTED_USEC);
    }

    /// Records that matching content arrived from `fid`.
    pub fn note_content_from(&mut self, fid: FaceId) {
        if self.src == Some(fid) {
            self.adjust_predicted(false);
        } else if self.src.is_none() {
            self.src = Some(fid);
        } else {
            self.osrc = self.src;
            self.src = Some(fid);
        }
    }
}

pub struct PrefixTable {
    pub map: HashMap<Bytes, PrefixEntry>,
}

impl Default for PrefixTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&PrefixEntry> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut PrefixEntry> {
        self.map.get_mut(key)
    }

    /// Finds or creates the entry for `key`. A fresh entry starts with no
    /// source hints and a jittered initial response-time estimate.
    /// Returns true when the entry was created.
    pub fn seek(&mut self, key: Bytes, pit: &mut PitTable, rng: &mut impl Rng) -> bool {
        if self.map.contains_key(&key) {
            return false;
        }
        let head = pit.new_sentinel();
        self.map.insert(
            key,
            PrefixEntry {
                head,
                src: None,
                osrc: None,
                usec: rng.gen_range(0..4096) + 8192,
                forwarding: Vec::new(),
            },
        );
        true
    }

    pub fn keys(&self) -> Vec<Bytes> {
        self.map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> PrefixEntry {
        PrefixEntry {
            head: 0,
            src: None,
            osrc: None,
            usec: 10_000,
            forwarding: Vec::new(),
        }
    }

    #[test]
    fn adjust_clamps() {
        let mut e = entry();
        e.usec = 128;
        for _ in 0..100 {
            e.adjust_predicted(false);
        }
        assert_eq!(e.usec, MIN_PREDICTED_USEC);
        for _ in 0..200 {
            e.adjust_predicted(true);
        }
        assert_eq!(e.usec, MAX_PREDICTED_USEC);
    }

    #[test]
    fn source_hint_rotation() {
        let mut e = entry();
        let (a, b) = (FaceId(7), FaceId(9));
        e.note_content_from(a);
        assert_eq!(e.src, Some(a));
        assert_eq!(e.osrc, None);
        // repeat hit shrinks the estimate instead of rotating
        let before = e.usec;
        e.note_content_from(a);
        assert!(e.usec < before);
        assert_eq!(e.src, Some(a));
        e.note_content_from(b);
        assert_eq!(e.src, Some(b));
        assert_eq!(e.osrc, Some(a));
    }
}
