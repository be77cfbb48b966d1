//! The face table: slot-plus-generation ids and the fd / peer-address
//! indices.

use crate::face::Face;
use rust_ccnd_common::error::Error;
use rust_ccnd_common::Result;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Low bits of a face-id form the slot index; the rest are a generation
/// counter so a reused slot yields a distinct id.
pub const FACE_SLOT_BITS: u32 = 18;
pub const MAX_FACES: u32 = (1 << FACE_SLOT_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaceId(pub u32);

impl FaceId {
    pub fn slot(self) -> usize {
        (self.0 & MAX_FACES) as usize
    }
}

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "face{}", self.0)
    }
}

pub struct FaceTable {
    slots: Vec<Option<Face>>,
    gen: u32,
    rover: usize,
    /// Stream faces and bound UDP sockets, keyed by kernel handle.
    pub by_fd: HashMap<RawFd, FaceId>,
    /// Per-peer datagram faces, keyed by peer address.
    pub dgram: HashMap<SocketAddr, FaceId>,
}

impl Default for FaceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceTable {
    pub fn new() -> Self {
        Self {
            slots: (0..32).map(|_| None).collect(),
            gen: 0,
            rover: 0,
            by_fd: HashMap::new(),
            dgram: HashMap::new(),
        }
    }

    /// Assigns a slot (scanning from the rover, bumping the generation on
    /// wrap) and stores the face. Growth is geometric, capped at
    /// [`MAX_FACES`].
    pub fn enroll(&mut self, mut face: Face) -> Result<FaceId> {
        let n = self.slots.len();
        let mut slot = None;
        for i in self.rover..n {
            if self.slots[i].is_none() {
                slot = Some(i);
                break;
            }
        }
        if slot.is_none() {
            for i in 0..n {
                if self.slots[i].is_none() {
                    // bump gen only if the second pass succeeds
                    self.gen = self.gen.wrapping_add(MAX_FACES + 1);
                    slot = Some(i);
                    break;
                }
            }
        }
        let slot = match slot {
            Some(i) => i,
            None => {
                let grown = ((n + 1) * 3 / 2).min(MAX_FACES as usize);
                if grown <= n {
                    return Err(Error::Face("face table full".into()));
                }
                self.slots.resize_with(grown, || None);
                n
            }
        };
        self.rover = slot + 1;
        let id = FaceId(slot as u32 | self.gen);
        face.faceid = id;
        self.slots[slot] = Some(face);
        Ok(id)
    }

    /// Null for a free slot or a stale generation.
    pub fn get(&self, id: FaceId) -> Option<&Face> {
        self.slots
            .get(id.slot())?
            .as_ref()
            .filter(|f| f.faceid == id)
    }

    pub fn get_mut(&mut self, id: FaceId) -> Option<&mut Face> {
        self.slots
            .get_mut(id.slot())?
            .as_mut()
            .filter(|f| f.faceid == id)
    }

    /// Clears the slot and both secondary indices.
    pub fn remove(&mut self, id: FaceId) -> Option<Face> {
        let slot = id.slot();
        if self.get(id).is_none() {
            return None;
        }
        let face = self.slots[slot].take()?;
        if let Some(fd) = face.fd {
            if self.by_fd.get(&fd) == Some(&id) {
                self.by_fd.remove(&fd);
            }
        }
        if let Some(peer) = face.peer {
            if self.dgram.get(&peer) == Some(&id) {
                self.dgram.remove(&peer);
            }
        }
        Some(face)
    }

    pub fn ids(&self) -> Vec<FaceId> {
        self.slots
            .iter()
            .flatten()
            .map(|f| f.faceid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::FaceFlags;

    #[test]
    fn enroll_lookup_destroy() {
        let mut t = FaceTable::new();
        let id = t.enroll(Face::internal(FaceFlags::empty())).unwrap();
        assert!(t.get(id).is_some());
        assert_eq!(t.get(id).unwrap().faceid, id);
        t.remove(id).unwrap();
        assert!(t.get(id).is_none());
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut t = FaceTable::new();
        let mut ids = Vec::new();
        // fill every slot, free them all, then wrap around
        loop {
            match t.enroll(Face::internal(FaceFlags::empty())) {
                Ok(id) => {
                    ids.push(id);
                    if ids.len() > 200 {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let first = ids[0];
        for id in &ids {
            t.remove(*id);
        }
        // rover keeps moving forward until it wraps, which bumps the gen
        let mut reused = None;
        for _ in 0..100_000 {
            let id = t.enroll(Face::internal(FaceFlags::empty())).unwrap();
            if id.slot() == first.slot() {
                reused = Some(id);
                break;
            }
            t.remove(id);
        }
        let reused = reused.expect("slot should be reused eventually");
        assert_ne!(reused, first);
        assert!(t.get(first).is_none());
        assert!(t.get(reused).is_some());
    }
}
