//! Outbound content queues and the per-face sender.

use crate::config::{DEBUG_CONTENT, DEBUG_MATCH};
use crate::daemon::Daemon;
use crate::face::{ContentQueue, DelayClass, FaceFlags};
use crate::faces::FaceId;
use crate::sched::TimedEvent;
use bytes::BytesMut;
use rand::Rng;
use rust_ccnd_common::coding::{self, dtag, Tt};
use rust_ccnd_common::content::DIGEST_COMPONENT_BYTES;

/// Base inter-send delay for link-wrapped faces.
const DATA_PAUSE_USEC: u64 = 2000;

/// Consecutive productive drains after which spacing stops randomizing.
const STEADY_RUNS: u32 = 12;

impl Daemon {
    fn choose_face_delay(flags: FaceFlags, class: DelayClass) -> u64 {
        let shift = if class == DelayClass::Slow { 2 } else { 0 };
        if class == DelayClass::Asap {
            return 1;
        }
        if flags.contains(FaceFlags::LINK) {
            return DATA_PAUSE_USEC << shift;
        }
        if flags.contains(FaceFlags::DGRAM) {
            return 100 << shift;
        }
        10
    }

    fn choose_content_delay_class(&self, faceid: FaceId, slow_send: bool) -> DelayClass {
        let flags = match self.faces.get(faceid) {
            Some(f) => f.flags,
            None => return DelayClass::Asap, // going nowhere, get it over with
        };
        if flags.contains(FaceFlags::DGRAM) && !flags.contains(FaceFlags::LINK) {
            return DelayClass::Normal;
        }
        if flags.contains(FaceFlags::LINK) {
            return if slow_send {
                DelayClass::Slow
            } else {
                DelayClass::Normal
            };
        }
        DelayClass::Asap
    }

    fn randomize_content_delay(&mut self, usec: u64, steady: bool) -> u64 {
        if usec < 2 {
            return 1;
        }
        if usec <= 20 || steady {
            return usec;
        }
        self.rng.gen_range(0..(2 * usec - 1)) + 1
    }

    /// Queues one stored object for transmission on a face, scheduling
    /// the class sender if it is not already pending.
    pub(crate) fn face_send_queue_insert(&mut self, faceid: FaceId, accession: u64) {
        let slow_send = self
            .store
            .from_accession(accession)
            .map_or(false, |e| e.flags.contains(crate::store::ContentFlags::SLOWSEND));
        let class = self.choose_content_delay_class(faceid, slow_send);
        let (usec, needs_sched) = {
            let face = match self.faces.get_mut(faceid) {
                Some(f) if !f.flags.contains(FaceFlags::NOSEND) => f,
                _ => return,
            };
            let flags = face.flags;
            let q = face.queues[class.index()]
                .get_or_insert_with(|| ContentQueue::new(Self::choose_face_delay(flags, class)));
            if !q.send_queue.contains(&accession) {
                q.send_queue.push(accession);
            }
            if q.sender.is_none() {
                q.ready = q.send_queue.len();
                (q.usec, true)
            } else {
                (0, false)
            }
        };
        if needs_sched {
            let steady = self
                .faces
                .get(faceid)
                .and_then(|f| f.queues[class.index()].as_ref())
                .map_or(false, |q| q.nrun >= STEADY_RUNS);
            let delay = self.randomize_content_delay(usec, steady);
            let h = self.schedule(delay, TimedEvent::SendQueue { face: faceid, class });
            if let Some(q) = self
                .faces
                .get_mut(faceid)
                .and_then(|f| f.queues[class.index()].as_mut())
            {
                q.sender = Some(h);
            }
        }
    }

    /// One sender tick: transmit the entries that have waited enough,
    /// then decide when to run again (0 unschedules).
    pub(crate) fn content_sender(&mut self, faceid: FaceId, class: DelayClass, cancel: bool) -> u64 {
        let bail = |daemon: &mut Daemon| {
            if let Some(q) = daemon
                .faces
                .get_mut(faceid)
                .and_then(|f| f.queues[class.index()].as_mut())
            {
                q.sender = None;
            }
            0
        };
        if cancel {
            return bail(self);
        }
        let batch: Vec<u64> = {
            let face = match self.faces.get_mut(faceid) {
                Some(f) if !f.flags.contains(FaceFlags::NOSEND) => f,
                _ => return bail(self),
            };
            let q = match face.queues[class.index()].as_mut() {
                Some(q) => q,
                None => return bail(self),
            };
            if q.ready > q.send_queue.len() {
                q.ready = q.send_queue.len();
            }
            q.send_queue[..q.ready].to_vec()
        };
        let mut sent = 0usize;
        for accession in &batch {
            if self.store.from_accession(*accession).is_some() {
                self.send_content(faceid, *accession);
                sent += 1;
                // face may have vanished mid-drain
                if self.faces.get(faceid).is_none() {
                    return 0;
                }
            }
        }
        let (usec, steady, live_remainder) = {
            let face = match self.faces.get_mut(faceid) {
                Some(f) => f,
                None => return 0,
            };
            let q = match face.queues[class.index()].as_mut() {
                Some(q) => q,
                None => return 0,
            };
            q.send_queue.drain(..batch.len());
            q.ready = q.send_queue.len();
            if sent > 0 {
                q.nrun += 1;
            } else {
                q.nrun = 0;
            }
            (q.usec, q.nrun >= STEADY_RUNS, q.send_queue.clone())
        };
        if live_remainder
            .iter()
            .any(|a| self.store.from_accession(*a).is_some())
        {
            return self.randomize_content_delay(usec, steady);
        }
        if let Some(q) = self
            .faces
            .get_mut(faceid)
            .and_then(|f| f.queues[class.index()].as_mut())
        {
            q.send_queue.clear();
            q.ready = 0;
        }
        bail(self)
    }

    /// Transmits one stored object on a face: the digest component is
    /// excised, pending interests are stuffed into the frame, and
    /// link-wrapped faces get the PDU wrapper.
    pub(crate) fn send_content(&mut self, faceid: FaceId, accession: u64) {
        let flags = match self.faces.get(faceid) {
            Some(f) if !f.flags.contains(FaceFlags::NOSEND) => f.flags,
            _ => return,
        };
        let (data, a, b) = match self.store.from_accession(accession) {
            Some(e) => {
                let nb = e.pco.comps.len();
                debug_assert!(nb >= 2);
                (e.data.clone(), e.pco.comps[nb - 2], e.pco.comps[nb - 1])
            }
            None => return,
        };
        if b - a != DIGEST_COMPONENT_BYTES {
            self.debug_msg(DEBUG_CONTENT, "strange_digest", faceid, data.len());
        }
        self.debug_msg(DEBUG_CONTENT, "content_to", faceid, data.len());
        let mut frame = BytesMut::with_capacity(data.len() + 8);
        if flags.contains(FaceFlags::LINK) {
            coding::append_tt(&mut frame, dtag::CCN_PROTOCOL_DATA_UNIT, Tt::Dtag);
        }
        frame.extend_from_slice(&data[..a]);
        frame.extend_from_slice(&data[b..]);
        self.stuff_interests(faceid, &mut frame);
        if flags.contains(FaceFlags::LINK) {
            coding::append_closer(&mut frame);
        }
        self.do_write(faceid, &frame);
        self.metrics.content_items_sent.increment();
    }

    /// Writes an already-encoded message, stuffing pending interests
    /// behind it (inside the PDU wrapper on link faces).
    pub(crate) fn stuff_and_write(&mut self, faceid: FaceId, data: &[u8]) {
        let link = self
            .faces
            .get(faceid)
            .map_or(false, |f| f.flags.contains(FaceFlags::LINK));
        let mut frame = BytesMut::with_capacity(data.len() + 8);
        if link {
            coding::append_tt(&mut frame, dtag::CCN_PROTOCOL_DATA_UNIT, Tt::Dtag);
            frame.extend_from_slice(data);
            self.stuff_interests(faceid, &mut frame);
            coding::append_closer(&mut frame);
        } else {
            frame.extend_from_slice(data);
            self.stuff_interests(faceid, &mut frame);
        }
        self.do_write(faceid, &frame);
    }

    pub(crate) fn note_consume_debug(&self, faceid: FaceId, size: usize) {
        self.debug_msg(DEBUG_MATCH, "consume", faceid, size);
    }
}
