//! Content ingress and the content → interest matcher.

use crate::config::{DEBUG_CONTENT, DEBUG_MATCH};
use crate::daemon::Daemon;
use crate::face::FaceFlags;
use crate::faces::FaceId;
use crate::sched::TimedEvent;
use crate::store::{ContentFlags, InsertOutcome};
use bytes::Bytes;
use log::{debug, error, info, warn};
use rust_ccnd_common::content::{
    content_matches_interest, parse_content_object, with_digest_component,
};

/// FreshnessSeconds beyond this cannot be timed in microseconds.
const MAX_FRESHNESS_SECS: u64 = (1u64 << 31) / 1_000_000;

impl Daemon {
    /// Parses, digests, deduplicates, and enrolls an arriving object,
    /// then wakes the interests it satisfies.
    pub(crate) fn process_incoming_content(&mut self, faceid: FaceId, wire: Bytes) {
        let pco = match parse_content_object(&wire) {
            Ok(p) => p,
            Err(e) => {
                error!("error parsing ContentObject - {}", e);
                return;
            }
        };
        let keysize = pco.comps[pco.comps.len() - 1];
        if keysize > 65535 - 36 {
            info!("ContentObject with keysize {} discarded", keysize);
            return;
        }
        if pco.legacy {
            self.metrics.oldformat_content.increment();
            let n = self.metrics.oldformat_content.value();
            if n == self.oldformat_grumble {
                self.oldformat_grumble *= 10;
                info!("downrev content items received: {}", n);
            }
        }
        // Materialize the digest as an explicit final name component and
        // re-parse so component offsets describe the stored form.
        let full = with_digest_component(&wire, &pco);
        let pco = match parse_content_object(&full) {
            Ok(p) => p,
            Err(_) => {
                debug_assert!(false, "digest splice must keep the object well-formed");
                return;
            }
        };
        self.debug_msg(DEBUG_CONTENT, "content_from", faceid, full.len());

        let (accession, is_new) = match self.store.insert(full, pco, &mut self.rng) {
            InsertOutcome::New(a) => {
                self.metrics.cs_size.set(self.store.count() as u64);
                (a, true)
            }
            InsertOutcome::Duplicate(a) => {
                self.metrics.content_dups_recvd.increment();
                debug!(
                    "received duplicate ContentObject from {} (accession {})",
                    faceid, a
                );
                (a, false)
            }
            InsertOutcome::Collision => {
                warn!("ContentObject name collision; both copies dropped");
                return;
            }
        };
        if is_new {
            let freshness = self
                .store
                .from_accession(accession)
                .and_then(|e| e.pco.freshness_seconds);
            self.set_content_timer(accession, freshness);
        }
        // A duplicate still wakes interests pending on the arrival face.
        let restrict = if is_new { None } else { Some(faceid) };
        let n_matches = self.match_interests(accession, restrict, Some(faceid));
        if is_new && n_matches == 0 {
            let link = self
                .faces
                .get(faceid)
                .map_or(false, |f| f.flags.contains(FaceFlags::LINK));
            if link {
                // nothing was waiting; the peer that sent it likely has it
                if let Some(e) = self.store.from_accession_mut(accession) {
                    e.flags.insert(ContentFlags::SLOWSEND);
                }
            }
        }
        // If this consumed interests from the source, don't echo the
        // object straight back to it.
        let squash = self.cfg.debug_enabled(DEBUG_MATCH);
        if let Some(f) = self.faces.get_mut(faceid) {
            for q in f.queues.iter_mut().flatten() {
                for slot in q.send_queue.iter_mut() {
                    if *slot == accession {
                        if squash {
                            debug!("content_nosend face={} accession={}", faceid, accession);
                        }
                        *slot = 0;
                    }
                }
            }
        }
    }

    fn set_content_timer(&mut self, accession: u64, freshness: Option<u64>) {
        let seconds = match freshness {
            Some(s) if s > 0 => s,
            _ => return,
        };
        if seconds > MAX_FRESHNESS_SECS {
            debug!("FreshnessSeconds {} too large; not timed", seconds);
            return;
        }
        self.schedule(seconds * 1_000_000, TimedEvent::FreshnessExpire { accession });
    }

    /// Freshness expiry: flips the entry stale, or removes it outright
    /// when the store is already well over quota.
    pub(crate) fn expire_content(&mut self, accession: u64) {
        if self.store.from_accession(accession).is_none() {
            return;
        }
        let n = self.store.count();
        let over = (n - (n >> 3)) > self.store.capacity
            || (n > self.store.capacity && self.store.min_stale > self.store.max_stale);
        if over && self.remove_content(accession) {
            return;
        }
        self.mark_stale_content(accession);
    }

    pub(crate) fn mark_stale_content(&mut self, accession: u64) {
        if self.store.mark_stale(accession) {
            self.debug_msg(DEBUG_CONTENT, "stale", FaceId(0), 0);
        }
    }

    /// Content → interests: walk the stored name's prefixes from longest
    /// to shortest, consuming the pending interests each prefix anchors
    /// and updating the source hints where matches happened.
    pub(crate) fn match_interests(
        &mut self,
        accession: u64,
        restrict: Option<FaceId>,
        from_face: Option<FaceId>,
    ) -> usize {
        let (data, comps) = match self.store.from_accession(accession) {
            Some(e) => (e.data.clone(), e.pco.comps.clone()),
            None => return 0,
        };
        let total = comps.len() - 1;
        let mut n_matched = 0;
        let mut cm: Option<usize> = None;
        for ci in (0..=total).rev() {
            let key = data.slice(comps[0]..comps[ci]);
            if self.prefixes.get(&key).is_none() {
                continue;
            }
            let new_matches = self.consume_matching_interests(key.clone(), accession, restrict);
            if let Some(src) = from_face {
                if new_matches != 0 || cm == Some(ci + 1) {
                    if let Some(e) = self.prefixes.get_mut(&key) {
                        e.note_content_from(src);
                    }
                }
            }
            if new_matches != 0 {
                cm = Some(ci);
                n_matched += new_matches;
            }
        }
        n_matched
    }

    /// Runs the full predicate over one prefix entry's PIT list,
    /// queueing the content toward each satisfied interest's face and
    /// consuming the entry.
    fn consume_matching_interests(
        &mut self,
        prefix_key: Bytes,
        accession: u64,
        restrict: Option<FaceId>,
    ) -> usize {
        let head = match self.prefixes.get(&prefix_key) {
            Some(e) => e.head,
            None => return 0,
        };
        let (data, pco, is_stale) = match self.store.from_accession(accession) {
            Some(e) => (
                e.data.clone(),
                e.pco.clone(),
                e.flags.contains(ContentFlags::STALE),
            ),
            None => return 0,
        };
        let mut matches = 0;
        let mut p = self.pit.next_of(head);
        while p != head {
            let next = self.pit.next_of(p);
            let verdict = match self.pit.entry_at(p) {
                Some(e) => match &e.interest_msg {
                    Some(msg) => {
                        let face_ok = match restrict {
                            None => self.faces.get(e.faceid).is_some(),
                            Some(f) => e.faceid == f,
                        };
                        // stale content answers only stale-tolerant interests
                        let stale_ok =
                            !is_stale || e.pi.answer_origin & rust_ccnd_common::interest::AOK_STALE != 0;
                        if face_ok && stale_ok && content_matches_interest(&data, &pco, msg, &e.pi) {
                            Some((e.faceid, self.pit.ref_at(p), msg.len()))
                        } else {
                            None
                        }
                    }
                    None => None,
                },
                None => None,
            };
            if let Some((target, r, size)) = verdict {
                self.face_send_queue_insert(target, accession);
                self.note_consume_debug(target, size);
                matches += 1;
                self.consume(r);
            }
            p = next;
        }
        matches
    }
}
