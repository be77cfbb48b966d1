//! Interest processing: duplicate suppression, similar-interest
//! coalescing, outbound-face selection, propagation ticks, and
//! interest stuffing.

use crate::config::{DEBUG_INTEREST, DEBUG_MATCH, DEBUG_PIT};
use crate::daemon::Daemon;
use crate::face::FaceFlags;
use crate::faces::FaceId;
use crate::pit::{PitEntry, PitFlags, PitRef};
use crate::prefix::ForwardingFlags;
use crate::sched::TimedEvent;
use bytes::{Bytes, BytesMut};
use log::{debug, error, warn};
use rand::Rng;
use rust_ccnd_common::coding::component_value;
use rust_ccnd_common::content::content_matches_interest;
use rust_ccnd_common::interest::{
    parse_interest, with_nonce, ParsedInterest, AOK_CS, AOK_EXPIRE, AOK_STALE,
    DEFAULT_LIFETIME_USEC,
};

/// Bytes of Nonce the forwarder inserts when an interest carries none.
const GENERATED_NONCE_BYTES: usize = 6;

/// Near-duplicates tolerated from the same face before dropping.
const MAX_REDUNDANT_SAME_FACE: usize = 3;

/// Swap-remove; the vacated position is filled from the tail.
fn remove_faceid_swap(v: &mut Vec<FaceId>, fid: FaceId) -> bool {
    match v.iter().position(|f| *f == fid) {
        Some(i) => {
            v.swap_remove(i);
            true
        }
        None => false,
    }
}

/// Order-preserving remove.
fn remove_faceid_ordered(v: &mut Vec<FaceId>, fid: FaceId) -> bool {
    match v.iter().position(|f| *f == fid) {
        Some(i) => {
            v.remove(i);
            true
        }
        None => false,
    }
}

/// Moves `fid` to the final place so the send loop, popping from the
/// tail, tries it first.
fn move_to_end(v: &mut Vec<FaceId>, fid: FaceId) {
    if let Some(i) = v.iter().position(|f| *f == fid) {
        if i + 1 < v.len() {
            let fid = v.remove(i);
            v.push(fid);
        }
    }
}

impl Daemon {
    pub(crate) fn process_incoming_interest(&mut self, faceid: FaceId, msg: Bytes) {
        if msg.len() > 65535 {
            error!("oversize Interest from {} dropped", faceid);
            return;
        }
        let pi = match parse_interest(&msg) {
            Ok(pi) => pi,
            Err(e) => {
                error!("error parsing Interest - {}", e);
                return;
            }
        };
        let flags = match self.faces.get(faceid) {
            Some(f) => f.flags,
            None => return,
        };
        if pi.scope.map_or(false, |s| s < 2) && flags.contains(FaceFlags::LINK) {
            self.debug_msg(DEBUG_INTEREST, "interest_outofscope", faceid, msg.len());
            return;
        }
        if self.is_duplicate_flooded(&msg, &pi, faceid) {
            self.debug_msg(DEBUG_PIT, "interest_dup", faceid, msg.len());
            self.metrics.interests_dropped.increment();
            return;
        }
        self.debug_msg(DEBUG_INTEREST, "interest_from", faceid, msg.len());
        if pi.child_selector > 1 {
            if let Some(f) = self.faces.get_mut(faceid) {
                f.cached_accession = None;
            }
        }
        self.metrics.interests_accepted.increment();
        let s_ok = pi.answer_origin & AOK_STALE != 0;
        let prefix_key = msg.slice(pi.prefix_key_range());
        self.seek_prefix_with_parent(&msg, &pi);

        let mut matched = false;
        if pi.answer_origin & AOK_CS != 0 {
            let found = self.find_content_for_interest(faceid, &msg, &pi, s_ok);
            if let Some(accession) = found {
                let already_queued = self
                    .faces
                    .get(faceid)
                    .map_or(false, |f| f.send_queues_member(accession));
                if !already_queued {
                    self.propagate_interest(faceid, &msg, &pi, prefix_key.clone());
                    let n = self.match_interests(accession, Some(faceid), None);
                    if n < 1 && self.cfg.debug != 0 {
                        debug!("expected_match_did_not_happen face={}", faceid);
                    }
                }
                if pi.answer_origin & AOK_EXPIRE != 0 {
                    self.mark_stale_content(accession);
                }
                if let Some(f) = self.faces.get_mut(faceid) {
                    f.cached_accession = Some(accession);
                }
                matched = true;
            }
        }
        if !matched && pi.scope != Some(0) {
            self.propagate_interest(faceid, &msg, &pi, prefix_key);
        }
    }

    /// Interest → content selection over the name-ordered skiplist.
    fn find_content_for_interest(
        &mut self,
        faceid: FaceId,
        msg: &Bytes,
        pi: &ParsedInterest,
        s_ok: bool,
    ) -> Option<u64> {
        let mut candidate: Option<u64> = None;
        // resume hint for enumerating clients
        let cached = self.faces.get_mut(faceid).and_then(|f| f.cached_accession.take());
        if let Some(ca) = cached {
            if self.content_prefix_matches(ca, msg, pi) {
                let next = self.store.next_in_name_order(ca);
                self.debug_msg(DEBUG_MATCH, "resume", faceid, 0);
                candidate = next.filter(|&a| self.content_prefix_matches(a, msg, pi));
            }
        }
        if candidate.is_none() {
            let key: Vec<&[u8]> = (0..pi.prefix_comps)
                .map(|i| component_value(msg, pi.comp_range(i)).unwrap_or(&[]))
                .collect();
            candidate = self
                .store
                .first_at_or_after(&key)
                .filter(|&a| self.content_prefix_matches(a, msg, pi));
        }
        let rightmost = pi.child_selector == 5;
        let mut last_match = None;
        while let Some(accession) = candidate {
            let e = match self.store.from_accession(accession) {
                Some(e) => e,
                None => break,
            };
            let stale = e.flags.contains(crate::store::ContentFlags::STALE);
            if (s_ok || !stale) && content_matches_interest(&e.data, &e.pco, msg, pi) {
                self.debug_msg(DEBUG_MATCH, "matches", faceid, e.data.len());
                if !rightmost {
                    return Some(accession);
                }
                last_match = Some(accession);
            }
            candidate = self
                .store
                .next_in_name_order(accession)
                .filter(|&a| self.content_prefix_matches(a, msg, pi));
        }
        last_match
    }

    /// Byte-exact check that a stored object's name extends the
    /// interest's prefix.
    pub(crate) fn content_prefix_matches(
        &self,
        accession: u64,
        msg: &[u8],
        pi: &ParsedInterest,
    ) -> bool {
        let e = match self.store.from_accession(accession) {
            Some(e) => e,
            None => return false,
        };
        if e.ncomps() < pi.prefix_comps {
            return false;
        }
        let want = &msg[pi.comps[0]..pi.comps[pi.prefix_comps]];
        let have = &e.data[e.pco.comps[0]..e.pco.comps[pi.prefix_comps]];
        want == have
    }

    /// Finds or creates the prefix entry; a brand-new entry at depth >= 1
    /// inherits its history from the one-level-shorter prefix, creating
    /// that parent if needed so the history has a place to live.
    fn seek_prefix_with_parent(&mut self, msg: &Bytes, pi: &ParsedInterest) {
        let key = msg.slice(pi.prefix_key_range());
        let is_new = self
            .prefixes
            .seek(key.clone(), &mut self.pit, &mut self.rng);
        if is_new && pi.prefix_comps > 0 {
            let pkey = msg.slice(pi.comps[0]..pi.comps[pi.prefix_comps - 1]);
            let parent_new = self
                .prefixes
                .seek(pkey.clone(), &mut self.pit, &mut self.rng);
            if parent_new {
                let usec = self.prefixes.get(&key).unwrap().usec;
                self.prefixes.get_mut(&pkey).unwrap().usec = usec;
            } else {
                let (src, osrc, usec) = {
                    let p = self.prefixes.get(&pkey).unwrap();
                    (p.src, p.osrc, p.usec)
                };
                let e = self.prefixes.get_mut(&key).unwrap();
                e.src = src;
                e.osrc = osrc;
                e.usec = usec;
            }
        }
    }

    /// A matching Nonce always means a duplicate; the arrival face is
    /// also scratched from the original's outbound set so we don't send
    /// the interest back to a face that already has it.
    fn is_duplicate_flooded(&mut self, msg: &[u8], pi: &ParsedInterest, faceid: FaceId) -> bool {
        if !pi.has_nonce() {
            return false;
        }
        let nonce = &msg[pi.nonce.clone()];
        if let Some(r) = self.pit.lookup_nonce(nonce) {
            if let Some(e) = self.pit.get_mut(r) {
                if let Some(outbound) = e.outbound.as_mut() {
                    remove_faceid_swap(outbound, faceid);
                }
            }
            return true;
        }
        false
    }

    /// Base outbound set per scope, replaced by forwarding entries when
    /// any prefix level carries an active registration.
    fn get_outbound_faces(
        &self,
        from: FaceId,
        msg: &[u8],
        pi: &ParsedInterest,
    ) -> Vec<FaceId> {
        if pi.scope == Some(0) {
            return Vec::new();
        }
        let block_link = pi.scope == Some(1);
        let eligible = |daemon: &Daemon, fid: FaceId| -> bool {
            if fid == from {
                return false;
            }
            match daemon.faces.get(fid) {
                Some(f) => !(block_link && f.flags.contains(FaceFlags::LINK)),
                None => false,
            }
        };
        let mut x = Vec::new();
        let mut have_forwarding = false;
        for k in (0..=pi.prefix_comps).rev() {
            let key = &msg[pi.comps[0]..pi.comps[k]];
            if let Some(e) = self.prefixes.get(key) {
                for fe in &e.forwarding {
                    if !fe.flags.contains(ForwardingFlags::ACTIVE) {
                        continue;
                    }
                    if k != pi.prefix_comps && !fe.flags.contains(ForwardingFlags::CHILD_INHERIT) {
                        continue;
                    }
                    have_forwarding = true;
                    if eligible(self, fe.faceid) && !x.contains(&fe.faceid) {
                        x.push(fe.faceid);
                    }
                }
            }
        }
        if !have_forwarding {
            for fid in self.faces.ids() {
                if eligible(self, fid) {
                    x.push(fid);
                }
            }
        }
        x
    }

    /// Coalesces with pending interests that match everywhere but the
    /// Nonce. Same face: tolerate a few (packet-loss resilience), then
    /// drop. Other face: the existing interest will serve, but we still
    /// need to reach the face it arrived on.
    fn adjust_outbound_for_existing_interests(
        &mut self,
        faceid: FaceId,
        msg: &[u8],
        pi: &ParsedInterest,
        prefix_key: &[u8],
        outbound: &mut Vec<FaceId>,
    ) {
        let head = match self.prefixes.get(prefix_key) {
            Some(e) => e.head,
            None => return,
        };
        let presize = pi.nonce.start;
        let postsize = pi.end - pi.nonce.end;
        let minsize = presize + postsize;
        let post = &msg[pi.nonce.end..pi.end];
        let mut k = 0usize;
        let mut p = self.pit.next_of(head);
        while p != head {
            let next = self.pit.next_of(p);
            if let Some(e) = self.pit.entry_at(p) {
                if let Some(pmsg) = &e.interest_msg {
                    if pmsg.len() > minsize
                        && e.usec > 0
                        && pmsg[..presize] == msg[..presize]
                        && pmsg[pmsg.len() - postsize..] == *post
                    {
                        if e.faceid == faceid {
                            k += 1;
                            if k < MAX_REDUNDANT_SAME_FACE {
                                p = next;
                                continue;
                            }
                            outbound.clear();
                            return;
                        }
                        let pface = e.faceid;
                        let keep = outbound.contains(&pface);
                        outbound.clear();
                        if keep {
                            outbound.push(pface);
                        } else {
                            return;
                        }
                    }
                }
            }
            p = next;
        }
    }

    fn reorder_outbound_using_history(&self, prefix_key: &[u8], outbound: &mut Vec<FaceId>) {
        if let Some(e) = self.prefixes.get(prefix_key) {
            if let Some(osrc) = e.osrc {
                move_to_end(outbound, osrc);
            }
            if let Some(src) = e.src {
                move_to_end(outbound, src);
            }
        }
    }

    /// Creates the PIT entry for a not-locally-satisfied interest and
    /// schedules its first propagation tick.
    pub(crate) fn propagate_interest(
        &mut self,
        faceid: FaceId,
        msg: &Bytes,
        pi: &ParsedInterest,
        prefix_key: Bytes,
    ) {
        let mut outbound = self.get_outbound_faces(faceid, msg, pi);
        self.adjust_outbound_for_existing_interests(faceid, msg, pi, &prefix_key, &mut outbound);
        let outbound = if outbound.is_empty() {
            None
        } else {
            self.reorder_outbound_using_history(&prefix_key, &mut outbound);
            Some(outbound)
        };
        let (msg_out, pi_out) = if pi.has_nonce() {
            (msg.clone(), pi.clone())
        } else {
            let mut nonce = [0u8; GENERATED_NONCE_BYTES];
            self.rng.fill(&mut nonce[..]);
            let m = with_nonce(msg, pi, &nonce);
            let p = parse_interest(&m).expect("nonce splice keeps the message well-formed");
            (m, p)
        };
        let nonce_key = msg_out.slice(pi_out.nonce.clone());
        if let Some(r) = self.pit.lookup_nonce(&nonce_key) {
            // A colliding nonce on the propagation path; drop it.
            warn!("nonce collision on propagation; interest dropped");
            if let Some(e) = self.pit.get_mut(r) {
                if let Some(ob) = e.outbound.as_mut() {
                    remove_faceid_swap(ob, faceid);
                }
            }
            return;
        }
        let (head, ipe_src, ipe_usec) = match self.prefixes.get(&prefix_key) {
            Some(e) => (e.head, e.src, e.usec),
            None => return,
        };
        let lifetime = pi_out.lifetime_usec;
        let mut flags = PitFlags::empty();
        let mut delaymask: u64 = 0xFFF;
        if let (Some(ob), Some(src)) = (&outbound, ipe_src) {
            if ob.last() == Some(&src) {
                flags = PitFlags::UNSENT;
                delaymask = 0xFF;
            }
        }
        let has_outbound = outbound.is_some();
        let entry = PitEntry {
            interest_msg: Some(msg_out),
            pi: pi_out,
            flags,
            faceid,
            usec: lifetime,
            lifetime_usec: lifetime,
            outbound,
            nonce: nonce_key,
            tombstone_ttl: 0,
        };
        let r = self.pit.insert(entry, head);
        if let Some(f) = self.faces.get_mut(faceid) {
            f.pending_interests += 1;
        }
        self.metrics.pit_size.set(self.pit.live_count() as u64);
        // make sure a reaper exists while the table is non-empty
        self.reap_needed(2 * DEFAULT_LIFETIME_USEC as u64);
        let first_delay = if has_outbound {
            (self.rng.gen::<u64>() & delaymask) as i64 + 1
        } else {
            lifetime
        };
        let first_delay = self.pe_next_usec(r, first_delay);
        self.schedule(
            first_delay.max(1) as u64,
            TimedEvent::Propagate {
                pit: r,
                fast_usec: ipe_usec,
            },
        );
    }

    /// Deducts the chosen delay from the entry's residual lifetime.
    fn pe_next_usec(&mut self, r: PitRef, next_delay: i64) -> i64 {
        let e = match self.pit.get_mut(r) {
            Some(e) => e,
            None => return 0,
        };
        let d = next_delay.min(e.usec);
        e.usec -= d;
        if self.cfg.debug_enabled(DEBUG_PIT) {
            debug!(
                "propagate outbound.n={} usec={}+{}",
                e.outbound.as_ref().map_or(-1, |o| o.len() as i64),
                d,
                e.usec
            );
        }
        d
    }

    /// One propagation tick: transmit toward the next outbound face, or
    /// wait out the residual lifetime, or expire.
    pub(crate) fn do_propagate(&mut self, pref: PitRef, fast_usec: u64, cancel: bool) -> u64 {
        match self.pit.get(pref) {
            Some(e) if e.interest_msg.is_some() => {}
            _ => return 0,
        }
        if cancel {
            self.consume(pref);
            return 0;
        }
        let wait1 = self
            .pit
            .get(pref)
            .map_or(false, |e| e.flags.contains(PitFlags::WAIT1));
        if wait1 {
            let (msg, pi) = {
                let e = self.pit.get(pref).unwrap();
                (e.interest_msg.clone().unwrap(), e.pi.clone())
            };
            self.pit.get_mut(pref).unwrap().flags.remove(PitFlags::WAIT1);
            self.adjust_predicted_response(&msg, &pi, true);
        }
        let expired = self.pit.get(pref).map_or(true, |e| e.usec <= 0);
        if expired {
            if let Some(e) = self.pit.get(pref) {
                self.debug_msg(DEBUG_INTEREST, "interest_expiry", e.faceid, 0);
            }
            self.consume(pref);
            self.reap_needed(0);
            return 0;
        }
        let mut next_delay: i64 = 1;
        let mut special: i64 = 0;
        let mut send: Option<(FaceId, Bytes)> = None;
        {
            let e = self.pit.get_mut(pref).unwrap();
            if e.flags.contains(PitFlags::STUFFED1) {
                e.flags.remove(PitFlags::STUFFED1);
                e.flags.insert(PitFlags::WAIT1);
                next_delay = fast_usec as i64;
                special = next_delay;
            } else if e.outbound.as_ref().map_or(false, |o| !o.is_empty()) {
                let fid = e.outbound.as_mut().unwrap().pop().unwrap();
                send = Some((fid, e.interest_msg.clone().unwrap()));
            }
        }
        if let Some((fid, msg)) = send {
            let sendable = self
                .faces
                .get(fid)
                .map_or(false, |f| !f.flags.contains(FaceFlags::NOSEND));
            if sendable {
                self.debug_msg(DEBUG_INTEREST, "interest_to", fid, msg.len());
                self.metrics.interests_sent.increment();
                next_delay = self.rng.gen_range(0..8192) + 500;
                {
                    let e = self.pit.get_mut(pref).unwrap();
                    if e.flags.contains(PitFlags::UNSENT) {
                        e.flags.remove(PitFlags::UNSENT);
                        e.flags.insert(PitFlags::WAIT1);
                        next_delay = fast_usec as i64;
                        special = next_delay;
                    }
                }
                self.stuff_and_write(fid, &msg);
            }
        }
        let empty_now = match self.pit.get_mut(pref) {
            Some(e) if e.interest_msg.is_some() => {
                let n = e.outbound.as_ref().map_or(0, |o| o.len());
                if n == 0 {
                    if e.usec <= e.lifetime_usec * 3 / 4 {
                        // finished propagating; wait for an answer
                        e.outbound = None;
                        next_delay = e.lifetime_usec;
                    } else if special == 0 {
                        next_delay = e.lifetime_usec / 4;
                    }
                }
                false
            }
            _ => true,
        };
        if empty_now {
            return 0;
        }
        self.pe_next_usec(pref, next_delay).max(1) as u64
    }

    /// Consumes a PIT entry: interest bytes and outbound set dropped,
    /// entry unlinked from its prefix list; the Nonce tombstone stays
    /// around for a couple of reap passes.
    pub(crate) fn consume(&mut self, pref: PitRef) {
        let faceid = match self.pit.get_mut(pref) {
            Some(e) => {
                e.outbound = None;
                e.usec = 0;
                match e.interest_msg.take() {
                    Some(_) => {
                        e.tombstone_ttl = 2;
                        Some(e.faceid)
                    }
                    None => None,
                }
            }
            None => return,
        };
        self.pit.unlink(pref.idx);
        if let Some(fid) = faceid {
            if let Some(f) = self.faces.get_mut(fid) {
                f.pending_interests -= 1;
            }
        }
        self.metrics.pit_size.set(self.pit.live_count() as u64);
    }

    /// Re-costs the prediction for the interest's prefix and its parent.
    fn adjust_predicted_response(&mut self, msg: &[u8], pi: &ParsedInterest, up: bool) {
        let key = &msg[pi.comps[0]..pi.comps[pi.prefix_comps]];
        if let Some(e) = self.prefixes.get_mut(key) {
            e.adjust_predicted(up);
        }
        if pi.prefix_comps > 0 {
            let pkey = &msg[pi.comps[0]..pi.comps[pi.prefix_comps - 1]];
            if let Some(e) = self.prefixes.get_mut(pkey) {
                e.adjust_predicted(up);
            }
        }
    }

    /// Piggybacks pending interests onto an outbound frame, at most one
    /// per prefix so redundancy is not subverted.
    pub(crate) fn stuff_interests(&mut self, faceid: FaceId, frame: &mut BytesMut) -> usize {
        let mut remaining = self.cfg.mtu as i64 - frame.len() as i64;
        if remaining < 20 {
            return 0;
        }
        let mut n_stuffed = 0;
        for key in self.prefixes.keys() {
            if remaining < 20 {
                break;
            }
            let head = match self.prefixes.get(&key) {
                Some(e) => e.head,
                None => continue,
            };
            let mut p = self.pit.prev_of(head);
            while p != head {
                let prev = self.pit.prev_of(p);
                let mut stuffed_size = None;
                if let Some(e) = self.pit.entry_at_mut(p) {
                    if let Some(msg) = e.interest_msg.clone() {
                        if let Some(ob) = e.outbound.as_mut() {
                            let fits = !ob.is_empty()
                                && (msg.len() as i64) <= remaining
                                && !e.flags.intersects(PitFlags::STUFFED1 | PitFlags::WAIT1)
                                && (!e.flags.contains(PitFlags::UNSENT)
                                    || ob.last() == Some(&faceid));
                            if fits && remove_faceid_ordered(ob, faceid) {
                                if e.flags.contains(PitFlags::UNSENT) {
                                    e.flags.remove(PitFlags::UNSENT);
                                    e.flags.insert(PitFlags::STUFFED1);
                                }
                                frame.extend_from_slice(&msg);
                                stuffed_size = Some(msg.len());
                            }
                        }
                    }
                }
                if let Some(size) = stuffed_size {
                    remaining -= size as i64;
                    n_stuffed += 1;
                    self.metrics.interests_stuffed.increment();
                    self.debug_msg(DEBUG_INTEREST, "stuff_interest_to", faceid, size);
                    break; // one per prefix
                }
                p = prev;
            }
        }
        n_stuffed
    }
}
