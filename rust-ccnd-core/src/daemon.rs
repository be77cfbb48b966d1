//! The daemon context: one value owning every table, passed by
//! reference through every operation.

use crate::config::Config;
use crate::face::{Face, FaceFlags};
use crate::faces::{FaceId, FaceTable};
use crate::pit::PitTable;
use crate::prefix::{ForwardingEntry, ForwardingFlags, PrefixTable};
use crate::sched::{Clock, EventHandle, Scheduler, TimedEvent};
use crate::store::{ContentFlags, ContentStore};
use bytes::{Bytes, BytesMut};
use log::{debug, info};
use polling::Poller;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_ccnd_common::interest::DEFAULT_LIFETIME_USEC;
use rust_ccnd_common::metrics::ForwarderMetrics;
use rust_ccnd_common::name::Name;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

/// Cadence of the forwarding-entry aging task.
pub const FORWARDING_AGE_SECS: i64 = 5;

pub struct Daemon {
    pub(crate) cfg: Config,
    pub(crate) clock: Clock,
    pub(crate) sched: Scheduler,
    pub(crate) faces: FaceTable,
    pub(crate) prefixes: PrefixTable,
    pub(crate) store: ContentStore,
    pub(crate) pit: PitTable,
    pub(crate) metrics: ForwarderMetrics,
    pub(crate) rng: StdRng,
    pub(crate) poller: Option<Poller>,
    pub(crate) listener: Option<UnixListener>,
    pub(crate) listener_fd: Option<RawFd>,
    pub(crate) udp4: Option<FaceId>,
    pub(crate) udp6: Option<FaceId>,
    pub(crate) sock_path: Option<PathBuf>,
    pub(crate) reaper: Option<EventHandle>,
    pub(crate) clean: Option<EventHandle>,
    pub(crate) age_fwd: Option<EventHandle>,
    pub(crate) oldformat_grumble: u64,
    pub(crate) shutting_down: bool,
}

impl Daemon {
    pub fn new(cfg: Config) -> Self {
        Self::with_clock(cfg, Clock::wall())
    }

    /// A daemon on an explicit clock; with [`Clock::manual`] the caller
    /// drives time, which is how embedders and the tests run it.
    pub fn with_clock(cfg: Config, clock: Clock) -> Self {
        let store = ContentStore::new(cfg.capacity);
        let mut daemon = Daemon {
            cfg,
            clock,
            sched: Scheduler::new(),
            faces: FaceTable::new(),
            prefixes: PrefixTable::new(),
            store,
            pit: PitTable::new(),
            metrics: ForwarderMetrics::new(),
            rng: StdRng::from_entropy(),
            poller: None,
            listener: None,
            listener_fd: None,
            udp4: None,
            udp6: None,
            sock_path: None,
            reaper: None,
            clean: None,
            age_fwd: None,
            oldformat_grumble: 1,
            shutting_down: false,
        };
        daemon.clean_needed();
        daemon
    }

    /* ------------------------------------------------------------ *
     * Clock and scheduling
     * ------------------------------------------------------------ */

    pub(crate) fn now(&mut self) -> u64 {
        self.clock.now()
    }

    /// Moves a manual clock forward without running anything.
    pub fn advance_clock(&mut self, usec: u64) {
        self.clock.advance(usec);
    }

    pub(crate) fn schedule(&mut self, delay_usec: u64, ev: TimedEvent) -> EventHandle {
        let due = self.now() + delay_usec;
        self.sched.schedule(due, ev)
    }

    fn resched(&mut self, handle: EventHandle, delay_usec: u64, ev: TimedEvent) {
        let due = self.now() + delay_usec;
        self.sched.reschedule(handle, due, ev);
    }

    /// Runs every event currently due. The poll loop calls this each
    /// wakeup; tests call it after advancing the clock.
    pub fn tick(&mut self) {
        loop {
            let now = self.now();
            match self.sched.pop_due(now) {
                Some((handle, ev)) => self.handle_event(handle, ev),
                None => break,
            }
        }
    }

    /// Micros until the next event, for the poll timeout.
    pub(crate) fn next_wakeup(&mut self) -> Option<u64> {
        let now = self.clock.now();
        self.sched.next_due().map(|due| due.saturating_sub(now))
    }

    fn handle_event(&mut self, handle: EventHandle, ev: TimedEvent) {
        match ev {
            TimedEvent::Reap => {
                let d = self.reap(false);
                if d > 0 {
                    self.resched(handle, d, TimedEvent::Reap);
                } else {
                    self.reaper = None;
                }
            }
            TimedEvent::AgeForwarding => {
                let d = self.age_forwarding_pass(false);
                if d > 0 {
                    self.resched(handle, d, TimedEvent::AgeForwarding);
                } else {
                    self.age_fwd = None;
                }
            }
            TimedEvent::CleanStore { resume } => {
                let (d, resume) = self.clean_pass(resume, false);
                if d > 0 {
                    self.resched(handle, d, TimedEvent::CleanStore { resume });
                } else {
                    self.clean = None;
                }
            }
            TimedEvent::Propagate { pit, fast_usec } => {
                let d = self.do_propagate(pit, fast_usec, false);
                if d > 0 {
                    self.resched(handle, d, TimedEvent::Propagate { pit, fast_usec });
                }
            }
            TimedEvent::SendQueue { face, class } => {
                let d = self.content_sender(face, class, false);
                if d > 0 {
                    self.resched(handle, d, TimedEvent::SendQueue { face, class });
                }
            }
            TimedEvent::FreshnessExpire { accession } => {
                self.expire_content(accession);
            }
        }
    }

    /// Cancels a pending event, delivering the final cancel invocation
    /// so its handler can release resources.
    pub(crate) fn cancel_event(&mut self, handle: EventHandle) {
        if let Some(ev) = self.sched.cancel(handle) {
            self.deliver_cancel(ev);
        }
    }

    fn deliver_cancel(&mut self, ev: TimedEvent) {
        match ev {
            TimedEvent::Propagate { pit, fast_usec } => {
                self.do_propagate(pit, fast_usec, true);
            }
            TimedEvent::SendQueue { face, class } => {
                self.content_sender(face, class, true);
            }
            TimedEvent::Reap => {
                self.reap(true);
                self.reaper = None;
            }
            TimedEvent::AgeForwarding => {
                self.age_forwarding_pass(true);
                self.age_fwd = None;
            }
            TimedEvent::CleanStore { .. } => {
                self.clean = None;
            }
            TimedEvent::FreshnessExpire { .. } => {}
        }
    }

    /* ------------------------------------------------------------ *
     * Reaping
     * ------------------------------------------------------------ */

    pub(crate) fn reap_needed(&mut self, init_delay_usec: u64) {
        if self.reaper.is_none() {
            let h = self.schedule(init_delay_usec, TimedEvent::Reap);
            self.reaper = Some(h);
        }
    }

    fn reap(&mut self, cancel: bool) -> u64 {
        if cancel {
            return 0;
        }
        self.check_dgram_faces();
        self.check_propagating();
        self.check_comm_file();
        if self.cfg.debug != 0 {
            debug!(
                "stats: accepted={} dropped={} sent={} stuffed={} content_sent={} dups={} cs={} pit={} faces={}",
                self.metrics.interests_accepted.value(),
                self.metrics.interests_dropped.value(),
                self.metrics.interests_sent.value(),
                self.metrics.interests_stuffed.value(),
                self.metrics.content_items_sent.value(),
                self.metrics.content_dups_recvd.value(),
                self.store.count(),
                self.pit.live_count(),
                self.faces.len(),
            );
        }
        if !self.faces.dgram.is_empty() || !self.pit.by_nonce.is_empty() {
            2 * DEFAULT_LIFETIME_USEC as u64
        } else {
            // nothing on the horizon
            0
        }
    }

    /// Datagram faces must show traffic within two reap passes.
    fn check_dgram_faces(&mut self) {
        let candidates: Vec<FaceId> = self.faces.dgram.values().copied().collect();
        for id in candidates {
            let idle = match self.faces.get_mut(id) {
                Some(face) => {
                    if face.recvcount == 0 {
                        true
                    } else {
                        face.recvcount = (face.recvcount > 1) as u32;
                        false
                    }
                }
                None => continue,
            };
            if idle {
                self.destroy_face(id);
            }
        }
    }

    /// Ages PIT tombstones and retires unused prefix entries.
    fn check_propagating(&mut self) {
        for r in self.pit.refs() {
            let release = match self.pit.get_mut(r) {
                Some(e) if e.interest_msg.is_none() => {
                    if e.tombstone_ttl == 0 {
                        true
                    } else {
                        e.tombstone_ttl -= 1;
                        false
                    }
                }
                _ => false,
            };
            if release {
                self.pit.release(r);
            }
        }
        for key in self.prefixes.keys() {
            let (retire, head) = match self.prefixes.get(&key) {
                Some(e) => {
                    let empty = self.pit.next_of(e.head) == e.head;
                    (
                        e.src.is_none() && empty && e.forwarding.is_empty(),
                        e.head,
                    )
                }
                None => continue,
            };
            if retire {
                self.prefixes.map.remove(&key);
                self.pit.free_sentinel(head);
            } else if let Some(e) = self.prefixes.get_mut(&key) {
                e.osrc = e.src;
                e.src = None;
            }
        }
    }

    /// The daemon exits when its socket path disappears.
    fn check_comm_file(&mut self) {
        if let Some(path) = &self.sock_path {
            if !path.exists() {
                info!("exiting ({} gone)", path.display());
                self.shutting_down = true;
            }
        }
    }

    fn age_forwarding_pass(&mut self, cancel: bool) -> u64 {
        if cancel {
            return 0;
        }
        let mut remain = false;
        for key in self.prefixes.keys() {
            if let Some(e) = self.prefixes.get_mut(&key) {
                e.forwarding.retain_mut(|f| {
                    f.expires -= FORWARDING_AGE_SECS;
                    f.expires > 0
                });
                if !e.forwarding.is_empty() {
                    remain = true;
                }
            }
        }
        if remain {
            FORWARDING_AGE_SECS as u64 * 1_000_000
        } else {
            0
        }
    }

    fn age_forwarding_needed(&mut self) {
        if self.age_fwd.is_none() {
            let h = self.schedule(
                FORWARDING_AGE_SECS as u64 * 1_000_000,
                TimedEvent::AgeForwarding,
            );
            self.age_fwd = Some(h);
        }
    }

    /* ------------------------------------------------------------ *
     * Cache cleaning
     * ------------------------------------------------------------ */

    fn clean_needed(&mut self) {
        if self.clean.is_none() {
            let h = self.schedule(1_000_000, TimedEvent::CleanStore { resume: 0 });
            self.clean = Some(h);
        }
    }

    /// One bounded cleaning pass targeting stale entries. Returns the
    /// next delay and the accession to resume from.
    fn clean_pass(&mut self, resume: u64, cancel: bool) -> (u64, u64) {
        if cancel {
            return (0, 0);
        }
        let mut n = self.store.count();
        if n <= self.store.capacity {
            return (15_000_000, 0);
        }
        let mut check_limit = 500i64;
        let mut resume_out = 0;
        if self.store.min_stale <= self.store.max_stale {
            let limit = self.store.max_stale.min(self.store.accession);
            let mut min_stale = u64::MAX;
            let mut a = resume;
            if a <= self.store.min_stale || a > self.store.max_stale {
                a = self.store.min_stale;
            } else {
                min_stale = self.store.min_stale;
            }
            while a <= limit && n > self.store.capacity {
                if check_limit <= 0 {
                    resume_out = a;
                    break;
                }
                check_limit -= 1;
                let flags = self.store.from_accession(a).map(|e| e.flags);
                if let Some(f) = flags {
                    if f.contains(ContentFlags::STALE) {
                        if f.contains(ContentFlags::PRECIOUS) {
                            if a < min_stale {
                                min_stale = a;
                            }
                        } else {
                            self.remove_content(a);
                            n -= 1;
                        }
                    }
                }
                a += 1;
            }
            if min_stale < a {
                self.store.min_stale = min_stale;
            } else if a > limit {
                self.store.min_stale = u64::MAX;
                self.store.max_stale = 0;
            } else {
                self.store.min_stale = a;
            }
        }
        if check_limit <= 0 {
            (5_000, resume_out)
        } else {
            (15_000_000, 0)
        }
    }

    pub(crate) fn remove_content(&mut self, accession: u64) -> bool {
        if self.cfg.debug_enabled(crate::config::DEBUG_CONTENT) {
            debug!("remove accession={}", accession);
        }
        let removed = self.store.remove(accession);
        if removed {
            self.metrics.cs_size.set(self.store.count() as u64);
        }
        removed
    }

    /* ------------------------------------------------------------ *
     * Faces and prefixes
     * ------------------------------------------------------------ */

    /// Enrolls an in-process face. Its writes are captured and read back
    /// with [`Daemon::take_output`].
    pub fn add_internal_face(&mut self, flags: FaceFlags) -> FaceId {
        let id = self
            .faces
            .enroll(Face::internal(flags))
            .expect("face table full");
        self.metrics.face_count.set(self.faces.len() as u64);
        id
    }

    /// Feeds one complete framed message in on behalf of a face, as if
    /// it had arrived from that face's transport.
    pub fn process_message(&mut self, faceid: FaceId, msg: impl Into<Bytes>) {
        let msg = msg.into();
        if let Some(f) = self.faces.get_mut(faceid) {
            f.recvcount += 1;
            f.meter.bytes_in += msg.len() as u64;
            f.meter.packets_in += 1;
        }
        self.metrics.bytes_received.add(msg.len() as u64);
        self.process_input_message(faceid, msg, true);
    }

    /// Drains everything written to an internal face.
    pub fn take_output(&mut self, faceid: FaceId) -> Bytes {
        match self.faces.get_mut(faceid) {
            Some(face) => {
                let buf = face.outbuf.take().unwrap_or_default();
                face.outbuf = Some(BytesMut::new());
                face.outbuf_index = 0;
                buf.freeze()
            }
            None => Bytes::new(),
        }
    }

    /// Registers a forwarding entry for `name` toward `faceid`,
    /// refreshed or created with the given flags and lifetime.
    pub fn register_prefix(
        &mut self,
        name: &Name,
        faceid: FaceId,
        flags: ForwardingFlags,
        expires_secs: i64,
    ) {
        let mut key = BytesMut::new();
        for comp in name.components() {
            comp.encode(&mut key);
        }
        let key = key.freeze();
        self.prefixes.seek(key.clone(), &mut self.pit, &mut self.rng);
        if let Some(entry) = self.prefixes.get_mut(&key) {
            match entry.forwarding.iter_mut().find(|f| f.faceid == faceid) {
                Some(f) => {
                    f.flags = flags | ForwardingFlags::ACTIVE;
                    f.expires = expires_secs;
                }
                None => entry.forwarding.push(ForwardingEntry {
                    faceid,
                    flags: flags | ForwardingFlags::ACTIVE,
                    expires: expires_secs,
                }),
            }
        }
        self.age_forwarding_needed();
    }

    /* ------------------------------------------------------------ *
     * Shutdown
     * ------------------------------------------------------------ */

    /// Cancels every pending event (each gets its final invocation),
    /// tears down all faces, and unlinks the IPC socket.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        for (_, ev) in self.sched.take_all() {
            self.deliver_cancel(ev);
        }
        for id in self.faces.ids() {
            self.destroy_face(id);
        }
        self.listener = None;
        self.unlink_socket();
    }

    pub(crate) fn unlink_socket(&mut self) {
        if let Some(path) = self.sock_path.take() {
            let _ = std::fs::remove_file(&path);
        }
    }

    /* ------------------------------------------------------------ *
     * Inspection
     * ------------------------------------------------------------ */

    pub fn metrics(&self) -> &ForwarderMetrics {
        &self.metrics
    }

    pub fn content_count(&self) -> usize {
        self.store.count()
    }

    /// Last assigned accession number.
    pub fn accession_counter(&self) -> u64 {
        self.store.accession
    }

    pub fn content_flags(&self, accession: u64) -> Option<ContentFlags> {
        self.store.from_accession(accession).map(|e| e.flags)
    }

    pub fn live_pit_count(&self) -> usize {
        self.pit.live_count()
    }

    /// Outbound face set of the PIT entry keyed by this Nonce element.
    pub fn pit_outbound(&self, nonce_elem: &[u8]) -> Option<Vec<FaceId>> {
        let r = self.pit.lookup_nonce(nonce_elem)?;
        self.pit.get(r)?.outbound.clone()
    }

    pub fn face_pending_interests(&self, faceid: FaceId) -> i64 {
        self.faces.get(faceid).map_or(0, |f| f.pending_interests)
    }

    pub fn face_exists(&self, faceid: FaceId) -> bool {
        self.faces.get(faceid).is_some()
    }

    pub fn prefix_count(&self) -> usize {
        self.prefixes.len()
    }

    pub fn check_store_integrity(&self) -> std::result::Result<(), String> {
        self.store.check_integrity()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub(crate) fn debug_msg(&self, bit: u32, label: &str, faceid: FaceId, size: usize) {
        if self.cfg.debug_enabled(bit) {
            debug!("{} face={} size={}", label, faceid, size);
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.unlink_socket();
    }
}
