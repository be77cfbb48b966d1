//! The face abstraction: one record per communication endpoint.

use crate::sched::EventHandle;
use bitflags::bitflags;
use bytes::BytesMut;
use rust_ccnd_common::coding::SkeletonDecoder;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::faces::FaceId;

bitflags! {
    pub struct FaceFlags: u32 {
        /// Elements are wrapped in CCNProtocolDataUnit on this face.
        const LINK      = 1 << 0;
        /// Datagram endpoint; packet boundaries are respected.
        const DGRAM     = 1 << 1;
        /// Bound to or reached via loopback.
        const LOOPBACK  = 1 << 2;
        /// Local-IPC (unix socket) client; trusted for Inject.
        const LOCAL     = 1 << 3;
        const INET      = 1 << 4;
        const INET6     = 1 << 6;
        /// Don't transmit on this face anymore.
        const NOSEND    = 1 << 8;
        /// Exempt from inactivity reaping.
        const PERMANENT = 1 << 9;
        /// No kernel handle; writes are captured in the outbound buffer.
        const INTERNAL  = 1 << 10;
    }
}

/// Outbound delay classes, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayClass {
    Asap = 0,
    Normal = 1,
    Slow = 2,
}

impl DelayClass {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn all() -> [DelayClass; Self::COUNT] {
        [DelayClass::Asap, DelayClass::Normal, DelayClass::Slow]
    }
}

/// Per-face, per-class queue of content awaiting transmission.
///
/// The queue holds accession numbers, not entries; every pop revalidates
/// against the store, so an eviction mid-flight is just a skipped slot.
#[derive(Debug)]
pub struct ContentQueue {
    /// Mean inter-send delay for this class.
    pub usec: u64,
    /// Snapshot of the queue length when the sender was scheduled.
    pub ready: usize,
    pub send_queue: Vec<u64>,
    pub sender: Option<EventHandle>,
    /// Consecutive productive drains; a steadily busy queue stops
    /// randomizing its spacing.
    pub nrun: u32,
}

impl ContentQueue {
    pub fn new(usec: u64) -> Self {
        Self {
            usec,
            ready: 0,
            send_queue: Vec::new(),
            sender: None,
            nrun: 0,
        }
    }
}

/// Transport handle behind a face.
#[derive(Debug)]
pub enum FaceSocket {
    /// Accepted local-IPC stream.
    Stream(UnixStream),
    /// A bound UDP socket; per-peer datagram faces reference it by fd.
    Udp(UdpSocket),
    /// Internal face, or a per-peer datagram face.
    None,
}

/// Simple per-direction traffic meters.
#[derive(Debug, Default, Clone, Copy)]
pub struct FaceMeter {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

#[derive(Debug)]
pub struct Face {
    pub socket: FaceSocket,
    /// For per-peer datagram faces, the fd of the owning UDP socket.
    pub fd: Option<RawFd>,
    pub flags: FaceFlags,
    pub faceid: FaceId,
    /// Activity level for inactivity reaping.
    pub recvcount: u32,
    /// Accession of the last content matched for this face; lets an
    /// enumerating client resume past it.
    pub cached_accession: Option<u64>,
    pub queues: [Option<ContentQueue>; DelayClass::COUNT],
    pub inbuf: BytesMut,
    pub decoder: SkeletonDecoder,
    /// Offset within `inbuf` of the first unprocessed byte.
    pub msgstart: usize,
    pub outbuf: Option<BytesMut>,
    pub outbuf_index: usize,
    pub peer: Option<SocketAddr>,
    pub pending_interests: i64,
    pub meter: FaceMeter,
}

impl Face {
    pub fn new(socket: FaceSocket, flags: FaceFlags) -> Self {
        let fd = match &socket {
            FaceSocket::Stream(s) => Some(s.as_raw_fd()),
            FaceSocket::Udp(s) => Some(s.as_raw_fd()),
            FaceSocket::None => None,
        };
        Self {
            socket,
            fd,
            flags,
            faceid: FaceId(0),
            recvcount: 0,
            cached_accession: None,
            queues: [None, None, None],
            inbuf: BytesMut::new(),
            decoder: SkeletonDecoder::new(),
            msgstart: 0,
            outbuf: None,
            outbuf_index: 0,
            peer: None,
            pending_interests: 0,
            meter: FaceMeter::default(),
        }
    }

    /// An in-process face: no kernel handle, writes are captured.
    pub fn internal(flags: FaceFlags) -> Self {
        let mut face = Face::new(FaceSocket::None, flags | FaceFlags::INTERNAL);
        face.outbuf = Some(BytesMut::new());
        face
    }

    /// A per-peer datagram face sending through the UDP socket at `fd`.
    pub fn dgram_peer(fd: RawFd, peer: SocketAddr, flags: FaceFlags) -> Self {
        let mut face = Face::new(FaceSocket::None, flags | FaceFlags::DGRAM);
        face.fd = Some(fd);
        face.peer = Some(peer);
        face
    }

    /// True when `accession` sits in any of this face's send queues.
    pub fn send_queues_member(&self, accession: u64) -> bool {
        self.queues.iter().flatten().any(|q| {
            q.send_queue.contains(&accession)
        })
    }
}
