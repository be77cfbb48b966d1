//! Socket I/O: the poll loop, reads with incremental framing, deferred
//! writes, and face setup/teardown.

use crate::daemon::Daemon;
use crate::face::{Face, FaceFlags, FaceSocket};
use crate::faces::FaceId;
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use polling::{Event, Events, Poller};
use rust_ccnd_common::error::Error;
use rust_ccnd_common::interest::DEFAULT_LIFETIME_USEC;
use rust_ccnd_common::Result;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::BorrowedFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::time::Duration;

/// Read chunk per wakeup; also the largest message a face may carry.
const READ_CHUNK: usize = 8800;

impl Daemon {
    /* ------------------------------------------------------------ *
     * Startup
     * ------------------------------------------------------------ */

    /// Creates the poller, the local-IPC listener (fatal on failure),
    /// and the UDP endpoints (best effort per address family).
    pub fn bind(&mut self) -> Result<()> {
        let poller = Poller::new()?;
        let path = self.cfg.sockname.clone();
        let listener = create_local_listener(&path)
            .map_err(|e| Error::Fatal(format!("cannot listen on {}: {}", path.display(), e)))?;
        let lfd = listener.as_raw_fd();
        unsafe {
            poller.add(lfd, Event::readable(lfd as usize))?;
        }
        info!("listening on {}", path.display());
        self.sock_path = Some(path);
        self.listener = Some(listener);
        self.listener_fd = Some(lfd);
        self.poller = Some(poller);

        let port: u16 = self.cfg.port.parse().unwrap_or(4485);
        let (v4, v6): (SocketAddr, SocketAddr) = if self.cfg.nonlocal_udp {
            (
                (Ipv4Addr::UNSPECIFIED, port).into(),
                (Ipv6Addr::UNSPECIFIED, port).into(),
            )
        } else {
            (
                (Ipv4Addr::LOCALHOST, port).into(),
                (Ipv6Addr::LOCALHOST, port).into(),
            )
        };
        self.udp4 = self.bind_udp(v4, FaceFlags::INET);
        self.udp6 = self.bind_udp(v6, FaceFlags::INET6);
        Ok(())
    }

    fn bind_udp(&mut self, addr: SocketAddr, family: FaceFlags) -> Option<FaceId> {
        let sock = match UdpSocket::bind(addr) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot bind udp {}: {}", addr, e);
                return None;
            }
        };
        if let Err(e) = sock.set_nonblocking(true) {
            warn!("udp {}: {}", addr, e);
            return None;
        }
        let fd = sock.as_raw_fd();
        let mut flags = FaceFlags::DGRAM | family;
        if !self.cfg.nonlocal_udp {
            flags |= FaceFlags::LOOPBACK;
        }
        let face = Face::new(FaceSocket::Udp(sock), flags);
        let id = match self.faces.enroll(face) {
            Ok(id) => id,
            Err(e) => {
                error!("{}", e);
                return None;
            }
        };
        self.faces.by_fd.insert(fd, id);
        if let Some(poller) = &self.poller {
            let res = unsafe { poller.add(fd, Event::readable(fd as usize)) };
            if let Err(e) = res {
                error!("poller add: {}", e);
            }
        }
        self.metrics.face_count.set(self.faces.len() as u64);
        info!("accepting datagrams on fd {} id {}", fd, id);
        Some(id)
    }

    /* ------------------------------------------------------------ *
     * Main loop
     * ------------------------------------------------------------ */

    /// Runs until shutdown: scheduler first, then one poll wait, then
    /// the ready faces.
    pub fn run(&mut self) -> Result<()> {
        if self.poller.is_none() {
            return Err(Error::Fatal("run() before bind()".into()));
        }
        let mut events = Events::new();
        while !self.shutting_down {
            self.tick();
            if self.shutting_down {
                break;
            }
            let timeout = self.next_wakeup().map(Duration::from_micros);
            events.clear();
            let res = self
                .poller
                .as_ref()
                .unwrap()
                .wait(&mut events, timeout);
            match res {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("poll: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            }
            let fired: Vec<(usize, bool, bool)> = events
                .iter()
                .map(|ev| (ev.key, ev.readable, ev.writable))
                .collect();
            for (key, readable, writable) in fired {
                let fd = key as RawFd;
                if Some(fd) == self.listener_fd {
                    self.accept_clients();
                    self.rearm(fd, false);
                    continue;
                }
                if writable {
                    self.do_deferred_write(fd);
                }
                if readable {
                    self.process_input(fd);
                }
                let want_write = self
                    .faces
                    .by_fd
                    .get(&fd)
                    .and_then(|id| self.faces.get(*id))
                    .map_or(false, |f| f.outbuf.is_some());
                if self.faces.by_fd.contains_key(&fd) {
                    self.rearm(fd, want_write);
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    pub(crate) fn rearm(&self, fd: RawFd, want_write: bool) {
        if let Some(poller) = &self.poller {
            let interest = if want_write {
                Event::all(fd as usize)
            } else {
                Event::readable(fd as usize)
            };
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(e) = poller.modify(borrowed, interest) {
                debug!("poller modify fd {}: {}", fd, e);
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let (stream, _) = match self.listener.as_ref().unwrap().accept() {
                Ok(x) => x,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept: {}", e);
                    break;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                error!("accept fcntl: {}", e);
                continue;
            }
            let fd = stream.as_raw_fd();
            let face = Face::new(FaceSocket::Stream(stream), FaceFlags::LOCAL);
            match self.faces.enroll(face) {
                Ok(id) => {
                    self.faces.by_fd.insert(fd, id);
                    if let Some(poller) = &self.poller {
                        let res = unsafe { poller.add(fd, Event::readable(fd as usize)) };
                        if let Err(e) = res {
                            error!("poller add: {}", e);
                        }
                    }
                    self.metrics.face_count.set(self.faces.len() as u64);
                    info!("accepted client fd={} id={}", fd, id);
                }
                Err(e) => error!("{}", e),
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Reads
     * ------------------------------------------------------------ */

    fn process_input(&mut self, fd: RawFd) {
        let faceid = match self.faces.by_fd.get(&fd) {
            Some(id) => *id,
            None => return,
        };
        let is_dgram = matches!(
            self.faces.get(faceid).map(|f| &f.socket),
            Some(FaceSocket::Udp(_))
        );
        if is_dgram {
            self.process_dgram_input(faceid);
        } else {
            self.process_stream_input(faceid);
        }
    }

    /// One datagram: the peer address selects (or creates) its face and
    /// the payload is framed standalone, so a protocol error costs only
    /// this packet.
    fn process_dgram_input(&mut self, listener_id: FaceId) {
        let mut buf = [0u8; READ_CHUNK];
        let (n, peer) = {
            let face = match self.faces.get(listener_id) {
                Some(f) => f,
                None => return,
            };
            let sock = match &face.socket {
                FaceSocket::Udp(s) => s,
                _ => return,
            };
            match sock.recv_from(&mut buf) {
                Ok(x) => x,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("recvfrom: {}", e);
                    return;
                }
            }
        };
        let source = match self.get_dgram_source(listener_id, peer) {
            Some(id) => id,
            None => return,
        };
        if let Some(f) = self.faces.get_mut(source) {
            f.recvcount += 1;
            f.meter.bytes_in += n as u64;
            f.meter.packets_in += 1;
        }
        self.metrics.bytes_received.add(n as u64);
        if n <= 1 {
            debug!("{}-byte heartbeat on {}", n, source);
            return;
        }
        let data = Bytes::copy_from_slice(&buf[..n]);
        let mut sd = rust_ccnd_common::coding::SkeletonDecoder::new();
        let mut msgstart = 0usize;
        while sd.index < data.len() {
            sd.feed(&data[sd.index..]);
            if sd.error() || !sd.complete() {
                info!(
                    "protocol error on {}, discarding {} bytes",
                    source,
                    data.len() - msgstart
                );
                return;
            }
            let end = sd.index;
            self.process_input_message(source, data.slice(msgstart..end), true);
            msgstart = end;
            if self.faces.get(source).is_none() {
                return;
            }
        }
    }

    /// Each remote peer address becomes its own datagram face on first
    /// packet; inactivity reaping will collect it later.
    fn get_dgram_source(&mut self, listener_id: FaceId, peer: SocketAddr) -> Option<FaceId> {
        if let Some(id) = self.faces.dgram.get(&peer) {
            return Some(*id);
        }
        let (fd, inherit) = {
            let f = self.faces.get(listener_id)?;
            (
                f.fd?,
                f.flags & (FaceFlags::INET | FaceFlags::INET6 | FaceFlags::LOOPBACK),
            )
        };
        let face = Face::dgram_peer(fd, peer, inherit);
        let id = match self.faces.enroll(face) {
            Ok(id) => id,
            Err(e) => {
                error!("{}; datagram dropped", e);
                return None;
            }
        };
        self.faces.dgram.insert(peer, id);
        self.metrics.face_count.set(self.faces.len() as u64);
        info!("accepted datagram client {} ({})", id, peer);
        self.reap_needed(DEFAULT_LIFETIME_USEC as u64);
        Some(id)
    }

    /// Stream bytes accumulate in the face buffer; the skeleton decoder
    /// slices out complete elements as they finish. Protocol errors tear
    /// the face down.
    fn process_stream_input(&mut self, faceid: FaceId) {
        let mut tmp = [0u8; READ_CHUNK];
        let n = {
            let face = match self.faces.get(faceid) {
                Some(f) => f,
                None => return,
            };
            let stream = match &face.socket {
                FaceSocket::Stream(s) => s,
                _ => return,
            };
            match (&*stream).read(&mut tmp) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("read {}: {}", faceid, e);
                    return;
                }
            }
        };
        if n == 0 {
            info!("shutdown client {}", faceid);
            self.destroy_face(faceid);
            return;
        }
        if let Some(f) = self.faces.get_mut(faceid) {
            f.recvcount += 1;
            f.inbuf.extend_from_slice(&tmp[..n]);
            f.meter.bytes_in += n as u64;
            f.meter.packets_in += 1;
        }
        self.metrics.bytes_received.add(n as u64);
        loop {
            let step = {
                let f = match self.faces.get_mut(faceid) {
                    Some(f) => f,
                    None => return,
                };
                if f.decoder.index >= f.inbuf.len() {
                    None
                } else {
                    let Face {
                        decoder, inbuf, ..
                    } = f;
                    decoder.feed(&inbuf[decoder.index..]);
                    Some((decoder.complete(), decoder.error(), decoder.index))
                }
            };
            match step {
                None => break,
                Some((_, true, _)) => {
                    error!("protocol error on {}", faceid);
                    self.destroy_face(faceid);
                    return;
                }
                Some((true, _, end)) => {
                    let msg = {
                        let f = self.faces.get(faceid).unwrap();
                        Bytes::copy_from_slice(&f.inbuf[f.msgstart..end])
                    };
                    if let Some(f) = self.faces.get_mut(faceid) {
                        f.msgstart = end;
                    }
                    self.process_input_message(faceid, msg, true);
                    if self.faces.get(faceid).is_none() {
                        return;
                    }
                }
                Some((false, _, _)) => break, // partial message
            }
        }
        if let Some(f) = self.faces.get_mut(faceid) {
            if f.msgstart > 0 {
                if f.msgstart >= f.inbuf.len() {
                    f.inbuf.clear();
                    f.decoder.reset();
                } else {
                    let consumed = f.msgstart;
                    let _ = f.inbuf.split_to(consumed);
                    f.decoder.index -= consumed;
                }
                f.msgstart = 0;
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Writes
     * ------------------------------------------------------------ */

    /// Transmits (or buffers) one frame toward a face, in enqueue order.
    pub(crate) fn do_write(&mut self, faceid: FaceId, data: &[u8]) {
        enum Target {
            Buffered,
            Stream(RawFd),
            Peer(SocketAddr),
        }
        let target = {
            let face = match self.faces.get(faceid) {
                Some(f) => f,
                None => return,
            };
            if face.flags.contains(FaceFlags::NOSEND) {
                return;
            }
            if face.outbuf.is_some() {
                Target::Buffered
            } else if let Some(peer) = face.peer {
                Target::Peer(peer)
            } else {
                match &face.socket {
                    FaceSocket::Stream(_) => Target::Stream(face.fd.unwrap_or(-1)),
                    // a bound UDP socket is never written without a peer
                    FaceSocket::Udp(_) => return,
                    FaceSocket::None => Target::Buffered,
                }
            }
        };
        match target {
            Target::Buffered => {
                if let Some(f) = self.faces.get_mut(faceid) {
                    if let Some(outbuf) = f.outbuf.as_mut() {
                        outbuf.extend_from_slice(data);
                        f.meter.bytes_out += data.len() as u64;
                        f.meter.packets_out += 1;
                    }
                }
            }
            Target::Peer(addr) => {
                let via = if addr.is_ipv4() { self.udp4 } else { self.udp6 };
                let res = via.and_then(|id| self.faces.get(id)).and_then(|listener| {
                    match &listener.socket {
                        FaceSocket::Udp(sock) => Some(sock.send_to(data, addr)),
                        _ => None,
                    }
                });
                match res {
                    Some(Ok(n)) if n == data.len() => {
                        self.metrics.bytes_sent.add(n as u64);
                        if let Some(f) = self.faces.get_mut(faceid) {
                            f.meter.bytes_out += n as u64;
                            f.meter.packets_out += 1;
                        }
                    }
                    Some(Ok(_)) => info!("sendto short"),
                    Some(Err(e)) if e.kind() == ErrorKind::WouldBlock => {}
                    Some(Err(e)) => error!("sendto {}: {}", addr, e),
                    None => {}
                }
            }
            Target::Stream(fd) => {
                let res = {
                    let face = self.faces.get(faceid).unwrap();
                    match &face.socket {
                        FaceSocket::Stream(s) => (&*s).write(data),
                        _ => return,
                    }
                };
                match res {
                    Ok(n) if n == data.len() => {
                        self.metrics.bytes_sent.add(n as u64);
                        if let Some(f) = self.faces.get_mut(faceid) {
                            f.meter.bytes_out += n as u64;
                            f.meter.packets_out += 1;
                        }
                    }
                    Ok(n) => self.stash_partial(faceid, fd, &data[n..], n),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        self.stash_partial(faceid, fd, data, 0)
                    }
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                        if let Some(f) = self.faces.get_mut(faceid) {
                            f.flags.insert(FaceFlags::NOSEND);
                            f.outbuf = None;
                            f.outbuf_index = 0;
                        }
                    }
                    Err(e) => error!("send {}: {}", faceid, e),
                }
            }
        }
    }

    fn stash_partial(&mut self, faceid: FaceId, fd: RawFd, rest: &[u8], sent: usize) {
        if let Some(f) = self.faces.get_mut(faceid) {
            let mut outbuf = BytesMut::with_capacity(rest.len());
            outbuf.extend_from_slice(rest);
            f.outbuf = Some(outbuf);
            f.outbuf_index = 0;
            f.meter.bytes_out += sent as u64;
        }
        self.metrics.bytes_sent.add(sent as u64);
        self.rearm(fd, true);
    }

    /// Drains a face's deferred output when the socket becomes writable.
    pub(crate) fn do_deferred_write(&mut self, fd: RawFd) {
        let faceid = match self.faces.by_fd.get(&fd) {
            Some(id) => *id,
            None => return,
        };
        let res = {
            let face = match self.faces.get(faceid) {
                Some(f) => f,
                None => return,
            };
            let outbuf = match &face.outbuf {
                Some(b) => b,
                None => {
                    debug!("deferred write with nothing pending on {}", faceid);
                    return;
                }
            };
            let chunk = &outbuf[face.outbuf_index..];
            if chunk.is_empty() {
                Ok(0)
            } else {
                match &face.socket {
                    FaceSocket::Stream(s) => (&*s).write(chunk),
                    _ => return,
                }
            }
        };
        let pending = {
            let f = self.faces.get(faceid).unwrap();
            f.outbuf.as_ref().map_or(0, |b| b.len()) - f.outbuf_index
        };
        match res {
            Ok(n) if n == pending => {
                if let Some(f) = self.faces.get_mut(faceid) {
                    f.outbuf = None;
                    f.outbuf_index = 0;
                }
                self.metrics.bytes_sent.add(n as u64);
                self.rearm(fd, false);
            }
            Ok(n) => {
                if let Some(f) = self.faces.get_mut(faceid) {
                    f.outbuf_index += n;
                }
                self.metrics.bytes_sent.add(n as u64);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                if let Some(f) = self.faces.get_mut(faceid) {
                    f.flags.insert(FaceFlags::NOSEND);
                    f.outbuf = None;
                    f.outbuf_index = 0;
                }
            }
            Err(e) => {
                error!("send {}: {}", faceid, e);
                self.destroy_face(faceid);
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Teardown
     * ------------------------------------------------------------ */

    /// Synchronously drains the face out of every structure: sender
    /// events cancelled, poller registration dropped, slot nulled. Any
    /// stale face-id held elsewhere now resolves to nothing.
    pub fn destroy_face(&mut self, faceid: FaceId) {
        let face = match self.faces.remove(faceid) {
            Some(f) => f,
            None => return,
        };
        for q in face.queues.iter().flatten() {
            if let Some(h) = q.sender {
                self.cancel_event(h);
            }
        }
        if let Some(poller) = &self.poller {
            if let (Some(fd), FaceSocket::Stream(_) | FaceSocket::Udp(_)) =
                (face.fd, &face.socket)
            {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let _ = poller.delete(borrowed);
            }
        }
        info!("releasing {} (slot {})", faceid, faceid.slot());
        self.metrics.face_count.set(self.faces.len() as u64);
    }
}

/// Binds the well-known stream socket, replacing a leftover path.
/// World-writable so any local client can connect.
fn create_local_listener(path: &std::path::Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        info!("unlinking old {}", path.display());
        let _ = std::fs::remove_file(path);
    }
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666));
    Ok(listener)
}
