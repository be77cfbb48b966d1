//! Shared plumbing for the CLI commands.

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use rust_ccnd_common::coding::SkeletonDecoder;
use std::io::{ErrorKind, Read};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Instant;

/// The daemon's IPC socket path, resolved from the same environment
/// variables the daemon itself reads.
pub fn local_socket_path() -> PathBuf {
    rust_ccnd_core::Config::from_env().sockname
}

/// Connects to the local daemon.
pub fn connect() -> Result<UnixStream> {
    let path = local_socket_path();
    UnixStream::connect(&path)
        .with_context(|| format!("cannot reach ccnd at {}", path.display()))
}

/// Reads one complete ccnb element, or None when the deadline passes.
pub fn read_message(stream: &mut UnixStream, deadline: Instant) -> Result<Option<Bytes>> {
    let mut decoder = SkeletonDecoder::new();
    let mut buf = BytesMut::new();
    let mut tmp = [0u8; 8800];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        stream.set_read_timeout(Some(deadline - now))?;
        let n = match stream.read(&mut tmp) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        buf.extend_from_slice(&tmp[..n]);
        decoder.feed(&buf[decoder.index..]);
        if decoder.error() {
            anyhow::bail!("protocol error from daemon");
        }
        if decoder.complete() {
            return Ok(Some(buf.freeze().slice(..decoder.index)));
        }
    }
}
