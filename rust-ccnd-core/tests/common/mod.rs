//! Shared fixtures: manual-clock daemons over internal faces.

use bytes::{Bytes, BytesMut};
use rust_ccnd_core::{Clock, Config, Daemon};
use rust_ccnd_common::coding::{self, dtag, SkeletonDecoder};
use rust_ccnd_common::content::ContentObjectBuilder;
use rust_ccnd_common::interest::InterestBuilder;
use rust_ccnd_common::name::Name;

pub fn daemon() -> Daemon {
    Daemon::with_clock(Config::default(), Clock::manual())
}

pub fn daemon_with(tweak: impl FnOnce(&mut Config)) -> Daemon {
    let mut cfg = Config::default();
    tweak(&mut cfg);
    Daemon::with_clock(cfg, Clock::manual())
}

pub fn name(uri: &str) -> Name {
    Name::from_uri(uri).unwrap()
}

pub fn interest(uri: &str) -> InterestBuilder {
    InterestBuilder::new(name(uri))
}

/// An encoded ContentObject with a fixed timestamp so tests are
/// byte-for-byte repeatable.
pub fn content(uri: &str, payload: &[u8]) -> Bytes {
    ContentObjectBuilder::new(name(uri), payload.to_vec())
        .timestamp_secs(1_300_000_000)
        .build()
}

pub fn content_fresh(uri: &str, payload: &[u8], freshness: u64) -> Bytes {
    ContentObjectBuilder::new(name(uri), payload.to_vec())
        .timestamp_secs(1_300_000_000)
        .freshness_seconds(freshness)
        .build()
}

/// The Nonce element bytes for a nonce value, as keyed in the PIT.
pub fn nonce_elem(nonce: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    coding::append_tagged_blob(&mut buf, dtag::NONCE, nonce);
    buf.freeze()
}

/// Advances the manual clock in steps, running due events each step.
pub fn run_for(d: &mut Daemon, total_usec: u64, step_usec: u64) {
    let mut t = 0;
    while t < total_usec {
        d.advance_clock(step_usec);
        d.tick();
        t += step_usec;
    }
}

/// Splits a captured output buffer into its framed elements.
pub fn frames(data: &Bytes) -> Vec<Bytes> {
    let mut out = Vec::new();
    let mut sd = SkeletonDecoder::new();
    let mut start = 0;
    while sd.index < data.len() {
        sd.feed(&data[sd.index..]);
        assert!(!sd.error(), "undecodable output frame");
        assert!(sd.complete(), "truncated output frame");
        out.push(data.slice(start..sd.index));
        start = sd.index;
    }
    out
}
