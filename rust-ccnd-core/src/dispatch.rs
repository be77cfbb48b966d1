//! Message classification by outer tag, link-PDU unwrapping, and the
//! trusted Inject path.

use crate::daemon::Daemon;
use crate::face::{FaceFlags, FaceSocket};
use crate::faces::FaceId;
use bytes::Bytes;
use log::{debug, info};
use rust_ccnd_common::coding::{dtag, ElementDecoder, SkeletonDecoder, Token};
use rust_ccnd_common::interest::parse_interest;
use std::net::SocketAddr;

impl Daemon {
    /// Routes one complete framed element. `pdu_ok` limits link-PDU
    /// recursion to a single level.
    pub(crate) fn process_input_message(&mut self, faceid: FaceId, msg: Bytes, pdu_ok: bool) {
        let d = match ElementDecoder::new(&msg) {
            Ok(d) => d,
            Err(_) => {
                info!("discarding undecodable message; size = {}", msg.len());
                return;
            }
        };
        match d.token() {
            Token::Dtag(dtag::CCN_PROTOCOL_DATA_UNIT) if pdu_ok => {
                if let Some(f) = self.faces.get_mut(faceid) {
                    f.flags.insert(FaceFlags::LINK);
                }
                self.process_pdu_members(faceid, &msg, d.index());
            }
            Token::Dtag(dtag::INTEREST) => self.process_incoming_interest(faceid, msg),
            Token::Dtag(dtag::CONTENT_OBJECT) | Token::Dtag(dtag::CONTENT_OBJECT_V20080711) => {
                self.process_incoming_content(faceid, msg)
            }
            Token::Dtag(dtag::INJECT) => self.process_incoming_inject(faceid, &msg),
            _ => info!("discarding unknown message; size = {}", msg.len()),
        }
    }

    fn process_pdu_members(&mut self, faceid: FaceId, msg: &Bytes, body_start: usize) {
        if msg.len() <= body_start {
            return;
        }
        // strip the PDU closer and frame the members
        let inner = msg.slice(body_start..msg.len() - 1);
        let mut sd = SkeletonDecoder::new();
        let mut msgstart = 0usize;
        while sd.index < inner.len() {
            sd.feed(&inner[sd.index..]);
            if sd.error() || !sd.complete() {
                info!(
                    "malformed link PDU member; discarding {} bytes",
                    inner.len() - msgstart
                );
                return;
            }
            let end = sd.index;
            self.process_input_message(faceid, inner.slice(msgstart..end), false);
            msgstart = end;
            if self.faces.get(faceid).is_none() {
                return;
            }
        }
    }

    /// Inject: a trusted local client asks the daemon to transmit an
    /// Interest from its own UDP socket toward a given address, used to
    /// bootstrap datagram faces.
    fn process_incoming_inject(&mut self, faceid: FaceId, msg: &Bytes) {
        let trusted = self
            .faces
            .get(faceid)
            .map_or(false, |f| f.flags.contains(FaceFlags::LOCAL));
        if !trusted {
            debug!("Inject from untrusted {} dropped", faceid);
            return;
        }
        let parsed = (|| -> rust_ccnd_common::Result<(u64, SocketAddr, Bytes)> {
            let mut d = ElementDecoder::new(msg)?;
            d.advance()?;
            let sotype = d
                .optional_tagged_number(dtag::SO_TYPE)?
                .ok_or_else(|| rust_ccnd_common::Error::Coding("missing SOType".into()))?;
            let addr_range = d.required_tagged_blob(dtag::ADDRESS, 1, Some(64))?;
            let addr: SocketAddr = std::str::from_utf8(&msg[addr_range])
                .map_err(|_| rust_ccnd_common::Error::Coding("bad Address".into()))?
                .parse()
                .map_err(|_| rust_ccnd_common::Error::Coding("bad Address".into()))?;
            let istart = d.token_index();
            if !d.match_dtag(dtag::INTEREST) {
                return Err(rust_ccnd_common::Error::Coding("missing Interest".into()));
            }
            d.advance_past_element()?;
            let iend = d.token_index();
            d.check_close()?;
            let imsg = msg.slice(istart..iend);
            parse_interest(&imsg)?;
            Ok((sotype, addr, imsg))
        })();
        let (sotype, addr, imsg) = match parsed {
            Ok(x) => x,
            Err(e) => {
                debug!("malformed Inject: {}", e);
                return;
            }
        };
        // datagram sockets only
        if sotype != 2 {
            return;
        }
        self.debug_msg(crate::config::DEBUG_INTEREST, "inject", faceid, imsg.len());
        let via = if addr.is_ipv4() { self.udp4 } else { self.udp6 };
        if let Some(listener) = via.and_then(|id| self.faces.get(id)) {
            if let FaceSocket::Udp(sock) = &listener.socket {
                if let Err(e) = sock.send_to(&imsg, addr) {
                    info!("inject sendto {} failed: {}", addr, e);
                }
            }
        }
    }
}
