//! ContentObject parsing, construction, and interest matching.
//!
//! Stored objects differ from the on-wire form in one way: the content
//! digest, implicit on the wire, is materialized as an explicit final
//! name component so that name ordering and matching treat it like any
//! other component. The send path excises it again.

use crate::coding::{self, component_value, dtag, ElementDecoder, Tt};
use crate::error::Error;
use crate::interest::{exclude_matches, ParsedInterest};
use crate::name::Name;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

/// Byte length of the content digest.
pub const DIGEST_BYTES: usize = 32;

/// Encoded size of the synthesized digest name component.
pub const DIGEST_COMPONENT_BYTES: usize = 36;

/// Parsed field offsets of one ContentObject message.
#[derive(Debug, Clone)]
pub struct ParsedContentObject {
    pub signature: Range<usize>,
    pub name: Range<usize>,
    /// Component byte boundaries plus one final boundary; length is the
    /// component count plus one.
    pub comps: Vec<usize>,
    /// Value bytes of SignedInfo/PublisherPublicKeyDigest.
    pub publisher_digest: Range<usize>,
    pub freshness_seconds: Option<u64>,
    /// The whole Content element.
    pub content: Range<usize>,
    pub end: usize,
    /// True when the message carried the legacy outer tag.
    pub legacy: bool,
}

impl ParsedContentObject {
    pub fn ncomps(&self) -> usize {
        self.comps.len() - 1
    }

    pub fn comp_range(&self, i: usize) -> Range<usize> {
        self.comps[i]..self.comps[i + 1]
    }
}

/// Parses a ContentObject message (either outer tag).
pub fn parse_content_object(msg: &[u8]) -> Result<ParsedContentObject> {
    let mut d = ElementDecoder::new(msg)?;
    let legacy = d.match_dtag(dtag::CONTENT_OBJECT_V20080711);
    if !legacy && !d.match_dtag(dtag::CONTENT_OBJECT) {
        return Err(Error::ContentParse("outer tag is not ContentObject".into()));
    }
    d.advance()?;

    let sig_start = d.token_index();
    if !d.match_dtag(dtag::SIGNATURE) {
        return Err(Error::ContentParse("missing Signature".into()));
    }
    d.advance()?;
    d.optional_tagged_udata(dtag::DIGEST_ALGORITHM)?;
    d.optional_tagged_blob(dtag::WITNESS, 8, None)?;
    d.required_tagged_blob(dtag::SIGNATURE_BITS, 16, None)?;
    d.check_close()?;
    let signature = sig_start..d.token_index();

    let name_start = d.token_index();
    if !d.match_dtag(dtag::NAME) {
        return Err(Error::ContentParse("missing Name".into()));
    }
    d.advance()?;
    let mut comps = Vec::new();
    while d.match_dtag(dtag::COMPONENT) {
        comps.push(d.token_index());
        d.required_tagged_blob(dtag::COMPONENT, 0, None)?;
    }
    comps.push(d.token_index());
    d.check_close()?;
    let name = name_start..d.token_index();

    if !d.match_dtag(dtag::SIGNED_INFO) {
        return Err(Error::ContentParse("missing SignedInfo".into()));
    }
    d.advance()?;
    let publisher_digest =
        d.required_tagged_blob(dtag::PUBLISHER_PUBLIC_KEY_DIGEST, 16, Some(64))?;
    d.required_tagged_blob(dtag::TIMESTAMP, 3, Some(7))?;
    d.optional_tagged_binary_number(dtag::TYPE, 3, 3)?;
    let freshness_seconds = d.optional_tagged_number(dtag::FRESHNESS_SECONDS)?;
    d.optional_tagged_blob(dtag::FINAL_BLOCK_ID, 1, None)?;
    if d.match_dtag(dtag::KEY_LOCATOR) {
        d.advance_past_element()?;
    }
    d.optional_tagged_blob(dtag::EXT_OPT, 2, None)?;
    d.check_close()?;

    let content_start = d.token_index();
    d.required_tagged_blob(dtag::CONTENT, 0, None)?;
    let content = content_start..d.token_index();

    d.check_close()?;
    let end = d.index();
    if !d.finished() {
        return Err(Error::ContentParse("trailing bytes after ContentObject".into()));
    }

    trace!(
        "parsed ContentObject: ncomps={} freshness={:?} legacy={}",
        comps.len() - 1,
        freshness_seconds,
        legacy
    );

    Ok(ParsedContentObject {
        signature,
        name,
        comps,
        publisher_digest,
        freshness_seconds,
        content,
        end,
        legacy,
    })
}

/// The 32-byte content digest over the whole encoded object.
pub fn digest_content_object(msg: &[u8]) -> [u8; DIGEST_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(msg);
    hasher.finalize().into()
}

/// Returns a copy of `msg` with the digest materialized as an explicit
/// final name component.
pub fn with_digest_component(msg: &[u8], pco: &ParsedContentObject) -> Bytes {
    let digest = digest_content_object(msg);
    let at = pco.comps[pco.comps.len() - 1];
    let mut buf = BytesMut::with_capacity(msg.len() + DIGEST_COMPONENT_BYTES);
    buf.put_slice(&msg[..at]);
    coding::append_tagged_blob(&mut buf, dtag::COMPONENT, &digest);
    buf.put_slice(&msg[at..]);
    buf.freeze()
}

/// Full interest predicate: prefix bytes, suffix-count bounds, publisher
/// digest, and Exclude. Staleness is the caller's concern.
///
/// `content`/`pco` describe the stored form with the digest component
/// materialized; the digest counts as a suffix component.
pub fn content_matches_interest(
    content: &[u8],
    pco: &ParsedContentObject,
    interest: &[u8],
    pi: &ParsedInterest,
) -> bool {
    if pco.ncomps() < pi.prefix_comps {
        return false;
    }
    let cpfx = &content[pco.comps[0]..pco.comps[pi.prefix_comps]];
    let ipfx = &interest[pi.comps[0]..pi.comps[pi.prefix_comps]];
    if cpfx != ipfx {
        return false;
    }
    let suffix = (pco.ncomps() - pi.prefix_comps) as u64;
    if suffix < pi.min_suffix_comps || suffix > pi.max_suffix_comps {
        return false;
    }
    if let Some(pd) = &pi.publisher_digest {
        if interest[pd.clone()] != content[pco.publisher_digest.clone()] {
            return false;
        }
    }
    if let Some(excl) = &pi.exclude {
        if pco.ncomps() > pi.prefix_comps {
            let comp = match component_value(content, pco.comp_range(pi.prefix_comps)) {
                Ok(c) => c,
                Err(_) => return false,
            };
            match exclude_matches(&interest[excl.clone()], comp) {
                Ok(true) => return false,
                Ok(false) => {}
                Err(_) => return false,
            }
        }
    }
    true
}

/// Payload bytes of a parsed object's Content element.
pub fn content_value<'a>(msg: &'a [u8], pco: &ParsedContentObject) -> Result<&'a [u8]> {
    let mut d = ElementDecoder::new(&msg[pco.content.clone()])?;
    let range = d.required_tagged_blob(dtag::CONTENT, 0, None)?;
    Ok(&msg[pco.content.start + range.start..pco.content.start + range.end])
}

/* ---------------------------------------------------------------- *\
 * Construction
\* ---------------------------------------------------------------- */

/// Builder assembling an encoded ContentObject.
///
/// Signing proper is a collaborator concern; the builder fills
/// SignatureBits with the digest of the signed portion so the element is
/// structurally complete.
#[derive(Debug, Clone)]
pub struct ContentObjectBuilder {
    name: Name,
    content: Bytes,
    publisher_digest: Bytes,
    freshness_seconds: Option<u64>,
    timestamp_secs: Option<u64>,
}

impl ContentObjectBuilder {
    pub fn new(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            content: content.into(),
            publisher_digest: Bytes::from_static(&[0u8; DIGEST_BYTES]),
            freshness_seconds: None,
            timestamp_secs: None,
        }
    }

    pub fn publisher_digest(mut self, digest: impl Into<Bytes>) -> Self {
        self.publisher_digest = digest.into();
        self
    }

    pub fn freshness_seconds(mut self, seconds: u64) -> Self {
        self.freshness_seconds = Some(seconds);
        self
    }

    pub fn timestamp_secs(mut self, seconds: u64) -> Self {
        self.timestamp_secs = Some(seconds);
        self
    }

    pub fn build(&self) -> Bytes {
        let secs = self.timestamp_secs.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });

        // The signed portion: Name, SignedInfo, Content.
        let mut signed = BytesMut::new();
        self.name.encode(&mut signed);
        coding::append_tt(&mut signed, dtag::SIGNED_INFO, Tt::Dtag);
        coding::append_tagged_blob(
            &mut signed,
            dtag::PUBLISHER_PUBLIC_KEY_DIGEST,
            &self.publisher_digest,
        );
        // binary timestamp with a 12-bit fraction, at least 3 bytes
        let ts = (secs << 12).to_be_bytes();
        let skip = ts
            .iter()
            .take_while(|&&b| b == 0)
            .count()
            .min(ts.len() - 3);
        coding::append_tagged_blob(&mut signed, dtag::TIMESTAMP, &ts[skip..]);
        if let Some(fresh) = self.freshness_seconds {
            coding::append_tagged_number(&mut signed, dtag::FRESHNESS_SECONDS, fresh);
        }
        coding::append_closer(&mut signed);
        coding::append_tagged_blob(&mut signed, dtag::CONTENT, &self.content);

        let mut hasher = Sha256::new();
        hasher.update(&signed);
        let sigbits: [u8; DIGEST_BYTES] = hasher.finalize().into();

        let mut buf = BytesMut::with_capacity(signed.len() + 64);
        coding::append_tt(&mut buf, dtag::CONTENT_OBJECT, Tt::Dtag);
        coding::append_tt(&mut buf, dtag::SIGNATURE, Tt::Dtag);
        coding::append_tagged_blob(&mut buf, dtag::SIGNATURE_BITS, &sigbits);
        coding::append_closer(&mut buf);
        buf.put_slice(&signed);
        coding::append_closer(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::{ExcludeTerm, InterestBuilder};

    fn name(s: &str) -> Name {
        Name::from_uri(s).unwrap()
    }

    fn stored(uri: &str, content: &[u8]) -> (Bytes, ParsedContentObject) {
        let wire = ContentObjectBuilder::new(name(uri), content.to_vec())
            .timestamp_secs(1_300_000_000)
            .build();
        let pco = parse_content_object(&wire).unwrap();
        let full = with_digest_component(&wire, &pco);
        let pco = parse_content_object(&full).unwrap();
        (full, pco)
    }

    #[test]
    fn parse_roundtrip() {
        let wire = ContentObjectBuilder::new(name("/x/y"), &b"hello"[..])
            .freshness_seconds(30)
            .build();
        let pco = parse_content_object(&wire).unwrap();
        assert_eq!(pco.ncomps(), 2);
        assert_eq!(pco.freshness_seconds, Some(30));
        assert_eq!(pco.end, wire.len());
    }

    #[test]
    fn digest_component_shape() {
        let wire = ContentObjectBuilder::new(name("/x"), &b"c"[..]).build();
        let pco = parse_content_object(&wire).unwrap();
        let full = with_digest_component(&wire, &pco);
        let pco2 = parse_content_object(&full).unwrap();
        assert_eq!(pco2.ncomps(), pco.ncomps() + 1);
        let last = pco2.comp_range(pco2.ncomps() - 1);
        assert_eq!(last.end - last.start, DIGEST_COMPONENT_BYTES);
        assert_eq!(full.len(), wire.len() + DIGEST_COMPONENT_BYTES);
    }

    #[test]
    fn digest_is_stable() {
        let wire = ContentObjectBuilder::new(name("/x"), &b"c"[..])
            .timestamp_secs(1)
            .build();
        assert_eq!(digest_content_object(&wire), digest_content_object(&wire));
    }

    #[test]
    fn prefix_match() {
        let (full, pco) = stored("/a/b/c", b"data");
        let hit = InterestBuilder::new(name("/a/b")).build();
        let miss = InterestBuilder::new(name("/a/x")).build();
        let pi_hit = crate::interest::parse_interest(&hit).unwrap();
        let pi_miss = crate::interest::parse_interest(&miss).unwrap();
        assert!(content_matches_interest(&full, &pco, &hit, &pi_hit));
        assert!(!content_matches_interest(&full, &pco, &miss, &pi_miss));
    }

    #[test]
    fn suffix_bounds_count_digest() {
        // /a/b stored => components /a/b/#digest; interest prefix /a/b
        // leaves exactly one suffix component (the digest).
        let (full, pco) = stored("/a/b", b"data");
        let exact = InterestBuilder::new(name("/a/b"))
            .min_suffix_comps(1)
            .max_suffix_comps(1)
            .build();
        let pi = crate::interest::parse_interest(&exact).unwrap();
        assert!(content_matches_interest(&full, &pco, &exact, &pi));

        let deeper = InterestBuilder::new(name("/a/b"))
            .min_suffix_comps(2)
            .build();
        let pi = crate::interest::parse_interest(&deeper).unwrap();
        assert!(!content_matches_interest(&full, &pco, &deeper, &pi));
    }

    #[test]
    fn publisher_digest_gate() {
        let wire = ContentObjectBuilder::new(name("/p"), &b"x"[..])
            .publisher_digest(vec![0xaa; 32])
            .build();
        let pco = parse_content_object(&wire).unwrap();
        let full = with_digest_component(&wire, &pco);
        let pco = parse_content_object(&full).unwrap();

        let good = InterestBuilder::new(name("/p"))
            .publisher_digest(vec![0xaa; 32])
            .build();
        let bad = InterestBuilder::new(name("/p"))
            .publisher_digest(vec![0xbb; 32])
            .build();
        let pi_good = crate::interest::parse_interest(&good).unwrap();
        let pi_bad = crate::interest::parse_interest(&bad).unwrap();
        assert!(content_matches_interest(&full, &pco, &good, &pi_good));
        assert!(!content_matches_interest(&full, &pco, &bad, &pi_bad));
    }

    #[test]
    fn exclude_gate() {
        let (full, pco) = stored("/a/b/c", b"data");
        let wire = InterestBuilder::new(name("/a/b"))
            .exclude(vec![ExcludeTerm::Component(Bytes::from_static(b"c"))])
            .build();
        let pi = crate::interest::parse_interest(&wire).unwrap();
        assert!(!content_matches_interest(&full, &pco, &wire, &pi));

        let other = InterestBuilder::new(name("/a/b"))
            .exclude(vec![ExcludeTerm::Component(Bytes::from_static(b"z"))])
            .build();
        let pi = crate::interest::parse_interest(&other).unwrap();
        assert!(content_matches_interest(&full, &pco, &other, &pi));
    }
}
