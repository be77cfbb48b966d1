//! Interest parsing and construction.
//!
//! The forwarder works from parsed byte offsets rather than materialized
//! structures: [`ParsedInterest`] records where each field of the message
//! lives so that the original bytes can be propagated, spliced, and
//! compared without re-encoding.

use crate::coding::{self, dtag, ElementDecoder, Tt};
use crate::error::Error;
use crate::name::{compare_components, Name};
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use std::cmp::Ordering;
use std::ops::Range;
use std::time::Duration;

/// AnswerOriginKind: answer may come from the content store.
pub const AOK_CS: u32 = 1;
/// AnswerOriginKind: answer may be new content from upstream.
pub const AOK_NEW: u32 = 2;
/// AnswerOriginKind: stale content is an acceptable answer.
pub const AOK_STALE: u32 = 4;
/// AnswerOriginKind: mark the matched content stale after answering.
pub const AOK_EXPIRE: u32 = 8;
pub const AOK_DEFAULT: u32 = AOK_CS | AOK_NEW;

/// Lifetime applied when an Interest carries none.
pub const DEFAULT_LIFETIME_USEC: i64 = 4_000_000;

/// Parsed field offsets of one Interest message.
///
/// Ranges index the original message bytes. `comps` holds the byte
/// boundary of each name component plus one final boundary at the Name
/// closer, so `comps.len()` is the component count plus one.
#[derive(Debug, Clone)]
pub struct ParsedInterest {
    pub name: Range<usize>,
    pub comps: Vec<usize>,
    pub prefix_comps: usize,
    pub min_suffix_comps: u64,
    pub max_suffix_comps: u64,
    /// Value bytes of PublisherPublicKeyDigest, when present and keyed.
    pub publisher_digest: Option<Range<usize>>,
    /// The whole Exclude element, when present.
    pub exclude: Option<Range<usize>>,
    pub child_selector: u64,
    pub answer_origin: u32,
    pub scope: Option<u64>,
    pub lifetime_usec: i64,
    /// The whole Nonce element; empty range when absent.
    pub nonce: Range<usize>,
    /// Trailing local-use fields between Nonce and the closer.
    pub other: Range<usize>,
    pub end: usize,
}

impl ParsedInterest {
    pub fn has_nonce(&self) -> bool {
        !self.nonce.is_empty()
    }

    /// Byte range of the encoded components forming the full prefix.
    pub fn prefix_key_range(&self) -> Range<usize> {
        self.comps[0]..self.comps[self.prefix_comps]
    }

    /// Byte range of the encoded component at `i`.
    pub fn comp_range(&self, i: usize) -> Range<usize> {
        self.comps[i]..self.comps[i + 1]
    }
}

/// Parses an Interest message, mirroring the schema field for field.
pub fn parse_interest(msg: &[u8]) -> Result<ParsedInterest> {
    let mut d = ElementDecoder::new(msg)?;
    if !d.match_dtag(dtag::INTEREST) {
        return Err(Error::InterestParse("outer tag is not Interest".into()));
    }
    d.advance()?;

    let name_start = d.token_index();
    if !d.match_dtag(dtag::NAME) {
        return Err(Error::InterestParse("missing Name".into()));
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
    let prefix_comps = comps.len() - 1;

    let min_suffix_comps = d
        .optional_tagged_number(dtag::MIN_SUFFIX_COMPONENTS)?
        .unwrap_or(0);
    let max_suffix_comps = d
        .optional_tagged_number(dtag::MAX_SUFFIX_COMPONENTS)?
        .unwrap_or(32767);
    if max_suffix_comps < min_suffix_comps {
        return Err(Error::InterestParse("suffix bounds are inverted".into()));
    }

    let mut publisher_digest = None;
    if d.match_dtag(dtag::PUBLISHER_PUBLIC_KEY_DIGEST) {
        publisher_digest =
            Some(d.required_tagged_blob(dtag::PUBLISHER_PUBLIC_KEY_DIGEST, 1, Some(64))?);
    } else if d.match_dtag(dtag::PUBLISHER_CERTIFICATE_DIGEST)
        || d.match_dtag(dtag::PUBLISHER_ISSUER_KEY_DIGEST)
        || d.match_dtag(dtag::PUBLISHER_ISSUER_CERTIFICATE_DIGEST)
    {
        // Other publisher qualifiers are tolerated but give no match data.
        d.advance_past_element()?;
    }

    let mut exclude = None;
    if d.match_dtag(dtag::EXCLUDE) {
        let start = d.token_index();
        parse_exclude_body(&mut d)?;
        exclude = Some(start..d.token_index());
    }

    let child_selector = d.optional_tagged_number(dtag::CHILD_SELECTOR)?.unwrap_or(0);
    if child_selector > 5 {
        return Err(Error::InterestParse("ChildSelector out of range".into()));
    }

    let answer_origin = d
        .optional_tagged_number(dtag::ANSWER_ORIGIN_KIND)?
        .map(|v| v as u32)
        .unwrap_or(AOK_DEFAULT);
    if answer_origin & AOK_NEW != 0 && answer_origin & AOK_CS == 0 {
        return Err(Error::InterestParse("AnswerOriginKind NEW without CS".into()));
    }

    let scope = d.optional_tagged_number(dtag::SCOPE)?;
    if let Some(s) = scope {
        if s > 9 {
            return Err(Error::InterestParse("Scope out of range".into()));
        }
    }
    if answer_origin & AOK_EXPIRE != 0 && scope != Some(0) {
        return Err(Error::InterestParse("EXPIRE requires scope 0".into()));
    }

    let lifetime_usec = match d.optional_tagged_blob(dtag::INTEREST_LIFETIME, 1, Some(8))? {
        Some(range) => {
            let mut v: u64 = 0;
            for &b in &msg[range] {
                v = (v << 8) | b as u64;
            }
            // 12-bit fixed-point seconds
            ((v * 1_000_000) >> 12) as i64
        }
        None => DEFAULT_LIFETIME_USEC,
    };

    let nonce_start = d.token_index();
    d.optional_tagged_blob(dtag::NONCE, 4, Some(64))?;
    let nonce = nonce_start..d.token_index();

    let other_start = d.token_index();
    d.optional_tagged_number(dtag::FACE_ID)?;
    let other = other_start..d.token_index();

    d.check_close()?;
    let end = d.index();
    if !d.finished() {
        return Err(Error::InterestParse("trailing bytes after Interest".into()));
    }

    trace!(
        "parsed Interest: prefix_comps={} selector={} answerfrom={:#x} scope={:?} lifetime={}us nonce={}",
        prefix_comps,
        child_selector,
        answer_origin,
        scope,
        lifetime_usec,
        !nonce.is_empty()
    );

    Ok(ParsedInterest {
        name,
        comps,
        prefix_comps,
        min_suffix_comps,
        max_suffix_comps,
        publisher_digest,
        exclude,
        child_selector,
        answer_origin,
        scope,
        lifetime_usec,
        nonce,
        other,
        end,
    })
}

fn parse_exclude_body(d: &mut ElementDecoder<'_>) -> Result<()> {
    d.advance()?;
    parse_optional_any_or_bloom(d)?;
    while d.match_dtag(dtag::COMPONENT) {
        d.required_tagged_blob(dtag::COMPONENT, 0, None)?;
        parse_optional_any_or_bloom(d)?;
    }
    d.check_close()
}

fn parse_optional_any_or_bloom(d: &mut ElementDecoder<'_>) -> Result<()> {
    if d.match_dtag(dtag::ANY) {
        d.advance()?;
        d.check_close()?;
    } else if d.match_dtag(dtag::BLOOM) {
        d.required_tagged_blob(dtag::BLOOM, 1, Some(1024 + 8))?;
    }
    Ok(())
}

/// Decides whether an Exclude element rules out component value `comp`.
///
/// The element lists component values in increasing canonical order with
/// optional Any markers covering the gaps around them. Bloom terms are
/// parsed but never exclude.
pub fn exclude_matches(exclude_elem: &[u8], comp: &[u8]) -> Result<bool> {
    let mut d = ElementDecoder::new(exclude_elem)?;
    if !d.match_dtag(dtag::EXCLUDE) {
        return Err(Error::InterestParse("not an Exclude".into()));
    }
    d.advance()?;
    let mut gap_covered = false;
    loop {
        if d.match_dtag(dtag::ANY) {
            d.advance()?;
            d.check_close()?;
            gap_covered = true;
            continue;
        }
        if d.match_dtag(dtag::BLOOM) {
            d.required_tagged_blob(dtag::BLOOM, 1, Some(1024 + 8))?;
            continue;
        }
        if d.match_dtag(dtag::COMPONENT) {
            let range = d.required_tagged_blob(dtag::COMPONENT, 0, None)?;
            let listed = &exclude_elem[range];
            match compare_components(comp, listed) {
                Ordering::Equal => return Ok(true),
                Ordering::Less => return Ok(gap_covered),
                Ordering::Greater => {
                    gap_covered = false;
                    continue;
                }
            }
        }
        break;
    }
    d.check_close()?;
    Ok(gap_covered)
}

/// Returns a copy of `msg` with `nonce` spliced in as the Nonce element,
/// replacing any existing one.
pub fn with_nonce(msg: &[u8], pi: &ParsedInterest, nonce: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(msg.len() + nonce.len() + 8);
    buf.put_slice(&msg[..pi.nonce.start]);
    coding::append_tagged_blob(&mut buf, dtag::NONCE, nonce);
    buf.put_slice(&msg[pi.nonce.end..]);
    buf.freeze()
}

/* ---------------------------------------------------------------- *\
 * Construction
\* ---------------------------------------------------------------- */

/// One term of an Exclude filter, in increasing component order.
#[derive(Debug, Clone)]
pub enum ExcludeTerm {
    Any,
    Component(Bytes),
}

/// Builder assembling an encoded Interest.
#[derive(Debug, Clone, Default)]
pub struct InterestBuilder {
    name: Name,
    min_suffix_comps: Option<u64>,
    max_suffix_comps: Option<u64>,
    publisher_digest: Option<Bytes>,
    exclude: Vec<ExcludeTerm>,
    child_selector: Option<u64>,
    answer_origin: Option<u32>,
    scope: Option<u64>,
    lifetime: Option<Duration>,
    nonce: Option<Bytes>,
}

impl InterestBuilder {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn min_suffix_comps(mut self, n: u64) -> Self {
        self.min_suffix_comps = Some(n);
        self
    }

    pub fn max_suffix_comps(mut self, n: u64) -> Self {
        self.max_suffix_comps = Some(n);
        self
    }

    pub fn publisher_digest(mut self, digest: impl Into<Bytes>) -> Self {
        self.publisher_digest = Some(digest.into());
        self
    }

    pub fn exclude(mut self, terms: Vec<ExcludeTerm>) -> Self {
        self.exclude = terms;
        self
    }

    pub fn child_selector(mut self, sel: u64) -> Self {
        self.child_selector = Some(sel);
        self
    }

    pub fn answer_origin(mut self, aok: u32) -> Self {
        self.answer_origin = Some(aok);
        self
    }

    pub fn scope(mut self, scope: u64) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn nonce(mut self, nonce: impl Into<Bytes>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn build(&self) -> Bytes {
        let mut buf = BytesMut::new();
        coding::append_tt(&mut buf, dtag::INTEREST, Tt::Dtag);
        self.name.encode(&mut buf);
        if let Some(n) = self.min_suffix_comps {
            coding::append_tagged_number(&mut buf, dtag::MIN_SUFFIX_COMPONENTS, n);
        }
        if let Some(n) = self.max_suffix_comps {
            coding::append_tagged_number(&mut buf, dtag::MAX_SUFFIX_COMPONENTS, n);
        }
        if let Some(digest) = &self.publisher_digest {
            coding::append_tagged_blob(&mut buf, dtag::PUBLISHER_PUBLIC_KEY_DIGEST, digest);
        }
        if !self.exclude.is_empty() {
            coding::append_tt(&mut buf, dtag::EXCLUDE, Tt::Dtag);
            for term in &self.exclude {
                match term {
                    ExcludeTerm::Any => {
                        coding::append_tt(&mut buf, dtag::ANY, Tt::Dtag);
                        coding::append_closer(&mut buf);
                    }
                    ExcludeTerm::Component(c) => {
                        coding::append_tagged_blob(&mut buf, dtag::COMPONENT, c);
                    }
                }
            }
            coding::append_closer(&mut buf);
        }
        if let Some(sel) = self.child_selector {
            coding::append_tagged_number(&mut buf, dtag::CHILD_SELECTOR, sel);
        }
        if let Some(aok) = self.answer_origin {
            coding::append_tagged_number(&mut buf, dtag::ANSWER_ORIGIN_KIND, aok as u64);
        }
        if let Some(scope) = self.scope {
            coding::append_tagged_number(&mut buf, dtag::SCOPE, scope);
        }
        if let Some(lifetime) = self.lifetime {
            let fixed = (lifetime.as_secs_f64() * 4096.0).round() as u64;
            coding::append_tagged_binary_number(&mut buf, dtag::INTEREST_LIFETIME, fixed.max(1));
        }
        if let Some(nonce) = &self.nonce {
            coding::append_tagged_blob(&mut buf, dtag::NONCE, nonce);
        }
        coding::append_closer(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        Name::from_uri(s).unwrap()
    }

    #[test]
    fn parse_minimal() {
        let wire = InterestBuilder::new(name("/a/b")).build();
        let pi = parse_interest(&wire).unwrap();
        assert_eq!(pi.prefix_comps, 2);
        assert_eq!(pi.min_suffix_comps, 0);
        assert_eq!(pi.max_suffix_comps, 32767);
        assert_eq!(pi.answer_origin, AOK_DEFAULT);
        assert_eq!(pi.scope, None);
        assert_eq!(pi.lifetime_usec, DEFAULT_LIFETIME_USEC);
        assert!(!pi.has_nonce());
        assert_eq!(pi.end, wire.len());
    }

    #[test]
    fn parse_full() {
        let wire = InterestBuilder::new(name("/a/b"))
            .min_suffix_comps(1)
            .max_suffix_comps(3)
            .publisher_digest(vec![7u8; 32])
            .exclude(vec![
                ExcludeTerm::Component(Bytes::from_static(b"x")),
                ExcludeTerm::Any,
            ])
            .child_selector(5)
            .answer_origin(AOK_CS | AOK_NEW | AOK_STALE)
            .scope(2)
            .lifetime(Duration::from_secs(2))
            .nonce(vec![1, 2, 3, 4, 5, 6])
            .build();
        let pi = parse_interest(&wire).unwrap();
        assert_eq!(pi.min_suffix_comps, 1);
        assert_eq!(pi.max_suffix_comps, 3);
        assert!(pi.publisher_digest.is_some());
        assert!(pi.exclude.is_some());
        assert_eq!(pi.child_selector, 5);
        assert_eq!(pi.scope, Some(2));
        assert_eq!(pi.lifetime_usec, 2_000_000);
        assert!(pi.has_nonce());
        assert_eq!(wire[pi.nonce.clone()].len(), 10);
    }

    #[test]
    fn reject_new_without_cs() {
        let wire = InterestBuilder::new(name("/a"))
            .answer_origin(AOK_NEW)
            .build();
        assert!(parse_interest(&wire).is_err());
    }

    #[test]
    fn reject_inverted_suffix_bounds() {
        let wire = InterestBuilder::new(name("/a"))
            .min_suffix_comps(4)
            .max_suffix_comps(1)
            .build();
        assert!(parse_interest(&wire).is_err());
    }

    #[test]
    fn nonce_splice() {
        let wire = InterestBuilder::new(name("/a/b")).scope(1).build();
        let pi = parse_interest(&wire).unwrap();
        assert!(!pi.has_nonce());
        let spliced = with_nonce(&wire, &pi, &[9, 8, 7, 6, 5, 4]);
        let pi2 = parse_interest(&spliced).unwrap();
        assert!(pi2.has_nonce());
        assert_eq!(pi2.scope, Some(1));
        // everything before the nonce is byte-identical
        assert_eq!(&spliced[..pi.nonce.start], &wire[..pi.nonce.start]);
    }

    #[test]
    fn exclude_semantics() {
        let wire = InterestBuilder::new(name("/a"))
            .exclude(vec![
                ExcludeTerm::Component(Bytes::from_static(b"b")),
                ExcludeTerm::Component(Bytes::from_static(b"d")),
                ExcludeTerm::Any,
            ])
            .build();
        let pi = parse_interest(&wire).unwrap();
        let excl = &wire[pi.exclude.clone().unwrap()];
        assert!(exclude_matches(excl, b"b").unwrap());
        assert!(exclude_matches(excl, b"d").unwrap());
        assert!(!exclude_matches(excl, b"a").unwrap());
        assert!(!exclude_matches(excl, b"c").unwrap());
        // the trailing Any covers everything after "d"
        assert!(exclude_matches(excl, b"e").unwrap());
        assert!(exclude_matches(excl, b"zzzz").unwrap());
    }

    #[test]
    fn exclude_leading_any() {
        let wire = InterestBuilder::new(name("/a"))
            .exclude(vec![
                ExcludeTerm::Any,
                ExcludeTerm::Component(Bytes::from_static(b"m")),
            ])
            .build();
        let pi = parse_interest(&wire).unwrap();
        let excl = &wire[pi.exclude.clone().unwrap()];
        assert!(exclude_matches(excl, b"a").unwrap());
        assert!(exclude_matches(excl, b"m").unwrap());
        assert!(!exclude_matches(excl, b"n").unwrap());
    }
}
