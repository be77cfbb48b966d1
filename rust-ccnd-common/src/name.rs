//! CCN names and name components.
//!
//! A name is an ordered sequence of opaque byte-string components. The
//! canonical order compares componentwise, each component by length and
//! then bytes, and a name that is a proper prefix of another sorts first.

use crate::coding::{self, dtag, ElementDecoder, Tt};
use crate::error::Error;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;

/// Maximum number of components accepted in a single name.
pub const MAX_NAME_COMPONENTS: usize = 64;

/* ---------------------------------------------------------------- *\
 * Component
\* ---------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Component(pub Bytes);

impl Component {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        coding::append_tagged_blob(buf, dtag::COMPONENT, &self.0);
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_components(&self.0, &other.0)
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Canonical component order: shorter first, then bytewise.
pub fn compare_components(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Canonical order over two sequences of component values.
pub fn compare_component_seqs<'a, A, B>(a: A, b: B) -> Ordering
where
    A: Iterator<Item = &'a [u8]>,
    B: Iterator<Item = &'a [u8]>,
{
    let mut a = a;
    let mut b = b;
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match compare_components(x, y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.iter() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

/* ---------------------------------------------------------------- *\
 * Name
\* ---------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Name {
    components: Vec<Component>,
}

impl Name {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parses a URI-style name such as `/a/b/%00%01`.
    ///
    /// Empty segments are dropped, so `/` names the empty name.
    pub fn from_uri(s: &str) -> Result<Self> {
        let mut components = Vec::new();
        for seg in s.split('/').filter(|seg| !seg.is_empty()) {
            components.push(Component(percent_decode(seg)?));
            if components.len() > MAX_NAME_COMPONENTS {
                return Err(Error::Coding("too many name components".into()));
            }
        }
        Ok(Self { components })
    }

    pub fn push(&mut self, component: Component) -> &mut Self {
        self.components.push(component);
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Component> {
        self.components.get(index)
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.components.len() <= other.components.len()
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .all(|(a, b)| a == b)
    }

    /// Appends the `<Name>` element to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        coding::append_tt(buf, dtag::NAME, Tt::Dtag);
        for component in &self.components {
            component.encode(buf);
        }
        coding::append_closer(buf);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Reads a `<Name>` element from the decoder's current position.
    pub fn decode(d: &mut ElementDecoder<'_>) -> Result<Self> {
        if !d.match_dtag(dtag::NAME) {
            return Err(Error::Coding("expected Name".into()));
        }
        d.advance()?;
        let mut components = Vec::new();
        while d.match_dtag(dtag::COMPONENT) {
            let range = d.required_tagged_blob(dtag::COMPONENT, 0, None)?;
            components.push(Component(Bytes::copy_from_slice(&d.buffer()[range])));
            if components.len() > MAX_NAME_COMPONENTS {
                return Err(Error::Coding("too many name components".into()));
            }
        }
        d.check_close()?;
        Ok(Self { components })
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_component_seqs(
            self.components.iter().map(|c| c.as_bytes()),
            other.components.iter().map(|c| c.as_bytes()),
        )
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

fn percent_decode(seg: &str) -> Result<Bytes> {
    let raw = seg.as_bytes();
    let mut out = BytesMut::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            if i + 3 > raw.len() {
                return Err(Error::Coding(format!("truncated escape in '{}'", seg)));
            }
            let hex = std::str::from_utf8(&raw[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::Coding(format!("bad escape in '{}'", seg)))?;
            out.put_u8(hex);
            i += 3;
        } else {
            out.put_u8(raw[i]);
            i += 1;
        }
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_roundtrip() {
        let name = Name::from_uri("/test/data/1").unwrap();
        assert_eq!(name.len(), 3);
        assert_eq!(name.get(0).unwrap().as_bytes(), b"test");
        assert_eq!(name.to_string(), "/test/data/1");

        let escaped = Name::from_uri("/a/%00%01").unwrap();
        assert_eq!(escaped.get(1).unwrap().as_bytes(), &[0u8, 1u8][..]);
        assert_eq!(escaped.to_string(), "/a/%00%01");
    }

    #[test]
    fn empty_name() {
        let root = Name::from_uri("/").unwrap();
        assert!(root.is_empty());
        assert_eq!(root.to_string(), "/");
    }

    #[test]
    fn prefix_relation() {
        let a = Name::from_uri("/a/b").unwrap();
        let b = Name::from_uri("/a/b/c").unwrap();
        assert!(a.is_prefix_of(&b));
        assert!(!b.is_prefix_of(&a));
        assert!(a.is_prefix_of(&a));
    }

    #[test]
    fn canonical_order() {
        let mut names: Vec<Name> = ["/b", "/a/b", "/a", "/a/bb", "/a/c", "/"]
            .iter()
            .map(|s| Name::from_uri(s).unwrap())
            .collect();
        names.sort();
        let sorted: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        assert_eq!(sorted, vec!["/", "/a", "/a/b", "/a/c", "/a/bb", "/b"]);
    }

    #[test]
    fn encode_decode() {
        let name = Name::from_uri("/x/y/z").unwrap();
        let bytes = name.to_bytes();
        let mut d = ElementDecoder::new(&bytes).unwrap();
        let parsed = Name::decode(&mut d).unwrap();
        assert_eq!(parsed, name);
        assert!(d.finished());
    }
}
