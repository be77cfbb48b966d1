//! ccnb encoding and decoding primitives.
//!
//! ccnb is the self-delimiting tag-length-value encoding carried on every
//! face. A token begins with a variable-length header: the final header
//! byte has its high bit set and holds the token type in its three
//! low-order bits plus the four low-order bits of the number; each
//! preceding byte has the high bit clear and contributes seven more bits,
//! most significant first. A single zero byte closes the innermost open
//! element, so a message needs no outer length prefix.

use crate::error::Error;
use crate::Result;
use bytes::{BufMut, BytesMut};
use log::{debug, trace};

/// Byte that closes the innermost open element.
pub const CLOSE: u8 = 0x00;

const TT_BITS: u32 = 3;
const TT_MASK: u64 = (1 << TT_BITS) - 1;
const TT_HBIT: u8 = 0x80;
const MAX_TINY: u64 = (1 << (7 - TT_BITS)) - 1;

/// Header numbers larger than this are treated as coding errors.
const NUMVAL_LIMIT: u64 = 1 << 60;

/// Token types of the ccnb encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tt {
    /// Dictionary tag; the number selects an entry in the [`dtag`] table.
    Dtag,
    /// Opaque binary data; the number is the byte count that follows.
    Blob,
    /// UTF-8 character data; the number is the byte count that follows.
    Udata,
}

impl Tt {
    fn from_bits(bits: u64) -> Result<Tt> {
        match bits {
            2 => Ok(Tt::Dtag),
            5 => Ok(Tt::Blob),
            6 => Ok(Tt::Udata),
            other => Err(Error::Coding(format!("unsupported token type {}", other))),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Tt::Dtag => 2,
            Tt::Blob => 5,
            Tt::Udata => 6,
        }
    }
}

/// Dictionary tag numbers used by the CCN message schema.
pub mod dtag {
    pub const ANY: u64 = 13;
    pub const NAME: u64 = 14;
    pub const COMPONENT: u64 = 15;
    pub const CERTIFICATE: u64 = 16;
    pub const CONTENT: u64 = 19;
    pub const SIGNED_INFO: u64 = 20;
    pub const INTEREST: u64 = 26;
    pub const KEY: u64 = 27;
    pub const KEY_LOCATOR: u64 = 28;
    pub const KEY_NAME: u64 = 29;
    pub const SIGNATURE: u64 = 37;
    pub const SIGNATURE_BITS: u64 = 38;
    pub const WITNESS: u64 = 39;
    pub const TIMESTAMP: u64 = 40;
    pub const TYPE: u64 = 41;
    pub const NONCE: u64 = 42;
    pub const EXCLUDE: u64 = 45;
    pub const BLOOM: u64 = 47;
    pub const SCOPE: u64 = 50;
    pub const MIN_SUFFIX_COMPONENTS: u64 = 51;
    pub const MAX_SUFFIX_COMPONENTS: u64 = 52;
    pub const CHILD_SELECTOR: u64 = 53;
    pub const ANSWER_ORIGIN_KIND: u64 = 54;
    pub const INTEREST_LIFETIME: u64 = 55;
    pub const FRESHNESS_SECONDS: u64 = 58;
    pub const FINAL_BLOCK_ID: u64 = 59;
    pub const DIGEST_ALGORITHM: u64 = 60;
    pub const PUBLISHER_PUBLIC_KEY_DIGEST: u64 = 61;
    pub const PUBLISHER_CERTIFICATE_DIGEST: u64 = 62;
    pub const PUBLISHER_ISSUER_KEY_DIGEST: u64 = 63;
    pub const CONTENT_OBJECT: u64 = 64;
    pub const PUBLISHER_ISSUER_CERTIFICATE_DIGEST: u64 = 65;
    pub const FACE_ID: u64 = 66;
    pub const SO_TYPE: u64 = 67;
    pub const ADDRESS: u64 = 68;
    pub const INJECT: u64 = 69;
    pub const EXT_OPT: u64 = 70;
    /// Wrapper grouping elements on link-wrapped transports.
    pub const CCN_PROTOCOL_DATA_UNIT: u64 = 17702112;
    /// Legacy ContentObject tag retained for backward compatibility.
    pub const CONTENT_OBJECT_V20080711: u64 = 19478337;
}

/* ---------------------------------------------------------------- *\
 * Encoding
\* ---------------------------------------------------------------- */

/// Appends a token header carrying `val` with token type `tt`.
pub fn append_tt(buf: &mut BytesMut, val: u64, tt: Tt) {
    let mut tmp = [0u8; 11];
    let mut pos = tmp.len() - 1;
    tmp[pos] = TT_HBIT | (((val & MAX_TINY) as u8) << TT_BITS) | tt.bits();
    let mut v = val >> (7 - TT_BITS);
    while v != 0 {
        pos -= 1;
        tmp[pos] = (v & 0x7f) as u8;
        v >>= 7;
    }
    buf.put_slice(&tmp[pos..]);
}

/// Appends the closer for the innermost open element.
pub fn append_closer(buf: &mut BytesMut) {
    buf.put_u8(CLOSE);
}

/// Appends `<dtag>BLOB</dtag>`.
pub fn append_tagged_blob(buf: &mut BytesMut, dtag: u64, blob: &[u8]) {
    append_tt(buf, dtag, Tt::Dtag);
    append_tt(buf, blob.len() as u64, Tt::Blob);
    buf.put_slice(blob);
    append_closer(buf);
}

/// Appends `<dtag>UDATA</dtag>`.
pub fn append_tagged_udata(buf: &mut BytesMut, dtag: u64, s: &str) {
    append_tt(buf, dtag, Tt::Dtag);
    append_tt(buf, s.len() as u64, Tt::Udata);
    buf.put_slice(s.as_bytes());
    append_closer(buf);
}

/// Appends a tagged nonNegativeInteger (decimal UDATA form).
pub fn append_tagged_number(buf: &mut BytesMut, dtag: u64, val: u64) {
    append_tagged_udata(buf, dtag, &val.to_string());
}

/// Appends a tagged big-endian binary number using the minimal byte count.
pub fn append_tagged_binary_number(buf: &mut BytesMut, dtag: u64, val: u64) {
    let bytes = val.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    append_tagged_blob(buf, dtag, &bytes[skip..]);
}

/* ---------------------------------------------------------------- *\
 * Skeleton decoder
\* ---------------------------------------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkelState {
    NewToken,
    Number,
    Skip,
    Error,
}

/// Incremental framing decoder.
///
/// Feeds arbitrary byte chunks and stops at the end of each complete
/// top-level element, so stream faces can slice whole messages out of
/// their inbound buffers without understanding the schema.
#[derive(Debug)]
pub struct SkeletonDecoder {
    state: SkelState,
    /// Total bytes consumed, relative to the start of the logical stream.
    pub index: usize,
    nest: usize,
    numval: u64,
    skip: u64,
    complete: bool,
}

impl Default for SkeletonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SkeletonDecoder {
    pub fn new() -> Self {
        Self {
            state: SkelState::NewToken,
            index: 0,
            nest: 0,
            numval: 0,
            skip: 0,
            complete: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// True when the bytes consumed so far end exactly one or more
    /// complete top-level elements, the last of which ends at `index`.
    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn error(&self) -> bool {
        self.state == SkelState::Error
    }

    /// Consumes bytes from `data`, stopping after a top-level element
    /// closes or the input runs out. Returns the number consumed.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut i = 0;
        self.complete = false;
        while i < data.len() {
            match self.state {
                SkelState::Error => break,
                SkelState::Skip => {
                    let take = (self.skip as usize).min(data.len() - i);
                    i += take;
                    self.skip -= take as u64;
                    if self.skip == 0 {
                        self.state = SkelState::NewToken;
                        if self.nest == 0 {
                            self.complete = true;
                            break;
                        }
                    }
                }
                SkelState::NewToken | SkelState::Number => {
                    let c = data[i];
                    i += 1;
                    if self.state == SkelState::NewToken && c == CLOSE {
                        if self.nest == 0 {
                            debug!("skeleton decode: close with nothing open");
                            self.state = SkelState::Error;
                            break;
                        }
                        self.nest -= 1;
                        if self.nest == 0 {
                            self.complete = true;
                            break;
                        }
                        continue;
                    }
                    if c & TT_HBIT == 0 {
                        self.numval = (self.numval << 7) | (c & 0x7f) as u64;
                        if self.numval >= NUMVAL_LIMIT {
                            debug!("skeleton decode: token number overflow");
                            self.state = SkelState::Error;
                            break;
                        }
                        self.state = SkelState::Number;
                        continue;
                    }
                    let numval = (self.numval << (7 - TT_BITS))
                        | ((c >> TT_BITS) as u64 & MAX_TINY);
                    self.numval = 0;
                    match Tt::from_bits((c as u64) & TT_MASK) {
                        Ok(Tt::Dtag) => {
                            self.nest += 1;
                            self.state = SkelState::NewToken;
                        }
                        Ok(Tt::Blob) | Ok(Tt::Udata) => {
                            if numval == 0 {
                                self.state = SkelState::NewToken;
                                if self.nest == 0 {
                                    self.complete = true;
                                    break;
                                }
                            } else {
                                self.skip = numval;
                                self.state = SkelState::Skip;
                            }
                        }
                        Err(e) => {
                            debug!("skeleton decode: {}", e);
                            self.state = SkelState::Error;
                            break;
                        }
                    }
                }
            }
        }
        self.index += i;
        if self.complete {
            trace!("skeleton decode: element ends at {}", self.index);
        }
        i
    }
}

/* ---------------------------------------------------------------- *\
 * Element decoder
\* ---------------------------------------------------------------- */

/// Current token of an [`ElementDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Dtag(u64),
    Blob { len: usize },
    Udata { len: usize },
    Closer,
    End,
}

/// Token-stepping decoder over one complete ccnb element.
///
/// The cursor model follows the message parsers: `token_index` is the
/// offset of the current token's header and `index` the offset of its
/// value bytes.
pub struct ElementDecoder<'a> {
    buf: &'a [u8],
    token: Token,
    token_index: usize,
    index: usize,
    nest: usize,
}

impl<'a> ElementDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let mut d = Self {
            buf,
            token: Token::End,
            token_index: 0,
            index: 0,
            nest: 0,
        };
        d.read_token(0)?;
        Ok(d)
    }

    fn read_token(&mut self, at: usize) -> Result<()> {
        self.token_index = at;
        if at == self.buf.len() {
            if self.nest != 0 {
                return Err(Error::Coding("truncated element".into()));
            }
            self.token = Token::End;
            self.index = at;
            return Ok(());
        }
        if self.buf[at] == CLOSE {
            self.token = Token::Closer;
            self.index = at + 1;
            return Ok(());
        }
        let mut numval: u64 = 0;
        let mut i = at;
        loop {
            if i == self.buf.len() {
                return Err(Error::Coding("truncated token header".into()));
            }
            let c = self.buf[i];
            i += 1;
            if c & TT_HBIT == 0 {
                numval = (numval << 7) | (c & 0x7f) as u64;
                if numval >= NUMVAL_LIMIT {
                    return Err(Error::Coding("token number overflow".into()));
                }
                continue;
            }
            numval = (numval << (7 - TT_BITS)) | ((c >> TT_BITS) as u64 & MAX_TINY);
            self.index = i;
            self.token = match Tt::from_bits((c as u64) & TT_MASK)? {
                Tt::Dtag => Token::Dtag(numval),
                Tt::Blob => {
                    let len = numval as usize;
                    if i + len > self.buf.len() {
                        return Err(Error::Coding("blob overruns element".into()));
                    }
                    Token::Blob { len }
                }
                Tt::Udata => {
                    let len = numval as usize;
                    if i + len > self.buf.len() {
                        return Err(Error::Coding("udata overruns element".into()));
                    }
                    Token::Udata { len }
                }
            };
            return Ok(());
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// The underlying element bytes.
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    /// Offset of the current token's header.
    pub fn token_index(&self) -> usize {
        self.token_index
    }

    /// Offset of the current token's value bytes.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn match_dtag(&self, dtag: u64) -> bool {
        self.token == Token::Dtag(dtag)
    }

    /// Value bytes of the current token if it is a BLOB.
    pub fn blob_value(&self) -> Option<&'a [u8]> {
        match self.token {
            Token::Blob { len } => Some(&self.buf[self.index..self.index + len]),
            _ => None,
        }
    }

    fn udata_value(&self) -> Option<&'a [u8]> {
        match self.token {
            Token::Udata { len } => Some(&self.buf[self.index..self.index + len]),
            _ => None,
        }
    }

    /// Consumes the current token and reads the next.
    pub fn advance(&mut self) -> Result<()> {
        let next = match self.token {
            Token::Dtag(_) => {
                self.nest += 1;
                self.index
            }
            Token::Blob { len } | Token::Udata { len } => self.index + len,
            Token::Closer => {
                if self.nest == 0 {
                    return Err(Error::Coding("unbalanced closer".into()));
                }
                self.nest -= 1;
                self.index
            }
            Token::End => return Err(Error::Coding("advance past end".into())),
        };
        self.read_token(next)
    }

    /// Consumes the closer that ends the innermost open element.
    pub fn check_close(&mut self) -> Result<()> {
        if self.token != Token::Closer {
            return Err(Error::Coding(format!(
                "expected closer at {}",
                self.token_index
            )));
        }
        self.advance()
    }

    /// True when the whole buffer has been consumed at nesting level zero.
    pub fn finished(&self) -> bool {
        self.token == Token::End && self.nest == 0
    }

    /// Skips the current element entirely (tag through matching closer).
    pub fn advance_past_element(&mut self) -> Result<()> {
        match self.token {
            Token::Dtag(_) => {
                let level = self.nest;
                self.advance()?;
                while self.nest > level {
                    self.advance()?;
                }
                Ok(())
            }
            _ => Err(Error::Coding("not at an element".into())),
        }
    }

    /// Parses `<dtag>BLOB</dtag>` and returns the value byte range.
    pub fn required_tagged_blob(
        &mut self,
        dtag: u64,
        minlen: usize,
        maxlen: Option<usize>,
    ) -> Result<std::ops::Range<usize>> {
        if !self.match_dtag(dtag) {
            return Err(Error::Coding(format!("expected dtag {}", dtag)));
        }
        self.advance()?;
        let range = match self.token {
            Token::Blob { len } => {
                let r = self.index..self.index + len;
                self.advance()?;
                r
            }
            _ => self.index..self.index,
        };
        self.check_close()?;
        let len = range.end - range.start;
        if len < minlen || maxlen.map_or(false, |m| len > m) {
            return Err(Error::Coding(format!("blob length {} out of range", len)));
        }
        Ok(range)
    }

    /// As [`Self::required_tagged_blob`] but `None` when the tag is absent.
    pub fn optional_tagged_blob(
        &mut self,
        dtag: u64,
        minlen: usize,
        maxlen: Option<usize>,
    ) -> Result<Option<std::ops::Range<usize>>> {
        if self.match_dtag(dtag) {
            Ok(Some(self.required_tagged_blob(dtag, minlen, maxlen)?))
        } else {
            Ok(None)
        }
    }

    /// Parses an optional tagged decimal nonNegativeInteger.
    pub fn optional_tagged_number(&mut self, dtag: u64) -> Result<Option<u64>> {
        if !self.match_dtag(dtag) {
            return Ok(None);
        }
        self.advance()?;
        let digits = self
            .udata_value()
            .ok_or_else(|| Error::Coding("number is not UDATA".into()))?;
        if digits.is_empty() {
            return Err(Error::Coding("empty number".into()));
        }
        let mut val: u64 = 0;
        for &c in digits {
            if !c.is_ascii_digit() {
                return Err(Error::Coding("malformed number".into()));
            }
            val = val
                .checked_mul(10)
                .and_then(|v| v.checked_add((c - b'0') as u64))
                .ok_or_else(|| Error::Coding("number overflow".into()))?;
        }
        self.advance()?;
        self.check_close()?;
        Ok(Some(val))
    }

    /// Parses an optional tagged big-endian binary number.
    pub fn optional_tagged_binary_number(
        &mut self,
        dtag: u64,
        minlen: usize,
        maxlen: usize,
    ) -> Result<Option<u64>> {
        if !self.match_dtag(dtag) {
            return Ok(None);
        }
        let range = self.required_tagged_blob(dtag, minlen, Some(maxlen))?;
        let mut val: u64 = 0;
        for &b in &self.buf[range] {
            val = (val << 8) | b as u64;
        }
        Ok(Some(val))
    }

    /// Skips an optional tagged UDATA element.
    pub fn optional_tagged_udata(&mut self, dtag: u64) -> Result<()> {
        if self.match_dtag(dtag) {
            self.advance()?;
            if self.udata_value().is_none() {
                return Err(Error::Coding("expected UDATA".into()));
            }
            self.advance()?;
            self.check_close()?;
        }
        Ok(())
    }
}

/// Extracts the BLOB value of a Component element at `range` in `buf`.
///
/// Components always carry a single BLOB (possibly empty).
pub fn component_value(buf: &[u8], range: std::ops::Range<usize>) -> Result<&[u8]> {
    let mut d = ElementDecoder::new(&buf[range])?;
    if !d.match_dtag(dtag::COMPONENT) {
        return Err(Error::Coding("not a Component".into()));
    }
    d.advance()?;
    Ok(d.blob_value().unwrap_or(&[]))
}
