// BER (tag-length-value) encoding/decoding for LDAP v3
// Reader returns Ok(None) when the buffer ends early; malformed input is an Err.

use thiserror::Error;

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Largest length a writer will emit (3 length bytes after the 0x83 prefix).
pub const MAX_WRITE_LENGTH: usize = 0xFF_FFFF;

/// Bytes reserved for a sequence length before the content size is known.
const SEQUENCE_PLACEHOLDER: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BerError {
    #[error("expected tag 0x{expected:02X}, got 0x{found:02X} at offset {offset}")]
    UnexpectedTag { expected: u8, found: u8, offset: usize },

    #[error("indefinite length not supported (offset {offset})")]
    IndefiniteLength { offset: usize },

    #[error("length field too long: {bytes} bytes (offset {offset})")]
    LengthFieldTooLong { bytes: usize, offset: usize },

    #[error("length {length} exceeds remaining {remaining} bytes (offset {offset})")]
    LengthExceedsBuffer { length: usize, remaining: usize, offset: usize },

    #[error("integer too long: {0} bytes")]
    IntegerTooLong(usize),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("length {0} exceeds 0xFFFFFF")]
    LengthOverflow(usize),

    #[error("unbalanced sequence: {0}")]
    UnbalancedSequence(&'static str),

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("invalid OID: {0}")]
    InvalidOid(String),

    #[error("{0}")]
    Invalid(String),
}

pub type BerResult<T> = std::result::Result<T, BerError>;

/// Turns a "need more bytes" `None` into a hard error for callers that hold a
/// complete envelope, where a short read can only mean malformed input.
pub trait Required<T> {
    fn required(self, what: &'static str) -> BerResult<T>;
}

impl<T> Required<T> for BerResult<Option<T>> {
    fn required(self, what: &'static str) -> BerResult<T> {
        self?.ok_or(BerError::Truncated(what))
    }
}

/// Read cursor over a byte region.
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    buf: &'a [u8],
    offset: usize,
    /// Length decoded by the most recent `read_length`.
    length: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            length: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    /// Next tag byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.offset).copied()
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.offset += 1;
        Some(b)
    }

    /// Advance past `n` bytes; false (and no movement) if fewer remain.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() < n {
            return false;
        }
        self.offset += n;
        true
    }

    /// Decode a short- or long-form length at the current offset.
    ///
    /// `Ok(None)` means the length bytes themselves are not all buffered yet.
    /// The cursor does not move in that case.
    pub fn read_length(&mut self) -> BerResult<Option<usize>> {
        let start = self.offset;
        let Some(first) = self.peek() else {
            return Ok(None);
        };
        if first & 0x80 == 0 {
            self.offset += 1;
            self.length = first as usize;
            return Ok(Some(self.length));
        }
        let n = (first & 0x7F) as usize;
        if n == 0 {
            return Err(BerError::IndefiniteLength { offset: start });
        }
        if n > 4 {
            return Err(BerError::LengthFieldTooLong { bytes: n, offset: start });
        }
        if self.remaining() < 1 + n {
            return Ok(None);
        }
        let mut length = 0usize;
        for &b in &self.buf[start + 1..start + 1 + n] {
            length = (length << 8) | b as usize;
        }
        self.offset = start + 1 + n;
        self.length = length;
        Ok(Some(length))
    }

    /// Read a constructed tag plus its length. Returns the tag actually read.
    /// With `expected = None` any tag is accepted.
    pub fn read_sequence(&mut self, expected: Option<u8>) -> BerResult<Option<u8>> {
        let start = self.offset;
        let Some(tag) = self.peek() else {
            return Ok(None);
        };
        if let Some(want) = expected {
            if tag != want {
                return Err(BerError::UnexpectedTag {
                    expected: want,
                    found: tag,
                    offset: start,
                });
            }
        }
        self.offset += 1;
        match self.read_length()? {
            Some(len) => {
                if len > self.remaining() {
                    // Container content not fully buffered yet.
                    self.offset = start;
                    return Ok(None);
                }
                Ok(Some(tag))
            }
            None => {
                self.offset = start;
                Ok(None)
            }
        }
    }

    /// Like `read_sequence`, for a buffer that is known to be complete.
    /// Returns the tag read and the offset one past the container's content.
    pub fn read_container(&mut self, expected: Option<u8>) -> BerResult<(u8, usize)> {
        let start = self.offset;
        let Some(tag) = self.peek() else {
            return Err(BerError::Truncated("container tag"));
        };
        if let Some(want) = expected {
            if tag != want {
                return Err(BerError::UnexpectedTag {
                    expected: want,
                    found: tag,
                    offset: start,
                });
            }
        }
        self.offset += 1;
        let Some(len) = self.read_length()? else {
            self.offset = start;
            return Err(BerError::Truncated("container length"));
        };
        if len > self.remaining() {
            let remaining = self.remaining();
            self.offset = start;
            return Err(BerError::LengthExceedsBuffer {
                length: len,
                remaining,
                offset: start,
            });
        }
        Ok((tag, self.offset + len))
    }

    /// Tag, length and the value bytes; tag must match. Cursor is restored on `None`.
    fn read_tagged(&mut self, tag: u8) -> BerResult<Option<&'a [u8]>> {
        let start = self.offset;
        let Some(found) = self.peek() else {
            return Ok(None);
        };
        if found != tag {
            return Err(BerError::UnexpectedTag {
                expected: tag,
                found,
                offset: start,
            });
        }
        self.offset += 1;
        let Some(len) = self.read_length()? else {
            self.offset = start;
            return Ok(None);
        };
        if self.remaining() < len {
            self.offset = start;
            return Ok(None);
        }
        let value = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(Some(value))
    }

    /// Read value bytes of the element just after an already-consumed tag.
    pub fn read_value_after_tag(&mut self) -> BerResult<Option<&'a [u8]>> {
        let start = self.offset;
        let Some(len) = self.read_length()? else {
            return Ok(None);
        };
        if self.remaining() < len {
            self.offset = start;
            return Ok(None);
        }
        let value = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(Some(value))
    }

    fn decode_int(bytes: &[u8]) -> BerResult<i32> {
        if bytes.len() > 4 {
            return Err(BerError::IntegerTooLong(bytes.len()));
        }
        if bytes.is_empty() {
            return Ok(0);
        }
        let mut value = 0u32;
        for &b in bytes {
            value = (value << 8) | b as u32;
        }
        // Sign extension for short negative encodings
        if bytes[0] & 0x80 != 0 && bytes.len() < 4 {
            value |= !0u32 << (bytes.len() * 8);
        }
        Ok(value as i32)
    }

    pub fn read_int(&mut self, tag: u8) -> BerResult<Option<i32>> {
        let start = self.offset;
        match self.read_tagged(tag)? {
            Some(bytes) => match Self::decode_int(bytes) {
                Ok(v) => Ok(Some(v)),
                Err(e) => {
                    self.offset = start;
                    Err(e)
                }
            },
            None => Ok(None),
        }
    }

    pub fn read_integer(&mut self) -> BerResult<Option<i32>> {
        self.read_int(TAG_INTEGER)
    }

    pub fn read_enumeration(&mut self) -> BerResult<Option<i32>> {
        self.read_int(TAG_ENUMERATED)
    }

    pub fn read_boolean_tagged(&mut self, tag: u8) -> BerResult<Option<bool>> {
        match self.read_tagged(tag)? {
            Some(bytes) => Ok(Some(bytes.first().is_some_and(|&b| b != 0))),
            None => Ok(None),
        }
    }

    pub fn read_boolean(&mut self) -> BerResult<Option<bool>> {
        self.read_boolean_tagged(TAG_BOOLEAN)
    }

    /// Raw value bytes of an element with the given tag.
    pub fn read_bytes(&mut self, tag: u8) -> BerResult<Option<Vec<u8>>> {
        Ok(self.read_tagged(tag)?.map(|b| b.to_vec()))
    }

    /// UTF-8 value of an element with the given tag.
    pub fn read_string(&mut self, tag: u8) -> BerResult<Option<String>> {
        match self.read_tagged(tag)? {
            Some(bytes) => std::str::from_utf8(bytes)
                .map(|s| Some(s.to_string()))
                .map_err(|_| BerError::InvalidUtf8),
            None => Ok(None),
        }
    }

    /// Dotted-decimal OID from base-128 encoded arcs.
    pub fn read_oid(&mut self, tag: u8) -> BerResult<Option<String>> {
        let Some(bytes) = self.read_tagged(tag)? else {
            return Ok(None);
        };
        let mut values: Vec<u32> = Vec::new();
        let mut current: u32 = 0;
        let mut pending = false;
        for &b in bytes {
            if current > (u32::MAX >> 7) {
                return Err(BerError::InvalidOid("arc overflows 32 bits".to_string()));
            }
            current = (current << 7) | (b & 0x7F) as u32;
            pending = true;
            if b & 0x80 == 0 {
                values.push(current);
                current = 0;
                pending = false;
            }
        }
        if pending {
            return Err(BerError::InvalidOid("unterminated arc".to_string()));
        }
        let Some(&first) = values.first() else {
            return Err(BerError::InvalidOid("empty".to_string()));
        };
        let mut arcs = vec![(first / 40).to_string(), (first % 40).to_string()];
        arcs.extend(values[1..].iter().map(|v| v.to_string()));
        Ok(Some(arcs.join(".")))
    }
}

/// Growable BER writer.
///
/// Sequences reserve a 3-byte length and are back-patched on `end_sequence`.
/// Errors are sticky: the first one is returned by `into_bytes`.
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
    /// Offsets of reserved length placeholders of open sequences.
    seq: Vec<usize>,
    error: Option<BerError>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            seq: Vec::new(),
            error: None,
        }
    }

    /// Record an error; the first one wins and is returned by `into_bytes`.
    pub fn fail(&mut self, err: BerError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn ensure(&mut self, additional: usize) {
        let needed = self.buffer.len() + additional;
        if needed > self.buffer.capacity() {
            let grown = (self.buffer.capacity() * 2).max(needed);
            self.buffer.reserve_exact(grown - self.buffer.len());
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_byte(&mut self, b: u8) {
        self.ensure(1);
        self.buffer.push(b);
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_length(&mut self, len: usize) {
        self.ensure(4);
        if len <= 0x7F {
            self.buffer.push(len as u8);
        } else if len <= 0xFF {
            self.buffer.extend_from_slice(&[0x81, len as u8]);
        } else if len <= 0xFFFF {
            self.buffer
                .extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
        } else if len <= MAX_WRITE_LENGTH {
            self.buffer.extend_from_slice(&[
                0x83,
                (len >> 16) as u8,
                (len >> 8) as u8,
                len as u8,
            ]);
        } else {
            self.fail(BerError::LengthOverflow(len));
        }
    }

    /// Minimal two's-complement integer with an explicit tag.
    pub fn write_int(&mut self, value: i32, tag: u8) {
        let mut i = value as u32;
        let mut size = 4;
        while (i & 0xFF80_0000 == 0 || i & 0xFF80_0000 == 0xFF80_0000) && size > 1 {
            size -= 1;
            i <<= 8;
        }
        self.ensure(2 + size);
        self.buffer.push(tag);
        self.buffer.push(size as u8);
        for _ in 0..size {
            self.buffer.push((i >> 24) as u8);
            i <<= 8;
        }
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_int(value, TAG_INTEGER);
    }

    pub fn write_enumeration(&mut self, value: i32) {
        self.write_int(value, TAG_ENUMERATED);
    }

    pub fn write_boolean_tagged(&mut self, value: bool, tag: u8) {
        self.ensure(3);
        self.buffer.extend_from_slice(&[tag, 0x01, if value { 0xFF } else { 0x00 }]);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_boolean_tagged(value, TAG_BOOLEAN);
    }

    pub fn write_null(&mut self) {
        self.write_raw(&[TAG_NULL, 0x00]);
    }

    pub fn write_buffer(&mut self, data: &[u8], tag: u8) {
        self.write_byte(tag);
        self.write_length(data.len());
        self.write_raw(data);
    }

    pub fn write_string(&mut self, s: &str, tag: u8) {
        self.write_buffer(s.as_bytes(), tag);
    }

    pub fn write_octet_string(&mut self, s: &str) {
        self.write_string(s, TAG_OCTET_STRING);
    }

    pub fn write_oid(&mut self, oid: &str, tag: u8) {
        match encode_oid(oid) {
            Ok(bytes) => self.write_buffer(&bytes, tag),
            Err(e) => self.fail(e),
        }
    }

    /// Open a constructed element; content length is patched in `end_sequence`.
    pub fn start_sequence(&mut self, tag: u8) {
        self.write_byte(tag);
        self.seq.push(self.buffer.len());
        self.ensure(SEQUENCE_PLACEHOLDER);
        self.buffer.extend_from_slice(&[0u8; SEQUENCE_PLACEHOLDER]);
    }

    pub fn end_sequence(&mut self) {
        let Some(start) = self.seq.pop() else {
            self.fail(BerError::UnbalancedSequence("end_sequence without start_sequence"));
            return;
        };
        let content_start = start + SEQUENCE_PLACEHOLDER;
        let len = self.buffer.len() - content_start;
        let header: Vec<u8> = if len <= 0x7F {
            vec![len as u8]
        } else if len <= 0xFF {
            vec![0x81, len as u8]
        } else if len <= 0xFFFF {
            vec![0x82, (len >> 8) as u8, len as u8]
        } else if len <= MAX_WRITE_LENGTH {
            vec![0x83, (len >> 16) as u8, (len >> 8) as u8, len as u8]
        } else {
            self.fail(BerError::LengthOverflow(len));
            return;
        };
        self.shift(content_start, len, header.len());
        self.buffer[start..start + header.len()].copy_from_slice(&header);
    }

    /// Move `len` content bytes at `content_start` so they begin right after a
    /// length field of `header_len` bytes placed at the reserved offset.
    fn shift(&mut self, content_start: usize, len: usize, header_len: usize) {
        let start = content_start - SEQUENCE_PLACEHOLDER;
        let new_start = start + header_len;
        if new_start == content_start {
            return;
        }
        if new_start > content_start {
            let grow = new_start - content_start;
            self.ensure(grow);
            self.buffer.resize(self.buffer.len() + grow, 0);
            self.buffer
                .copy_within(content_start..content_start + len, new_start);
        } else {
            self.buffer
                .copy_within(content_start..content_start + len, new_start);
            let shrink = content_start - new_start;
            self.buffer.truncate(self.buffer.len() - shrink);
        }
    }

    /// Final encoded bytes. Fails on any recorded error or open sequence.
    pub fn into_bytes(self) -> BerResult<Vec<u8>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if !self.seq.is_empty() {
            return Err(BerError::UnbalancedSequence("sequence not closed"));
        }
        Ok(self.buffer)
    }
}

fn encode_oid(oid: &str) -> BerResult<Vec<u8>> {
    let arcs: Vec<u32> = oid
        .split('.')
        .map(|p| p.parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| BerError::InvalidOid(oid.to_string()))?;
    if arcs.len() < 2 || arcs[0] > 2 {
        return Err(BerError::InvalidOid(oid.to_string()));
    }
    let first = arcs[0]
        .checked_mul(40)
        .and_then(|v| v.checked_add(arcs[1]))
        .ok_or_else(|| BerError::InvalidOid(oid.to_string()))?;
    let mut out = Vec::with_capacity(arcs.len() * 2);
    for value in std::iter::once(first).chain(arcs[2..].iter().copied()) {
        let mut chunk = [0u8; 5];
        let mut n = 0;
        let mut v = value;
        loop {
            chunk[n] = (v & 0x7F) as u8;
            n += 1;
            v >>= 7;
            if v == 0 {
                break;
            }
        }
        for i in (0..n).rev() {
            out.push(if i == 0 { chunk[i] } else { chunk[i] | 0x80 });
        }
    }
    Ok(out)
}

/// Header of the first TLV in `buf`: (header length, content length).
/// `Ok(None)` until enough bytes are buffered to know the full element size.
pub fn peek_element(buf: &[u8]) -> BerResult<Option<(usize, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut reader = BerReader::new(&buf[1..]);
    match reader.read_length()? {
        Some(len) => Ok(Some((1 + reader.offset(), len))),
        None => Ok(None),
    }
}
