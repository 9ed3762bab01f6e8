// Byte stream -> complete LDAP envelopes

use crate::ber::{peek_element, BerError, TAG_SEQUENCE};
use crate::error::LdapError;
use crate::ldap_protocol::{parse_ldap_message, parse_ldap_message_header, LdapMessage};
use bytes::BytesMut;
use tracing::{debug, warn};

/// Envelopes larger than this are treated as a broken stream.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Result of trying to parse one envelope from the front of the buffer.
enum TryParseResult {
    /// Not enough data yet.
    Incomplete,
    Message(LdapMessage),
    /// The envelope was fully framed but its content did not decode. Its
    /// bytes are consumed; the stream stays usable.
    ParseError(LdapError),
}

/// Accumulates stream chunks and yields every complete envelope they finish.
///
/// A decode failure inside a well-framed envelope only affects that envelope.
/// A bad outer tag or length is fatal: there is no way to find the next
/// envelope boundary.
#[derive(Debug)]
pub struct Framer {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_message_size,
        }
    }

    /// Bytes held back waiting for the rest of an envelope.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `chunk` and drain every complete envelope now buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Result<LdapMessage, LdapError>>, LdapError> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            match self.try_parse_message()? {
                TryParseResult::Incomplete => break,
                TryParseResult::Message(message) => out.push(Ok(message)),
                TryParseResult::ParseError(err) => out.push(Err(err)),
            }
        }
        Ok(out)
    }

    fn try_parse_message(&mut self) -> Result<TryParseResult, LdapError> {
        if self.buffer.is_empty() {
            return Ok(TryParseResult::Incomplete);
        }
        let first_byte = self.buffer[0];
        if first_byte != TAG_SEQUENCE {
            return Err(self.fatal(BerError::UnexpectedTag {
                expected: TAG_SEQUENCE,
                found: first_byte,
                offset: 0,
            }));
        }

        let (header_len, content_len) = match peek_element(&self.buffer) {
            Ok(Some(h)) => h,
            Ok(None) => return Ok(TryParseResult::Incomplete),
            Err(e) => return Err(self.fatal(e)),
        };
        let total_length = header_len + content_len;
        if total_length > self.max_message_size {
            return Err(self.fatal(BerError::LengthOverflow(total_length)));
        }
        if self.buffer.len() < total_length {
            // Not enough data yet
            return Ok(TryParseResult::Incomplete);
        }

        let frame = self.buffer.split_to(total_length);
        match parse_ldap_message(&frame) {
            Ok(message) => {
                debug!(
                    "Framed message {} ({} bytes, {} left buffered)",
                    message.message_id,
                    total_length,
                    self.buffer.len()
                );
                Ok(TryParseResult::Message(message))
            }
            Err(e) => {
                let hex_preview: String = frame
                    .iter()
                    .take(64)
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(" ");
                warn!(
                    "Failed to parse LDAP message: {} (first 64 bytes: {})",
                    e, hex_preview
                );
                let (message_id, tag) = match parse_ldap_message_header(&frame) {
                    Ok((id, tag)) => (Some(id), Some(tag)),
                    Err(_) => (None, None),
                };
                Ok(TryParseResult::ParseError(LdapError::Decode {
                    message_id,
                    tag,
                    source: e,
                }))
            }
        }
    }

    /// The buffer cannot be resynchronised; drop it.
    fn fatal(&mut self, source: BerError) -> LdapError {
        self.buffer.clear();
        LdapError::Decode {
            message_id: None,
            tag: None,
            source,
        }
    }
}
