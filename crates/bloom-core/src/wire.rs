//! HyperBloom wire format — the unauthenticated open frame.
//!
//! The open frame is the only plaintext a raw connection ever carries. It
//! names the feed (by discovery key, never by feed key) so the accepting side
//! can route the connection before any handshake runs. The same encoding is
//! reused as the first encrypted message of a secure stream.
//!
//! Layout: a fixed 40-byte `OpenHeader` followed by `extension_len` bytes of
//! extension data. The header is #[repr(C, packed)] with zerocopy derives,
//! so there is no unsafe code in this module.

use bytes::{Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::DiscoveryKey;

// ── Open Header ───────────────────────────────────────────────────────────────

/// Fixed-size prefix of every open frame.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct OpenHeader {
    /// Always `OPEN_MAGIC`. Lets the parser reject foreign traffic after
    /// four bytes instead of waiting for a full header.
    pub magic: [u8; 4],

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Length of the extension data that follows, little-endian.
    pub extension_len: [u8; 2],

    /// Rendezvous identifier of the feed this connection is for.
    pub discovery_key: [u8; 32],
}

assert_eq_size!(OpenHeader, [u8; 40]);

pub const OPEN_MAGIC: [u8; 4] = *b"HBLM";
pub const OPEN_VERSION: u8 = 0x01;
pub const OPEN_HEADER_SIZE: usize = std::mem::size_of::<OpenHeader>();

/// Maximum extension length. Anything larger is treated as a protocol error.
pub const MAX_EXTENSION_LEN: usize = 1024;

// ── Open Frame ────────────────────────────────────────────────────────────────

/// A decoded open frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFrame {
    pub discovery_key: DiscoveryKey,
    pub extension: Bytes,
}

impl OpenFrame {
    pub fn new(discovery_key: DiscoveryKey) -> Self {
        Self {
            discovery_key,
            extension: Bytes::new(),
        }
    }

    pub fn with_extension(discovery_key: DiscoveryKey, extension: Bytes) -> Self {
        Self {
            discovery_key,
            extension,
        }
    }

    /// Encode header and extension into one buffer.
    pub fn encode(&self) -> Result<Vec<u8>, PreambleError> {
        if self.extension.len() > MAX_EXTENSION_LEN {
            return Err(PreambleError::ExtensionTooLarge(self.extension.len()));
        }
        let header = OpenHeader {
            magic: OPEN_MAGIC,
            version: OPEN_VERSION,
            flags: 0,
            extension_len: (self.extension.len() as u16).to_le_bytes(),
            discovery_key: self.discovery_key,
        };
        let mut out = Vec::with_capacity(OPEN_HEADER_SIZE + self.extension.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.extension);
        Ok(out)
    }

    /// Decode a complete frame. Trailing bytes are an error here; use
    /// `PreambleParser` when reading from a stream.
    pub fn decode(data: &[u8]) -> Result<Self, PreambleError> {
        let mut parser = PreambleParser::new();
        match parser.push(data)? {
            Progress::Done(preamble) if preamble.extra.is_empty() => Ok(preamble.open),
            Progress::Done(preamble) => Err(PreambleError::TrailingBytes(preamble.extra.len())),
            Progress::NeedMore => Err(PreambleError::Truncated(data.len())),
        }
    }
}

// ── Preamble Parser ───────────────────────────────────────────────────────────

/// The open frame plus whatever was read past it.
///
/// `extra` belongs to the protocol that follows and must be replayed ahead
/// of the transport (see `transport::Rewind`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub open: OpenFrame,
    pub extra: Bytes,
}

#[derive(Debug)]
pub enum Progress {
    NeedMore,
    Done(Preamble),
}

/// Incremental parser that accepts exactly one open frame.
#[derive(Debug, Default)]
pub struct PreambleParser {
    buf: BytesMut,
}

impl PreambleParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed more bytes. Returns `Done` once a whole frame is buffered.
    pub fn push(&mut self, data: &[u8]) -> Result<Progress, PreambleError> {
        self.buf.extend_from_slice(data);

        let magic_len = OPEN_MAGIC.len().min(self.buf.len());
        if self.buf[..magic_len] != OPEN_MAGIC[..magic_len] {
            return Err(PreambleError::BadMagic);
        }

        let header = match OpenHeader::read_from_prefix(&self.buf[..]) {
            Some(h) => h,
            None => return Ok(Progress::NeedMore),
        };
        if header.version != OPEN_VERSION {
            return Err(PreambleError::UnknownVersion(header.version));
        }
        if header.flags != 0 {
            return Err(PreambleError::ReservedFlagsSet(header.flags));
        }
        let ext_len = u16::from_le_bytes(header.extension_len) as usize;
        if ext_len > MAX_EXTENSION_LEN {
            return Err(PreambleError::ExtensionTooLarge(ext_len));
        }

        let frame_len = OPEN_HEADER_SIZE + ext_len;
        if self.buf.len() < frame_len {
            return Ok(Progress::NeedMore);
        }

        let mut frame = self.buf.split_to(frame_len).freeze();
        let extension = frame.split_off(OPEN_HEADER_SIZE);
        let extra = self.buf.split().freeze();

        Ok(Progress::Done(Preamble {
            open: OpenFrame {
                discovery_key: header.discovery_key,
                extension,
            },
            extra,
        }))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreambleError {
    #[error("not an open frame (bad magic)")]
    BadMagic,

    #[error("unknown open frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("extension length {0} exceeds maximum {MAX_EXTENSION_LEN}")]
    ExtensionTooLarge(usize),

    #[error("open frame truncated after {0} bytes")]
    Truncated(usize),

    #[error("{0} unexpected bytes after open frame")]
    TrailingBytes(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(ext: &[u8]) -> Vec<u8> {
        OpenFrame::with_extension([0xab; 32], Bytes::copy_from_slice(ext))
            .encode()
            .unwrap()
    }

    #[test]
    fn header_layout_is_stable() {
        let bytes = frame_bytes(b"xy");
        assert_eq!(bytes.len(), 42);
        assert_eq!(&bytes[..4], b"HBLM");
        assert_eq!(bytes[4], OPEN_VERSION);
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[6..8], &[2, 0]);
        assert_eq!(&bytes[8..40], &[0xab; 32]);
        assert_eq!(&bytes[40..], b"xy");
    }

    #[test]
    fn parser_waits_for_whole_frame() {
        let bytes = frame_bytes(b"ext");
        let mut parser = PreambleParser::new();

        for chunk in bytes[..bytes.len() - 1].chunks(5) {
            assert!(matches!(parser.push(chunk).unwrap(), Progress::NeedMore));
        }
        match parser.push(&bytes[bytes.len() - 1..]).unwrap() {
            Progress::Done(p) => {
                assert_eq!(p.open.discovery_key, [0xab; 32]);
                assert_eq!(&p.open.extension[..], b"ext");
                assert!(p.extra.is_empty());
            }
            Progress::NeedMore => panic!("frame should be complete"),
        }
    }

    #[test]
    fn parser_captures_bytes_past_the_frame() {
        let mut bytes = frame_bytes(b"");
        bytes.extend_from_slice(b"noise msg1");

        let mut parser = PreambleParser::new();
        match parser.push(&bytes).unwrap() {
            Progress::Done(p) => assert_eq!(&p.extra[..], b"noise msg1"),
            Progress::NeedMore => panic!("frame should be complete"),
        }
    }

    #[test]
    fn garbage_fails_fast_on_magic() {
        let mut parser = PreambleParser::new();
        assert_eq!(parser.push(b"GET ").unwrap_err(), PreambleError::BadMagic);

        let mut parser = PreambleParser::new();
        assert_eq!(parser.push(b"X").unwrap_err(), PreambleError::BadMagic);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = frame_bytes(b"");
        bytes[4] = 0x09;
        let mut parser = PreambleParser::new();
        assert_eq!(
            parser.push(&bytes).unwrap_err(),
            PreambleError::UnknownVersion(0x09)
        );
    }

    #[test]
    fn reserved_flags_rejected() {
        let mut bytes = frame_bytes(b"");
        bytes[5] = 0x01;
        let mut parser = PreambleParser::new();
        assert_eq!(
            parser.push(&bytes).unwrap_err(),
            PreambleError::ReservedFlagsSet(0x01)
        );
    }

    #[test]
    fn oversize_extension_rejected_before_body_arrives() {
        let mut bytes = frame_bytes(b"");
        bytes[6..8].copy_from_slice(&((MAX_EXTENSION_LEN as u16) + 1).to_le_bytes());
        let mut parser = PreambleParser::new();
        assert_eq!(
            parser.push(&bytes).unwrap_err(),
            PreambleError::ExtensionTooLarge(MAX_EXTENSION_LEN + 1)
        );
    }

    #[test]
    fn encode_refuses_oversize_extension() {
        let frame = OpenFrame::with_extension([0u8; 32], Bytes::from(vec![0u8; MAX_EXTENSION_LEN + 1]));
        assert!(frame.encode().is_err());
    }

    #[test]
    fn decode_rejects_trailing_and_truncated_input() {
        let mut bytes = frame_bytes(b"");
        assert_eq!(
            OpenFrame::decode(&bytes[..20]).unwrap_err(),
            PreambleError::Truncated(20)
        );
        bytes.push(0);
        assert_eq!(
            OpenFrame::decode(&bytes).unwrap_err(),
            PreambleError::TrailingBytes(1)
        );
    }
}
