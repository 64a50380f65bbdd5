//! Git packet-line framing.
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)
//!
//! The gateway only needs to emit the smart-HTTP service announcement and to
//! reject request bodies that are not well-formed packet streams before
//! handing them to `git upload-pack`.

use std::fmt;

/// Largest packet git will produce or accept (`LARGE_PACKET_MAX`).
pub const MAX_PKT_LEN: usize = 65520;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Vec<u8>),
    /// Flush packet (`0000`).
    Flush,
    /// Delimiter packet (`0001`), protocol v2 only.
    Delimiter,
    /// Response-end packet (`0002`), protocol v2 only.
    ResponseEnd,
}

/// Why a byte stream is not a valid packet-line sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLineError {
    Empty,
    BadLength { offset: usize },
    Truncated { offset: usize, expected: usize },
    TooLong { offset: usize, len: usize },
}

impl fmt::Display for PktLineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty packet stream"),
            Self::BadLength { offset } => write!(f, "invalid packet length at byte {offset}"),
            Self::Truncated { offset, expected } => {
                write!(f, "packet at byte {offset} truncated (expected {expected} bytes)")
            }
            Self::TooLong { offset, len } => {
                write!(f, "packet at byte {offset} exceeds maximum length ({len} bytes)")
            }
        }
    }
}

impl std::error::Error for PktLineError {}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a byte slice as a packet line (4-hex-digit length prefix + data).
///
/// The length includes the 4 prefix bytes themselves.  Callers are responsible
/// for including any trailing newline in `data` if the protocol requires it.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    assert!(
        total_len <= MAX_PKT_LEN,
        "packet-line data too large ({total_len} bytes)"
    );
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Encode a [`PktLine`] into its wire representation.
pub fn encode_pkt(pkt: &PktLine) -> Vec<u8> {
    match pkt {
        PktLine::Data(data) => encode_pkt_line(data),
        PktLine::Flush => b"0000".to_vec(),
        PktLine::Delimiter => b"0001".to_vec(),
        PktLine::ResponseEnd => b"0002".to_vec(),
    }
}

/// The `# service=<name>` announcement plus flush that precedes a smart-HTTP
/// v0/v1 ref advertisement.
pub fn service_announcement(service: &str) -> Vec<u8> {
    let mut buf = encode_pkt_line(format!("# service={service}\n").as_bytes());
    buf.extend_from_slice(&encode_pkt(&PktLine::Flush));
    buf
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Strictly decode a complete packet-line stream.
pub fn decode_pkt_lines(data: &[u8]) -> Result<Vec<PktLine>, PktLineError> {
    if data.is_empty() {
        return Err(PktLineError::Empty);
    }

    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let header = data
            .get(pos..pos + 4)
            .ok_or(PktLineError::BadLength { offset: pos })?;
        if !header.iter().all(u8::is_ascii_hexdigit) {
            return Err(PktLineError::BadLength { offset: pos });
        }
        let len = std::str::from_utf8(header)
            .ok()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .ok_or(PktLineError::BadLength { offset: pos })?;

        match len {
            0 => packets.push(PktLine::Flush),
            1 => packets.push(PktLine::Delimiter),
            2 => packets.push(PktLine::ResponseEnd),
            3 => return Err(PktLineError::BadLength { offset: pos }),
            n if n > MAX_PKT_LEN => return Err(PktLineError::TooLong { offset: pos, len: n }),
            n => {
                let payload = data.get(pos + 4..pos + n).ok_or(PktLineError::Truncated {
                    offset: pos,
                    expected: n,
                })?;
                packets.push(PktLine::Data(payload.to_vec()));
                pos += n;
                continue;
            }
        }
        pos += 4;
    }

    Ok(packets)
}

/// Check that `data` is a complete packet-line stream containing at least
/// one control packet.
pub fn validate_request(data: &[u8]) -> Result<(), PktLineError> {
    let packets = decode_pkt_lines(data)?;
    if packets.iter().all(|p| matches!(p, PktLine::Data(_))) {
        // Every upload-pack request is terminated by a flush or delimiter.
        return Err(PktLineError::Truncated {
            offset: data.len(),
            expected: 4,
        });
    }
    Ok(())
}
