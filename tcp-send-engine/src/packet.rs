//! Wire-format definitions for TCP segments.
//!
//! Every segment handed to the transmission primitive is a
//! [`SegmentDescriptor`].  This module is responsible for:
//! - Defining the on-wire header layout (RFC 793 §3.1) and option encoding
//!   (RFC 793, RFC 2018, RFC 7323).
//! - Serialising a descriptor into bytes ready for the link layer.
//! - Deserialising raw bytes back into a descriptor, returning errors for
//!   malformed or truncated input.
//!
//! No I/O happens here.  The checksum field is carried through untouched:
//! computing it (with the IP pseudo-header) is the link layer's job.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Data |       |U|A|P|R|S|F|                                   |
//! | Offset| Rsrvd |R|C|S|S|Y|I|            Window                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options (padded to 32 bits)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             data                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

/// Bit-flag constants for the flags byte.
pub mod flags {
    /// No more data from sender.
    pub const FIN: u8 = 0b0000_0001;
    /// Synchronise sequence numbers.
    pub const SYN: u8 = 0b0000_0010;
    /// Reset the connection.
    pub const RST: u8 = 0b0000_0100;
    /// Push buffered data to the receiving application.
    pub const PSH: u8 = 0b0000_1000;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0001_0000;
    /// Urgent pointer field is valid.
    pub const URG: u8 = 0b0010_0000;
}

/// Option kind numbers.
pub mod kind {
    pub const END: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const SACK: u8 = 5;
    pub const TIMESTAMPS: u8 = 8;
}

/// Byte length of the fixed header.
pub const HEADER_LEN: usize = 20;

/// Option space available after the fixed header.
pub const MAX_OPTIONS_LEN: usize = 40;

// Byte offsets of each field within the serialised header.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_DATA_OFFSET: usize = 12;
const OFF_FLAGS: usize = 13;
const OFF_WINDOW: usize = 14;
const OFF_CHECKSUM: usize = 16;
const OFF_URGENT: usize = 18;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// A single TCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    /// Up to four `(left, right)` edges, right edge exclusive.
    Sack(Vec<(u32, u32)>),
    Timestamps { value: u32, echo: u32 },
    Unknown { kind: u8, data: Vec<u8> },
}

impl TcpOption {
    /// Bytes this option occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            TcpOption::EndOfList | TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::Sack(blocks) => 2 + 8 * blocks.len(),
            TcpOption::Timestamps { .. } => 10,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    /// Append the kind/length/value encoding to `out`.
    pub fn emit(&self, out: &mut Vec<u8>) {
        match self {
            TcpOption::EndOfList => out.push(kind::END),
            TcpOption::NoOperation => out.push(kind::NOP),
            TcpOption::MaxSegmentSize(mss) => {
                out.extend_from_slice(&[kind::MSS, 4]);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                out.extend_from_slice(&[kind::WINDOW_SCALE, 3, *shift]);
            }
            TcpOption::SackPermitted => out.extend_from_slice(&[kind::SACK_PERMITTED, 2]),
            TcpOption::Sack(blocks) => {
                out.extend_from_slice(&[kind::SACK, (2 + 8 * blocks.len()) as u8]);
                for (left, right) in blocks {
                    out.extend_from_slice(&left.to_be_bytes());
                    out.extend_from_slice(&right.to_be_bytes());
                }
            }
            TcpOption::Timestamps { value, echo } => {
                out.extend_from_slice(&[kind::TIMESTAMPS, 10]);
                out.extend_from_slice(&value.to_be_bytes());
                out.extend_from_slice(&echo.to_be_bytes());
            }
            TcpOption::Unknown { kind, data } => {
                out.extend_from_slice(&[*kind, (2 + data.len()) as u8]);
                out.extend_from_slice(data);
            }
        }
    }

    /// Parse one option from the front of `buf`.
    ///
    /// Returns the option and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<(TcpOption, usize), PacketError> {
        let first = *buf.first().ok_or(PacketError::MalformedOption)?;
        match first {
            kind::END => return Ok((TcpOption::EndOfList, 1)),
            kind::NOP => return Ok((TcpOption::NoOperation, 1)),
            _ => {}
        }
        let len = *buf.get(1).ok_or(PacketError::MalformedOption)? as usize;
        if len < 2 || len > buf.len() {
            return Err(PacketError::MalformedOption);
        }
        let data = &buf[2..len];
        let option = match (first, len) {
            (kind::MSS, 4) => TcpOption::MaxSegmentSize(u16::from_be_bytes([data[0], data[1]])),
            (kind::WINDOW_SCALE, 3) => TcpOption::WindowScale(data[0]),
            (kind::SACK_PERMITTED, 2) => TcpOption::SackPermitted,
            (kind::SACK, n) if n >= 10 && (n - 2) % 8 == 0 => TcpOption::Sack(
                data.chunks_exact(8)
                    .map(|c| (read_u32(&c[..4]), read_u32(&c[4..])))
                    .collect(),
            ),
            (kind::TIMESTAMPS, 10) => TcpOption::Timestamps {
                value: read_u32(&data[..4]),
                echo: read_u32(&data[4..]),
            },
            (kind::MSS, _)
            | (kind::WINDOW_SCALE, _)
            | (kind::SACK_PERMITTED, _)
            | (kind::SACK, _)
            | (kind::TIMESTAMPS, _) => return Err(PacketError::MalformedOption),
            (kind, _) => TcpOption::Unknown {
                kind,
                data: data.to_vec(),
            },
        };
        Ok((option, len))
    }
}

/// Encode an option list, padded with end-of-list bytes to a multiple of 4.
pub fn encode_options(options: &[TcpOption]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_OPTIONS_LEN);
    for option in options {
        option.emit(&mut out);
    }
    while out.len() % 4 != 0 {
        out.push(kind::END);
    }
    out
}

/// Decode an option block.  Padding and NOPs are dropped; parsing stops at
/// end-of-list.
pub fn decode_options(mut buf: &[u8]) -> Result<Vec<TcpOption>, PacketError> {
    let mut options = Vec::new();
    while !buf.is_empty() {
        let (option, used) = TcpOption::parse(buf)?;
        buf = &buf[used..];
        match option {
            TcpOption::EndOfList => break,
            TcpOption::NoOperation => {}
            other => options.push(other),
        }
    }
    Ok(options)
}

/// Padded option-block length for `options`.
pub fn options_len(options: &[TcpOption]) -> usize {
    let raw: usize = options.iter().map(TcpOption::encoded_len).sum();
    (raw + 3) & !3
}

// ---------------------------------------------------------------------------
// Header / SegmentDescriptor
// ---------------------------------------------------------------------------

/// TCP header fields in host byte order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    /// Sequence number of the first payload byte (or of SYN/FIN).
    pub seq: u32,
    /// Next sequence number expected from the peer.
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Advertised receive window, already scaled down.
    pub window: u16,
    /// Left as given; filled in by the link layer.
    pub checksum: u16,
    /// Offset from `seq` to the end of urgent data (valid with URG).
    pub urgent: u16,
    pub options: Vec<TcpOption>,
}

impl Header {
    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        HEADER_LEN + options_len(&self.options)
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// One segment ready for the transmission primitive: header + payload.
///
/// Produced by [`crate::builder::SegmentBuilder`], consumed immediately by
/// the link, never retained by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentDescriptor {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl SegmentDescriptor {
    /// Sequence space consumed: payload plus one each for SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32
            + u32::from(self.header.has(flags::SYN))
            + u32::from(self.header.has(flags::FIN))
    }

    /// One past the last sequence number this segment covers.
    pub fn seq_end(&self) -> u32 {
        self.header.seq.wrapping_add(self.seq_len())
    }

    /// Serialise into a newly allocated byte vector.
    ///
    /// Fails with [`PacketError::OptionsTooLong`] when the padded option
    /// block exceeds [`MAX_OPTIONS_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let options = encode_options(&self.header.options);
        if options.len() > MAX_OPTIONS_LEN {
            return Err(PacketError::OptionsTooLong);
        }
        let header_len = HEADER_LEN + options.len();
        let mut buf = vec![0u8; header_len + self.payload.len()];
        let h = &self.header;

        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&h.src_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&h.dst_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&h.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&h.ack.to_be_bytes());
        buf[OFF_DATA_OFFSET] = ((header_len / 4) as u8) << 4;
        buf[OFF_FLAGS] = h.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&h.window.to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&h.checksum.to_be_bytes());
        buf[OFF_URGENT..OFF_URGENT + 2].copy_from_slice(&h.urgent.to_be_bytes());
        buf[HEADER_LEN..header_len].copy_from_slice(&options);
        buf[header_len..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a segment from raw bytes.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the data offset is below 5 words or beyond the buffer, or
    /// - an option is malformed.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }
        let header_len = usize::from(buf[OFF_DATA_OFFSET] >> 4) * 4;
        if header_len < HEADER_LEN || header_len > buf.len() {
            return Err(PacketError::BadDataOffset);
        }

        let header = Header {
            src_port: read_u16(&buf[OFF_SRC_PORT..]),
            dst_port: read_u16(&buf[OFF_DST_PORT..]),
            seq: read_u32(&buf[OFF_SEQ..]),
            ack: read_u32(&buf[OFF_ACK..]),
            flags: buf[OFF_FLAGS] & 0x3f,
            window: read_u16(&buf[OFF_WINDOW..]),
            checksum: read_u16(&buf[OFF_CHECKSUM..]),
            urgent: read_u16(&buf[OFF_URGENT..]),
            options: decode_options(&buf[HEADER_LEN..header_len])?,
        };
        Ok(SegmentDescriptor {
            header,
            payload: buf[header_len..].to_vec(),
        })
    }
}

/// Errors that can arise when encoding or parsing a segment.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    BufferTooShort,
    /// Data offset field is inconsistent with the buffer.
    BadDataOffset,
    /// An option has an invalid kind/length combination.
    MalformedOption,
    /// The option block does not fit into 40 bytes.
    OptionsTooLong,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::BufferTooShort => write!(f, "buffer too short to contain a header"),
            PacketError::BadDataOffset => write!(f, "data offset does not match the buffer"),
            PacketError::MalformedOption => write!(f, "malformed TCP option"),
            PacketError::OptionsTooLong => write!(f, "options exceed 40 bytes"),
        }
    }
}

impl std::error::Error for PacketError {}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_segment(seq: u32, ack: u32, flags: u8, window: u16, payload: &[u8]) -> SegmentDescriptor {
        SegmentDescriptor {
            header: Header {
                src_port: 4000,
                dst_port: 80,
                seq,
                ack,
                flags,
                window,
                ..Header::default()
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut seg = make_segment(42, 7, flags::ACK | flags::PSH, 4096, b"hello");
        seg.header.options = vec![
            TcpOption::Timestamps {
                value: 1,
                echo: 2,
            },
            TcpOption::Sack(vec![(100, 200)]),
        ];
        let decoded = SegmentDescriptor::decode(&seg.encode().unwrap()).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn fixed_header_is_big_endian() {
        let bytes = make_segment(0x0102_0304, 0x0506_0708, flags::ACK, 0x1122, b"")
            .encode()
            .unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..2], &4000u16.to_be_bytes());
        assert_eq!(&bytes[2..4], &80u16.to_be_bytes());
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[OFF_ACK..OFF_ACK + 4], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(bytes[OFF_DATA_OFFSET], 0x50);
        assert_eq!(bytes[OFF_FLAGS], 0x10);
        assert_eq!(&bytes[OFF_WINDOW..OFF_WINDOW + 2], &[0x11, 0x22]);
    }

    #[test]
    fn timestamp_block_is_byte_exact() {
        let opts = encode_options(&[
            TcpOption::NoOperation,
            TcpOption::NoOperation,
            TcpOption::Timestamps {
                value: 0xdead_beef,
                echo: 0x0000_0001,
            },
        ]);
        assert_eq!(
            opts,
            [1, 1, 8, 10, 0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 1]
        );
    }

    #[test]
    fn sack_block_is_byte_exact() {
        let opts = encode_options(&[
            TcpOption::NoOperation,
            TcpOption::NoOperation,
            TcpOption::Sack(vec![(1, 2), (0x0a0b_0c0d, 0x1000_0000)]),
        ]);
        assert_eq!(opts.len(), 20);
        assert_eq!(&opts[..4], &[1, 1, 5, 18]);
        assert_eq!(&opts[4..12], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&opts[12..20], &[0x0a, 0x0b, 0x0c, 0x0d, 0x10, 0, 0, 0]);
    }

    #[test]
    fn syn_options_are_padded_with_end_of_list() {
        let opts = encode_options(&[
            TcpOption::MaxSegmentSize(1460),
            TcpOption::WindowScale(7),
        ]);
        assert_eq!(opts, [2, 4, 0x05, 0xb4, 3, 3, 7, 0]);
    }

    #[test]
    fn decode_short_buffer_returns_error() {
        assert_eq!(
            SegmentDescriptor::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::BufferTooShort)
        );
    }

    #[test]
    fn decode_bad_data_offset_returns_error() {
        let mut bytes = make_segment(0, 0, 0, 0, b"").encode().unwrap();
        bytes[OFF_DATA_OFFSET] = 0x60;
        assert_eq!(
            SegmentDescriptor::decode(&bytes),
            Err(PacketError::BadDataOffset)
        );
    }

    #[test]
    fn malformed_option_is_rejected() {
        assert_eq!(
            TcpOption::parse(&[kind::MSS, 3, 0]),
            Err(PacketError::MalformedOption)
        );
        assert_eq!(TcpOption::parse(&[kind::SACK, 7]), Err(PacketError::MalformedOption));
    }

    #[test]
    fn oversized_options_fail_to_encode() {
        let mut seg = make_segment(0, 0, flags::ACK, 0, b"");
        seg.header.options = vec![TcpOption::Sack(vec![(0, 1); 5])];
        assert_eq!(seg.encode(), Err(PacketError::OptionsTooLong));
    }

    #[test]
    fn seq_len_counts_syn_and_fin() {
        let seg = make_segment(10, 0, flags::FIN | flags::ACK, 0, b"abc");
        assert_eq!(seg.seq_len(), 4);
        assert_eq!(seg.seq_end(), 14);
    }
}
