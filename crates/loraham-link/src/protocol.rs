//! Line framing for the TNC command channel.
//!
//! The node writes `\r\n`-terminated lines, each starting with a tag:
//!
//! ```text
//! debug: <text>
//! cli: <text>
//! net: <text>
//! callsign: <text>
//! pkt: <RSSI> <LEN> <LEN raw packet bytes>
//! pkrx: <RSSI> <LEN> <LEN raw packet bytes>
//! !tnc
//! ```
//!
//! The raw packet in a `pkt:` line may itself contain `\r\n`, so a packet
//! line is only complete once `LEN` payload bytes have been seen.
//!
//! The harness writes `\r`-terminated commands: plain text such as `!tnc`
//! or `!reset`, or `!pktx <hex>` to inject a raw packet.

use bytes::{BufMut, BytesMut};

/// Terminator of every line the node writes.
pub const EOL: &[u8] = b"\r\n";

/// Terminator of every command the harness writes.
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Prefix of the raw packet injection command.
pub const PKTX_PREFIX: &[u8] = b"!pktx ";

/// Widest accepted packet length field, in digits.
pub const MAX_LEN_DIGITS: usize = 2;

/// Kind of line received from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Debug,
    Cli,
    Net,
    Callsign,
    /// `pkt:` line carrying a length-delimited packet.
    Packet,
    /// `pkrx:` line, framed the same way as `pkt:`.
    PacketRx,
    /// Echo of the `!tnc` command.
    TncEcho,
}

/// Tag prefixes, matched in order.
pub const LINE_TAGS: &[(&[u8], LineTag)] = &[
    (b"debug: ", LineTag::Debug),
    (b"cli: ", LineTag::Cli),
    (b"net: ", LineTag::Net),
    (b"callsign: ", LineTag::Callsign),
    (b"pkt: ", LineTag::Packet),
    (b"pkrx: ", LineTag::PacketRx),
    (b"!tnc", LineTag::TncEcho),
];

/// Malformed `pkt:` line header.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FramingError {
    #[error("invalid packet header, no RSSI delimiter")]
    NoRssiDelimiter,

    #[error("invalid RSSI value")]
    InvalidRssi,

    #[error("invalid packet header, no size delimiter")]
    NoLengthDelimiter,

    #[error("invalid packet header, size field wider than {MAX_LEN_DIGITS} digits")]
    LengthFieldTooWide,

    #[error("invalid packet size field")]
    InvalidLength,

    #[error("packet bigger than expected ({present} bytes, declared {declared})")]
    Oversized { declared: usize, present: usize },
}

/// Header of a `pkt:` line, borrowing the payload bytes present on the line.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketLine<'a> {
    /// Received signal strength reported by the node.
    pub rssi: f32,
    /// Declared payload length.
    pub len: usize,
    /// Payload bytes present on this line (may be fewer than `len`).
    pub payload: &'a [u8],
}

impl PacketLine<'_> {
    /// Bytes still missing after this line's payload.
    pub fn missing(&self) -> usize {
        self.len - self.payload.len()
    }
}

/// Position of the first line terminator in `buf`.
pub fn find_eol(buf: &[u8]) -> Option<usize> {
    buf.windows(EOL.len()).position(|w| w == EOL)
}

/// Match a line against [`LINE_TAGS`], returning the tag and the rest of
/// the line.
pub fn classify_line(line: &[u8]) -> Option<(LineTag, &[u8])> {
    LINE_TAGS
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix))
        .map(|(prefix, tag)| (*tag, &line[prefix.len()..]))
}

/// Decode the body of a `pkt:` / `pkrx:` line (tag already stripped).
///
/// The payload may be shorter than the declared length; the caller
/// completes it from the read buffer. A longer payload is an error.
pub fn decode_packet_line(body: &[u8]) -> Result<PacketLine<'_>, FramingError> {
    let sp = body
        .iter()
        .position(|&b| b == b' ')
        .ok_or(FramingError::NoRssiDelimiter)?;
    let rssi = std::str::from_utf8(&body[..sp])
        .ok()
        .and_then(|s| s.trim().parse::<f32>().ok())
        .ok_or(FramingError::InvalidRssi)?;
    let rest = &body[sp + 1..];

    let sp = rest
        .iter()
        .position(|&b| b == b' ')
        .ok_or(FramingError::NoLengthDelimiter)?;
    if sp > MAX_LEN_DIGITS {
        return Err(FramingError::LengthFieldTooWide);
    }
    let len = std::str::from_utf8(&rest[..sp])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(FramingError::InvalidLength)?;
    let payload = &rest[sp + 1..];

    if payload.len() > len {
        return Err(FramingError::Oversized {
            declared: len,
            present: payload.len(),
        });
    }

    Ok(PacketLine { rssi, len, payload })
}

/// Encode a `pkt:` line as the node writes it.
///
/// # Example
///
/// ```
/// use loraham_link::protocol::encode_packet_line;
///
/// assert_eq!(encode_packet_line(-50.0, b"A<B:1 hi"), b"pkt: -50 8 A<B:1 hi\r\n");
/// ```
pub fn encode_packet_line(rssi: f32, payload: &[u8]) -> Vec<u8> {
    let header = format!("pkt: {rssi} {} ", payload.len());
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + EOL.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(EOL);
    buf.to_vec()
}

/// Encode a `!pktx` command injecting a raw packet.
///
/// # Example
///
/// ```
/// use loraham_link::protocol::encode_pktx;
///
/// assert_eq!(encode_pktx(b"A:PING"), b"!pktx 413a50494e47\r");
/// ```
pub fn encode_pktx(packet: &[u8]) -> Vec<u8> {
    let hex = hex::encode(packet);
    let mut buf = BytesMut::with_capacity(PKTX_PREFIX.len() + hex.len() + 1);
    buf.put_slice(PKTX_PREFIX);
    buf.put_slice(hex.as_bytes());
    buf.put_u8(COMMAND_TERMINATOR);
    buf.to_vec()
}

/// Decode the packet carried by a `!pktx` command line (terminator
/// already stripped). Returns `None` for any other line.
pub fn decode_pktx(line: &[u8]) -> Option<Vec<u8>> {
    let hex = line.strip_prefix(PKTX_PREFIX)?;
    hex::decode(hex.trim_ascii()).ok()
}

/// Encode a text command, preceded by a terminator to flush any partial
/// line the node may be holding.
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(cmd.len() + 2);
    buf.put_u8(COMMAND_TERMINATOR);
    buf.put_slice(cmd.as_bytes());
    buf.put_u8(COMMAND_TERMINATOR);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // classify_line
    // -----------------------------------------------------------------------

    #[test]
    fn classify_known_tags() {
        assert_eq!(
            classify_line(b"debug: hello"),
            Some((LineTag::Debug, &b"hello"[..]))
        );
        assert_eq!(classify_line(b"cli: Ok"), Some((LineTag::Cli, &b"Ok"[..])));
        assert_eq!(classify_line(b"net: up"), Some((LineTag::Net, &b"up"[..])));
        assert_eq!(
            classify_line(b"callsign: PU5EPX-1"),
            Some((LineTag::Callsign, &b"PU5EPX-1"[..]))
        );
        assert_eq!(
            classify_line(b"pkt: -50 3 abc"),
            Some((LineTag::Packet, &b"-50 3 abc"[..]))
        );
        assert_eq!(
            classify_line(b"pkrx: -50 3 abc"),
            Some((LineTag::PacketRx, &b"-50 3 abc"[..]))
        );
        assert_eq!(classify_line(b"!tnc"), Some((LineTag::TncEcho, &b""[..])));
    }

    #[test]
    fn classify_unknown_line() {
        assert_eq!(classify_line(b"hello"), None);
        // Tags need their trailing space.
        assert_eq!(classify_line(b"debug:x"), None);
    }

    #[test]
    fn find_eol_first_terminator() {
        assert_eq!(find_eol(b"ab\r\ncd\r\n"), Some(2));
        assert_eq!(find_eol(b"ab\rcd\n"), None);
        assert_eq!(find_eol(b""), None);
    }

    // -----------------------------------------------------------------------
    // decode_packet_line
    // -----------------------------------------------------------------------

    #[test]
    fn packet_line_complete() {
        let line = decode_packet_line(b"-50.5 8 A<B:1 hi").unwrap();
        assert_eq!(line.rssi, -50.5);
        assert_eq!(line.len, 8);
        assert_eq!(line.payload, b"A<B:1 hi");
        assert_eq!(line.missing(), 0);
    }

    #[test]
    fn packet_line_integer_rssi() {
        let line = decode_packet_line(b"-87 4 A<B:").unwrap();
        assert_eq!(line.rssi, -87.0);
    }

    #[test]
    fn packet_line_short_payload() {
        let line = decode_packet_line(b"-50 12 A<B:1 x").unwrap();
        assert_eq!(line.missing(), 5);
    }

    #[test]
    fn packet_line_errors() {
        assert_eq!(
            decode_packet_line(b"-50"),
            Err(FramingError::NoRssiDelimiter)
        );
        assert_eq!(
            decode_packet_line(b"loud 3 abc"),
            Err(FramingError::InvalidRssi)
        );
        assert_eq!(
            decode_packet_line(b"-50 3"),
            Err(FramingError::NoLengthDelimiter)
        );
        assert_eq!(
            decode_packet_line(b"-50 100 abc"),
            Err(FramingError::LengthFieldTooWide)
        );
        assert_eq!(
            decode_packet_line(b"-50 x3 abc"),
            Err(FramingError::InvalidLength)
        );
        assert_eq!(
            decode_packet_line(b"-50  abc"),
            Err(FramingError::InvalidLength)
        );
        assert_eq!(
            decode_packet_line(b"-50 2 abc"),
            Err(FramingError::Oversized {
                declared: 2,
                present: 3
            })
        );
    }

    // -----------------------------------------------------------------------
    // Encoders
    // -----------------------------------------------------------------------

    #[test]
    fn packet_line_encode_decode() {
        let raw = encode_packet_line(-12.5, b"A<B:1 hi");
        assert_eq!(raw, b"pkt: -12.5 8 A<B:1 hi\r\n");
        let (tag, body) = classify_line(&raw[..raw.len() - 2]).unwrap();
        assert_eq!(tag, LineTag::Packet);
        let line = decode_packet_line(body).unwrap();
        assert_eq!(line.payload, b"A<B:1 hi");
    }

    #[test]
    fn pktx_hex_encoding() {
        let cmd = encode_pktx(b"PU5EPX-11:SW A,abc");
        assert!(cmd.starts_with(b"!pktx "));
        assert_eq!(cmd.last(), Some(&b'\r'));
        let body = &cmd[..cmd.len() - 1];
        assert_eq!(decode_pktx(body).unwrap(), b"PU5EPX-11:SW A,abc");
    }

    #[test]
    fn pktx_rejects_other_lines() {
        assert_eq!(decode_pktx(b"!tnc"), None);
        assert_eq!(decode_pktx(b"!pktx zz"), None);
    }

    #[test]
    fn command_is_framed_by_terminators() {
        assert_eq!(encode_command("!tnc"), b"\r!tnc\r");
    }
}
