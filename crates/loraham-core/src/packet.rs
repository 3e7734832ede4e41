//! Link packet codec.
//!
//! A packet travels as `TO<FROM:params message`. The preamble (everything
//! before the first space) carries the addresses and the parameter list;
//! the message is opaque bytes and may itself contain spaces, CR or LF.
//! Its length is governed by the outer `pkt:` line framing, not by this
//! codec.
//!
//! # Parameter grammar
//!
//! ```text
//! params = param *( "," param )
//! param  = ident / symbol
//! ident  = 1*6DIGIT                 ; 1..999999, no leading zeros
//! symbol = key [ "=" value ]        ; key: [0-9a-zA-Z]+, first char a letter
//! value  = *( printable ASCII except "=", " ", ",", ":", "<" )
//! ```
//!
//! # Example
//!
//! ```
//! use loraham_core::packet::Packet;
//!
//! let pkt = Packet::decode(b"PU5EPX-11<PU5EPX-1:33,PONG hello").unwrap();
//! assert_eq!(pkt.to, "PU5EPX-11");
//! assert_eq!(pkt.from, "PU5EPX-1");
//! assert_eq!(pkt.ident, 33);
//! assert!(pkt.params.has("PONG"));
//! assert_eq!(pkt.message, b"hello");
//! ```

use std::fmt;

use crate::params::Params;

/// Largest ident a packet may carry.
pub const MAX_IDENT: u32 = 999_999;

/// Bytes a symbol parameter value must not contain.
const VALUE_DELIMITERS: &[u8] = b"= ,:<";

/// Why a packet failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("basic preamble delimiters missing")]
    BasicPreambleDelimiters,

    #[error("preamble delimiters out of order")]
    DelimiterOrder,

    #[error("invalid UTF-8 in callsign")]
    InvalidCallsignEncoding,

    #[error("empty parameter")]
    EmptyParam,

    #[error("parameter with invalid first char")]
    InvalidParamLeadChar,

    #[error("ident parameter is not a decimal number")]
    IdentNotDecimal,

    #[error("ident below 1")]
    IdentBelowRange,

    #[error("ident above 999999")]
    IdentAboveRange,

    #[error("ident has a non-canonical representation")]
    IdentLengthMismatch,

    #[error("parameter key with invalid char")]
    InvalidKeyChar,

    /// Unreachable after the ASCII key check.
    #[error("invalid UTF-8 in parameter key")]
    KeyEncoding,

    #[error("parameter value with invalid char")]
    InvalidValueChar,

    /// Unreachable after the printable-ASCII value check.
    #[error("invalid UTF-8 in parameter value")]
    ValueEncoding,
}

/// A failed decode: the first cause plus whatever was decoded before it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{cause}")]
pub struct DecodeFailure {
    #[source]
    pub cause: DecodeError,
    /// Fields set before decoding stopped. Not a valid packet.
    pub partial: Packet,
}

/// A packet received over the link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Destination callsign.
    pub to: String,
    /// Source callsign.
    pub from: String,
    /// Ident parameter, 0 if absent.
    pub ident: u32,
    pub params: Params,
    /// Message body after the preamble.
    pub message: Vec<u8>,
}

impl Packet {
    /// Decode a raw packet payload.
    pub fn decode(data: &[u8]) -> Result<Packet, DecodeFailure> {
        decode(data)
    }

    /// Encode the packet back to its wire form.
    ///
    /// The ident (if any) is rendered first, then symbol parameters in key
    /// order. A space and the message follow only when the message is
    /// non-empty.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.to.len() + self.from.len() + self.message.len() + 16);
        buf.extend_from_slice(self.to.as_bytes());
        buf.push(b'<');
        buf.extend_from_slice(self.from.as_bytes());
        buf.push(b':');
        buf.extend_from_slice(self.serialized_params().as_bytes());
        if !self.message.is_empty() {
            buf.push(b' ');
            buf.extend_from_slice(&self.message);
        }
        buf
    }

    /// Parameter list including the ident, as it appears in the preamble.
    pub fn serialized_params(&self) -> String {
        let symbols = self.params.serialize();
        match (self.ident, symbols.is_empty()) {
            (0, _) => symbols,
            (ident, true) => ident.to_string(),
            (ident, false) => format!("{ident},{symbols}"),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "to {} from {} params {} msg {:?}",
            self.to,
            self.from,
            self.serialized_params(),
            String::from_utf8_lossy(&self.message)
        )
    }
}

/// Decode a raw packet payload.
///
/// Stops at the first error; the returned [`DecodeFailure`] carries the
/// partially filled packet for diagnostics.
pub fn decode(data: &[u8]) -> Result<Packet, DecodeFailure> {
    let mut pkt = Packet::default();

    let preamble = match data.iter().position(|&b| b == b' ') {
        Some(sp) => {
            pkt.message = data[sp + 1..].to_vec();
            &data[..sp]
        }
        // Valid packet with no message.
        None => data,
    };

    match decode_preamble(preamble, &mut pkt) {
        Ok(()) => Ok(pkt),
        Err(cause) => Err(DecodeFailure {
            cause,
            partial: pkt,
        }),
    }
}

fn decode_preamble(data: &[u8], pkt: &mut Packet) -> Result<(), DecodeError> {
    let lt = data.iter().position(|&b| b == b'<');
    let colon = data.iter().position(|&b| b == b':');
    let (lt, colon) = match (lt, colon) {
        (Some(lt), Some(colon)) => (lt, colon),
        _ => return Err(DecodeError::BasicPreambleDelimiters),
    };
    if lt >= colon {
        return Err(DecodeError::DelimiterOrder);
    }

    let to = std::str::from_utf8(&data[..lt]).map_err(|_| DecodeError::InvalidCallsignEncoding)?;
    let from = std::str::from_utf8(&data[lt + 1..colon])
        .map_err(|_| DecodeError::InvalidCallsignEncoding)?;
    pkt.to = to.to_string();
    pkt.from = from.to_string();

    decode_params(&data[colon + 1..], pkt)
}

fn decode_params(mut data: &[u8], pkt: &mut Packet) -> Result<(), DecodeError> {
    // A trailing comma ends the list; an empty token anywhere else is an error.
    while !data.is_empty() {
        let (param, rest) = match data.iter().position(|&b| b == b',') {
            Some(comma) => (&data[..comma], &data[comma + 1..]),
            None => (data, &data[data.len()..]),
        };
        data = rest;

        match param.first() {
            None => return Err(DecodeError::EmptyParam),
            Some(c) if c.is_ascii_digit() => pkt.ident = decode_ident(param)?,
            Some(c) if c.is_ascii_alphabetic() => decode_symbol(param, &mut pkt.params)?,
            Some(_) => return Err(DecodeError::InvalidParamLeadChar),
        }
    }
    Ok(())
}

fn decode_ident(token: &[u8]) -> Result<u32, DecodeError> {
    if !token.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::IdentNotDecimal);
    }
    let text = std::str::from_utf8(token).map_err(|_| DecodeError::IdentNotDecimal)?;

    // All digits, so the only parse failure is overflow.
    let value: u64 = text.parse().map_err(|_| DecodeError::IdentAboveRange)?;
    if value == 0 {
        return Err(DecodeError::IdentBelowRange);
    }
    if value > u64::from(MAX_IDENT) {
        return Err(DecodeError::IdentAboveRange);
    }
    if value.to_string().len() != text.len() {
        return Err(DecodeError::IdentLengthMismatch);
    }
    Ok(value as u32)
}

fn decode_symbol(token: &[u8], params: &mut Params) -> Result<(), DecodeError> {
    let (key, value) = match token.iter().position(|&b| b == b'=') {
        Some(eq) => (&token[..eq], Some(&token[eq + 1..])),
        None => (token, None),
    };

    if !key.iter().all(u8::is_ascii_alphanumeric) {
        return Err(DecodeError::InvalidKeyChar);
    }
    let key = std::str::from_utf8(key).map_err(|_| DecodeError::KeyEncoding)?;

    let value = match value {
        Some(value) => {
            if value
                .iter()
                .any(|&b| b >= 127 || VALUE_DELIMITERS.contains(&b))
            {
                return Err(DecodeError::InvalidValueChar);
            }
            let value = std::str::from_utf8(value).map_err(|_| DecodeError::ValueEncoding)?;
            Some(value.to_string())
        }
        None => None,
    };

    params.put(key, value);
    Ok(())
}
