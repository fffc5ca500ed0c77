//! Length-prefixed fields: `<decimal length>:<payload>,`
//!
//! Payloads are delimited by their length alone, so they may contain any byte
//! including `:` and `,`.

use crate::error::Abort;
use crate::wire::Wire;
use std::io::{Read, Write};

/// Largest length prefix accepted before the connection is abandoned
pub const MAX_LENGTH: u64 = 200_000_000;

/// A decoded field whose payload may have been too large to keep
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Field {
    Kept(Vec<u8>),
    /// The payload was consumed but not retained
    Oversized(u64),
}

/// Read a length prefix up to and including the `:`
pub(crate) fn decode_length<R: Read, W: Write>(wire: &mut Wire<R, W>) -> Result<u64, Abort> {
    let mut len: u64 = 0;
    loop {
        let ch = wire.read_byte()?;
        if len > MAX_LENGTH {
            return Err(Abort::LengthOverflow);
        }
        match ch {
            b':' => return Ok(len),
            b'0'..=b'9' => len = 10 * len + u64::from(ch - b'0'),
            _ => return Err(Abort::Protocol("bad character in length prefix")),
        }
    }
}

/// Read a length prefix nested inside another field, charging every byte to
/// the enclosing field's remaining `budget`
pub(crate) fn decode_nested_length<R: Read, W: Write>(
    wire: &mut Wire<R, W>,
    budget: &mut u64,
) -> Result<u64, Abort> {
    let mut len: u64 = 0;
    loop {
        if *budget == 0 {
            return Err(Abort::Protocol("length prefix runs past enclosing field"));
        }
        let ch = wire.read_byte()?;
        *budget -= 1;
        if len > MAX_LENGTH {
            return Err(Abort::LengthOverflow);
        }
        match ch {
            b':' => return Ok(len),
            b'0'..=b'9' => len = 10 * len + u64::from(ch - b'0'),
            _ => return Err(Abort::Protocol("bad character in length prefix")),
        }
    }
}

pub(crate) fn decode_comma<R: Read, W: Write>(wire: &mut Wire<R, W>) -> Result<(), Abort> {
    match wire.read_byte()? {
        b',' => Ok(()),
        _ => Err(Abort::Protocol("missing comma after field")),
    }
}

/// Decode a whole field, keeping the payload only if it is shorter than `max`
pub(crate) fn decode_field<R: Read, W: Write>(
    wire: &mut Wire<R, W>,
    max: u64,
) -> Result<Field, Abort> {
    let len = decode_length(wire)?;
    let field = if len >= max {
        wire.drain(len)?;
        Field::Oversized(len)
    } else {
        Field::Kept(wire.read_exact(len)?)
    };
    decode_comma(wire)?;
    Ok(field)
}

/// Append the framed `payload` to `out`
pub fn encode_into(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(b',');
}

/// Frame `payload` as a length-prefixed field
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    encode_into(&mut out, payload);
    out
}
