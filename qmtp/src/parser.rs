use nom::bytes::complete::{tag, take};
use nom::character::complete::digit1;
use nom::combinator::{map_res, verify};
use nom::multi::many0;
use nom::sequence::terminated;
use nom::IResult;

use crate::error::ReplyError;
use std::str;

/// One segment of a server reply, as seen by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `K`: the message was accepted for this recipient
    Success(String),
    /// `Z`: try again later
    Temporary(String),
    /// `D`: give up
    Permanent(String),
}

//----- Parser -----------------------------------------------------------------

/// Parse every reply segment in `buf`
pub fn parse_replies(buf: &[u8]) -> Result<Vec<Reply>, ReplyError> {
    match many0(reply)(buf) {
        Ok((rest, replies)) if rest.is_empty() => Ok(replies),
        Ok((rest, _)) => Err(ReplyError {
            offset: buf.len() - rest.len(),
        }),
        Err(_) => Err(ReplyError { offset: 0 }),
    }
}

/// Parse one length-prefixed field, returning its payload
pub fn netstring(buf: &[u8]) -> IResult<&[u8], &[u8]> {
    let (buf, len) = terminated(length, tag(b":"))(buf)?;
    terminated(take(len), tag(b","))(buf)
}

fn length(buf: &[u8]) -> IResult<&[u8], usize> {
    map_res(map_res(digit1, str::from_utf8), str::parse::<usize>)(buf)
}

fn reply(buf: &[u8]) -> IResult<&[u8], Reply> {
    let segment = verify(netstring, |payload: &[u8]| {
        matches!(payload.first(), Some(b'K' | b'Z' | b'D'))
    });
    map_res(segment, to_reply)(buf)
}

//---- Helper functions ---------------------------------------------------------

fn to_reply(payload: &[u8]) -> Result<Reply, str::Utf8Error> {
    let text = str::from_utf8(&payload[1..])?.to_owned();
    Ok(match payload[0] {
        b'K' => Reply::Success(text),
        b'Z' => Reply::Temporary(text),
        _ => Reply::Permanent(text),
    })
}

//---- Tests --------------------------------------------------------------------
