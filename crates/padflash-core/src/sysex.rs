//! SysEx framing for bootloader firmware payloads
//!
//! A payload is sent as one System-Exclusive message:
//! `F0 <header> <nibbles> F7`, where every payload byte is split into its
//! high and low nibble so that no interior byte reaches 0x80. Uploaded
//! `.syx` files may instead hold a sequence of such messages back to back.

/// Start of a System-Exclusive message
pub const SYSEX_START: u8 = 0xF0;
/// End of a System-Exclusive message
pub const SYSEX_END: u8 = 0xF7;

/// Wrap a raw payload into a SysEx message
pub fn encode(header: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + payload.len() * 2 + 2);
    out.push(SYSEX_START);
    out.extend_from_slice(header);
    for &byte in payload {
        out.push(byte >> 4);
        out.push(byte & 0x0F);
    }
    out.push(SYSEX_END);
    out
}

/// Recover the raw payload from a message built by [`encode`] with `header`
///
/// Returns `None` if the framing or header does not match, or the body is
/// not a sequence of nibble pairs.
pub fn decode(header: &[u8], message: &[u8]) -> Option<Vec<u8>> {
    let body = message
        .strip_prefix(&[SYSEX_START])?
        .strip_prefix(header)?
        .strip_suffix(&[SYSEX_END])?;

    if body.len() % 2 != 0 {
        return None;
    }

    body.chunks_exact(2)
        .map(|pair| match pair {
            [hi, lo] if *hi < 0x10 && *lo < 0x10 => Some((*hi << 4) | *lo),
            _ => None,
        })
        .collect()
}

/// Whether `message` looks like a single framed SysEx message
pub fn is_sysex(message: &[u8]) -> bool {
    message.len() >= 2
        && message[0] == SYSEX_START
        && message[message.len() - 1] == SYSEX_END
        && message[1..message.len() - 1].iter().all(|&b| b < 0x80)
}

/// Split a byte stream into its complete SysEx messages
///
/// Returns `None` unless `bytes` is one or more well-formed messages with
/// nothing between them.
pub fn split_messages(bytes: &[u8]) -> Option<Vec<&[u8]>> {
    let mut messages = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let end = rest.iter().position(|&b| b == SYSEX_END)?;
        let (message, tail) = rest.split_at(end + 1);
        if !is_sysex(message) {
            return None;
        }
        messages.push(message);
        rest = tail;
    }
    (!messages.is_empty()).then_some(messages)
}
