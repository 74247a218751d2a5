//! Intel-HEX text encoding for HexText-class firmware

use std::collections::BTreeMap;
use thiserror::Error;

/// Data bytes per record
pub const RECORD_LEN: usize = 16;

/// The fixed end-of-file record
pub const EOF_RECORD: &str = ":00000001FF";

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const START_SEGMENT_ADDRESS: u8 = 0x03;
const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const START_LINEAR_ADDRESS: u8 = 0x05;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    #[error("Line {0}: record does not start with ':'")]
    MissingColon(usize),
    #[error("Line {0}: invalid hex digits")]
    InvalidDigits(usize),
    #[error("Line {0}: record length does not match its byte count")]
    BadLength(usize),
    #[error("Line {line}: checksum mismatch (sum is 0x{sum:02X})")]
    BadChecksum { line: usize, sum: u8 },
    #[error("Line {line}: unsupported record type 0x{kind:02X}")]
    UnsupportedRecord { line: usize, kind: u8 },
    #[error("Missing end-of-file record")]
    MissingEof,
}

/// Checksum byte that makes a record's byte sum zero (mod 256)
pub fn record_checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

fn push_record(out: &mut String, address: u16, kind: u8, data: &[u8]) {
    let mut record = Vec::with_capacity(data.len() + 5);
    record.push(data.len() as u8);
    record.extend_from_slice(&address.to_be_bytes());
    record.push(kind);
    record.extend_from_slice(data);
    record.push(record_checksum(&record));

    out.push(':');
    out.push_str(&hex::encode_upper(&record));
    out.push('\n');
}

/// Encode `data` located at `base_address` as Intel-HEX text
///
/// Extended linear address records are emitted whenever the upper 16 bits
/// of the address change.
pub fn encode(base_address: u32, data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + data.len() / RECORD_LEN * 12 + 16);
    let mut upper: u16 = 0;

    let mut offset = 0usize;
    while offset < data.len() {
        let address = base_address.wrapping_add(offset as u32);
        let record_upper = (address >> 16) as u16;
        if record_upper != upper {
            push_record(&mut out, 0, EXTENDED_LINEAR_ADDRESS, &record_upper.to_be_bytes());
            upper = record_upper;
        }

        // A record must not cross a 64 KiB boundary
        let to_boundary = 0x1_0000 - (address & 0xFFFF) as usize;
        let len = RECORD_LEN.min(data.len() - offset).min(to_boundary);
        push_record(&mut out, address as u16, DATA, &data[offset..offset + len]);
        offset += len;
    }

    out.push_str(EOF_RECORD);
    out.push('\n');
    out
}

fn parse_digits(line: usize, text: &str) -> Result<Vec<u8>, HexError> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(HexError::InvalidDigits(line));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| HexError::InvalidDigits(line)))
        .collect()
}

/// Parse Intel-HEX text into a sparse address -> byte map
pub fn decode(text: &str) -> Result<BTreeMap<u32, u8>, HexError> {
    let mut memory = BTreeMap::new();
    let mut upper: u32 = 0;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let digits = raw.strip_prefix(':').ok_or(HexError::MissingColon(line))?;
        let bytes = parse_digits(line, digits)?;
        if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
            return Err(HexError::BadLength(line));
        }

        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(HexError::BadChecksum { line, sum });
        }

        let address = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        let kind = bytes[3];
        let data = &bytes[4..bytes.len() - 1];

        match kind {
            DATA => {
                for (i, &byte) in data.iter().enumerate() {
                    memory.insert(upper.wrapping_add(address + i as u32), byte);
                }
            }
            END_OF_FILE => return Ok(memory),
            EXTENDED_LINEAR_ADDRESS if data.len() == 2 => {
                upper = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
            }
            EXTENDED_SEGMENT_ADDRESS if data.len() == 2 => {
                upper = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
            }
            START_SEGMENT_ADDRESS | START_LINEAR_ADDRESS => {}
            _ => return Err(HexError::UnsupportedRecord { line, kind }),
        }
    }

    Err(HexError::MissingEof)
}

/// Read `len` bytes starting at `start`
///
/// Gaps between records read as erased flash (0xFF). Returns `None` when
/// the window runs past the last recorded address.
pub fn read_window(memory: &BTreeMap<u32, u8>, start: u32, len: usize) -> Option<Vec<u8>> {
    let last = start.checked_add(u32::try_from(len.checked_sub(1)?).ok()?)?;
    memory.range(last..).next()?;

    let mut out = vec![0xFF; len];
    for (&address, &byte) in memory.range(start..=last) {
        out[(address - start) as usize] = byte;
    }
    Some(out)
}

/// Whether `bytes` look like Intel-HEX text
pub fn is_hex_text(bytes: &[u8]) -> bool {
    let trimmed = bytes.trim_ascii_start();
    trimmed.first() == Some(&b':')
        && trimmed
            .iter()
            .all(|b| b.is_ascii_hexdigit() || matches!(b, b':' | b'\r' | b'\n' | b' ' | b'\t'))
}
