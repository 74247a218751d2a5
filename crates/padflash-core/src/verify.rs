//! Firmware verifier - classify an uploaded file against the catalog
//!
//! Only the model's signature window is compared, so uploads that were
//! themselves patched (palette, options) are still recognized.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::catalog::{Catalog, CatalogEntry};
use crate::ihex;
use crate::model::Model;
use crate::sysex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Unrecognized firmware: no catalog signature matches")]
    UnrecognizedFirmware,
}

fn window_matches(entry: &CatalogEntry, payload: &[u8]) -> bool {
    payload
        .get(entry.signature.offset..entry.signature.end())
        .is_some_and(|window| window == entry.signature_bytes())
}

/// Compare the signature window directly against decoded HEX memory
fn hex_window_matches(entry: &CatalogEntry, memory: &BTreeMap<u32, u8>) -> bool {
    let start = u32::try_from(entry.signature.offset)
        .ok()
        .and_then(|offset| entry.hex_base_address.checked_add(offset));
    start
        .and_then(|start| ihex::read_window(memory, start, entry.signature.len))
        .is_some_and(|window| window == entry.signature_bytes())
}

/// Try `raw` as SysEx messages, as Intel-HEX text, then as a raw payload
fn matches(entry: &CatalogEntry, raw: &[u8]) -> bool {
    if let Some(messages) = sysex::split_messages(raw) {
        let payload = messages
            .into_iter()
            .map(|message| sysex::decode(&entry.sysex_header, message))
            .collect::<Option<Vec<_>>>();
        if payload.is_some_and(|parts| window_matches(entry, &parts.concat())) {
            return true;
        }
    }

    if ihex::is_hex_text(raw) {
        let decoded = std::str::from_utf8(raw)
            .ok()
            .and_then(|text| ihex::decode(text).ok());
        if let Some(memory) = decoded {
            if hex_window_matches(entry, &memory) {
                return true;
            }
        }
    }

    window_matches(entry, raw)
}

/// Return the first model, in catalog order, whose signature `raw` carries
pub fn verify(catalog: &Catalog, raw: &[u8]) -> Result<Model, VerifyError> {
    let model = catalog
        .entries()
        .iter()
        .find(|entry| matches(entry, raw))
        .map(|entry| entry.model)
        .ok_or(VerifyError::UnrecognizedFirmware)?;

    debug!(model = %model, size = raw.len(), "Recognized firmware");
    Ok(model)
}
