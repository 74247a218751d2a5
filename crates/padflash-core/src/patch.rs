//! Patch engine - base image + options + palette -> encoded firmware
//!
//! The engine is a pure function over the catalog: it copies the base
//! image, applies option edits, writes the palette table, fixes up the
//! length and checksum fields (checksum last, so no later edit can
//! invalidate it) and encodes the result for the model's image class.

use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::{Catalog, CatalogEntry, ChecksumKind, ChecksumSpec, LengthField};
use crate::ihex;
use crate::image::{Encoding, FirmwareImage};
use crate::model::{ImageClass, Model, OptionKey, PatchOptions, UnknownModel};
use crate::palette::Palette;
use crate::sysex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error(transparent)]
    UnknownModel(#[from] UnknownModel),
    #[error("Palette has {actual} colors, {model} expects {expected}")]
    PaletteSizeMismatch {
        model: Model,
        expected: usize,
        actual: usize,
    },
    #[error("Base image for {model} does not contain the expected bytes for '{option}' at 0x{offset:X}")]
    UnexpectedBytes {
        model: Model,
        option: OptionKey,
        offset: usize,
    },
}

/// Whether this request writes the palette table
fn consumes_palette(entry: &CatalogEntry, options: &PatchOptions) -> bool {
    entry.palette_required
        || (options.is_enabled(OptionKey::CustomPalette) && entry.model.supports(OptionKey::CustomPalette))
}

/// Produce the patched, unencoded payload
pub fn patch_raw(
    catalog: &Catalog,
    model: Model,
    options: &PatchOptions,
    palette: &Palette,
) -> Result<Vec<u8>, PatchError> {
    let entry = catalog.catalog_for(model)?;

    let palette_layout = if consumes_palette(entry, options) {
        match entry.palette {
            Some(layout) if palette.len() != layout.slots => {
                return Err(PatchError::PaletteSizeMismatch {
                    model,
                    expected: layout.slots,
                    actual: palette.len(),
                });
            }
            Some(layout) => Some(layout),
            None => {
                warn!(model = %model, "Catalog has no palette table for this model, ignoring palette");
                None
            }
        }
    } else {
        None
    };

    let mut image = entry.base_image.clone();

    for option in options.iter() {
        if !model.supports(option) {
            debug!(model = %model, option = %option, "Option not supported by model, skipping");
            continue;
        }
        for edit in entry.edits_for(option) {
            let target = &mut image[edit.offset..edit.offset + edit.bytes.len()];
            if let Some(expect) = &edit.expect {
                if target != expect.as_slice() {
                    return Err(PatchError::UnexpectedBytes {
                        model,
                        option,
                        offset: edit.offset,
                    });
                }
            }
            target.copy_from_slice(&edit.bytes);
            debug!(model = %model, option = %option, offset = edit.offset, len = edit.bytes.len(), "Applied edit");
        }
    }

    if let Some(layout) = palette_layout {
        for (index, color) in palette.colors().iter().enumerate() {
            let at = layout.offset + index * layout.stride;
            image[at..at + 3].copy_from_slice(&color.to_bytes());
        }
        debug!(model = %model, slots = layout.slots, "Wrote palette table");
    }

    if let Some(field) = &entry.length_field {
        write_length(&mut image, field);
    }

    if let Some(checksum) = &entry.checksum {
        write_checksum(&mut image, checksum);
    }

    Ok(image)
}

/// Patch and encode a firmware image for `model`
pub fn patch(
    catalog: &Catalog,
    model: Model,
    options: &PatchOptions,
    palette: &Palette,
) -> Result<FirmwareImage, PatchError> {
    let payload = patch_raw(catalog, model, options, palette)?;
    let entry = catalog.catalog_for(model)?;
    Ok(encode(entry, &payload))
}

/// Encode a raw payload for the entry's image class
pub fn encode(entry: &CatalogEntry, payload: &[u8]) -> FirmwareImage {
    match entry.model.class() {
        ImageClass::SysEx => FirmwareImage::new(
            entry.model,
            Encoding::SysEx,
            sysex::encode(&entry.sysex_header, payload),
        ),
        ImageClass::HexText => FirmwareImage::new(
            entry.model,
            Encoding::IntelHex,
            ihex::encode(entry.hex_base_address, payload).into_bytes(),
        ),
    }
}

fn write_length(image: &mut [u8], field: &LengthField) {
    let len = image.len() as u32;
    let bytes = len.to_le_bytes();
    image[field.offset..field.offset + field.width].copy_from_slice(&bytes[..field.width]);
}

/// Compute the checksum value for `data` as stored in the image
pub fn checksum_bytes(kind: ChecksumKind, data: &[u8]) -> Vec<u8> {
    match kind {
        ChecksumKind::Sum8 => vec![data
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
            .wrapping_neg()],
        ChecksumKind::Xor8 => vec![data.iter().fold(0u8, |acc, &b| acc ^ b)],
        ChecksumKind::Sum16Le => data
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
            .to_le_bytes()
            .to_vec(),
    }
}

fn write_checksum(image: &mut [u8], checksum: &ChecksumSpec) {
    let value = checksum_bytes(checksum.kind, &image[checksum.start..checksum.end]);
    image[checksum.offset..checksum.offset + value.len()].copy_from_slice(&value);
}
