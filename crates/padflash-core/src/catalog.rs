//! Firmware catalog - per-model base images and patch descriptions
//!
//! The catalog is loaded once from a TOML manifest. Model-level metadata
//! (image class, supported options, bootloader routing) is fixed in
//! [`Model`]; everything byte-level (base image, signature window, option
//! edits, palette table, length and checksum fields) comes from the
//! manifest, since it depends on the exact stock firmware release.
//!
//! ```toml
//! [[model]]
//! name = "LPMK2"
//! image = "lpmk2.bin"
//! signature = { offset = 0, len = 16 }
//! sysex_header = [0x00, 0x20, 0x29, 0x00, 0x69]
//! palette = { offset = 4096, slots = 64, stride = 3 }
//!
//! [[model.patch]]
//! option = "ApolloFastLed"
//! offset = 1024
//! bytes = [0x01, 0x02]
//! expect = [0x00, 0x00]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::image::sha256_hex;
use crate::model::{ImageClass, Model, OptionKey, UnknownModel};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog file {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse catalog manifest: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error(transparent)]
    UnknownModel(#[from] UnknownModel),
    #[error("Model {0} appears more than once in the catalog")]
    DuplicateModel(Model),
    #[error("Base image for {model} has SHA256 {actual}, expected {expected}")]
    ShaMismatch {
        model: Model,
        expected: String,
        actual: String,
    },
    #[error("Model {model} does not support option '{option}'")]
    UnsupportedOption { model: Model, option: OptionKey },
    #[error("Model {model}: {what} lies outside the {len}-byte base image")]
    RegionOutOfBounds {
        model: Model,
        what: String,
        len: usize,
    },
    #[error("Model {model}: {what} overlaps the signature window")]
    SignatureOverlap { model: Model, what: String },
    #[error("Model {model}: {what}")]
    InvalidLayout { model: Model, what: String },
    #[error("Model {0}: SysEx header must be non-empty and 7-bit clean")]
    InvalidHeader(Model),
}

/// A byte range within the base image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Location and shape of the palette table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteLayout {
    /// Offset of slot 0
    pub offset: usize,
    /// Number of palette entries the table holds
    pub slots: usize,
    /// Bytes between consecutive slots (at least 3)
    #[serde(default = "default_stride")]
    pub stride: usize,
}

fn default_stride() -> usize {
    3
}

impl PaletteLayout {
    pub fn region(&self) -> Region {
        if self.slots == 0 {
            return Region::new(self.offset, 0);
        }
        Region::new(self.offset, (self.slots - 1) * self.stride + 3)
    }
}

/// Little-endian payload length field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthField {
    pub offset: usize,
    /// Width in bytes: 2 or 4
    pub width: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// One byte: two's complement of the byte sum over the range
    Sum8,
    /// One byte: XOR of every byte in the range
    Xor8,
    /// Two bytes, little-endian: wrapping 16-bit sum of the range
    Sum16Le,
}

impl ChecksumKind {
    pub fn width(&self) -> usize {
        match self {
            ChecksumKind::Sum8 | ChecksumKind::Xor8 => 1,
            ChecksumKind::Sum16Le => 2,
        }
    }
}

/// Checksum over `[start, end)` stored at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    pub kind: ChecksumKind,
    pub start: usize,
    pub end: usize,
    pub offset: usize,
}

impl ChecksumSpec {
    pub fn field(&self) -> Region {
        Region::new(self.offset, self.kind.width())
    }
}

/// One byte-region edit applied when an option is enabled
///
/// With `expect` set, the edit is an instruction-sequence substitution: the
/// bytes at `offset` must match `expect` before they are replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEdit {
    pub option: OptionKey,
    pub offset: usize,
    pub bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Vec<u8>>,
}

impl PatchEdit {
    pub fn region(&self) -> Region {
        Region::new(self.offset, self.bytes.len())
    }
}

/// One `[[model]]` table of the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    /// Model short name (e.g., "LPMK2")
    pub name: String,
    /// Base image path, relative to the manifest's directory
    pub image: String,
    /// Expected SHA256 of the base image
    #[serde(default)]
    pub sha256: Option<String>,
    /// Distinguishing bytes used to recognize uploads
    pub signature: Region,
    /// Manufacturer/device bytes following F0 (SysEx models)
    #[serde(default)]
    pub sysex_header: Vec<u8>,
    /// Load address of the image (HexText models)
    #[serde(default)]
    pub hex_base_address: u32,
    #[serde(default)]
    pub palette: Option<PaletteLayout>,
    /// Write the palette even without the Custom Palette option
    #[serde(default)]
    pub palette_required: bool,
    #[serde(default)]
    pub length_field: Option<LengthField>,
    #[serde(default)]
    pub checksum: Option<ChecksumSpec>,
    #[serde(default)]
    pub patch: Vec<PatchEdit>,
}

/// The catalog manifest file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogManifest {
    #[serde(default)]
    pub model: Vec<ModelManifest>,
}

impl CatalogManifest {
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        Ok(toml::from_str(content)?)
    }
}

/// Immutable per-model record
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub model: Model,
    pub base_image: Vec<u8>,
    pub signature: Region,
    pub sysex_header: Vec<u8>,
    pub hex_base_address: u32,
    pub palette: Option<PaletteLayout>,
    pub palette_required: bool,
    pub length_field: Option<LengthField>,
    pub checksum: Option<ChecksumSpec>,
    /// Edits per option, in manifest order
    pub option_patches: BTreeMap<OptionKey, Vec<PatchEdit>>,
}

impl CatalogEntry {
    /// Build an entry from its manifest table and base image
    ///
    /// Region layout is validated when the entry joins a [`Catalog`].
    pub fn from_manifest(manifest: &ModelManifest, base_image: Vec<u8>) -> Result<Self, CatalogError> {
        let model: Model = manifest.name.parse()?;

        if let Some(expected) = &manifest.sha256 {
            let actual = sha256_hex(&base_image);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(CatalogError::ShaMismatch {
                    model,
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let mut option_patches: BTreeMap<OptionKey, Vec<PatchEdit>> = BTreeMap::new();
        for edit in &manifest.patch {
            if !model.supports(edit.option) {
                return Err(CatalogError::UnsupportedOption {
                    model,
                    option: edit.option,
                });
            }
            option_patches.entry(edit.option).or_default().push(edit.clone());
        }

        Ok(Self {
            model,
            base_image,
            signature: manifest.signature,
            sysex_header: manifest.sysex_header.clone(),
            hex_base_address: manifest.hex_base_address,
            palette: manifest.palette,
            palette_required: manifest.palette_required,
            length_field: manifest.length_field,
            checksum: manifest.checksum,
            option_patches,
        })
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let model = self.model;
        let len = self.base_image.len();
        let out_of_bounds = |what: String| CatalogError::RegionOutOfBounds { model, what, len };
        let layout = |what: &str| CatalogError::InvalidLayout {
            model,
            what: what.to_string(),
        };

        if self.signature.len == 0 {
            return Err(layout("signature window is empty"));
        }
        if self.signature.end() > len {
            return Err(out_of_bounds("signature window".to_string()));
        }

        // Every region the patch engine may write to
        let mut written: Vec<(String, Region)> = Vec::new();

        for (option, edits) in &self.option_patches {
            for edit in edits {
                if let Some(expect) = &edit.expect {
                    if expect.len() != edit.bytes.len() {
                        return Err(layout(&format!(
                            "'{option}' edit at 0x{:X} expects {} bytes but writes {}",
                            edit.offset,
                            expect.len(),
                            edit.bytes.len()
                        )));
                    }
                }
                written.push((format!("'{option}' edit at 0x{:X}", edit.offset), edit.region()));
            }
        }

        if let Some(palette) = &self.palette {
            if palette.stride < 3 {
                return Err(layout("palette stride must be at least 3"));
            }
            written.push(("palette table".to_string(), palette.region()));
        }

        if let Some(field) = &self.length_field {
            if field.width != 2 && field.width != 4 {
                return Err(layout("length field width must be 2 or 4"));
            }
            if field.width == 2 && len > u16::MAX as usize {
                return Err(layout("a 2-byte length field cannot hold the image length"));
            }
            written.push(("length field".to_string(), Region::new(field.offset, field.width)));
        }

        if let Some(checksum) = &self.checksum {
            if checksum.start > checksum.end || checksum.end > len {
                return Err(out_of_bounds("checksum range".to_string()));
            }
            let range = Region::new(checksum.start, checksum.end - checksum.start);
            if checksum.field().overlaps(&range) {
                return Err(layout("checksum field lies inside its own range"));
            }
            written.push(("checksum field".to_string(), checksum.field()));
        }

        for (what, region) in written {
            if region.end() > len {
                return Err(out_of_bounds(what));
            }
            if region.overlaps(&self.signature) {
                return Err(CatalogError::SignatureOverlap { model, what });
            }
        }

        if model.class() == ImageClass::SysEx
            && (self.sysex_header.is_empty() || self.sysex_header.iter().any(|&b| b >= 0x80))
        {
            return Err(CatalogError::InvalidHeader(model));
        }

        Ok(())
    }

    /// Distinguishing bytes of the base image
    pub fn signature_bytes(&self) -> &[u8] {
        &self.base_image[self.signature.offset..self.signature.end()]
    }

    pub fn palette_slots(&self) -> Option<usize> {
        self.palette.map(|p| p.slots)
    }

    /// Edits registered for `option`, empty if none
    pub fn edits_for(&self, option: OptionKey) -> &[PatchEdit] {
        self.option_patches
            .get(&option)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// All catalog entries, in catalog (model) order
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Build a catalog from validated entries
    pub fn from_entries(mut entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        for entry in &entries {
            entry.validate()?;
        }
        entries.sort_by_key(|e| e.model);
        for pair in entries.windows(2) {
            if pair[0].model == pair[1].model {
                return Err(CatalogError::DuplicateModel(pair[0].model));
            }
        }

        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                if a.signature == b.signature && a.signature_bytes() == b.signature_bytes() {
                    warn!(
                        first = %a.model,
                        second = %b.model,
                        "Models share a firmware signature; uploads will verify as the first"
                    );
                }
            }
        }

        Ok(Self { entries })
    }

    /// Build a catalog from a parsed manifest, loading images with `load_image`
    pub fn from_manifest<F>(manifest: &CatalogManifest, mut load_image: F) -> Result<Self, CatalogError>
    where
        F: FnMut(&ModelManifest) -> Result<Vec<u8>, CatalogError>,
    {
        let mut entries = Vec::with_capacity(manifest.model.len());
        for table in &manifest.model {
            let image = load_image(table)?;
            let entry = CatalogEntry::from_manifest(table, image)?;
            debug!(
                model = %entry.model,
                size = entry.base_image.len(),
                options = entry.option_patches.len(),
                "Loaded catalog entry"
            );
            entries.push(entry);
        }
        Self::from_entries(entries)
    }

    /// Load a catalog manifest and the base images it references
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = CatalogManifest::from_toml(&content)?;
        let base_dir = path.parent().unwrap_or(Path::new("."));

        let catalog = Self::from_manifest(&manifest, |table| {
            let image_path = base_dir.join(&table.image);
            std::fs::read(&image_path).map_err(|source| CatalogError::IoError {
                path: image_path,
                source,
            })
        })?;

        info!(
            path = %path.display(),
            models = catalog.entries.len(),
            "Loaded firmware catalog"
        );
        Ok(catalog)
    }

    pub fn catalog_for(&self, model: Model) -> Result<&CatalogEntry, UnknownModel> {
        self.entries
            .iter()
            .find(|e| e.model == model)
            .ok_or_else(|| UnknownModel(model.name().to_string()))
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn models(&self) -> impl Iterator<Item = Model> + '_ {
        self.entries.iter().map(|e| e.model)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
