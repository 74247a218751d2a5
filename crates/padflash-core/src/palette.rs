//! Color palettes embedded into firmware images
//!
//! A palette is an ordered table of RGB colors; the index of each entry is
//! the device's pad/LED (velocity) identifier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaletteError {
    #[error("Failed to read palette: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse palette: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Palette has no color for index {0}")]
    MissingIndex(usize),
    #[error("Palette index {0} is out of range")]
    IndexOutOfRange(usize),
}

/// A single palette color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(c: Rgb) -> Self {
        c.to_bytes()
    }
}

/// Ordered color table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Palette(Vec<Rgb>);

/// On-disk palette layouts: a plain list, or an index -> color object
#[derive(Deserialize)]
#[serde(untagged)]
enum PaletteFile {
    List(Vec<Rgb>),
    Indexed(BTreeMap<String, Rgb>),
}

impl Palette {
    pub fn new(colors: Vec<Rgb>) -> Self {
        Self(colors)
    }

    /// A palette of `len` black entries
    pub fn blank(len: usize) -> Self {
        Self(vec![Rgb::default(); len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn colors(&self) -> &[Rgb] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<Rgb> {
        self.0.get(index).copied()
    }

    pub fn set(&mut self, index: usize, color: Rgb) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = color;
        }
    }

    /// Parse a palette from JSON text
    pub fn from_json(content: &str) -> Result<Self, PaletteError> {
        match serde_json::from_str::<PaletteFile>(content)? {
            PaletteFile::List(colors) => Ok(Self(colors)),
            PaletteFile::Indexed(map) => {
                let mut indexed = BTreeMap::new();
                for (key, color) in map {
                    let index: usize = key.trim().parse().map_err(|_| {
                        <serde_json::Error as serde::de::Error>::custom(format!(
                            "palette key {key:?} is not an index"
                        ))
                    })?;
                    indexed.insert(index, color);
                }
                let len = match indexed.keys().next_back() {
                    Some(&last) => last
                        .checked_add(1)
                        .ok_or(PaletteError::IndexOutOfRange(last))?,
                    None => 0,
                };
                let colors = (0..len)
                    .map(|i| indexed.get(&i).copied().ok_or(PaletteError::MissingIndex(i)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self(colors))
            }
        }
    }

    /// Load a palette from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, PaletteError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

impl From<Vec<Rgb>> for Palette {
    fn from(colors: Vec<Rgb>) -> Self {
        Self(colors)
    }
}
