//! Encoded firmware images

use serde::{Deserialize, Serialize};

use crate::model::Model;

/// Byte encoding of a [`FirmwareImage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Unencoded payload
    Raw,
    /// Single 7-bit-clean SysEx message
    SysEx,
    /// Intel-HEX ASCII text
    IntelHex,
}

impl Encoding {
    pub fn extension(&self) -> &'static str {
        match self {
            Encoding::Raw => "bin",
            Encoding::SysEx => "syx",
            Encoding::IntelHex => "hex",
        }
    }
}

/// An immutable firmware image for a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    model: Model,
    encoding: Encoding,
    bytes: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(model: Model, encoding: Encoding, bytes: Vec<u8>) -> Self {
        Self {
            model,
            encoding,
            bytes,
        }
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Default download file name
    pub fn file_name(&self) -> String {
        match self.encoding {
            Encoding::SysEx => "output.syx".to_string(),
            Encoding::IntelHex => "mf64.hex".to_string(),
            Encoding::Raw => format!("{}.bin", self.model.name().to_ascii_lowercase()),
        }
    }

    /// SHA256 of the encoded bytes
    pub fn sha256(&self) -> String {
        sha256_hex(&self.bytes)
    }
}

/// Compute SHA256 hash of data and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}
