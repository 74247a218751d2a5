//! padflash Core - firmware catalog, patch engine and verifier
//!
//! This crate provides the pure parts of the padflash system:
//! - Fixed model table and patch option keys
//! - Firmware catalog loaded from a TOML manifest plus base images
//! - Patch engine producing SysEx or Intel-HEX encoded images
//! - Firmware verifier for user-supplied uploads
//! - Bootloader readiness classifier over observed device state

pub mod catalog;
pub mod device;
pub mod ihex;
pub mod image;
pub mod model;
pub mod palette;
pub mod patch;
pub mod sysex;
pub mod verify;

#[cfg(test)]
mod fixtures;

pub use catalog::{Catalog, CatalogEntry, CatalogError, CatalogManifest};
pub use device::{is_ready, DeviceIdentity, DeviceMode, DeviceState};
pub use image::{sha256_hex, Encoding, FirmwareImage};
pub use model::{ImageClass, Model, OptionKey, PatchOptions, UnknownModel};
pub use palette::{Palette, PaletteError, Rgb};
pub use patch::{patch, patch_raw, PatchError};
pub use verify::{verify, VerifyError};
