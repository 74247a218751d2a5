//! Device models, patch option keys and option sets
//!
//! The model table is fixed: every other structure (catalog entries,
//! palettes, bootloader routing) is keyed by [`Model`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::device::DeviceIdentity;

/// A model name that is not part of the fixed model table, or a model the
/// loaded catalog has no entry for.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown model: {0}")]
pub struct UnknownModel(pub String);

/// Output encoding family of a model's firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageClass {
    /// Flashed over MIDI as a single 7-bit-clean SysEx message
    SysEx,
    /// Written out as Intel-HEX text for the vendor utility
    HexText,
}

/// Device variant a firmware image is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Model {
    #[serde(rename = "LPX")]
    LaunchpadX,
    #[serde(rename = "LPMiniMK3")]
    LaunchpadMiniMk3,
    #[serde(rename = "LPPRO")]
    LaunchpadPro,
    #[serde(rename = "LPPROMK3")]
    LaunchpadProMk3,
    #[serde(rename = "LPMK2")]
    LaunchpadMk2,
    /// Launchpad Pro community firmware
    #[serde(rename = "CFY")]
    CustomFirmware,
    #[serde(rename = "MF64")]
    MidiFighter64,
    #[serde(rename = "CMF64")]
    CustomMidiFighter64,
}

impl Model {
    /// Every model, in catalog order
    pub const ALL: [Model; 8] = [
        Model::LaunchpadX,
        Model::LaunchpadMiniMk3,
        Model::LaunchpadPro,
        Model::LaunchpadProMk3,
        Model::LaunchpadMk2,
        Model::CustomFirmware,
        Model::MidiFighter64,
        Model::CustomMidiFighter64,
    ];

    /// Short name used in manifests, file names and on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Model::LaunchpadX => "LPX",
            Model::LaunchpadMiniMk3 => "LPMiniMK3",
            Model::LaunchpadPro => "LPPRO",
            Model::LaunchpadProMk3 => "LPPROMK3",
            Model::LaunchpadMk2 => "LPMK2",
            Model::CustomFirmware => "CFY",
            Model::MidiFighter64 => "MF64",
            Model::CustomMidiFighter64 => "CMF64",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Model::LaunchpadX => "Launchpad X",
            Model::LaunchpadMiniMk3 => "Launchpad Mini MK3",
            Model::LaunchpadPro => "Launchpad Pro",
            Model::LaunchpadProMk3 => "Launchpad Pro MK3",
            Model::LaunchpadMk2 => "Launchpad MK2",
            Model::CustomFirmware => "Launchpad Pro (CFW)",
            Model::MidiFighter64 => "MIDI Fighter 64",
            Model::CustomMidiFighter64 => "MIDI Fighter 64 (CFW)",
        }
    }

    pub fn class(&self) -> ImageClass {
        match self {
            Model::MidiFighter64 | Model::CustomMidiFighter64 => ImageClass::HexText,
            _ => ImageClass::SysEx,
        }
    }

    /// Options this model's firmware can be patched with
    pub fn supported_options(&self) -> &'static [OptionKey] {
        use OptionKey::*;
        match self {
            Model::LaunchpadX
            | Model::LaunchpadMiniMk3
            | Model::LaunchpadPro
            | Model::LaunchpadMk2 => &[CustomPalette, ApolloFastLed],
            Model::LaunchpadProMk3 => &[],
            // Fast LED is built into the custom firmware
            Model::CustomFirmware => &[],
            Model::MidiFighter64 | Model::CustomMidiFighter64 => &[CustomPalette, NovationIdSpoof],
        }
    }

    pub fn supports(&self, option: OptionKey) -> bool {
        self.supported_options().contains(&option)
    }

    /// Device identities whose bootloader accepts this model's image
    pub fn accepting_bootloaders(&self) -> &'static [DeviceIdentity] {
        match self {
            Model::LaunchpadX => &[DeviceIdentity::LaunchpadX],
            Model::LaunchpadMiniMk3 => &[DeviceIdentity::LaunchpadMiniMk3],
            Model::LaunchpadPro | Model::CustomFirmware => &[DeviceIdentity::LaunchpadPro],
            Model::LaunchpadProMk3 => &[DeviceIdentity::LaunchpadProMk3],
            Model::LaunchpadMk2 => &[DeviceIdentity::LaunchpadMk2],
            Model::MidiFighter64 | Model::CustomMidiFighter64 => &[],
        }
    }

    /// Whether the image can be sent to a device bootloader over SysEx
    pub fn is_flashable(&self) -> bool {
        self.class() == ImageClass::SysEx && !self.accepting_bootloaders().is_empty()
    }

    /// Human-readable instructions for putting the device into bootloader mode
    pub fn bootloader_instructions(&self) -> &'static str {
        match self {
            Model::LaunchpadX => {
                "Hold Capture MIDI while connecting the USB cable to start the Launchpad X in bootloader mode."
            }
            Model::LaunchpadMiniMk3 => {
                "Hold User while connecting the USB cable to start the Launchpad Mini MK3 in bootloader mode."
            }
            Model::LaunchpadPro | Model::CustomFirmware => {
                "Hold Setup while connecting the USB cable to start the Launchpad Pro in bootloader mode."
            }
            Model::LaunchpadProMk3 => {
                "Hold Setup while connecting the USB cable to start the Launchpad Pro MK3 in bootloader mode."
            }
            Model::LaunchpadMk2 => {
                "Hold Session while connecting the USB cable to start the Launchpad MK2 in bootloader mode."
            }
            Model::MidiFighter64 | Model::CustomMidiFighter64 => {
                "Install with the Midi Fighter Utility: Tools -> Midifighter -> Load Custom Firmware -> For a 64."
            }
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Model {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Model::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownModel(name.to_string()))
    }
}

/// A named boolean feature toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptionKey {
    #[serde(rename = "Custom Palette", alias = "CustomPalette", alias = "custom-palette")]
    CustomPalette,
    #[serde(
        rename = "Apollo Studio Fast LED Mod",
        alias = "ApolloFastLed",
        alias = "apollo-fast-led"
    )]
    ApolloFastLed,
    #[serde(rename = "Novation ID Spoof", alias = "NovationIdSpoof", alias = "novation-id-spoof")]
    NovationIdSpoof,
}

impl OptionKey {
    pub const ALL: [OptionKey; 3] = [
        OptionKey::CustomPalette,
        OptionKey::ApolloFastLed,
        OptionKey::NovationIdSpoof,
    ];

    /// Label used by the original option toggles
    pub fn label(&self) -> &'static str {
        match self {
            OptionKey::CustomPalette => "Custom Palette",
            OptionKey::ApolloFastLed => "Apollo Studio Fast LED Mod",
            OptionKey::NovationIdSpoof => "Novation ID Spoof",
        }
    }

    /// Kebab-case name for command line flags
    pub fn flag(&self) -> &'static str {
        match self {
            OptionKey::CustomPalette => "custom-palette",
            OptionKey::ApolloFastLed => "apollo-fast-led",
            OptionKey::NovationIdSpoof => "novation-id-spoof",
        }
    }

    /// Parse any of the label, variant or flag spellings
    pub fn parse(name: &str) -> Option<Self> {
        let wanted = squash(name);
        OptionKey::ALL.into_iter().find(|key| {
            [squash(key.label()), squash(key.flag()), format!("{:?}", key).to_ascii_lowercase()]
                .contains(&wanted)
        })
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Set of enabled patch options
///
/// Built from a name -> bool map; names that are not known option keys are
/// dropped rather than rejected, as are options switched off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, bool>", into = "BTreeMap<String, bool>")]
pub struct PatchOptions {
    enabled: BTreeSet<OptionKey>,
}

impl PatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style enable
    pub fn with(mut self, key: OptionKey) -> Self {
        self.enabled.insert(key);
        self
    }

    pub fn set(&mut self, key: OptionKey, on: bool) {
        if on {
            self.enabled.insert(key);
        } else {
            self.enabled.remove(&key);
        }
    }

    pub fn is_enabled(&self, key: OptionKey) -> bool {
        self.enabled.contains(&key)
    }

    /// Enabled options in key order
    pub fn iter(&self) -> impl Iterator<Item = OptionKey> + '_ {
        self.enabled.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }

    pub fn from_flags<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        for (name, on) in flags {
            match OptionKey::parse(name.as_ref()) {
                Some(key) => options.set(key, on),
                None => debug!(option = %name.as_ref(), "Ignoring unknown patch option"),
            }
        }
        options
    }
}

impl From<BTreeMap<String, bool>> for PatchOptions {
    fn from(map: BTreeMap<String, bool>) -> Self {
        Self::from_flags(map)
    }
}

impl From<PatchOptions> for BTreeMap<String, bool> {
    fn from(options: PatchOptions) -> Self {
        options
            .enabled
            .into_iter()
            .map(|key| (key.label().to_string(), true))
            .collect()
    }
}

impl FromIterator<OptionKey> for PatchOptions {
    fn from_iter<T: IntoIterator<Item = OptionKey>>(iter: T) -> Self {
        Self {
            enabled: iter.into_iter().collect(),
        }
    }
}
