//! Observed device state and the bootloader readiness classifier

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::Model;

/// Hardware family reported by a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceIdentity {
    LaunchpadX,
    LaunchpadMiniMk3,
    LaunchpadPro,
    LaunchpadProMk3,
    LaunchpadMk2,
    MidiFighter64,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceIdentity::LaunchpadX => "Launchpad X",
            DeviceIdentity::LaunchpadMiniMk3 => "Launchpad Mini MK3",
            DeviceIdentity::LaunchpadPro => "Launchpad Pro",
            DeviceIdentity::LaunchpadProMk3 => "Launchpad Pro MK3",
            DeviceIdentity::LaunchpadMk2 => "Launchpad MK2",
            DeviceIdentity::MidiFighter64 => "MIDI Fighter 64",
        };
        f.write_str(name)
    }
}

/// Operating mode of a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Running application firmware
    Normal,
    /// Waiting for a firmware write
    Bootloader,
}

/// Identity and mode of the currently connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub identity: DeviceIdentity,
    pub mode: DeviceMode,
}

impl DeviceState {
    pub fn new(identity: DeviceIdentity, mode: DeviceMode) -> Self {
        Self { identity, mode }
    }

    pub fn bootloader(identity: DeviceIdentity) -> Self {
        Self::new(identity, DeviceMode::Bootloader)
    }

    pub fn normal(identity: DeviceIdentity) -> Self {
        Self::new(identity, DeviceMode::Normal)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            DeviceMode::Normal => write!(f, "{}", self.identity),
            DeviceMode::Bootloader => write!(f, "{} (bootloader)", self.identity),
        }
    }
}

/// Whether a device in `state` can accept a firmware image for `target`
pub fn is_ready(state: &DeviceState, target: Model) -> bool {
    state.mode == DeviceMode::Bootloader
        && target.accepting_bootloaders().contains(&state.identity)
}
