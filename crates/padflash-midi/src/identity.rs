//! Universal Device Inquiry request and reply handling
//!
//! Devices answer `F0 7E 7F 06 01 F7` with
//! `F0 7E <channel> 06 02 <manufacturer> <family:2> <member:2> <version:4> F7`.
//! The family code tells both the hardware family and whether the
//! device is running its bootloader.

use padflash_core::{DeviceIdentity, DeviceMode, DeviceState};
use serde::Serialize;

/// Identity request addressed to all devices
pub const INQUIRY_REQUEST: [u8; 6] = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7];

/// Novation / Focusrite manufacturer id
pub const NOVATION: [u8; 3] = [0x00, 0x20, 0x29];

/// DJ TechTools manufacturer id
pub const DJ_TECHTOOLS: [u8; 3] = [0x00, 0x01, 0x79];

/// Known family codes, as sent on the wire (LSB first)
const FAMILIES: &[([u8; 3], [u8; 2], DeviceIdentity, DeviceMode)] = &[
    (NOVATION, [0x03, 0x01], DeviceIdentity::LaunchpadX, DeviceMode::Normal),
    (NOVATION, [0x11, 0x01], DeviceIdentity::LaunchpadX, DeviceMode::Bootloader),
    (NOVATION, [0x13, 0x01], DeviceIdentity::LaunchpadMiniMk3, DeviceMode::Normal),
    (NOVATION, [0x12, 0x01], DeviceIdentity::LaunchpadMiniMk3, DeviceMode::Bootloader),
    (NOVATION, [0x23, 0x01], DeviceIdentity::LaunchpadProMk3, DeviceMode::Normal),
    (NOVATION, [0x21, 0x01], DeviceIdentity::LaunchpadProMk3, DeviceMode::Bootloader),
    (NOVATION, [0x51, 0x00], DeviceIdentity::LaunchpadPro, DeviceMode::Normal),
    (NOVATION, [0x71, 0x00], DeviceIdentity::LaunchpadPro, DeviceMode::Bootloader),
    (NOVATION, [0x69, 0x00], DeviceIdentity::LaunchpadMk2, DeviceMode::Normal),
    (NOVATION, [0x79, 0x00], DeviceIdentity::LaunchpadMk2, DeviceMode::Bootloader),
    (DJ_TECHTOOLS, [0x64, 0x00], DeviceIdentity::MidiFighter64, DeviceMode::Normal),
];

/// Parsed identity reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityReply {
    pub channel: u8,
    pub manufacturer: [u8; 3],
    pub family: [u8; 2],
    pub member: [u8; 2],
    pub version: [u8; 4],
}

impl IdentityReply {
    /// Parse an identity reply, returning `None` for any other message
    pub fn parse(message: &[u8]) -> Option<Self> {
        let body = message
            .strip_prefix(&[0xF0, 0x7E])?
            .strip_suffix(&[0xF7])?;
        let (&channel, rest) = body.split_first()?;
        let rest = rest.strip_prefix(&[0x06, 0x02])?;

        // One-byte ids are widened to the three-byte form
        let (manufacturer, rest) = match rest.split_first()? {
            (&0x00, tail) if tail.len() >= 2 => ([0x00, tail[0], tail[1]], &tail[2..]),
            (&id, tail) => ([id, 0x00, 0x00], tail),
        };

        if rest.len() != 8 {
            return None;
        }
        Some(Self {
            channel,
            manufacturer,
            family: [rest[0], rest[1]],
            member: [rest[2], rest[3]],
            version: [rest[4], rest[5], rest[6], rest[7]],
        })
    }

    /// Classify the reply against the known family table
    pub fn device_state(&self) -> Option<DeviceState> {
        FAMILIES
            .iter()
            .find(|(manufacturer, family, _, _)| {
                *manufacturer == self.manufacturer && *family == self.family
            })
            .map(|(_, _, identity, mode)| DeviceState::new(*identity, *mode))
    }

    /// Version digits as reported, e.g. "0441"
    pub fn version_string(&self) -> String {
        self.version
            .iter()
            .map(|digit| char::from_digit(u32::from(*digit), 10).unwrap_or('?'))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(manufacturer: &[u8], family: [u8; 2]) -> Vec<u8> {
        let mut message = vec![0xF0, 0x7E, 0x00, 0x06, 0x02];
        message.extend_from_slice(manufacturer);
        message.extend_from_slice(&family);
        message.extend_from_slice(&[0x00, 0x00, 0x00, 0x04, 0x04, 0x01, 0xF7]);
        message
    }

    #[test]
    fn test_parse_novation_reply() {
        let parsed = IdentityReply::parse(&reply(&NOVATION, [0x03, 0x01])).unwrap();
        assert_eq!(parsed.manufacturer, NOVATION);
        assert_eq!(parsed.family, [0x03, 0x01]);
        assert_eq!(parsed.version_string(), "0441");
        assert_eq!(
            parsed.device_state(),
            Some(DeviceState::normal(DeviceIdentity::LaunchpadX))
        );
    }

    #[test]
    fn test_bootloader_families() {
        let parsed = IdentityReply::parse(&reply(&NOVATION, [0x71, 0x00])).unwrap();
        assert_eq!(
            parsed.device_state(),
            Some(DeviceState::bootloader(DeviceIdentity::LaunchpadPro))
        );

        let parsed = IdentityReply::parse(&reply(&NOVATION, [0x79, 0x00])).unwrap();
        assert_eq!(
            parsed.device_state(),
            Some(DeviceState::bootloader(DeviceIdentity::LaunchpadMk2))
        );
    }

    #[test]
    fn test_midi_fighter() {
        let parsed = IdentityReply::parse(&reply(&DJ_TECHTOOLS, [0x64, 0x00])).unwrap();
        assert_eq!(
            parsed.device_state(),
            Some(DeviceState::normal(DeviceIdentity::MidiFighter64))
        );
    }

    #[test]
    fn test_single_byte_manufacturer() {
        let parsed = IdentityReply::parse(&reply(&[0x41], [0x10, 0x00])).unwrap();
        assert_eq!(parsed.manufacturer, [0x41, 0x00, 0x00]);
        assert_eq!(parsed.device_state(), None);
    }

    #[test]
    fn test_unknown_family() {
        let parsed = IdentityReply::parse(&reply(&NOVATION, [0x7F, 0x7F])).unwrap();
        assert_eq!(parsed.device_state(), None);
    }

    #[test]
    fn test_rejects_other_messages() {
        assert_eq!(IdentityReply::parse(&INQUIRY_REQUEST), None);
        assert_eq!(IdentityReply::parse(&[0x90, 0x3C, 0x7F]), None);
        assert_eq!(IdentityReply::parse(&[]), None);

        let mut truncated = reply(&NOVATION, [0x03, 0x01]);
        truncated.remove(10);
        assert_eq!(IdentityReply::parse(&truncated), None);
    }
}
