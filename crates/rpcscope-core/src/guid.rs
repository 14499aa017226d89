//! Interface identifier handling.
//!
//! RPC interfaces are named by 128-bit identifiers laid out like a Windows
//! GUID. The discovery engine reads them raw out of resource data; the
//! registry and the event log key on the canonical braced string form, so
//! every identifier is normalized through this type before it is compared.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// 128-bit RPC interface identifier in GUID layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl InterfaceId {
    /// Size of the raw in-memory representation in bytes.
    pub const SIZE: usize = 16;

    /// Decode the in-memory layout: the first three fields little-endian,
    /// the trailing eight bytes as-is. This is how the identifier sits in a
    /// binary's resource data.
    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..16]);
        Self {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }

    /// Inverse of [`InterfaceId::from_le_bytes`].
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.data1.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.data2.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.data3.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.data4);
        bytes
    }
}

impl fmt::Display for InterfaceId {
    /// Canonical braced-hyphenated uppercase form, e.g.
    /// `{0779B52C-2D28-44AF-B054-B64B03B4AE52}`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl FromStr for InterfaceId {
    type Err = Error;

    /// Accepts the braced or bare hyphenated form in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidUuid(s.to_string());

        let bare = s
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(s);

        let mut groups = bare.split('-');
        let g1 = groups.next().ok_or_else(invalid)?;
        let g2 = groups.next().ok_or_else(invalid)?;
        let g3 = groups.next().ok_or_else(invalid)?;
        let g4 = groups.next().ok_or_else(invalid)?;
        let g5 = groups.next().ok_or_else(invalid)?;
        if groups.next().is_some()
            || g1.len() != 8
            || g2.len() != 4
            || g3.len() != 4
            || g4.len() != 4
            || g5.len() != 12
        {
            return Err(invalid());
        }

        let data1 = u32::from_str_radix(g1, 16).map_err(|_| invalid())?;
        let data2 = u16::from_str_radix(g2, 16).map_err(|_| invalid())?;
        let data3 = u16::from_str_radix(g3, 16).map_err(|_| invalid())?;
        let clock = u16::from_str_radix(g4, 16).map_err(|_| invalid())?;
        let node = u64::from_str_radix(g5, 16).map_err(|_| invalid())?;

        let clock = clock.to_be_bytes();
        let node = node.to_be_bytes();
        Ok(Self {
            data1,
            data2,
            data3,
            data4: [
                clock[0], clock[1], node[2], node[3], node[4], node[5], node[6], node[7],
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_round_trip() {
        let id: InterfaceId = "{0779B52C-2D28-44AF-B054-B64B03B4AE52}".parse().unwrap();
        assert_eq!(id.to_string(), "{0779B52C-2D28-44AF-B054-B64B03B4AE52}");
    }

    #[test]
    fn parse_accepts_bare_and_lowercase() {
        let braced: InterfaceId = "{12345678-ABCD-EF01-2345-6789ABCDEF01}".parse().unwrap();
        let bare: InterfaceId = "12345678-abcd-ef01-2345-6789abcdef01".parse().unwrap();
        assert_eq!(braced, bare);
        assert_eq!(bare.to_string(), "{12345678-ABCD-EF01-2345-6789ABCDEF01}");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("not-a-uuid".parse::<InterfaceId>().is_err());
        assert!("{12345678-ABCD-EF01-2345}".parse::<InterfaceId>().is_err());
        assert!(
            "12345678-ABCD-EF01-2345-6789ABCDEF0Z"
                .parse::<InterfaceId>()
                .is_err()
        );
        assert!(
            "123456789-BCD-EF01-2345-6789ABCDEF01"
                .parse::<InterfaceId>()
                .is_err()
        );
    }

    #[test]
    fn le_bytes_round_trip() {
        let id: InterfaceId = "{0779B52C-2D28-44AF-B054-B64B03B4AE52}".parse().unwrap();
        assert_eq!(InterfaceId::from_le_bytes(id.to_le_bytes()), id);
    }

    #[test]
    fn le_bytes_field_order() {
        let bytes: [u8; 16] = [
            0x2C, 0xB5, 0x79, 0x07, // data1, little-endian
            0x28, 0x2D, // data2
            0xAF, 0x44, // data3
            0xB0, 0x54, 0xB6, 0x4B, 0x03, 0xB4, 0xAE, 0x52, // data4 as-is
        ];
        let id = InterfaceId::from_le_bytes(bytes);
        assert_eq!(id.to_string(), "{0779B52C-2D28-44AF-B054-B64B03B4AE52}");
    }
}
