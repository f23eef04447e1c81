//! Chunk and file identifiers.
//!
//! Every chunk in a cloud store is identified by a randomly minted 128 bit
//! GUID. The GUID is stored as four little-endian `u32` words and printed
//! as 32 upper-case hex digits, which is also the form used in file names
//! and JSON manifests.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use uuid::Uuid;

use crate::lib_error_handling::BuildPatchError;

/// Number of sharding sub directories used for chunk storage.
pub const NUM_GROUPS: u32 = 100;

/// A 128 bit identifier made of four 32 bit words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}

impl Guid {
    pub const fn new(a: u32, b: u32, c: u32, d: u32) -> Self {
        Self { a, b, c, d }
    }

    /// Mints a fresh random GUID.
    ///
    /// GUIDs are never derived from content, so two chunks with identical
    /// bytes minted in separate runs get distinct identities.
    pub fn new_random() -> Self {
        let bytes = *Uuid::new_v4().as_bytes();
        let word = |i: usize| {
            u32::from_be_bytes([
                bytes[i],
                bytes[i + 1],
                bytes[i + 2],
                bytes[i + 3],
            ])
        };
        Self::new(word(0), word(4), word(8), word(12))
    }

    pub fn is_valid(&self) -> bool {
        (self.a | self.b | self.c | self.d) != 0
    }

    /// The 16 bytes used when hashing or serializing the GUID.
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.a.to_le_bytes());
        out[4..8].copy_from_slice(&self.b.to_le_bytes());
        out[8..12].copy_from_slice(&self.c.to_le_bytes());
        out[12..16].copy_from_slice(&self.d.to_le_bytes());
        out
    }

    /// Returns the storage group (sub directory index) for this GUID.
    ///
    /// The group is the CRC32 of the little-endian GUID words modulo
    /// `NUM_GROUPS`.
    pub fn group_number(&self) -> u8 {
        (crc32fast::hash(&self.to_le_bytes()) % NUM_GROUPS) as u8
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}{:08X}", self.a, self.b, self.c, self.d)
    }
}

impl FromStr for Guid {
    type Err = BuildPatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BuildPatchError::InvalidGuid(s.to_string()));
        }

        let word = |i: usize| {
            u32::from_str_radix(&s[i * 8..(i + 1) * 8], 16)
                .map_err(|_| BuildPatchError::InvalidGuid(s.to_string()))
        };

        Ok(Self::new(word(0)?, word(1)?, word(2)?, word(3)?))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let guid = Guid::new(0x1, 0xDEADBEEF, 0x0, 0xFFFFFFFF);
        let text = guid.to_string();
        assert_eq!(text, "00000001DEADBEEF00000000FFFFFFFF");
        assert_eq!(text.to_lowercase().parse::<Guid>().unwrap(), guid);
    }

    #[test]
    fn test_rejects_bad_text() {
        assert!("1234".parse::<Guid>().is_err());
        assert!("ZZZZZZZZDEADBEEF00000000FFFFFFFF".parse::<Guid>().is_err());
        assert!("+1234567DEADBEEF00000000FFFFFFFF".parse::<Guid>().is_err());
        assert!("12345678DEADBEEF+0000000FFFFFFFF".parse::<Guid>().is_err());
    }

    #[test]
    fn test_random_guids_differ() {
        let first = Guid::new_random();
        let second = Guid::new_random();
        assert!(first.is_valid());
        assert_ne!(first, second);
    }

    #[test]
    fn test_group_number_in_range() {
        for _ in 0..64 {
            assert!(u32::from(Guid::new_random().group_number()) < NUM_GROUPS);
        }
        let guid = Guid::new(1, 2, 3, 4);
        assert_eq!(guid.group_number(), guid.group_number());
    }
}
