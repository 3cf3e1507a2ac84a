//! 16 byte identifiers for messages and servents.
//!
//! Identifiers generated here are 'tagged': a 16 bit value derived from two other windows of the
//!  identifier is stored at a fixed position, so that peers can recognize identifiers created by
//!  this family of implementations without any registry. A random identifier passes this check
//!  with a probability of roughly 1/65536, which is accepted.
//!
//! Requeries (automatic repetitions of a query) carry a second tag at bytes 13-14. Three legacy
//!  placements of that tag are supported for compatibility with older peers.

use std::fmt::{Debug, Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::byte_order::{i16_le_at, put_i16_le_at, put_u16_le_at, u16_le_at};
use crate::util::net_addr::{is_valid_ipv4, is_valid_port};
use crate::util::random::{Random, RngRandom};

pub const GUID_LEN: usize = 16;

const TAG_OFFSET: usize = 9;
const REQUERY_TAG_OFFSET: usize = 13;
const PORT_OFFSET: usize = 13;
const VERSION_OFFSET: usize = 15;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RequeryTagVersion {
    V0 = 0,
    V1 = 1,
    V2 = 2,
}
impl RequeryTagVersion {
    pub const ALL: [RequeryTagVersion; 3] = [RequeryTagVersion::V0, RequeryTagVersion::V1, RequeryTagVersion::V2];

    /// the version used for newly generated requery identifiers
    pub const CURRENT: RequeryTagVersion = RequeryTagVersion::V2;

    /// offsets of the two windows the tag is computed from
    fn windows(&self) -> (usize, usize) {
        match self {
            RequeryTagVersion::V0 => (0, 9),
            RequeryTagVersion::V1 => (0, 2),
            RequeryTagVersion::V2 => (0, 11),
        }
    }
}


#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct Guid([u8; GUID_LEN]);

impl Guid {
    pub const ZERO: Guid = Guid([0; GUID_LEN]);

    pub fn new(bytes: [u8; GUID_LEN]) -> Guid {
        Guid(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Guid> {
        let raw: [u8; GUID_LEN] = bytes.try_into()
            .map_err(|_| anyhow!("a GUID has {} bytes, got {}", GUID_LEN, bytes.len()))?;
        Ok(Guid(raw))
    }

    pub fn as_bytes(&self) -> &[u8; GUID_LEN] {
        &self.0
    }

    /// Generates a fresh, tagged identifier.
    pub fn generate() -> Guid {
        Self::generate_with_random::<RngRandom>()
    }

    pub fn generate_with_random<R: Random>() -> Guid {
        let mut bytes = R::next_u128().to_le_bytes();
        bytes[VERSION_OFFSET] = 0;
        tag_at(&mut bytes, 4, 6, TAG_OFFSET);
        Guid(bytes)
    }

    pub fn generate_for_requery(version: RequeryTagVersion) -> Guid {
        Self::generate_for_requery_with_random::<RngRandom>(version)
    }

    pub fn generate_for_requery_with_random<R: Random>(version: RequeryTagVersion) -> Guid {
        let mut result = Self::generate_with_random::<R>();
        let (first, second) = version.windows();
        tag_at(&mut result.0, first, second, REQUERY_TAG_OFFSET);
        result
    }

    pub fn is_marked(&self) -> bool {
        has_tag(&self.0, 4, 6, TAG_OFFSET)
    }

    pub fn is_requery_marked(&self, version: RequeryTagVersion) -> bool {
        let (first, second) = version.windows();
        has_tag(&self.0, first, second, REQUERY_TAG_OFFSET)
    }

    pub fn is_requery_marked_any(&self) -> bool {
        RequeryTagVersion::ALL.iter()
            .any(|v| self.is_requery_marked(*v))
    }

    /// Returns a copy of this identifier with an IPv4 address written to bytes 0-3 and a port to
    ///  bytes 13-14. This overwrites a requery tag, but leaves the primary tag intact.
    pub fn address_encode(&self, ip: Ipv4Addr, port: u16) -> anyhow::Result<Guid> {
        if !is_valid_ipv4(ip) {
            bail!("invalid address {} for encoding into a GUID", ip);
        }
        if !is_valid_port(port) {
            bail!("invalid port {} for encoding into a GUID", port);
        }

        let mut bytes = self.0;
        bytes[..4].copy_from_slice(&ip.octets());
        put_u16_le_at(&mut bytes, PORT_OFFSET, port);
        Ok(Guid(bytes))
    }

    /// Checks if an address was encoded into this identifier. Invalid addresses never match.
    pub fn addresses_match(&self, ip: Ipv4Addr, port: u16) -> bool {
        if !is_valid_ipv4(ip) || !is_valid_port(port) {
            return false;
        }
        self.matches_ip(ip) && self.port() == port
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3])
    }

    pub fn matches_ip(&self, ip: Ipv4Addr) -> bool {
        self.0[..4] == ip.octets()
    }

    pub fn port(&self) -> u16 {
        u16_le_at(&self.0, PORT_OFFSET)
    }
}

impl From<[u8; GUID_LEN]> for Guid {
    fn from(value: [u8; GUID_LEN]) -> Self {
        Guid(value)
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({})", self)
    }
}

impl FromStr for Guid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2*GUID_LEN || !s.is_ascii() {
            bail!("a GUID needs {} hex digits: {:?}", 2*GUID_LEN, s);
        }

        let mut bytes = [0u8; GUID_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[2*i..2*i + 2], 16)?;
        }
        Ok(Guid(bytes))
    }
}

/// `((a + 2) * (b + 3)) >> 8`, truncated to 16 bits. Peers check the result bit for bit, so this
///  must stay signed arithmetic with an arithmetic shift.
fn tag(a: i16, b: i16) -> i16 {
    let product = (a as i32 + 2) * (b as i32 + 3);
    (product >> 8) as i16
}

fn tag_at(bytes: &mut [u8; GUID_LEN], first: usize, second: usize, mark_point: usize) {
    let tag = tag(i16_le_at(bytes, first), i16_le_at(bytes, second));
    put_i16_le_at(bytes, mark_point, tag);
}

fn has_tag(bytes: &[u8; GUID_LEN], first: usize, second: usize, mark_point: usize) -> bool {
    tag(i16_le_at(bytes, first), i16_le_at(bytes, second)) == i16_le_at(bytes, mark_point)
}
