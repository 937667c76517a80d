// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use schemars::JsonSchema;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt::{self, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl PartialOrd for Prefix4 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix4 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix4 {
    pub const HOST_MASK: u8 = 32;

    /// Create a new `Prefix4` from an IP address and mask length. The
    /// newly created `Prefix4` has its host bits zeroed upon creation.
    pub fn new(ip: Ipv4Addr, length: u8) -> Self {
        let mut new = Self { value: ip, length };
        new.unset_host_bits();
        new
    }

    pub fn unset_host_bits(&mut self) {
        let mask = match self.length {
            0 => 0,
            _ => (!0u32) << (32 - self.length),
        };

        self.value = Ipv4Addr::from_bits(self.value.to_bits() & mask)
    }

    /// Check if this prefix is contained within another prefix.
    /// Returns true if this prefix is equal to or more specific than the
    /// other.
    pub fn within(&self, other: &Prefix4) -> bool {
        // A less specific prefix cannot be within a more specific one
        if self.length < other.length {
            return false;
        }

        if other.length == 0 {
            // /0 contains everything
            return true;
        }

        let mask = !0u32 << (32 - other.length);
        self.value.to_bits() & mask == other.value.to_bits() & mask
    }

    /// The value of the `i`th bit of the network address, counting from
    /// the most significant bit. Callers must keep `i` below the mask
    /// length.
    pub fn bit(&self, i: u8) -> bool {
        (self.value.to_bits() >> (31 - i)) & 1 == 1
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) = s
            .split_once('/')
            .ok_or(Error::InvalidPrefix(s.to_string()))?;

        let value: Ipv4Addr = value
            .parse()
            .map_err(|_| Error::InvalidPrefix(s.to_string()))?;
        let length: u8 = length
            .parse()
            .map_err(|_| Error::InvalidPrefix(s.to_string()))?;
        if length > Self::HOST_MASK {
            return Err(Error::InvalidPrefix(s.to_string()));
        }
        Ok(Self::new(value, length))
    }
}

#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct Prefix6 {
    pub value: Ipv6Addr,
    pub length: u8,
}

impl PartialOrd for Prefix6 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix6 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix6 {
    pub const HOST_MASK: u8 = 128;

    /// Create a new `Prefix6` from an IP address and mask length. The
    /// newly created `Prefix6` has its host bits zeroed upon creation.
    pub fn new(ip: Ipv6Addr, length: u8) -> Self {
        let mut new = Self { value: ip, length };
        new.unset_host_bits();
        new
    }

    pub fn unset_host_bits(&mut self) {
        let mask = match self.length {
            0 => 0,
            _ => (!0u128) << (128 - self.length),
        };

        self.value = Ipv6Addr::from_bits(self.value.to_bits() & mask)
    }

    /// Check if this prefix is contained within another prefix.
    /// Returns true if this prefix is equal to or more specific than the
    /// other.
    pub fn within(&self, other: &Prefix6) -> bool {
        if self.length < other.length {
            return false;
        }

        if other.length == 0 {
            return true;
        }

        let mask = !0u128 << (128 - other.length);
        self.value.to_bits() & mask == other.value.to_bits() & mask
    }

    /// The value of the `i`th bit of the network address, counting from
    /// the most significant bit.
    pub fn bit(&self, i: u8) -> bool {
        (self.value.to_bits() >> (127 - i)) & 1 == 1
    }
}

impl fmt::Display for Prefix6 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix6 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) = s
            .split_once('/')
            .ok_or(Error::InvalidPrefix(s.to_string()))?;

        let value: Ipv6Addr = value
            .parse()
            .map_err(|_| Error::InvalidPrefix(s.to_string()))?;
        let length: u8 = length
            .parse()
            .map_err(|_| Error::InvalidPrefix(s.to_string()))?;
        if length > Self::HOST_MASK {
            return Err(Error::InvalidPrefix(s.to_string()));
        }
        Ok(Self::new(value, length))
    }
}

/// An IPv4 or IPv6 CIDR prefix. Address families are never comparable:
/// a `V4` prefix is not within, equal to or ordered against a `V6` one.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl Prefix {
    pub fn length(&self) -> u8 {
        match self {
            Self::V4(p) => p.length,
            Self::V6(p) => p.length,
        }
    }

    pub fn max_length(&self) -> u8 {
        match self {
            Self::V4(_) => Prefix4::HOST_MASK,
            Self::V6(_) => Prefix6::HOST_MASK,
        }
    }

    pub fn bit(&self, i: u8) -> bool {
        match self {
            Self::V4(p) => p.bit(i),
            Self::V6(p) => p.bit(i),
        }
    }

    /// Check if this prefix is equal to or more specific than `other`.
    /// Prefixes of different address families are never within each
    /// other.
    pub fn within(&self, other: &Prefix) -> bool {
        match (self, other) {
            (Self::V4(a), Self::V4(b)) => a.within(b),
            (Self::V6(a), Self::V6(b)) => a.within(b),
            _ => false,
        }
    }

    /// The immediate covering supernet, one bit shorter, or `None` for
    /// a zero-length prefix.
    pub fn parent(&self) -> Option<Prefix> {
        match self {
            Self::V4(p) => match p.length {
                0 => None,
                n => Some(Self::V4(Prefix4::new(p.value, n - 1))),
            },
            Self::V6(p) => match p.length {
                0 => None,
                n => Some(Self::V6(Prefix6::new(p.value, n - 1))),
            },
        }
    }
}

impl From<Prefix4> for Prefix {
    fn from(value: Prefix4) -> Self {
        Self::V4(value)
    }
}

impl From<Prefix6> for Prefix {
    fn from(value: Prefix6) -> Self {
        Self::V6(value)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(p) => p.fmt(f),
            Self::V6(p) => p.fmt(f),
        }
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            Ok(Self::V6(s.parse()?))
        } else {
            Ok(Self::V4(s.parse()?))
        }
    }
}

// Prefixes travel on the wire in CIDR string form.
impl Serialize for Prefix {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Prefix {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(|e| D::Error::custom(format!("{e}")))
    }
}

impl JsonSchema for Prefix {
    fn schema_name() -> String {
        "Prefix".to_string()
    }

    fn json_schema(
        generator: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        String::json_schema(generator)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_parse_and_mask() {
        let p: Prefix = "10.0.0.10/24".parse().expect("parse prefix");
        assert_eq!(p.to_string(), "10.0.0.0/24");
        assert_eq!(p.length(), 24);

        let p6: Prefix = "2001:db8::1/64".parse().expect("parse prefix");
        assert_eq!(p6.to_string(), "2001:db8::/64");

        assert!("10.0.0.0".parse::<Prefix>().is_err());
        assert!("10.0.0.0/33".parse::<Prefix>().is_err());
        assert!("bogus/24".parse::<Prefix>().is_err());
    }

    #[test]
    fn prefix_within() {
        let p24: Prefix = "10.0.0.0/24".parse().unwrap();
        let p25: Prefix = "10.0.0.128/25".parse().unwrap();
        let other: Prefix = "10.0.1.0/24".parse().unwrap();
        let v6: Prefix = "2001:db8::/32".parse().unwrap();

        assert!(p25.within(&p24));
        assert!(p24.within(&p24));
        assert!(!p24.within(&p25));
        assert!(!other.within(&p24));
        assert!(!v6.within(&p24));
    }

    #[test]
    fn prefix_parent() {
        let p: Prefix = "10.0.0.128/25".parse().unwrap();
        assert_eq!(p.parent().unwrap().to_string(), "10.0.0.0/24");

        let root: Prefix = "0.0.0.0/0".parse().unwrap();
        assert!(root.parent().is_none());
    }
}
