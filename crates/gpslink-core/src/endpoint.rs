//! Endpoint value objects: Bluetooth address and RFCOMM channel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Bluetooth Address
// ============================================================================

/// A 48-bit Bluetooth device address (e.g., "64:9D:38:33:1E:D1").
///
/// Parsing accepts exactly the characters `0-9A-Fa-f:` laid out as six
/// colon-separated groups of one or two hex digits. Display is always
/// the canonical upper-case, zero-padded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BtAddress([u8; 6]);

impl BtAddress {
    /// Creates an address from raw octets in display order.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Returns the raw octets in display order.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parses and validates a textual address.
    pub fn parse(value: &str) -> DomainResult<Self> {
        let invalid = |reason: String| DomainError::InvalidAddress {
            value: value.to_string(),
            reason,
        };

        if value.is_empty() {
            return Err(invalid("empty address".to_string()));
        }

        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_hexdigit() || *c == ':'))
        {
            return Err(invalid(format!("non-hex character '{bad}'")));
        }

        let groups: Vec<&str> = value.split(':').collect();
        if groups.len() != 6 {
            return Err(invalid(format!("expected 6 groups, found {}", groups.len())));
        }

        let mut octets = [0u8; 6];
        for (slot, group) in octets.iter_mut().zip(groups.iter()) {
            if group.is_empty() || group.len() > 2 {
                return Err(invalid(format!("malformed group '{group}'")));
            }
            *slot = u8::from_str_radix(group, 16)
                .map_err(|e| invalid(format!("malformed group '{group}': {e}")))?;
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for BtAddress {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BtAddress {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BtAddress> for String {
    fn from(address: BtAddress) -> Self {
        address.to_string()
    }
}

// ============================================================================
// RFCOMM Channel
// ============================================================================

/// An RFCOMM server channel number (1..=30).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Channel(u8);

impl Channel {
    /// Standard Serial Port Profile channel, tried first when nothing is advertised.
    pub const SPP_DEFAULT: Channel = Channel(1);

    /// Highest channel number RFCOMM allows.
    pub const MAX: u8 = 30;

    /// Creates a channel, validating the RFCOMM range.
    pub fn new(number: u16) -> DomainResult<Self> {
        match u8::try_from(number) {
            Ok(n) if (1..=Self::MAX).contains(&n) => Ok(Self(n)),
            _ => Err(DomainError::InvalidChannel(number)),
        }
    }

    /// Returns the channel number.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Returns true for the standard SPP channel.
    pub fn is_default(self) -> bool {
        self == Self::SPP_DEFAULT
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for Channel {
    type Error = DomainError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Channel> for u16 {
    fn from(channel: Channel) -> Self {
        u16::from(channel.0)
    }
}

impl FromStr for Channel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number: u16 = s
            .trim()
            .parse()
            .map_err(|_| DomainError::InvalidChannel(0))?;
        Self::new(number)
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// One connectable service instance on a remote device.
///
/// Immutable once constructed; switching channel produces a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    address: BtAddress,
    channel: Channel,
}

impl Endpoint {
    pub fn new(address: BtAddress, channel: Channel) -> Self {
        Self { address, channel }
    }

    pub fn address(&self) -> BtAddress {
        self.address
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Returns an endpoint on the same device but another channel.
    #[must_use]
    pub fn with_channel(&self, channel: Channel) -> Self {
        Self {
            address: self.address,
            channel,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.channel)
    }
}
