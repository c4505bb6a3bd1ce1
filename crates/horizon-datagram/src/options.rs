//! Channel options passed through to the transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Well-known option keys understood by the built-in transport.
pub mod keys {
    /// Allow rebinding an address still held by another socket (bool).
    pub const SO_REUSEADDR: &str = "so_reuseaddr";
    /// Receive buffer size in bytes (int).
    pub const SO_RCVBUF: &str = "so_rcvbuf";
    /// Send buffer size in bytes (int).
    pub const SO_SNDBUF: &str = "so_sndbuf";
    /// Permit sending to broadcast addresses (bool).
    pub const SO_BROADCAST: &str = "so_broadcast";
    /// Unicast time-to-live (int, 1..=255).
    pub const IP_TTL: &str = "ip_ttl";
    /// Loop multicast datagrams back to the local host (bool).
    pub const IP_MULTICAST_LOOP: &str = "ip_multicast_loop";
    /// Restrict an IPv6 socket to IPv6 traffic (bool).
    pub const IPV6_ONLY: &str = "ipv6_only";
}

/// A channel option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// A boolean flag.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// Free-form text.
    Str(String),
}

impl OptionValue {
    /// The value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

/// An ordered map of channel options.
///
/// Keys the transport does not know are kept and ignored by it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelOptions {
    values: BTreeMap<String, OptionValue>,
}

impl ChannelOptions {
    /// Create an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option after validating it. Replaces any earlier value.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<OptionValue>,
    ) -> Result<(), ConfigError> {
        let key = key.into();
        let value = value.into();
        validate(&key, &value)?;
        self.values.insert(key, value);
        Ok(())
    }

    /// Merge `other` into this set; keys in `other` win.
    pub fn merge(&mut self, other: &ChannelOptions) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Get an option value.
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    /// Get a boolean option.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(OptionValue::as_bool)
    }

    /// Get an integer option.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(OptionValue::as_int)
    }

    /// Remove an option, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        self.values.remove(key)
    }

    /// Iterate over options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of options.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check whether no options are set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Validate every option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.values
            .iter()
            .try_for_each(|(key, value)| validate(key, value))
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidOption {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn validate(key: &str, value: &OptionValue) -> Result<(), ConfigError> {
    match key {
        "" => Err(invalid(key, "option key is empty")),
        keys::SO_REUSEADDR | keys::SO_BROADCAST | keys::IP_MULTICAST_LOOP | keys::IPV6_ONLY => {
            value
                .as_bool()
                .map(|_| ())
                .ok_or_else(|| invalid(key, format!("expected a boolean, got {value}")))
        }
        keys::SO_RCVBUF | keys::SO_SNDBUF => match value.as_int() {
            Some(size) if size > 0 && usize::try_from(size).is_ok() => Ok(()),
            Some(size) => Err(invalid(key, format!("buffer size {size} must be positive"))),
            None => Err(invalid(key, format!("expected an integer, got {value}"))),
        },
        keys::IP_TTL => match value.as_int() {
            Some(ttl) if (1..=255).contains(&ttl) => Ok(()),
            Some(ttl) => Err(invalid(key, format!("ttl {ttl} is outside 1..=255"))),
            None => Err(invalid(key, format!("expected an integer, got {value}"))),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_keys_are_validated() {
        let mut options = ChannelOptions::new();
        assert!(options.set(keys::SO_RCVBUF, 65536).is_ok());
        assert!(options.set(keys::SO_BROADCAST, true).is_ok());

        assert!(matches!(
            options.set(keys::SO_BROADCAST, "yes"),
            Err(ConfigError::InvalidOption { .. })
        ));
        assert!(options.set(keys::SO_SNDBUF, 0).is_err());
        assert!(options.set(keys::IP_TTL, 256).is_err());
        assert!(options.set("", 1).is_err());

        assert_eq!(options.len(), 2);
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let mut options = ChannelOptions::new();
        options.set("vendor.tag", "blue").unwrap();
        assert_eq!(options.get("vendor.tag"), Some(&OptionValue::Str("blue".into())));
    }

    #[test]
    fn test_merge_later_wins() {
        let mut base = ChannelOptions::new();
        base.set(keys::SO_RCVBUF, 1024).unwrap();
        base.set(keys::SO_BROADCAST, false).unwrap();

        let mut overrides = ChannelOptions::new();
        overrides.set(keys::SO_RCVBUF, 4096).unwrap();

        base.merge(&overrides);
        assert_eq!(base.get_int(keys::SO_RCVBUF), Some(4096));
        assert_eq!(base.get_bool(keys::SO_BROADCAST), Some(false));
    }
}
