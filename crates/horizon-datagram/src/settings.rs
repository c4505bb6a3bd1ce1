//! Plain-data server settings loadable from TOML.
//!
//! Only the non-function parts of a configuration can be expressed here;
//! handlers and hooks are always set in code. Apply settings with
//! [`UdpServerConfig::apply_settings`](crate::UdpServerConfig::apply_settings).
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 12012
//! wiretap = false
//! loop_threads = 2
//! high_water_mark = 256
//! low_water_mark = 64
//!
//! [options]
//! so_rcvbuf = 1048576
//! so_reuseaddr = true
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::options::ChannelOptions;

/// Server settings. Every field is optional; absent fields leave the
/// configuration unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Bind host.
    pub host: Option<String>,
    /// Bind port.
    pub port: Option<u16>,
    /// Enable the wiretap.
    pub wiretap: Option<bool>,
    /// Run on a dedicated group with this many loops.
    pub loop_threads: Option<usize>,
    /// Inbound queue high-water mark.
    pub high_water_mark: Option<usize>,
    /// Inbound queue low-water mark.
    pub low_water_mark: Option<usize>,
    /// Channel options merged over the configured ones.
    pub options: ChannelOptions,
}

impl ServerSettings {
    /// Parse settings from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Settings(e.to_string()))
    }

    /// Render the settings as a TOML document.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Settings(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{OptionValue, keys};

    #[test]
    fn test_empty_document() {
        assert_eq!(ServerSettings::from_toml_str("").unwrap(), ServerSettings::default());
    }

    #[test]
    fn test_option_value_types() {
        let settings = ServerSettings::from_toml_str(
            r#"
            [options]
            so_rcvbuf = 4096
            so_broadcast = false
            "vendor.label" = "edge"
            "#,
        )
        .unwrap();

        assert_eq!(settings.options.get_int(keys::SO_RCVBUF), Some(4096));
        assert_eq!(settings.options.get_bool(keys::SO_BROADCAST), Some(false));
        assert_eq!(
            settings.options.get("vendor.label"),
            Some(&OptionValue::Str("edge".into()))
        );
    }

    #[test]
    fn test_rejects_bad_documents() {
        assert!(matches!(
            ServerSettings::from_toml_str("port = 70000"),
            Err(ConfigError::Settings(_))
        ));
        assert!(matches!(
            ServerSettings::from_toml_str("colour = \"red\""),
            Err(ConfigError::Settings(_))
        ));
    }

    #[test]
    fn test_render() {
        let settings = ServerSettings {
            host: Some("127.0.0.1".into()),
            port: Some(9),
            ..Default::default()
        };
        let rendered = settings.to_toml_string().unwrap();
        assert!(rendered.contains("host = \"127.0.0.1\""));
        assert_eq!(ServerSettings::from_toml_str(&rendered).unwrap(), settings);
    }
}
