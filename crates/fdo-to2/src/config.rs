//! Owner configuration
//!
//! Loaded from TOML, then overridden from the environment:
//!
//! ```toml
//! max_device_service_info_size = 1300
//! session_ttl_secs = 600
//! supported_kex_suites = ["ECDH256", "ECDH384"]
//! supported_cipher_suites = [1, 3]
//!
//! [[service_info]]
//! key = "devmod:active"
//! value = "f5"
//! ```

use std::path::Path;
use std::time::Duration;

use fdo_core::{CipherSuite, FdoError, FdoResult, KexSuite, DEFAULT_MAX_SERVICE_INFO_SIZE};
use serde::{Deserialize, Serialize};

use crate::service_info::{ServiceInfo, ServiceInfoKv};

/// Environment variable overriding `max_device_service_info_size`
pub const ENV_MAX_DEVICE_SERVICE_INFO_SIZE: &str = "FDO_MAX_DEVICE_SERVICE_INFO_SIZE";
/// Environment variable overriding `session_ttl_secs`
pub const ENV_SESSION_TTL_SECS: &str = "FDO_SESSION_TTL_SECS";

/// Smallest service info size the owner will negotiate
pub const MIN_SERVICE_INFO_SIZE: u16 = 256;

/// Configuration validation
pub trait ConfigValidation {
    /// Check that the configuration is usable
    fn validate(&self) -> FdoResult<()>;
}

/// Configuration defaults
pub trait ConfigDefaults {
    /// Default values
    fn defaults() -> Self;
}

/// Service info entry as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfoEntry {
    /// `module:message` key
    pub key: String,
    /// CBOR value, hex encoded
    pub value: String,
}

/// Owner-side TO2 settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    /// Largest DeviceServiceInfo the owner accepts
    pub max_device_service_info_size: u16,
    /// Largest message the owner accepts, 0 for no limit
    pub max_owner_message_size: u16,
    /// Session lifetime in seconds
    pub session_ttl_secs: u64,
    /// Key exchange suites offered to devices
    pub supported_kex_suites: Vec<KexSuite>,
    /// Cipher suite identifiers offered to devices
    pub supported_cipher_suites: Vec<CipherSuite>,
    /// Service info delivered to every device
    pub service_info: Vec<ServiceInfoEntry>,
}

impl ConfigDefaults for OwnerConfig {
    fn defaults() -> Self {
        Self {
            max_device_service_info_size: DEFAULT_MAX_SERVICE_INFO_SIZE,
            max_owner_message_size: 0,
            session_ttl_secs: 3600,
            supported_kex_suites: vec![
                KexSuite::Ecdh256,
                KexSuite::Ecdh384,
                KexSuite::DhKexId14,
                KexSuite::DhKexId15,
            ],
            supported_cipher_suites: vec![CipherSuite::A128Gcm, CipherSuite::A256Gcm],
            service_info: Vec::new(),
        }
    }
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl OwnerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> FdoResult<Self> {
        toml::from_str(content)
            .map_err(|e| FdoError::malformed(format!("invalid owner config: {e}")))
    }

    /// Load from a TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> FdoResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FdoError::internal(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn merge_with_env(&mut self) -> FdoResult<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply overrides from the given variables
    pub fn merge_with_vars<I>(&mut self, vars: I) -> FdoResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_MAX_DEVICE_SERVICE_INFO_SIZE => {
                    self.max_device_service_info_size = parse_env(&key, &value)?;
                }
                ENV_SESSION_TTL_SECS => {
                    self.session_ttl_secs = parse_env(&key, &value)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Session lifetime
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Decoded owner service info
    pub fn service_info(&self) -> FdoResult<ServiceInfo> {
        self.service_info
            .iter()
            .map(|entry| {
                let value = hex::decode(&entry.value).map_err(|e| {
                    FdoError::malformed(format!("service info {:?} is not hex: {e}", entry.key))
                })?;
                Ok(ServiceInfoKv::new(entry.key.clone(), value))
            })
            .collect()
    }

    /// Whether a kex suite may be negotiated
    pub fn supports_kex(&self, suite: KexSuite) -> bool {
        self.supported_kex_suites.contains(&suite)
    }

    /// Whether a cipher suite may be negotiated
    pub fn supports_cipher(&self, suite: CipherSuite) -> bool {
        self.supported_cipher_suites.contains(&suite)
    }
}

impl ConfigValidation for OwnerConfig {
    fn validate(&self) -> FdoResult<()> {
        if self.supported_kex_suites.is_empty() {
            return Err(FdoError::malformed("no key exchange suites configured"));
        }
        if self.supported_cipher_suites.is_empty() {
            return Err(FdoError::malformed("no cipher suites configured"));
        }
        if self.max_device_service_info_size < MIN_SERVICE_INFO_SIZE {
            return Err(FdoError::malformed(format!(
                "max_device_service_info_size must be at least {MIN_SERVICE_INFO_SIZE}"
            )));
        }
        if self.session_ttl_secs == 0 {
            return Err(FdoError::malformed("session_ttl_secs must be positive"));
        }
        self.service_info()?;
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> FdoResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| FdoError::malformed(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = OwnerConfig::defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_device_service_info_size, 1300);
        assert_eq!(config.session_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OwnerConfig::from_toml_str(
            r#"
            session_ttl_secs = 60
            supported_kex_suites = ["ECDH384"]
            supported_cipher_suites = [3]

            [[service_info]]
            key = "devmod:active"
            value = "f5"
            "#,
        )
        .unwrap();
        assert_eq!(config.session_ttl_secs, 60);
        assert_eq!(config.max_device_service_info_size, 1300);
        assert_eq!(config.supported_kex_suites, vec![KexSuite::Ecdh384]);
        assert_eq!(config.supported_cipher_suites, vec![CipherSuite::A256Gcm]);
        assert_eq!(
            config.service_info().unwrap(),
            vec![ServiceInfoKv::new("devmod:active", vec![0xf5])]
        );
    }

    #[test]
    fn test_unknown_suite_rejected() {
        assert!(OwnerConfig::from_toml_str(r#"supported_kex_suites = ["ECDH521"]"#).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OwnerConfig::defaults();
        config.supported_kex_suites.clear();
        assert!(config.validate().is_err());

        let mut config = OwnerConfig::defaults();
        config.max_device_service_info_size = 255;
        assert!(config.validate().is_err());

        let mut config = OwnerConfig::defaults();
        config.service_info.push(ServiceInfoEntry {
            key: "devmod:bad".into(),
            value: "zz".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = OwnerConfig::defaults();
        config
            .merge_with_vars([
                (ENV_MAX_DEVICE_SERVICE_INFO_SIZE.to_string(), "2048".to_string()),
                (ENV_SESSION_TTL_SECS.to_string(), " 30 ".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ])
            .unwrap();
        assert_eq!(config.max_device_service_info_size, 2048);
        assert_eq!(config.session_ttl_secs, 30);

        assert!(config
            .merge_with_vars([(ENV_SESSION_TTL_SECS.to_string(), "soon".to_string())])
            .is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_device_service_info_size = 4096").unwrap();
        let config = OwnerConfig::load_from_file(file.path()).unwrap();
        assert!(config.max_device_service_info_size >= MIN_SERVICE_INFO_SIZE);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = OwnerConfig::load_from_file(&dir.path().join("owner.toml")).unwrap_err();
        assert!(matches!(err, FdoError::InternalFailure { .. }));
    }
}
