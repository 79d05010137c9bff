//! Run configuration.
//!
//! Values come from a JSON file (upper-case keys, numbers may be strings) and
//! are overridden by command-line flags. Every required key must be present
//! once both sources are merged; nothing is defaulted silently except the
//! session timeout.

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracker_ota_protocol::espota::DEFAULT_OTA_PORT;
use tracker_ota_protocol::StartOtaCommand;

use crate::error::ConfigError;
use crate::registry::UploadPlan;
use crate::token::RunToken;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;

const REQUIRED_KEYS: [&str; 7] = [
    "PORT",
    "HOST",
    "OTAPORT",
    "OTAPASSWORD",
    "FILE",
    "SSID",
    "PASSWORD",
];

/// A config value as written by hand: `9000` and `"9000"` are both accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Number(u64),
    Text(String),
}

impl ConfigValue {
    fn is_present(&self) -> bool {
        match self {
            ConfigValue::Number(value) => *value != 0,
            ConfigValue::Text(value) => !value.is_empty(),
        }
    }

    fn text(&self) -> String {
        match self {
            ConfigValue::Number(value) => value.to_string(),
            ConfigValue::Text(value) => value.clone(),
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::Number(value) => Some(*value),
            ConfigValue::Text(value) => value.trim().parse().ok(),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        ConfigValue::Number(value)
    }
}

/// Unvalidated settings from one source (file or command line).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ConfigSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<ConfigValue>,
    #[serde(rename = "OTAPORT", default, skip_serializing_if = "Option::is_none")]
    pub ota_port: Option<ConfigValue>,
    #[serde(rename = "OTAPASSWORD", default, skip_serializing_if = "Option::is_none")]
    pub ota_password: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_timeout_secs: Option<ConfigValue>,
}

impl ConfigSource {
    /// The file written when no config exists yet.
    pub fn example() -> Self {
        Self {
            port: Some(ConfigValue::Number(9000)),
            host: Some("192.168.1.2".into()),
            ota_port: Some(u64::from(DEFAULT_OTA_PORT).into()),
            ota_password: Some("SlimeVR-OTA".into()),
            file: Some("./firmware.bin".into()),
            ssid: Some("wifi-ssid".into()),
            password: Some("wifi-password".into()),
            session_timeout_secs: None,
        }
    }

    /// Values set in `overrides` win.
    pub fn merge(self, overrides: ConfigSource) -> ConfigSource {
        ConfigSource {
            port: overrides.port.or(self.port),
            host: overrides.host.or(self.host),
            ota_port: overrides.ota_port.or(self.ota_port),
            ota_password: overrides.ota_password.or(self.ota_password),
            file: overrides.file.or(self.file),
            ssid: overrides.ssid.or(self.ssid),
            password: overrides.password.or(self.password),
            session_timeout_secs: overrides.session_timeout_secs.or(self.session_timeout_secs),
        }
    }

    fn required(&self) -> [(&'static str, Option<&ConfigValue>); 7] {
        [
            (REQUIRED_KEYS[0], self.port.as_ref()),
            (REQUIRED_KEYS[1], self.host.as_ref()),
            (REQUIRED_KEYS[2], self.ota_port.as_ref()),
            (REQUIRED_KEYS[3], self.ota_password.as_ref()),
            (REQUIRED_KEYS[4], self.file.as_ref()),
            (REQUIRED_KEYS[5], self.ssid.as_ref()),
            (REQUIRED_KEYS[6], self.password.as_ref()),
        ]
    }

    /// Required keys that are absent or empty, in canonical order.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        self.required()
            .into_iter()
            .filter(|(_, value)| !value.is_some_and(ConfigValue::is_present))
            .map(|(key, _)| key)
            .collect()
    }
}

/// Validated settings for one run.
#[derive(Clone)]
pub struct OtaConfig {
    pub listen_port: u16,
    pub host: Ipv4Addr,
    pub ota_port: u16,
    pub ota_password: String,
    pub firmware: PathBuf,
    pub ssid: String,
    pub wifi_password: String,
    pub session_timeout: Option<Duration>,
}

impl fmt::Debug for OtaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaConfig")
            .field("listen_port", &self.listen_port)
            .field("host", &self.host)
            .field("ota_port", &self.ota_port)
            .field("firmware", &self.firmware)
            .field("ssid", &self.ssid)
            .field("session_timeout", &self.session_timeout)
            .finish_non_exhaustive()
    }
}

impl OtaConfig {
    /// Validates merged settings. Checks that the firmware image exists.
    pub fn from_source(source: &ConfigSource) -> Result<Self, ConfigError> {
        let missing = source.missing_keys();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let text = |value: &Option<ConfigValue>| {
            value.as_ref().map(ConfigValue::text).unwrap_or_default()
        };

        let listen_port = parse_port("PORT", source.port.as_ref())?;
        let ota_port = parse_port("OTAPORT", source.ota_port.as_ref())?;

        let host_text = text(&source.host);
        let host = host_text
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidValue {
                key: "HOST",
                reason: format!("{:?} is not an IPv4 address", host_text),
            })?;

        let ssid = text(&source.ssid);
        let wifi_password = text(&source.password);
        StartOtaCommand::validate_credentials(&ssid, &wifi_password).map_err(|err| {
            ConfigError::InvalidValue {
                key: "SSID/PASSWORD",
                reason: err.to_string(),
            }
        })?;

        let session_timeout = match source.session_timeout_secs.as_ref() {
            None => Some(Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS)),
            Some(value) => match value.as_u64() {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => {
                    return Err(ConfigError::InvalidValue {
                        key: "SESSION_TIMEOUT_SECS",
                        reason: format!("{:?} is not a number of seconds", value.text()),
                    })
                }
            },
        };

        let firmware = PathBuf::from(text(&source.file));
        if !firmware.is_file() {
            return Err(ConfigError::FirmwareNotFound(firmware));
        }

        Ok(Self {
            listen_port,
            host,
            ota_port,
            ota_password: text(&source.ota_password),
            firmware,
            ssid,
            wifi_password,
            session_timeout,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.listen_port))
    }

    pub fn upload_plan(&self) -> UploadPlan {
        UploadPlan {
            image: self.firmware.clone(),
            ota_port: self.ota_port,
            ota_password: self.ota_password.clone(),
            session_timeout: self.session_timeout,
        }
    }

    pub fn start_command(&self, token: &RunToken) -> StartOtaCommand {
        StartOtaCommand {
            token: *token.as_bytes(),
            port: self.listen_port,
            host: self.host,
            ssid: self.ssid.clone(),
            password: self.wifi_password.clone(),
        }
    }
}

fn parse_port(key: &'static str, value: Option<&ConfigValue>) -> Result<u16, ConfigError> {
    let invalid = |value: Option<&ConfigValue>| ConfigError::InvalidValue {
        key,
        reason: format!(
            "{:?} is not a port number (1-65535)",
            value.map(ConfigValue::text).unwrap_or_default()
        ),
    };
    let number = value.and_then(ConfigValue::as_u64).ok_or_else(|| invalid(value))?;
    match u16::try_from(number) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(invalid(value)),
    }
}

/// Reads a config file. A missing file yields `Ok(None)`.
pub fn read_config_file(path: &Path) -> Result<Option<ConfigSource>, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| ConfigError::Malformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
}

pub fn write_example_config(path: &Path) -> Result<(), ConfigError> {
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let content = serde_json::to_string_pretty(&ConfigSource::example())
        .map_err(|err| write_error(std::io::Error::other(err)))?;
    fs::write(path, content).map_err(write_error)
}

/// Loads `path`, applies `overrides` and validates the result.
///
/// When the file is missing and the overrides alone are incomplete, an
/// example file is generated and loading fails so the operator can edit it.
pub fn load(path: &Path, overrides: ConfigSource) -> Result<OtaConfig, ConfigError> {
    let merged = match read_config_file(path)? {
        Some(file) => file.merge(overrides),
        None if overrides.missing_keys().is_empty() => overrides,
        None => {
            write_example_config(path)?;
            return Err(ConfigError::ExampleWritten(path.to_path_buf()));
        }
    };
    OtaConfig::from_source(&merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn firmware(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("firmware.bin");
        std::fs::write(&path, [0u8; 64]).expect("write firmware");
        path
    }

    fn complete(firmware: &Path) -> ConfigSource {
        ConfigSource {
            file: Some(ConfigValue::Text(firmware.to_string_lossy().into_owned())),
            ..ConfigSource::example()
        }
    }

    #[test]
    fn missing_file_writes_example() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.json");

        let err = load(&path, ConfigSource::default()).unwrap_err();

        assert!(matches!(err, ConfigError::ExampleWritten(_)));
        let written = read_config_file(&path).expect("read").expect("exists");
        assert_eq!(written, ConfigSource::example());
    }

    #[test]
    fn complete_overrides_need_no_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.json");
        let config = load(&path, complete(&firmware(&dir))).expect("load");

        assert_eq!(config.listen_port, 9000);
        assert!(!path.exists());
    }

    #[test]
    fn accepts_numbers_as_strings() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.json");
        let json = serde_json::json!({
            "PORT": "9100",
            "HOST": "10.0.0.5",
            "OTAPORT": 3232,
            "OTAPASSWORD": "secret",
            "FILE": firmware(&dir),
            "SSID": "net",
            "PASSWORD": "pw",
            "SESSION_TIMEOUT_SECS": "0"
        });
        std::fs::write(&path, json.to_string()).expect("write config");

        let config = load(&path, ConfigSource::default()).expect("load");
        assert_eq!(config.listen_port, 9100);
        assert_eq!(config.ota_port, 3232);
        assert_eq!(config.host, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(config.session_timeout, None);
    }

    #[test]
    fn overrides_win_over_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.json");
        let file = complete(&firmware(&dir));
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).expect("write config");

        let overrides = ConfigSource {
            port: Some("9500".into()),
            ..ConfigSource::default()
        };
        let config = load(&path, overrides).expect("load");
        assert_eq!(config.listen_port, 9500);
        assert_eq!(
            config.session_timeout,
            Some(Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS))
        );
    }

    #[test]
    fn reports_every_missing_key() {
        let source = ConfigSource {
            port: Some(ConfigValue::Number(9000)),
            ssid: Some("".into()),
            ..ConfigSource::default()
        };
        let err = OtaConfig::from_source(&source).unwrap_err();
        match err {
            ConfigError::Missing(keys) => assert_eq!(
                keys,
                vec!["HOST", "OTAPORT", "OTAPASSWORD", "FILE", "SSID", "PASSWORD"]
            ),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn rejects_missing_firmware() {
        let source = complete(Path::new("/definitely/not/firmware.bin"));
        assert!(matches!(
            OtaConfig::from_source(&source),
            Err(ConfigError::FirmwareNotFound(_))
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let dir = TempDir::new().expect("temp dir");
        let base = complete(&firmware(&dir));

        let port = ConfigSource {
            port: Some(ConfigValue::Number(70000)),
            ..base.clone()
        };
        assert!(matches!(
            OtaConfig::from_source(&port),
            Err(ConfigError::InvalidValue { key: "PORT", .. })
        ));

        let host = ConfigSource {
            host: Some("tracker-host.local".into()),
            ..base.clone()
        };
        assert!(matches!(
            OtaConfig::from_source(&host),
            Err(ConfigError::InvalidValue { key: "HOST", .. })
        ));

        let ssid = ConfigSource {
            ssid: Some("tab\there".into()),
            ..base
        };
        assert!(matches!(
            OtaConfig::from_source(&ssid),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write config");
        assert!(matches!(
            load(&path, ConfigSource::default()),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn start_command_carries_token_and_credentials() {
        let dir = TempDir::new().expect("temp dir");
        let config = OtaConfig::from_source(&complete(&firmware(&dir))).expect("config");
        let token = RunToken::from_bytes([7; 16]);

        let command = config.start_command(&token);
        assert_eq!(command.token, [7; 16]);
        assert_eq!(command.port, 9000);
        assert_eq!(command.host, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(command.ssid, "wifi-ssid");
        assert_eq!(command.password, "wifi-password");
    }
}
