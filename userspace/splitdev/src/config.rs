// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! TOML configuration for a host split-device setup.
//!
//! Every field has a default, so an empty file describes the `mydevice`
//! class between domain 1 (frontend) and domain 0 (backend).

use std::fs;
use std::path::{Path, PathBuf};

use nexus_grant::DomainId;
use serde::Deserialize;
use thiserror::Error;

use crate::device::{DeviceClass, Side};
use crate::record::{Message, MESSAGE_SIZE};

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File involved.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File involved.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: toml::de::Error,
    },
    /// Values parse but cannot be used together.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// `[device]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    /// Class name used in directory paths.
    pub class: String,
    /// Device number.
    pub devid: u32,
    /// Side that grants the ring page.
    pub allocator: Side,
    /// Side that writes records.
    pub producer: Side,
    /// First record sent once connected; empty disables it.
    pub greeting: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            class: "mydevice".to_string(),
            devid: 0,
            allocator: Side::Frontend,
            producer: Side::Backend,
            greeting: "Hello world\n".to_string(),
        }
    }
}

/// `[domains]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DomainsSection {
    /// Domain running the frontend.
    pub frontend: u16,
    /// Domain running the backend.
    pub backend: u16,
}

impl Default for DomainsSection {
    fn default() -> Self {
        Self { frontend: 1, backend: 0 }
    }
}

/// `[limits]` section, applied per domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Live grants per domain.
    pub grant_entries: usize,
    /// Open event channel ports per domain.
    pub event_ports: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { grant_entries: 32, event_ports: 64 }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Device description.
    pub device: DeviceSection,
    /// Domains on each side.
    pub domains: DomainsSection,
    /// Host resource limits.
    pub limits: Limits,
}

impl Config {
    /// Reads, parses and validates `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::parse(&data, path)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, Path::new("<inline>"))
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse individually but are unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domains.frontend == self.domains.backend {
            return Err(ConfigError::Invalid(format!(
                "frontend and backend share domain {}",
                self.domains.frontend
            )));
        }
        if self.limits.grant_entries == 0 || self.limits.event_ports == 0 {
            return Err(ConfigError::Invalid("limits must be non-zero".to_string()));
        }
        if self.device.class.is_empty() || self.device.class.contains('/') {
            return Err(ConfigError::Invalid(format!("bad device class {:?}", self.device.class)));
        }
        if self.device.greeting.len() > MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "greeting is {} bytes, records hold {MESSAGE_SIZE}",
                self.device.greeting.len()
            )));
        }
        Ok(())
    }

    /// Frontend domain id.
    pub fn frontend(&self) -> DomainId {
        DomainId(self.domains.frontend)
    }

    /// Backend domain id.
    pub fn backend(&self) -> DomainId {
        DomainId(self.domains.backend)
    }

    /// Device class described by `[device]`.
    pub fn device_class(&self) -> Result<DeviceClass, ConfigError> {
        let class = DeviceClass::new(self.device.class.clone())
            .with_allocator(self.device.allocator)
            .with_producer(self.device.producer);
        if self.device.greeting.is_empty() {
            return Ok(class);
        }
        let greeting = Message::from_text(&self.device.greeting)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(class.with_greeting(greeting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        let class = config.device_class().unwrap();
        assert_eq!(class.allocator, Side::Frontend);
        assert_eq!(class.producer, Side::Backend);
        assert_eq!(class.greeting.map(|msg| msg.text()).as_deref(), Some("Hello world\n"));
    }

    #[test]
    fn load_reads_sections_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[device]\nclass = \"console\"\nallocator = \"backend\"\ngreeting = \"\"\n\n[domains]\nfrontend = 7\nbackend = 2\n\n[limits]\ngrant_entries = 4"
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.frontend(), DomainId(7));
        assert_eq!(config.backend(), DomainId(2));
        assert_eq!(config.limits.grant_entries, 4);
        assert_eq!(config.limits.event_ports, 64);
        let class = config.device_class().unwrap();
        assert_eq!(class.name, "console");
        assert_eq!(class.allocator, Side::Backend);
        assert_eq!(class.greeting, None);
    }

    #[test]
    fn rejects_unusable_values() {
        assert!(matches!(
            Config::from_toml_str("[domains]\nfrontend = 3\nbackend = 3"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(Config::from_toml_str("[limits]\nevent_ports = 0"), Err(ConfigError::Invalid(_))));
        let long = format!("[device]\ngreeting = \"{}\"", "x".repeat(40));
        assert!(matches!(Config::from_toml_str(&long), Err(ConfigError::Invalid(_))));
        assert!(matches!(Config::from_toml_str("[device]\nallocator = \"guest\""), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/splitdev.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
