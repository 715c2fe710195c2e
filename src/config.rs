// SPDX-License-Identifier: Apache-2.0

//! Payloads exchanged with enclaves and the options that shape their loading
//!
//! Every type here can be read with any serde deserializer. The command line
//! front end reads them from TOML.
//!
//! ```
//! use enclave_manager::config::EnclaveConfig;
//!
//! const CONFIG: &str = r#"
//! enable_fork = true
//!
//! [[environment]]
//! name = "GREETING"
//! value = "hello"
//! "#;
//!
//! let config: EnclaveConfig = toml::from_str(CONFIG).unwrap();
//! assert!(config.enable_fork);
//! ```

use crate::error::{Error, Result};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Host-wide settings merged into every enclave configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// The name the host knows itself by.
    pub local_name: Option<String>,

    /// The directory relative paths inside an enclave resolve against.
    pub working_directory: Option<PathBuf>,
}

/// An environment variable handed to the trusted side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Verbosity of the trusted-side logger.
    pub vlog_level: u32,

    /// Where the trusted-side logger writes, if anywhere.
    pub log_directory: Option<PathBuf>,
}

/// The configuration handed to an enclave when it is initialized.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    pub host_config: Option<HostConfig>,
    pub stdin_fd: Option<i32>,
    pub stdout_fd: Option<i32>,
    pub stderr_fd: Option<i32>,
    pub environment: Vec<EnvironmentVariable>,
    pub logging: Option<LoggingConfig>,

    /// Whether the enclave may be re-created inside a forked child.
    pub enable_fork: bool,
}

impl EnclaveConfig {
    /// Fill every unset field from `host` and the standard defaults.
    ///
    /// Fields already set by the caller are left untouched.
    pub fn apply_defaults(&mut self, host: &HostConfig) {
        self.host_config.get_or_insert_with(|| host.clone());
        self.stdin_fd.get_or_insert(libc::STDIN_FILENO);
        self.stdout_fd.get_or_insert(libc::STDOUT_FILENO);
        self.stderr_fd.get_or_insert(libc::STDERR_FILENO);
        self.logging.get_or_insert_with(LoggingConfig::default);
    }

    /// A configuration holding nothing but the defaults for `host`.
    pub fn defaults_for(host: &HostConfig) -> Self {
        let mut config = Self::default();
        config.apply_defaults(host);
        config
    }
}

/// Input consumed by a single run of an enclave.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveInput {
    pub data: Vec<u8>,
}

/// Output produced by a run of an enclave.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveOutput {
    pub data: Vec<u8>,
}

/// Input handed to an enclave as it is finalized.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveFinal {
    pub data: Vec<u8>,
}

/// A host signal as seen from inside an enclave.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveSignal {
    pub signum: i32,
    pub code: i32,

    /// General purpose registers at the moment the signal was delivered.
    pub gregs: Vec<u64>,
}

/// Placement of an enclave re-created in a forked child.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkConfig {
    pub base_address: u64,
    pub enclave_size: u64,
}

/// Where an SGX enclave image comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SgxSource {
    /// A signed enclave file on disk.
    File { path: PathBuf },

    /// An ELF section of the running binary.
    Embedded { section: String },
}

/// The SGX extension of a [`LoadConfig`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgxLoadConfig {
    pub debug: bool,
    pub source: Option<SgxSource>,
    pub fork: Option<ForkConfig>,
}

/// Everything needed to load a named enclave.
///
/// A config without a hardware extension can only be loaded by a loader
/// that does not need one, such as the simulation loader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub name: String,
    pub config: Option<EnclaveConfig>,
    pub sgx: Option<SgxLoadConfig>,
}

impl LoadConfig {
    /// The requested base address, when the config carries a fork placement.
    pub fn base_address(&self) -> Option<usize> {
        self.sgx
            .as_ref()
            .and_then(|sgx| sgx.fork)
            .map(|fork| fork.base_address as usize)
            .filter(|addr| *addr != 0)
    }

    /// Record where a forked child has to re-create the enclave.
    ///
    /// A placement needs both a nonzero base and a nonzero size, and only
    /// an SGX config can carry one.
    pub fn set_fork_placement(&mut self, base_address: Option<usize>, size: usize) {
        let base = match base_address.filter(|base| *base != 0) {
            Some(base) if size != 0 => base,
            _ => return,
        };

        if let Some(sgx) = self.sgx.as_mut() {
            sgx.fork = Some(ForkConfig {
                base_address: base as u64,
                enclave_size: size as u64,
            });
        }
    }
}

/// Where the manager gets its [`HostConfig`] from.
#[derive(Clone, Debug, PartialEq, Eq)]
enum HostConfigSource {
    Config(HostConfig),
    Server { address: String, timeout: Duration },
}

/// Options applied once to the manager before it is created.
///
/// By default the options hold an empty [`HostConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerOptions {
    source: HostConfigSource,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            source: HostConfigSource::Config(HostConfig::default()),
        }
    }
}

impl ManagerOptions {
    /// Hold `config`, replacing any config server attributes.
    pub fn set_host_config(mut self, config: HostConfig) -> Self {
        self.source = HostConfigSource::Config(config);
        self
    }

    /// Hold config server attributes, replacing any host config.
    pub fn set_config_server_connection_attributes(
        mut self,
        address: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        self.source = HostConfigSource::Server {
            address: address.into(),
            timeout,
        };
        self
    }

    pub fn holds_host_config(&self) -> bool {
        matches!(self.source, HostConfigSource::Config(_))
    }

    pub fn host_config(&self) -> Result<&HostConfig> {
        match &self.source {
            HostConfigSource::Config(config) => Ok(config),
            HostConfigSource::Server { .. } => Err(Error::FailedPrecondition(
                "options do not contain a host config".into(),
            )),
        }
    }

    pub fn config_server_address(&self) -> Result<&str> {
        match &self.source {
            HostConfigSource::Server { address, .. } => Ok(address),
            HostConfigSource::Config(_) => Err(Error::FailedPrecondition(
                "options do not contain a config server address".into(),
            )),
        }
    }

    pub fn config_server_connection_timeout(&self) -> Result<Duration> {
        match &self.source {
            HostConfigSource::Server { timeout, .. } => Ok(*timeout),
            HostConfigSource::Config(_) => Err(Error::FailedPrecondition(
                "options do not contain a config server connection timeout".into(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_fill_unset_fields() {
        let host = HostConfig {
            local_name: Some("host".into()),
            working_directory: None,
        };

        let config = EnclaveConfig::defaults_for(&host);
        assert_eq!(config.host_config, Some(host));
        assert_eq!(config.stdin_fd, Some(0));
        assert_eq!(config.stdout_fd, Some(1));
        assert_eq!(config.stderr_fd, Some(2));
        assert_eq!(config.logging, Some(LoggingConfig::default()));
        assert!(!config.enable_fork);
    }

    #[test]
    fn defaults_keep_caller_fields() {
        let mut config = EnclaveConfig {
            stdout_fd: Some(7),
            host_config: Some(HostConfig {
                local_name: Some("mine".into()),
                working_directory: None,
            }),
            ..Default::default()
        };

        config.apply_defaults(&HostConfig::default());
        assert_eq!(config.stdout_fd, Some(7));
        assert_eq!(config.stdin_fd, Some(0));
        assert_eq!(
            config.host_config.and_then(|h| h.local_name).as_deref(),
            Some("mine")
        );
    }

    #[test]
    fn load_config_toml() {
        const CONFIG: &str = r#"
name = "demo"

[sgx]
debug = true

[sgx.source]
kind = "embedded"
section = "enclave"

[sgx.fork]
base_address = 139637976727552
enclave_size = 2097152
"#;

        let config: LoadConfig = toml::from_str(CONFIG).unwrap();
        assert_eq!(config.name, "demo");
        let sgx = config.sgx.clone().unwrap();
        assert!(sgx.debug);
        assert_eq!(
            sgx.source,
            Some(SgxSource::Embedded {
                section: "enclave".into()
            })
        );
        assert_eq!(config.base_address(), Some(0x7f0000000000));
    }

    #[test]
    fn zero_base_address_is_absent() {
        let config = LoadConfig {
            sgx: Some(SgxLoadConfig {
                fork: Some(ForkConfig::default()),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(config.base_address(), None);
        assert_eq!(LoadConfig::default().base_address(), None);
    }

    #[test]
    fn fork_placement_needs_base_and_size() {
        let mut config = LoadConfig {
            sgx: Some(SgxLoadConfig::default()),
            ..Default::default()
        };

        config.set_fork_placement(Some(0x4000_0000), 0);
        config.set_fork_placement(Some(0), 0x20_0000);
        config.set_fork_placement(None, 0x20_0000);
        assert_eq!(config.sgx.as_ref().unwrap().fork, None);

        config.set_fork_placement(Some(0x4000_0000), 0x20_0000);
        assert_eq!(
            config.sgx.as_ref().unwrap().fork,
            Some(ForkConfig {
                base_address: 0x4000_0000,
                enclave_size: 0x20_0000,
            })
        );
        assert_eq!(config.base_address(), Some(0x4000_0000));

        let mut bare = LoadConfig::default();
        bare.set_fork_placement(Some(0x4000_0000), 0x20_0000);
        assert_eq!(bare.sgx, None);
    }

    #[test]
    fn options_alternatives() {
        let options = ManagerOptions::default();
        assert!(options.holds_host_config());
        assert_eq!(options.host_config().unwrap(), &HostConfig::default());
        assert!(matches!(
            options.config_server_address(),
            Err(Error::FailedPrecondition(_))
        ));

        let options = options
            .set_config_server_connection_attributes("[::1]:8080", Duration::from_secs(3));
        assert!(!options.holds_host_config());
        assert_eq!(options.config_server_address().unwrap(), "[::1]:8080");
        assert_eq!(
            options.config_server_connection_timeout().unwrap(),
            Duration::from_secs(3)
        );
        assert!(matches!(
            options.host_config(),
            Err(Error::FailedPrecondition(_))
        ));
    }
}
