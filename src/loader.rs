// SPDX-License-Identifier: Apache-2.0

//! Loaders: how the manager obtains a new enclave.

use crate::backend::{self, create_with_retry, sim, ClientHandle, CreateOptions, Driver, Handle, Image};
use crate::config::{EnclaveConfig, LoadConfig, SgxLoadConfig, SgxSource};
use crate::error::Result;

use std::path::PathBuf;
use std::sync::Arc;

/// Creates enclaves on behalf of the manager.
pub trait Loader {
    /// The load config this loader would build for an enclave.
    fn load_config(&self) -> LoadConfig;

    /// Create the enclave `name`, at `base_address` if one is given.
    fn load_enclave(
        &self,
        name: &str,
        base_address: Option<usize>,
        size: usize,
        config: &EnclaveConfig,
    ) -> Result<Box<dyn ClientHandle>>;
}

fn load_sgx(
    loader: &dyn Loader,
    driver: &Arc<dyn Driver>,
    name: &str,
    base_address: Option<usize>,
    size: usize,
    config: &EnclaveConfig,
) -> Result<Box<dyn ClientHandle>> {
    let mut load_config = loader.load_config();
    load_config.name = name.into();
    load_config.config = Some(config.clone());
    load_config.set_fork_placement(base_address, size);

    backend::load(&load_config, driver.clone())
}

/// Loads an SGX enclave from a file.
pub struct SgxLoader {
    path: PathBuf,
    debug: bool,
    driver: Arc<dyn Driver>,
}

impl SgxLoader {
    pub fn new(path: impl Into<PathBuf>, debug: bool, driver: Arc<dyn Driver>) -> Self {
        Self {
            path: path.into(),
            debug,
            driver,
        }
    }
}

impl Loader for SgxLoader {
    fn load_config(&self) -> LoadConfig {
        LoadConfig {
            sgx: Some(SgxLoadConfig {
                debug: self.debug,
                source: Some(SgxSource::File {
                    path: self.path.clone(),
                }),
                fork: None,
            }),
            ..Default::default()
        }
    }

    fn load_enclave(
        &self,
        name: &str,
        base_address: Option<usize>,
        size: usize,
        config: &EnclaveConfig,
    ) -> Result<Box<dyn ClientHandle>> {
        load_sgx(self, &self.driver, name, base_address, size, config)
    }
}

/// Loads an SGX enclave from a section of the running binary.
pub struct SgxEmbeddedLoader {
    section: String,
    debug: bool,
    driver: Arc<dyn Driver>,
}

impl SgxEmbeddedLoader {
    pub fn new(section: impl Into<String>, debug: bool, driver: Arc<dyn Driver>) -> Self {
        Self {
            section: section.into(),
            debug,
            driver,
        }
    }
}

impl Loader for SgxEmbeddedLoader {
    fn load_config(&self) -> LoadConfig {
        LoadConfig {
            sgx: Some(SgxLoadConfig {
                debug: self.debug,
                source: Some(SgxSource::Embedded {
                    section: self.section.clone(),
                }),
                fork: None,
            }),
            ..Default::default()
        }
    }

    fn load_enclave(
        &self,
        name: &str,
        base_address: Option<usize>,
        size: usize,
        config: &EnclaveConfig,
    ) -> Result<Box<dyn ClientHandle>> {
        load_sgx(self, &self.driver, name, base_address, size, config)
    }
}

/// Loads a program into the simulation driver.
///
/// Its load config carries no hardware extension.
pub struct SimLoader {
    program: String,
    driver: Arc<sim::Driver>,
}

impl SimLoader {
    pub fn new(program: impl Into<String>, driver: Arc<sim::Driver>) -> Self {
        Self {
            program: program.into(),
            driver,
        }
    }
}

impl Loader for SimLoader {
    fn load_config(&self) -> LoadConfig {
        LoadConfig::default()
    }

    fn load_enclave(
        &self,
        _name: &str,
        base_address: Option<usize>,
        size: usize,
        config: &EnclaveConfig,
    ) -> Result<Box<dyn ClientHandle>> {
        let image = sim::image(&self.program);
        let options = CreateOptions {
            base_address,
            size,
            debug: false,
            enable_fork: config.enable_fork,
        };

        let created = create_with_retry(&*self.driver, &Image::Buffer(&image), &options)?;
        Ok(Box::new(Handle::new(self.driver.clone(), created)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;

    #[test]
    fn sgx_load_config() {
        let driver = Arc::new(sim::Driver::with_builtins());
        let loader = SgxLoader::new("/tmp/enclave.so", true, driver);

        let config = loader.load_config();
        let sgx = config.sgx.unwrap();
        assert!(sgx.debug);
        assert_eq!(
            sgx.source,
            Some(SgxSource::File {
                path: "/tmp/enclave.so".into()
            })
        );
        assert!(sgx.fork.is_none());
    }

    #[test]
    fn sim_has_no_extension() {
        let loader = SimLoader::new("echo", Arc::new(sim::Driver::with_builtins()));
        assert!(loader.load_config().sgx.is_none());

        let handle = loader
            .load_enclave("echo", None, 0, &EnclaveConfig::default())
            .unwrap();
        assert_eq!(handle.size(), sim::DEFAULT_SIZE);
        handle.destroy().unwrap();
    }

    #[test]
    fn sim_unknown_program() {
        let loader = SimLoader::new("nope", Arc::new(sim::Driver::with_builtins()));
        let err = loader
            .load_enclave("nope", None, 0, &EnclaveConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Backend { .. }));
    }

    #[test]
    fn sgx_file_through_driver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.enclave");
        std::fs::write(&path, sim::image("echo")).unwrap();

        let loader = SgxLoader::new(&path, false, Arc::new(sim::Driver::with_builtins()));
        let handle = loader
            .load_enclave("echo", None, 0, &EnclaveConfig::default())
            .unwrap();
        handle.destroy().unwrap();
    }
}
