// SPDX-License-Identifier: Apache-2.0

use enclave_manager::backend::sim;
use enclave_manager::config::{EnclaveConfig, EnclaveFinal, EnclaveInput, HostConfig, ManagerOptions};
use enclave_manager::loader::{SgxEmbeddedLoader, SgxLoader, SimLoader};
use enclave_manager::{signal, EnclaveManager, Loader};

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use log::info;
use serde::de::DeserializeOwned;

/// Load an enclave, run it once on an input and destroy it.
///
/// The enclave comes from an image file, from an ELF section of this
/// binary, or is a built-in program of the simulation driver.
#[derive(Args, Debug)]
pub struct Options {
    /// Path of the enclave image to load
    #[clap(value_name = "IMAGE", parse(from_os_str))]
    pub image: Option<PathBuf>,

    /// Load the enclave image from this ELF section of the running binary
    #[clap(long, conflicts_with = "image")]
    pub section: Option<String>,

    /// Built-in program to load when no image is given
    #[clap(long, default_value = "echo")]
    pub program: String,

    /// Name to register the enclave under
    #[clap(long, default_value = "main")]
    pub name: String,

    /// Host configuration file (TOML)
    #[clap(long, env = "ENCLAVE_HOST_CONFIG", parse(from_os_str))]
    pub host_config: Option<PathBuf>,

    /// Enclave configuration file (TOML)
    #[clap(long, parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Create a debug enclave
    #[clap(long)]
    pub debug: bool,

    /// Input handed to the enclave
    #[clap(long, default_value = "")]
    pub input: String,

    /// Forward this signal number to the enclave while it runs
    #[clap(long = "forward-signal", value_name = "SIGNUM")]
    pub signals: Vec<i32>,
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let host = match self.host_config {
            Some(ref path) => read_toml::<HostConfig>(path)?,
            None => HostConfig::default(),
        };

        EnclaveManager::configure(ManagerOptions::default().set_host_config(host))?;
        let manager = EnclaveManager::instance()?;

        let output = self.run(&manager, true)?;

        let mut stdout = io::stdout().lock();
        stdout.write_all(&output)?;
        writeln!(stdout)?;
        Ok(())
    }

    fn loader(&self) -> Box<dyn Loader> {
        let driver = Arc::new(sim::Driver::with_builtins());

        match (&self.image, &self.section) {
            (Some(path), _) => Box::new(SgxLoader::new(path, self.debug, driver)),
            (None, Some(section)) => {
                Box::new(SgxEmbeddedLoader::new(section.as_str(), self.debug, driver))
            }
            (None, None) => Box::new(SimLoader::new(self.program.as_str(), driver)),
        }
    }

    /// Take one enclave through its lifecycle on `manager`.
    ///
    /// The enclave is destroyed even when running it fails.
    fn run(&self, manager: &EnclaveManager, forward: bool) -> anyhow::Result<Vec<u8>> {
        let config = match self.config {
            Some(ref path) => Some(read_toml::<EnclaveConfig>(path)?),
            None => None,
        };

        let loader = self.loader();
        let client = manager
            .load_enclave(&self.name, &*loader, config, None, 0)
            .with_context(|| format!("failed to load enclave {:?}", self.name))?;
        info!("loaded enclave {:?}", self.name);

        let forwarded = match forward {
            true => self.forward_signals(manager, &client),
            false => Ok(()),
        };

        let output = forwarded.and_then(|()| {
            client
                .enter_and_run(&EnclaveInput {
                    data: self.input.clone().into_bytes(),
                })
                .context("failed to run enclave")
        });

        let destroyed = manager
            .destroy_enclave(Some(&client), &EnclaveFinal::default(), false)
            .context("failed to finalize enclave");

        let output = output?;
        destroyed?;
        Ok(output.data)
    }

    fn forward_signals(
        &self,
        manager: &EnclaveManager,
        client: &Arc<enclave_manager::EnclaveClient>,
    ) -> anyhow::Result<()> {
        for signum in &self.signals {
            manager.signals().register_signal(*signum, client.clone())?;
            signal::install_handler(*signum)
                .with_context(|| format!("failed to forward signal {}", signum))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use enclave_manager::{Runtime, SignalDispatcher};

    fn manager() -> Arc<EnclaveManager> {
        let runtime = Runtime::new(Arc::new(SignalDispatcher::new()));
        runtime.configure(ManagerOptions::default()).unwrap();
        runtime.instance().unwrap()
    }

    fn options() -> Options {
        Options {
            image: None,
            section: None,
            program: "echo".into(),
            name: "main".into(),
            host_config: None,
            config: None,
            debug: false,
            input: "hello".into(),
            signals: Vec::new(),
        }
    }

    #[test]
    fn run_builtin() {
        let manager = manager();
        assert_eq!(options().run(&manager, false).unwrap(), b"hello");
        assert!(manager.get_client("main").is_none());
    }

    #[test]
    fn run_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("echo.enclave");
        fs::write(&image, sim::image("echo")).unwrap();

        let config = dir.path().join("enclave.toml");
        fs::write(&config, "stdout_fd = 1\n").unwrap();

        let options = Options {
            image: Some(image),
            config: Some(config),
            ..options()
        };

        let manager = manager();
        assert_eq!(options.run(&manager, false).unwrap(), b"hello");
    }

    #[test]
    fn missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            image: Some(dir.path().join("absent.enclave")),
            ..options()
        };

        assert!(options.run(&manager(), false).is_err());
    }
}
