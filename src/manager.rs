// SPDX-License-Identifier: Apache-2.0

//! The enclave manager: a registry of named enclaves and their lifecycle
//!
//! The manager is created once per [`Runtime`], after exactly one call to
//! [`Runtime::configure`]. [`EnclaveManager::configure`] and
//! [`EnclaveManager::instance`] use the process-wide runtime.
//!
//! ```no_run
//! use enclave_manager::backend::sim;
//! use enclave_manager::config::{EnclaveFinal, EnclaveInput, ManagerOptions};
//! use enclave_manager::loader::SimLoader;
//! use enclave_manager::EnclaveManager;
//! use std::sync::Arc;
//!
//! EnclaveManager::configure(ManagerOptions::default()).unwrap();
//! let manager = EnclaveManager::instance().unwrap();
//!
//! let loader = SimLoader::new("echo", Arc::new(sim::Driver::with_builtins()));
//! manager.load_enclave("demo", &loader, None, None, 0).unwrap();
//!
//! let client = manager.get_client("demo").unwrap();
//! let output = client.enter_and_run(&EnclaveInput { data: b"hi".to_vec() }).unwrap();
//! assert_eq!(output.data, b"hi");
//!
//! manager
//!     .destroy_enclave(Some(&client), &EnclaveFinal::default(), false)
//!     .unwrap();
//! ```

use crate::backend::{self, ClientHandle, Driver};
use crate::client::EnclaveClient;
use crate::clock::{Clock, Ticker};
use crate::config::{EnclaveConfig, EnclaveFinal, HostConfig, LoadConfig, ManagerOptions};
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::primitives::{selector, DispatchTable, ExitCallProvider, ParameterStack};
use crate::registry::Registry;
use crate::resources::{SharedName, SharedResources};
use crate::signal::SignalDispatcher;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::Lazy;
use tracing::{debug, error, instrument};

enum Gate {
    Unconfigured,
    Configured(ManagerOptions),
    Running(Arc<EnclaveManager>),
}

/// The configure-once, create-once gate in front of an [`EnclaveManager`].
pub struct Runtime {
    gate: Mutex<Gate>,
    signals: Arc<SignalDispatcher>,
}

static GLOBAL: Lazy<Runtime> = Lazy::new(|| Runtime::new(SignalDispatcher::global()));

impl Runtime {
    /// A runtime whose manager will route signals through `signals`.
    pub fn new(signals: Arc<SignalDispatcher>) -> Self {
        Self {
            gate: Mutex::new(Gate::Unconfigured),
            signals,
        }
    }

    /// The process-wide runtime. Its manager uses the global signal
    /// dispatcher.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Store `options` for the manager this runtime will create.
    ///
    /// Fails if the runtime was already configured.
    pub fn configure(&self, options: ManagerOptions) -> Result<()> {
        let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());

        match *gate {
            Gate::Unconfigured => {
                *gate = Gate::Configured(options);
                Ok(())
            }
            Gate::Configured(_) | Gate::Running(_) => Err(Error::AlreadyInitialized),
        }
    }

    /// The manager, created on the first call after [`configure`](Self::configure).
    pub fn instance(&self) -> Result<Arc<EnclaveManager>> {
        let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());

        let manager = match &*gate {
            Gate::Running(manager) => return Ok(manager.clone()),
            Gate::Unconfigured => return Err(Error::NotConfigured),
            Gate::Configured(options) => {
                Arc::new(EnclaveManager::new(options, self.signals.clone())?)
            }
        };

        *gate = Gate::Running(manager.clone());
        Ok(manager)
    }
}

/// Owns every named enclave of a process.
pub struct EnclaveManager {
    host_config: HostConfig,
    registry: RwLock<Registry>,
    signals: Arc<SignalDispatcher>,
    resources: Arc<SharedResources>,
    clock: Clock,
    _ticker: Ticker,
}

impl EnclaveManager {
    /// Configure the process-wide manager. See [`Runtime::configure`].
    pub fn configure(options: ManagerOptions) -> Result<()> {
        Runtime::global().configure(options)
    }

    /// The process-wide manager. See [`Runtime::instance`].
    pub fn instance() -> Result<Arc<Self>> {
        Runtime::global().instance()
    }

    fn new(options: &ManagerOptions, signals: Arc<SignalDispatcher>) -> Result<Self> {
        let host_config = match options.host_config() {
            Ok(config) => config.clone(),
            Err(_) => {
                error!(
                    address = options.config_server_address().unwrap_or_default(),
                    "fetching the host config from a config server is not implemented, using defaults"
                );
                HostConfig::default()
            }
        };

        let resources = Arc::new(SharedResources::new());
        let clock = Clock::new();
        clock.register(&resources)?;

        let ticker = clock
            .spawn()
            .map_err(|e| Error::ResourceExhausted(format!("failed to start clock thread: {}", e)))?;

        Ok(Self {
            host_config,
            registry: RwLock::new(Registry::default()),
            signals,
            resources,
            clock,
            _ticker: ticker,
        })
    }

    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn host_config(&self) -> &HostConfig {
        &self.host_config
    }

    pub fn signals(&self) -> &Arc<SignalDispatcher> {
        &self.signals
    }

    pub fn shared_resources(&self) -> &Arc<SharedResources> {
        &self.resources
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Load and initialize the enclave `name` with `loader`.
    ///
    /// `config` is completed with the host defaults. A `base_address` of
    /// zero means none. When the config enables fork and a base address is
    /// given, this is the re-creation of an enclave inside a forked child:
    /// any registration under `name` left over from the parent is dropped
    /// first.
    #[instrument(level = "debug", skip(self, loader, config))]
    pub fn load_enclave(
        &self,
        name: &str,
        loader: &dyn Loader,
        config: Option<EnclaveConfig>,
        base_address: Option<usize>,
        size: usize,
    ) -> Result<Arc<EnclaveClient>> {
        let base_address = base_address.filter(|base| *base != 0);

        let mut config = config.unwrap_or_default();
        config.apply_defaults(&self.host_config);

        let mut load_config = loader.load_config();
        load_config.name = name.into();
        load_config.config = Some(config.clone());
        load_config.set_fork_placement(base_address, size);

        self.load(load_config, config.clone(), base_address, || {
            loader.load_enclave(name, base_address, size, &config)
        })
    }

    /// Load and initialize the enclave described by `load_config` on
    /// `driver`, using the backend its extension selects.
    #[instrument(level = "debug", skip(self, load_config, driver), fields(name = %load_config.name))]
    pub fn load_enclave_from_config(
        &self,
        mut load_config: LoadConfig,
        driver: Arc<dyn Driver>,
    ) -> Result<Arc<EnclaveClient>> {
        let mut config = load_config.config.take().unwrap_or_default();
        config.apply_defaults(&self.host_config);
        load_config.config = Some(config.clone());

        let base_address = load_config.base_address();
        let request = load_config.clone();

        self.load(load_config, config, base_address, move || {
            backend::load(&request, driver)
        })
    }

    fn load<F>(
        &self,
        load_config: LoadConfig,
        config: EnclaveConfig,
        base_address: Option<usize>,
        create: F,
    ) -> Result<Arc<EnclaveClient>>
    where
        F: FnOnce() -> Result<Box<dyn ClientHandle>>,
    {
        let name = load_config.name.clone();

        if config.enable_fork && base_address.is_some() {
            // The registration refers to the parent's enclave, which does
            // not exist in this process.
            if self.registry_mut().remove_name(&name).is_some() {
                debug!(name = %name, "dropped parent registration");
            }
        }

        if self.registry().contains(&name) {
            let e = Error::AlreadyExists(format!("name already exists: {}", name));
            error!(name = %name, "failed to load enclave: {}", e);
            return Err(e);
        }

        let handle = create().map_err(|e| {
            error!(name = %name, "failed to load enclave: {}", e);
            e
        })?;

        let client = Arc::new(self.client(&name, handle)?);
        let retained = config.enable_fork.then_some(load_config);

        let inserted = self.registry_mut().insert(&name, client.clone(), retained);
        if let Err(e) = inserted {
            // Another thread registered the name while the enclave was
            // being created.
            if let Err(d) = client.destroy_enclave() {
                error!(name = %name, "failed to destroy enclave: {}", d);
            }
            error!(name = %name, "failed to load enclave: {}", e);
            return Err(e);
        }

        match client.enter_and_initialize(&config) {
            Ok(_) => {
                self.registry_mut().publish(client.id());
                Ok(client)
            }

            Err(e) => {
                error!(name = %name, "failed to initialize enclave: {}", e);

                if let Err(d) = client.destroy_enclave() {
                    error!(name = %name, "failed to destroy enclave after initialization failure: {}", d);
                }
                if let Err(d) = self.signals.deregister_all_signals_for_client(&client) {
                    error!(name = %name, "failed to deregister signals: {}", d);
                }

                self.registry_mut().remove(client.id());
                Err(e)
            }
        }
    }

    /// Wrap `handle` in a client serving the host exit calls.
    fn client(&self, name: &str, handle: Box<dyn ClientHandle>) -> Result<EnclaveClient> {
        let exits = DispatchTable::new();
        let resources = self.resources.clone();

        let registered = exits.register_exit_handler(
            selector::exit::READ_CLOCK,
            Box::new(move |params| read_clock(&resources, params)),
        );

        if let Err(e) = registered {
            if let Err(d) = handle.destroy() {
                error!(name, "failed to destroy enclave: {}", d);
            }
            return Err(e);
        }

        Ok(EnclaveClient::new(name, handle, Box::new(exits)))
    }

    /// The initialized client registered as `name`.
    pub fn get_client(&self, name: &str) -> Option<Arc<EnclaveClient>> {
        self.registry().client(name)
    }

    /// The name `client` is registered under.
    pub fn get_name(&self, client: &EnclaveClient) -> Option<String> {
        self.registry().name(client.id()).map(String::from)
    }

    /// The load config of a fork-enabled `client`.
    pub fn get_load_config_from_client(&self, client: &EnclaveClient) -> Option<LoadConfig> {
        self.registry().load_config(client.id()).cloned()
    }

    /// Finalize (unless skipped), destroy and deregister `client`.
    ///
    /// Destruction always runs to completion: destroy and signal
    /// deregistration failures are logged. The finalize outcome is returned.
    #[instrument(level = "debug", skip_all, fields(name = client.map(|c| c.name())))]
    pub fn destroy_enclave(
        &self,
        client: Option<&EnclaveClient>,
        final_input: &EnclaveFinal,
        skip_finalize: bool,
    ) -> Result<()> {
        let client = match client {
            Some(client) => client,
            None => return Ok(()),
        };

        let finalized = match skip_finalize {
            true => Ok(()),
            false => client.enter_and_finalize(final_input),
        };

        if let Err(e) = client.destroy_enclave() {
            error!(name = client.name(), "failed to destroy enclave: {}", e);
        }

        if let Err(e) = self.signals.deregister_all_signals_for_client(client) {
            error!(name = client.name(), "failed to deregister signals: {}", e);
        }

        self.registry_mut().remove(client.id());
        finalized
    }
}

/// Serve a clock read from inside an enclave: pops {name, nanoseconds out}.
fn read_clock(resources: &SharedResources, params: &mut ParameterStack) -> Result<()> {
    let missing = || Error::InvalidArgument("missing clock parameter".into());
    let out = params.pop().ok_or_else(missing)?;
    let name = params.pop().ok_or_else(missing)?;

    // SAFETY: both extents were pushed by reference by the caller, which
    // waits for this handler to return.
    let name = std::str::from_utf8(unsafe { name.as_bytes() })
        .map_err(|_| Error::InvalidArgument("clock name is not UTF-8".into()))?;
    let out = unsafe { out.as_mut::<i64>() }
        .ok_or_else(|| Error::InvalidArgument("malformed clock output".into()))?;

    let clock = resources
        .acquire::<AtomicI64>(&SharedName::address(name))
        .ok_or_else(|| Error::InvalidArgument(format!("unknown clock {}", name)))?;

    *out = clock.load(Ordering::Acquire);
    Ok(())
}
