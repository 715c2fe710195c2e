// SPDX-License-Identifier: Apache-2.0

//! A software-simulated enclave driver
//!
//! Enclaves are [`TrustedApplication`]s hosted in this process. Each one
//! still owns a real, inaccessible address range so that placement and size
//! behave as they do on hardware. Images name a registered program:
//!
//! ```
//! use enclave_manager::backend::sim;
//!
//! let image = sim::image("echo");
//! assert!(image.starts_with(sim::MAGIC));
//! ```

mod entry;
pub mod programs;

use super::{CreateOptions, Created, Datum, Image, Status, LAUNCH_TOKEN_SIZE};
use crate::config::{EnclaveConfig, EnclaveFinal, EnclaveInput, EnclaveOutput, EnclaveSignal};
use crate::error::{Error, Result};
use crate::primitives::{dispatch_exit_call, selector, Extent, ParameterStack, Selector, Transfer};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mmarinus::{perms, Map, Private};
use tracing::{debug, trace};

/// Every simulated image starts with these bytes.
pub const MAGIC: &[u8; 8] = b"SIMENCLV";

/// The size of an enclave created without an explicit size.
pub const DEFAULT_SIZE: usize = 2 << 20;

const PAGE_SIZE: usize = 4096;

/// Build an image that loads `program`.
pub fn image(program: &str) -> Vec<u8> {
    let mut image = MAGIC.to_vec();
    image.extend_from_slice(program.as_bytes());
    image
}

/// The host services reachable from trusted code.
pub struct Host(());

impl Host {
    /// Call out to the host through the exit-call table of this enclave.
    pub fn exit_call(&self, selector: Selector, params: &mut ParameterStack) -> Result<()> {
        dispatch_exit_call(selector, params)
    }

    /// Read a named host clock, in nanoseconds.
    pub fn read_clock(&self, name: &str) -> Result<i64> {
        let mut nanos = 0i64;

        let mut params = ParameterStack::new();
        params.push_by_reference(Extent::from_slice(name.as_bytes()));
        params.push_by_reference(Extent::from_mut(&mut nanos));
        self.exit_call(selector::exit::READ_CLOCK, &mut params)?;

        Ok(nanos)
    }
}

/// Code running inside a simulated enclave.
pub trait TrustedApplication: Send + Sync {
    /// Returns the bytes handed back to the host as initialization output.
    fn initialize(&self, host: &Host, name: &str, config: &EnclaveConfig) -> Result<Vec<u8>>;

    fn run(&self, host: &Host, input: &EnclaveInput) -> Result<EnclaveOutput>;

    fn handle_signal(&self, host: &Host, signal: &EnclaveSignal) -> Result<()>;

    fn finalize(&self, host: &Host, input: &EnclaveFinal) -> Result<()>;

    /// Handle a user-defined selector.
    fn call(&self, _host: &Host, selector: Selector, _params: &mut ParameterStack) -> Result<()> {
        Err(Error::InvalidArgument(format!(
            "unsupported selector {}",
            selector
        )))
    }
}

type Factory = Box<dyn Fn() -> Arc<dyn TrustedApplication> + Send + Sync>;

/// The address range a simulated enclave occupies.
struct Region(Map<perms::None>);

// SAFETY: the mapping is never read or written; it only holds addresses.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

struct Enclave {
    program: String,
    region: Region,
    app: Arc<dyn TrustedApplication>,
}

/// The simulation [`Driver`](super::Driver).
#[derive(Default)]
pub struct Driver {
    programs: RwLock<HashMap<String, Factory>>,
    enclaves: Mutex<HashMap<u64, Arc<Enclave>>>,
    next: AtomicU64,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver knowing every program in [`programs`].
    pub fn with_builtins() -> Self {
        let driver = Self::new();
        for (name, factory) in programs::builtins() {
            driver.programs_mut().insert(name.into(), factory);
        }
        driver
    }

    fn programs_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Factory>> {
        self.programs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn enclaves(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Enclave>>> {
        self.enclaves.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `program` loadable. Each created enclave gets a fresh instance.
    pub fn register<F>(&self, program: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn TrustedApplication> + Send + Sync + 'static,
    {
        let mut programs = self.programs_mut();
        if programs.contains_key(program) {
            return Err(Error::AlreadyExists(format!("program {}", program)));
        }

        programs.insert(program.into(), Box::new(factory));
        Ok(())
    }

    pub fn programs(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .programs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The number of live enclaves.
    pub fn live(&self) -> usize {
        self.enclaves().len()
    }

    fn instantiate(&self, bytes: &[u8]) -> std::result::Result<(String, Arc<dyn TrustedApplication>), Status> {
        let program = bytes
            .strip_prefix(&MAGIC[..])
            .and_then(|name| std::str::from_utf8(name).ok())
            .ok_or(Status::INVALID_ENCLAVE)?;

        let programs = self.programs.read().unwrap_or_else(|e| e.into_inner());
        let factory = programs.get(program).ok_or(Status::INVALID_ENCLAVE)?;

        Ok((program.into(), factory()))
    }

    fn reserve(options: &CreateOptions) -> std::result::Result<Region, Status> {
        let size = match options.size {
            0 => DEFAULT_SIZE,
            size => {
                let padded = size
                    .checked_add(PAGE_SIZE - 1)
                    .ok_or(Status::INVALID_PARAMETER)?;
                padded / PAGE_SIZE * PAGE_SIZE
            }
        };

        let map = match options.base_address {
            Some(base) => Map::bytes(size).near(base).anonymously().with(perms::None),
            None => Map::bytes(size).anywhere().anonymously().with(perms::None),
        }
        .map_err(|_| Status::OUT_OF_MEMORY)?;

        match options.base_address {
            Some(base) if map.addr() != base => Err(Status::INVALID_PARAMETER),
            _ => Ok(Region(map)),
        }
    }
}

impl super::Driver for Driver {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn data(&self) -> Vec<Datum> {
        let programs = self.programs();

        vec![Datum {
            name: "Simulation".into(),
            pass: true,
            info: Some(if programs.is_empty() {
                "no programs".into()
            } else {
                programs.join(", ")
            }),
            mesg: None,
        }]
    }

    fn create(
        &self,
        image: &Image<'_>,
        options: &CreateOptions,
    ) -> std::result::Result<Created, Status> {
        let (program, app) = match image {
            Image::Buffer(bytes) => self.instantiate(bytes)?,
            Image::File(path) => {
                let map = Map::load(path, Private, perms::Read)
                    .map_err(|_| Status::ENCLAVE_FILE_ACCESS)?;
                self.instantiate(&map)?
            }
        };

        let region = Self::reserve(options)?;
        let base_address = region.0.addr();
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(id, program = %program, base_address, debug = options.debug, "created simulated enclave");

        self.enclaves().insert(
            id,
            Arc::new(Enclave {
                program,
                region,
                app,
            }),
        );

        let mut token = Box::new([0u8; LAUNCH_TOKEN_SIZE]);
        token[..8].copy_from_slice(&id.to_le_bytes());

        Ok(Created {
            id,
            base_address,
            token,
        })
    }

    fn size(&self, id: u64) -> std::result::Result<usize, Status> {
        self.enclaves()
            .get(&id)
            .map(|enclave| enclave.region.0.size())
            .ok_or(Status::INVALID_ENCLAVE_ID)
    }

    fn ecall(&self, id: u64, transfer: &mut Transfer) -> Status {
        // Unlocked while the enclave runs, so enclaves may be entered
        // concurrently and recursively.
        let enclave = match self.enclaves().get(&id) {
            Some(enclave) => enclave.clone(),
            None => return Status::INVALID_ENCLAVE_ID,
        };

        trace!(id, program = %enclave.program, selector = transfer.selector, "ecall");
        entry::enter(&*enclave.app, transfer);
        Status::SUCCESS
    }

    fn destroy(&self, id: u64) -> Status {
        match self.enclaves().remove(&id) {
            Some(_) => Status::SUCCESS,
            None => Status::INVALID_ENCLAVE_ID,
        }
    }
}
