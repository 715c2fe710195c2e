// SPDX-License-Identifier: Apache-2.0

//! Enclave backends
//!
//! A [`Driver`] is the hardware seam: it creates, enters and destroys
//! enclaves and reports raw status codes. A [`Backend`] knows where enclave
//! bytes come from and turns a successful creation into a [`ClientHandle`].

pub mod sgx;
pub mod sim;

use crate::config::LoadConfig;
use crate::config::SgxSource;
use crate::error::{Error, Result};
use crate::primitives::{ParameterStack, Selector, Transfer};

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, instrument, trace, warn};

/// Enclave creation is retried at most this many times.
pub const MAX_CREATE_ATTEMPTS: usize = 5;

/// The size of the token a driver returns from a successful launch.
pub const LAUNCH_TOKEN_SIZE: usize = 1024;

pub type LaunchToken = [u8; LAUNCH_TOKEN_SIZE];

/// A raw driver status code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Self = Self(0x0000);
    pub const UNEXPECTED: Self = Self(0x0001);
    pub const INVALID_PARAMETER: Self = Self(0x0002);
    pub const OUT_OF_MEMORY: Self = Self(0x0003);
    pub const INVALID_ENCLAVE: Self = Self(0x2001);
    pub const INVALID_ENCLAVE_ID: Self = Self(0x2002);
    pub const ENCLAVE_FILE_ACCESS: Self = Self(0x200f);

    /// Creation was interrupted and may succeed if tried again.
    pub const ENCLAVE_CREATE_INTERRUPTED: Self = Self(0xf001);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "success",
            Self::UNEXPECTED => "unexpected error",
            Self::INVALID_PARAMETER => "invalid parameter",
            Self::OUT_OF_MEMORY => "out of memory",
            Self::INVALID_ENCLAVE => "invalid enclave image",
            Self::INVALID_ENCLAVE_ID => "invalid enclave id",
            Self::ENCLAVE_FILE_ACCESS => "cannot open enclave file",
            Self::ENCLAVE_CREATE_INTERRUPTED => "enclave creation interrupted",
            _ => "unknown status",
        };

        write!(f, "{} ({:#06x})", name, self.0)
    }
}

/// One line of platform support information.
#[derive(Clone, Debug, Serialize)]
pub struct Datum {
    /// The name of this datum.
    pub name: String,

    /// Whether the datum indicates support for the platform or not.
    pub pass: bool,

    /// Short additional information to display to the user.
    pub info: Option<String>,

    /// Longer explanatory message on how to resolve problems.
    pub mesg: Option<String>,
}

/// The bytes of an enclave image.
#[derive(Copy, Clone, Debug)]
pub enum Image<'a> {
    File(&'a Path),
    Buffer(&'a [u8]),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Where the enclave must be placed, if anywhere in particular.
    pub base_address: Option<usize>,

    /// The requested size, or zero for the driver's choice.
    pub size: usize,
    pub debug: bool,
    pub enable_fork: bool,
}

/// What a driver reports about a freshly created enclave.
pub struct Created {
    pub id: u64,
    pub base_address: usize,
    pub token: Box<LaunchToken>,
}

/// The hardware seam: creates, enters and destroys enclaves.
pub trait Driver: Send + Sync {
    /// The name of the driver
    fn name(&self) -> &'static str;

    /// Whether or not the platform has support for this driver
    fn have(&self) -> bool {
        !self.data().iter().fold(false, |e, d| e | !d.pass)
    }

    /// The tests that show platform support for the driver
    fn data(&self) -> Vec<Datum>;

    fn create(&self, image: &Image<'_>, options: &CreateOptions)
        -> std::result::Result<Created, Status>;

    fn size(&self, id: u64) -> std::result::Result<usize, Status>;

    /// Enter the fixed entry point of enclave `id`.
    ///
    /// The returned status describes the boundary crossing only; the trusted
    /// side reports its own outcome in `transfer.retval`.
    fn ecall(&self, id: u64, transfer: &mut Transfer) -> Status;

    fn destroy(&self, id: u64) -> Status;
}

/// Identity of, and the call path into, one live enclave.
pub trait ClientHandle: Send + Sync {
    fn id(&self) -> u64;
    fn base_address(&self) -> usize;
    fn size(&self) -> usize;
    fn launch_token(&self) -> &[u8];

    /// Cross the boundary with `selector` and `params`.
    fn enclave_call(&self, selector: Selector, params: &mut ParameterStack) -> Result<()>;

    fn destroy(&self) -> Result<()>;
}

/// A [`ClientHandle`] for an enclave created by a [`Driver`].
pub struct Handle {
    driver: Arc<dyn Driver>,
    id: u64,
    base_address: usize,
    size: usize,
    token: Box<LaunchToken>,
}

impl Handle {
    /// Take ownership of `created`, recording the size the driver reports.
    ///
    /// The enclave is destroyed if its size cannot be read.
    pub fn new(driver: Arc<dyn Driver>, created: Created) -> Result<Self> {
        let size = match driver.size(created.id) {
            Ok(size) => size,
            Err(status) => {
                let destroyed = driver.destroy(created.id);
                if !destroyed.is_success() {
                    error!(id = created.id, "failed to destroy enclave: {}", destroyed);
                }

                return Err(Error::backend(status.0, "failed to read enclave size"));
            }
        };

        Ok(Self {
            driver,
            id: created.id,
            base_address: created.base_address,
            size,
            token: created.token,
        })
    }
}

impl ClientHandle for Handle {
    fn id(&self) -> u64 {
        self.id
    }

    fn base_address(&self) -> usize {
        self.base_address
    }

    fn size(&self) -> usize {
        self.size
    }

    fn launch_token(&self) -> &[u8] {
        &self.token[..]
    }

    #[instrument(level = "trace", skip(self, params), fields(id = self.id))]
    fn enclave_call(&self, selector: Selector, params: &mut ParameterStack) -> Result<()> {
        let mut transfer = Transfer::new(selector, params);

        let status = self.driver.ecall(self.id, &mut transfer);
        if !status.is_success() {
            return Err(Error::backend(status.0, "call to enclave entry point failed"));
        }

        // The trusted side does not report why it failed.
        if transfer.retval != 0 {
            trace!(retval = transfer.retval, "enclave call returned failure");
            return Err(Error::Internal("enclave call failed inside enclave".into()));
        }

        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        let status = self.driver.destroy(self.id);
        if !status.is_success() {
            return Err(Error::backend(status.0, "failed to destroy enclave"));
        }

        Ok(())
    }
}

/// Create an enclave, retrying only while creation reports an interruption.
pub fn create_with_retry(
    driver: &dyn Driver,
    image: &Image<'_>,
    options: &CreateOptions,
) -> Result<Created> {
    for attempt in 1..=MAX_CREATE_ATTEMPTS {
        match driver.create(image, options) {
            Ok(created) => return Ok(created),
            Err(status @ Status::ENCLAVE_CREATE_INTERRUPTED) => {
                warn!(
                    attempt,
                    max = MAX_CREATE_ATTEMPTS,
                    driver = driver.name(),
                    "enclave creation failed: {}",
                    status
                );
            }
            Err(status) => {
                return Err(Error::backend(status.0, "failed to create enclave"));
            }
        }
    }

    Err(Error::backend(
        Status::ENCLAVE_CREATE_INTERRUPTED.0,
        format!(
            "enclave creation interrupted {} times",
            MAX_CREATE_ATTEMPTS
        ),
    ))
}

/// A creation request as seen by a [`Backend`].
#[derive(Copy, Clone, Debug)]
pub struct LoadRequest<'a> {
    pub name: &'a str,
    pub base_address: Option<usize>,
    pub size: usize,
    pub debug: bool,
    pub enable_fork: bool,
}

impl LoadRequest<'_> {
    fn create_options(&self) -> CreateOptions {
        CreateOptions {
            base_address: self.base_address,
            size: self.size,
            debug: self.debug,
            enable_fork: self.enable_fork,
        }
    }
}

/// Knows where the bytes of an enclave come from.
pub trait Backend {
    /// What names the enclave bytes: a path, a section name, ...
    type Source: ?Sized;

    /// The name of the backend
    fn name(&self) -> &'static str;

    /// Create the enclave and return a handle to it.
    fn load(&self, request: &LoadRequest<'_>, source: &Self::Source)
        -> Result<Box<dyn ClientHandle>>;
}

/// Load the enclave described by `config` with the backend its extension
/// selects.
pub fn load(config: &LoadConfig, driver: Arc<dyn Driver>) -> Result<Box<dyn ClientHandle>> {
    let sgx = config
        .sgx
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("enclave backend not supported".into()))?;

    let request = LoadRequest {
        name: &config.name,
        base_address: config.base_address(),
        size: sgx.fork.map(|f| f.enclave_size as usize).unwrap_or(0),
        debug: sgx.debug,
        enable_fork: config.config.as_ref().map_or(false, |c| c.enable_fork),
    };

    match &sgx.source {
        Some(SgxSource::File { path }) => sgx::SgxBackend::new(driver).load(&request, path),
        Some(SgxSource::Embedded { section }) => {
            sgx::SgxEmbeddedBackend::new(driver).load(&request, section)
        }
        None => Err(Error::InvalidArgument("SGX enclave source not set".into())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{EnclaveConfig, SgxLoadConfig};

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails creation with `status` the first `failures` times.
    struct Flaky {
        failures: usize,
        status: Status,
        attempts: AtomicUsize,
        retval: i32,
        ecall_status: Status,
    }

    impl Flaky {
        fn new(failures: usize, status: Status) -> Self {
            Self {
                failures,
                status,
                attempts: AtomicUsize::new(0),
                retval: 0,
                ecall_status: Status::SUCCESS,
            }
        }
    }

    impl Driver for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn data(&self) -> Vec<Datum> {
            vec![Datum {
                name: "Flaky".into(),
                pass: true,
                info: None,
                mesg: None,
            }]
        }

        fn create(
            &self,
            _: &Image<'_>,
            _: &CreateOptions,
        ) -> std::result::Result<Created, Status> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(self.status);
            }

            Ok(Created {
                id: 1,
                base_address: 0x1000,
                token: Box::new([0; LAUNCH_TOKEN_SIZE]),
            })
        }

        fn size(&self, _: u64) -> std::result::Result<usize, Status> {
            Ok(0x2000)
        }

        fn ecall(&self, _: u64, transfer: &mut Transfer) -> Status {
            transfer.retval = self.retval;
            self.ecall_status
        }

        fn destroy(&self, _: u64) -> Status {
            Status::SUCCESS
        }
    }

    const IMAGE: Image<'static> = Image::Buffer(b"");

    #[test]
    fn retry_until_success() {
        let driver = Flaky::new(4, Status::ENCLAVE_CREATE_INTERRUPTED);
        assert!(create_with_retry(&driver, &IMAGE, &CreateOptions::default()).is_ok());
        assert_eq!(driver.attempts.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn retry_bound() {
        let driver = Flaky::new(5, Status::ENCLAVE_CREATE_INTERRUPTED);
        let err = create_with_retry(&driver, &IMAGE, &CreateOptions::default())
            .err()
            .unwrap();

        assert_eq!(driver.attempts.load(Ordering::SeqCst), MAX_CREATE_ATTEMPTS);
        assert_eq!(err.backend_code(), Some(0xf001));
    }

    #[test]
    fn no_retry_on_other_failures() {
        let driver = Flaky::new(1, Status::OUT_OF_MEMORY);
        let err = create_with_retry(&driver, &IMAGE, &CreateOptions::default())
            .err()
            .unwrap();

        assert_eq!(driver.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(err.backend_code(), Some(Status::OUT_OF_MEMORY.0));
    }

    #[test]
    fn dispatch_policy() {
        let created = |driver: &Arc<Flaky>| {
            let created = create_with_retry(&**driver, &IMAGE, &CreateOptions::default()).unwrap();
            Handle::new(driver.clone(), created).unwrap()
        };

        let ok = Arc::new(Flaky::new(0, Status::SUCCESS));
        let handle = created(&ok);
        assert_eq!(handle.size(), 0x2000);
        assert_eq!(handle.base_address(), 0x1000);
        assert_eq!(handle.launch_token().len(), LAUNCH_TOKEN_SIZE);
        handle.enclave_call(128, &mut ParameterStack::new()).unwrap();

        let boundary = Arc::new(Flaky {
            ecall_status: Status::UNEXPECTED,
            ..Flaky::new(0, Status::SUCCESS)
        });
        let err = created(&boundary)
            .enclave_call(128, &mut ParameterStack::new())
            .unwrap_err();
        assert_eq!(err.backend_code(), Some(Status::UNEXPECTED.0));

        let inside = Arc::new(Flaky {
            retval: 1,
            ..Flaky::new(0, Status::SUCCESS)
        });
        let err = created(&inside)
            .enclave_call(128, &mut ParameterStack::new())
            .unwrap_err();
        assert_eq!(
            err,
            Error::Internal("enclave call failed inside enclave".into())
        );
    }

    #[test]
    fn load_requires_extension() {
        let driver: Arc<dyn Driver> = Arc::new(Flaky::new(0, Status::SUCCESS));

        let config = LoadConfig {
            name: "demo".into(),
            config: Some(EnclaveConfig::default()),
            sgx: None,
        };
        assert!(matches!(
            load(&config, driver.clone()),
            Err(Error::InvalidArgument(_))
        ));

        let config = LoadConfig {
            sgx: Some(SgxLoadConfig::default()),
            ..config
        };
        assert_eq!(
            load(&config, driver).err(),
            Some(Error::InvalidArgument("SGX enclave source not set".into()))
        );
    }

    #[test]
    fn status_display() {
        assert_eq!(
            Status::ENCLAVE_CREATE_INTERRUPTED.to_string(),
            "enclave creation interrupted (0xf001)"
        );
        assert_eq!(Status(0x1234).to_string(), "unknown status (0x1234)");
    }
}
