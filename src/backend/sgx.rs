// SPDX-License-Identifier: Apache-2.0

//! SGX backends: enclaves loaded from a file or from a section of the
//! running binary.

use super::{create_with_retry, Backend, ClientHandle, Driver, Handle, Image, LoadRequest};
use crate::error::{Error, Result};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use goblin::elf::Elf;
use mmarinus::{perms, Map, Private};
use tracing::{debug, instrument};

/// Loads enclaves from signed files on disk.
pub struct SgxBackend {
    driver: Arc<dyn Driver>,
}

impl SgxBackend {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }
}

impl Backend for SgxBackend {
    type Source = Path;

    fn name(&self) -> &'static str {
        "sgx"
    }

    #[instrument(level = "debug", skip(self), fields(driver = self.driver.name()))]
    fn load(&self, request: &LoadRequest<'_>, path: &Path) -> Result<Box<dyn ClientHandle>> {
        let created = create_with_retry(
            &*self.driver,
            &Image::File(path),
            &request.create_options(),
        )?;

        Ok(Box::new(Handle::new(self.driver.clone(), created)?))
    }
}

/// Loads enclaves embedded as an ELF section of the running binary.
pub struct SgxEmbeddedBackend {
    driver: Arc<dyn Driver>,
    binary: PathBuf,
}

impl SgxEmbeddedBackend {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            binary: "/proc/self/exe".into(),
        }
    }
}

impl Backend for SgxEmbeddedBackend {
    type Source = str;

    fn name(&self) -> &'static str {
        "sgx-embedded"
    }

    #[instrument(level = "debug", skip(self), fields(driver = self.driver.name()))]
    fn load(&self, request: &LoadRequest<'_>, section: &str) -> Result<Box<dyn ClientHandle>> {
        // Hold the requested range so nothing else is mapped there while the
        // binary is read. Without a size there is no range to hold.
        let reservation = request
            .base_address
            .filter(|_| request.size > 0)
            .map(|base| Reservation::new(base, request.size))
            .transpose()?;

        let binary = Map::load(&self.binary, Private, perms::Read).map_err(|e| {
            Error::Internal(format!("failed to map {}: {}", self.binary.display(), e.err))
        })?;
        let bytes = find_section(&binary, section)?;
        debug!(section, len = bytes.len(), "found embedded enclave");

        drop(reservation);

        let created = create_with_retry(
            &*self.driver,
            &Image::Buffer(bytes),
            &request.create_options(),
        )?;

        Ok(Box::new(Handle::new(self.driver.clone(), created)?))
    }
}

/// An inaccessible mapping holding an address range until dropped.
pub struct Reservation(Map<perms::None>);

impl Reservation {
    /// Reserve `size` bytes at exactly `base`.
    pub fn new(base: usize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "cannot reserve an empty address range".into(),
            ));
        }

        let map = Map::bytes(size)
            .near(base)
            .anonymously()
            .with(perms::None)
            .map_err(|e| {
                Error::Internal(format!("failed to reserve {:#x}: {}", base, e.err))
            })?;

        if map.addr() != base {
            return Err(Error::Internal(format!(
                "failed to reserve {:#x}: range is in use",
                base
            )));
        }

        Ok(Self(map))
    }

    pub fn addr(&self) -> usize {
        self.0.addr()
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }
}

/// The file contents of the ELF section called `name`.
pub fn find_section<'a>(elf: &'a [u8], name: &str) -> Result<&'a [u8]> {
    let parsed = Elf::parse(elf)
        .map_err(|e| Error::InvalidArgument(format!("failed to parse ELF binary: {}", e)))?;

    let header = parsed
        .section_headers
        .iter()
        .find(|sh| parsed.shdr_strtab.get_at(sh.sh_name) == Some(name))
        .ok_or_else(|| Error::InvalidArgument(format!("section {} not found", name)))?;

    header
        .file_range()
        .and_then(|range| elf.get(range))
        .ok_or_else(|| Error::InvalidArgument(format!("section {} has no contents", name)))
}
