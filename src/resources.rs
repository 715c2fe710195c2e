// SPDX-License-Identifier: Apache-2.0

//! Named host resources shared with enclaves.

use crate::error::{Error, Result};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SharedKind {
    /// A plain memory location.
    Address,
}

/// The key of a shared resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SharedName {
    pub kind: SharedKind,
    pub name: String,
}

impl SharedName {
    pub fn address(name: impl Into<String>) -> Self {
        Self {
            kind: SharedKind::Address,
            name: name.into(),
        }
    }
}

impl fmt::Display for SharedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SharedKind::Address => write!(f, "address:{}", self.name),
        }
    }
}

type Resource = Arc<dyn Any + Send + Sync>;

/// A table of typed resources registered by the host.
#[derive(Default)]
pub struct SharedResources {
    table: RwLock<HashMap<SharedName, Resource>>,
}

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource whose lifetime the table does not manage beyond
    /// holding a reference.
    pub fn register_unmanaged(&self, name: SharedName, resource: Resource) -> Result<()> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());

        if table.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("shared resource {}", name)));
        }

        table.insert(name, resource);
        Ok(())
    }

    /// The resource called `name`, if it exists and is a `T`.
    pub fn acquire<T: Any + Send + Sync>(&self, name: &SharedName) -> Option<Arc<T>> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .and_then(|resource| resource.downcast::<T>().ok())
    }
}
