// SPDX-License-Identifier: Apache-2.0

//! The name and client indexes of the manager, kept as one entity.
//!
//! A name is present iff its client is, and a fork-enabled client's load
//! config is present iff the client is. Every mutation updates all three.

use crate::client::{ClientId, EnclaveClient};
use crate::config::LoadConfig;
use crate::error::{Error, Result};

use std::collections::HashMap;
use std::sync::Arc;

struct Entry {
    client: Arc<EnclaveClient>,
    load_config: Option<LoadConfig>,

    /// Set once the client is initialized; unpublished entries only
    /// reserve their name.
    published: bool,
}

#[derive(Default)]
pub(crate) struct Registry {
    by_name: HashMap<String, Entry>,
    names: HashMap<ClientId, String>,
}

impl Registry {
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Reserve `name` for `client` without making it visible to lookups.
    pub fn insert(
        &mut self,
        name: &str,
        client: Arc<EnclaveClient>,
        load_config: Option<LoadConfig>,
    ) -> Result<()> {
        if self.contains(name) {
            return Err(Error::AlreadyExists(format!("name already exists: {}", name)));
        }

        self.names.insert(client.id(), name.into());
        self.by_name.insert(
            name.into(),
            Entry {
                client,
                load_config,
                published: false,
            },
        );

        Ok(())
    }

    /// Make the client registered as `id` visible to lookups by name.
    pub fn publish(&mut self, id: ClientId) -> bool {
        let name = match self.names.get(&id) {
            Some(name) => name,
            None => return false,
        };

        match self.by_name.get_mut(name) {
            Some(entry) => {
                entry.published = true;
                true
            }
            None => false,
        }
    }

    pub fn client(&self, name: &str) -> Option<Arc<EnclaveClient>> {
        self.by_name
            .get(name)
            .filter(|entry| entry.published)
            .map(|entry| entry.client.clone())
    }

    pub fn name(&self, id: ClientId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn load_config(&self, id: ClientId) -> Option<&LoadConfig> {
        let name = self.names.get(&id)?;
        self.by_name.get(name)?.load_config.as_ref()
    }

    /// Remove the client registered as `id` from every index.
    pub fn remove(&mut self, id: ClientId) -> Option<Arc<EnclaveClient>> {
        let name = self.names.remove(&id)?;
        self.by_name.remove(&name).map(|entry| entry.client)
    }

    /// Remove whatever is registered under `name` from every index.
    pub fn remove_name(&mut self, name: &str) -> Option<Arc<EnclaveClient>> {
        let entry = self.by_name.remove(name)?;
        self.names.remove(&entry.client.id());
        Some(entry.client)
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.by_name.len(), self.names.len());
        self.by_name.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::sim::{self, Driver};
    use crate::backend::{create_with_retry, CreateOptions, Handle, Image};
    use crate::primitives::DispatchTable;

    fn client(name: &str) -> Arc<EnclaveClient> {
        let driver = Arc::new(Driver::with_builtins());
        let image = sim::image("echo");
        let created =
            create_with_retry(&*driver, &Image::Buffer(&image), &CreateOptions::default())
                .unwrap();
        let handle = Handle::new(driver, created).unwrap();

        Arc::new(EnclaveClient::new(
            name,
            Box::new(handle),
            Box::new(DispatchTable::new()),
        ))
    }

    #[test]
    fn publish_controls_visibility() {
        let mut registry = Registry::default();
        let a = client("a");

        registry.insert("a", a.clone(), None).unwrap();
        assert!(registry.contains("a"));
        assert!(registry.client("a").is_none());
        assert_eq!(registry.name(a.id()), Some("a"));

        assert!(registry.publish(a.id()));
        assert_eq!(registry.client("a").unwrap().id(), a.id());
    }

    #[test]
    fn unique_names() {
        let mut registry = Registry::default();
        let a = client("a");
        let b = client("a");

        registry.insert("a", a.clone(), None).unwrap();
        registry.publish(a.id());

        assert!(matches!(
            registry.insert("a", b.clone(), None),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(registry.client("a").unwrap().id(), a.id());
        assert_eq!(registry.name(b.id()), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removal_clears_every_index() {
        let mut registry = Registry::default();
        let a = client("a");
        let config = LoadConfig {
            name: "a".into(),
            ..Default::default()
        };

        registry.insert("a", a.clone(), Some(config.clone())).unwrap();
        assert_eq!(registry.load_config(a.id()), Some(&config));

        assert_eq!(registry.remove(a.id()).unwrap().id(), a.id());
        assert!(!registry.contains("a"));
        assert_eq!(registry.name(a.id()), None);
        assert_eq!(registry.load_config(a.id()), None);
        assert!(registry.remove(a.id()).is_none());
        assert!(!registry.publish(a.id()));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn remove_by_name() {
        let mut registry = Registry::default();
        let a = client("a");

        registry.insert("a", a.clone(), None).unwrap();
        assert_eq!(registry.remove_name("a").unwrap().id(), a.id());
        assert_eq!(registry.name(a.id()), None);
        assert!(registry.remove_name("a").is_none());
    }
}
