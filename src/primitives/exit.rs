// SPDX-License-Identifier: Apache-2.0

use super::{ParameterStack, Selector};
use crate::error::{Error, Result};

use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, RwLock};

use tracing::trace;

/// A host function the trusted side may call out to.
pub type ExitHandler = Box<dyn Fn(&mut ParameterStack) -> Result<()> + Send + Sync>;

/// Routes calls made from inside an enclave to host handlers.
pub trait ExitCallProvider: Send + Sync {
    fn register_exit_handler(&self, selector: Selector, handler: ExitHandler) -> Result<()>;

    fn invoke_exit_handler(&self, selector: Selector, params: &mut ParameterStack) -> Result<()>;
}

/// An [`ExitCallProvider`] backed by a selector table.
#[derive(Default)]
pub struct DispatchTable {
    handlers: RwLock<HashMap<Selector, Arc<ExitHandler>>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExitCallProvider for DispatchTable {
    fn register_exit_handler(&self, selector: Selector, handler: ExitHandler) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());

        if handlers.contains_key(&selector) {
            return Err(Error::AlreadyExists(format!(
                "exit handler for selector {}",
                selector
            )));
        }

        handlers.insert(selector, Arc::new(handler));
        Ok(())
    }

    fn invoke_exit_handler(&self, selector: Selector, params: &mut ParameterStack) -> Result<()> {
        // The handler runs unlocked so it may register further handlers.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&selector)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no exit handler for selector {}", selector))
            })?;

        trace!(selector, "exit call");
        (**handler)(params)
    }
}

thread_local! {
    static CURRENT: Cell<Option<NonNull<dyn ExitCallProvider>>> = Cell::new(None);
}

/// Marks the current thread as inside a call to the enclave owning `provider`.
///
/// Scopes nest; dropping one restores the provider of the enclosing call.
pub struct ExitScope<'a> {
    previous: Option<NonNull<dyn ExitCallProvider>>,
    _provider: std::marker::PhantomData<&'a dyn ExitCallProvider>,
}

impl<'a> ExitScope<'a> {
    pub fn enter(provider: &'a (dyn ExitCallProvider + 'static)) -> Self {
        let previous = CURRENT.with(|c| c.replace(Some(NonNull::from(provider))));

        Self {
            previous,
            _provider: std::marker::PhantomData,
        }
    }
}

impl Drop for ExitScope<'_> {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

/// The untrusted endpoint for calls leaving an enclave.
///
/// The call is routed to the provider of the enclave this thread is
/// currently executing.
pub fn dispatch_exit_call(selector: Selector, params: &mut ParameterStack) -> Result<()> {
    let provider = CURRENT.with(|c| c.get()).ok_or_else(|| {
        Error::FailedPrecondition("exit call made outside of an enclave call".into())
    })?;

    // SAFETY: the pointer was set by a live ExitScope on this thread, which
    // borrows the provider for as long as it is installed.
    unsafe { provider.as_ref() }.invoke_exit_handler(selector, params)
}
