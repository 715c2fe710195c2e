// SPDX-License-Identifier: Apache-2.0

//! Routing of host signals into enclaves
//!
//! Each signal number is bound to at most one [`EnclaveClient`]. The routing
//! table is only mutated with every signal blocked on the mutating thread,
//! so a handler can never observe it half updated.

use crate::client::EnclaveClient;
use crate::config::EnclaveSignal;
use crate::error::{Error, Result};

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use libc::{c_int, c_void, siginfo_t};
use once_cell::sync::Lazy;
use tracing::{error, trace};

/// Every signal blocked on the current thread until dropped.
///
/// This is the critical section for code that races signal handlers on the
/// same thread; it is not a lock between threads.
pub struct BlockedSignals {
    previous: libc::sigset_t,
}

impl BlockedSignals {
    pub fn new() -> Result<Self> {
        let mut all = MaybeUninit::<libc::sigset_t>::uninit();
        let mut previous = MaybeUninit::<libc::sigset_t>::uninit();

        unsafe {
            libc::sigfillset(all.as_mut_ptr());

            let rc = libc::pthread_sigmask(libc::SIG_SETMASK, all.as_ptr(), previous.as_mut_ptr());
            if rc != 0 {
                return Err(Error::Internal(format!(
                    "failed to block signals: {}",
                    io::Error::from_raw_os_error(rc)
                )));
            }

            Ok(Self {
                previous: previous.assume_init(),
            })
        }
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut()) };
        if rc != 0 {
            error!(
                "failed to restore signal mask: {}",
                io::Error::from_raw_os_error(rc)
            );
        }
    }
}

/// Routes signal numbers to the enclave that registered for them.
#[derive(Default)]
pub struct SignalDispatcher {
    table: RwLock<HashMap<c_int, Arc<EnclaveClient>>>,
}

static GLOBAL: Lazy<Arc<SignalDispatcher>> = Lazy::new(|| Arc::new(SignalDispatcher::new()));

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The dispatcher fed by handlers from [`install_handler`].
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<c_int, Arc<EnclaveClient>>> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<c_int, Arc<EnclaveClient>>> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `signum` to `client`, returning the client it was bound to.
    pub fn register_signal(
        &self,
        signum: c_int,
        client: Arc<EnclaveClient>,
    ) -> Result<Option<Arc<EnclaveClient>>> {
        let _blocked = BlockedSignals::new()?;
        trace!(signum, client = %client.id(), "register signal");
        Ok(self.write().insert(signum, client))
    }

    pub fn get_client_for_signal(&self, signum: c_int) -> Result<Arc<EnclaveClient>> {
        self.read().get(&signum).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("no enclave has registered signal {}", signum))
        })
    }

    /// The signals currently bound to `client`, in ascending order.
    pub fn signals_for_client(&self, client: &EnclaveClient) -> Vec<c_int> {
        let mut signums: Vec<_> = self
            .read()
            .iter()
            .filter(|(_, bound)| bound.id() == client.id())
            .map(|(signum, _)| *signum)
            .collect();
        signums.sort_unstable();
        signums
    }

    /// Unbind every signal bound to `client` and restore the default
    /// disposition of each.
    ///
    /// Every binding is removed even when resetting a handler fails; the
    /// failures are reported together.
    pub fn deregister_all_signals_for_client(&self, client: &EnclaveClient) -> Result<()> {
        let _blocked = BlockedSignals::new()?;
        let mut table = self.write();

        let signums: Vec<c_int> = table
            .iter()
            .filter(|(_, bound)| bound.id() == client.id())
            .map(|(signum, _)| *signum)
            .collect();

        let mut failures = Vec::new();
        for signum in signums {
            table.remove(&signum);

            if unsafe { libc::signal(signum, libc::SIG_DFL) } == libc::SIG_ERR {
                failures.push(format!("{}: {}", signum, io::Error::last_os_error()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "failed to reset signal handlers: {}",
                failures.join(", ")
            )))
        }
    }

    /// Deliver `signum` into the enclave bound to it.
    ///
    /// # Safety
    ///
    /// `info` and `context` must each be null or point to the `siginfo_t`
    /// and `ucontext_t` the kernel passed to a `SA_SIGINFO` handler.
    pub unsafe fn enter_enclave_and_handle_signal(
        &self,
        signum: c_int,
        info: *const siginfo_t,
        context: *const c_void,
    ) -> Result<()> {
        let client = self.get_client_for_signal(signum)?;

        let signal = EnclaveSignal {
            signum,
            code: info.as_ref().map_or(0, |info| info.si_code),
            gregs: registers(context),
        };

        client.enter_and_handle_signal(&signal)
    }
}

/// The general purpose registers saved in a `ucontext_t`.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn registers(context: *const c_void) -> Vec<u64> {
    match context.cast::<libc::ucontext_t>().as_ref() {
        Some(uc) => uc.uc_mcontext.gregs.iter().map(|r| *r as u64).collect(),
        None => Vec::new(),
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn registers(context: *const c_void) -> Vec<u64> {
    match context.cast::<libc::ucontext_t>().as_ref() {
        Some(uc) => {
            let mc = &uc.uc_mcontext;
            let mut regs: Vec<u64> = mc.regs.to_vec();
            regs.extend([mc.sp, mc.pc, mc.pstate]);
            regs
        }
        None => Vec::new(),
    }
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
unsafe fn registers(_context: *const c_void) -> Vec<u64> {
    Vec::new()
}

extern "C" fn trampoline(signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let dispatcher = SignalDispatcher::global();

    if let Err(e) = unsafe { dispatcher.enter_enclave_and_handle_signal(signum, info, context) } {
        error!(signum, "failed to deliver signal to enclave: {}", e);
    }
}

/// Route `signum` to the enclave bound to it in [`SignalDispatcher::global`].
pub fn install_handler(signum: c_int) -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = trampoline as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigfillset(&mut action.sa_mask);

        if libc::sigaction(signum, &action, ptr::null_mut()) != 0 {
            return Err(Error::InvalidArgument(format!(
                "failed to install handler for signal {}: {}",
                signum,
                io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn blocked(signum: c_int) -> bool {
        unsafe {
            let mut current = MaybeUninit::<libc::sigset_t>::uninit();
            libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), current.as_mut_ptr());
            libc::sigismember(current.as_ptr(), signum) == 1
        }
    }

    #[test]
    fn block_and_restore() {
        assert!(!blocked(libc::SIGUSR2));
        {
            let _blocked = BlockedSignals::new().unwrap();
            assert!(blocked(libc::SIGUSR2));
            assert!(blocked(libc::SIGTERM));
        }
        assert!(!blocked(libc::SIGUSR2));
    }

    #[test]
    fn unknown_signal() {
        let dispatcher = SignalDispatcher::new();
        assert_eq!(
            dispatcher.get_client_for_signal(libc::SIGUSR2).err(),
            Some(Error::InvalidArgument(
                "no enclave has registered signal 12".into()
            ))
        );

        assert!(matches!(
            unsafe {
                dispatcher.enter_enclave_and_handle_signal(libc::SIGUSR2, ptr::null(), ptr::null())
            },
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn null_context_has_no_registers() {
        assert!(unsafe { registers(ptr::null()) }.is_empty());
    }

    #[test]
    fn invalid_handler() {
        assert!(matches!(
            install_handler(libc::SIGKILL),
            Err(Error::InvalidArgument(_))
        ));
    }
}
