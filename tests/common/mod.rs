// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use enclave_manager::backend::sim::{self, Host, TrustedApplication};
use enclave_manager::config::{
    EnclaveConfig, EnclaveFinal, EnclaveInput, EnclaveOutput, EnclaveSignal, ManagerOptions,
};
use enclave_manager::{EnclaveManager, Error, Result, Runtime, SignalDispatcher};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mmarinus::{perms, Map};

/// A program that records what the host asks of it.
pub const RECORDER: &str = "recorder";

/// A recorder whose initialization always fails.
pub const FAILING_INIT: &str = "failing-init";

/// A recorder whose finalization always fails.
pub const FAILING_FINALIZE: &str = "failing-finalize";

/// What every recorder instance of a fixture observed.
#[derive(Default)]
pub struct Journal {
    pub configs: Mutex<Vec<EnclaveConfig>>,
    pub signals: Mutex<Vec<EnclaveSignal>>,
    pub finalized: AtomicUsize,
}

impl Journal {
    pub fn signals(&self) -> Vec<EnclaveSignal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

struct Recorder {
    journal: Arc<Journal>,
    fail_initialize: bool,
    fail_finalize: bool,
}

impl TrustedApplication for Recorder {
    fn initialize(&self, _host: &Host, name: &str, config: &EnclaveConfig) -> Result<Vec<u8>> {
        if self.fail_initialize {
            return Err(Error::Internal("refusing to initialize".into()));
        }

        self.journal.configs.lock().unwrap().push(config.clone());
        Ok(name.as_bytes().to_vec())
    }

    fn run(&self, _host: &Host, input: &EnclaveInput) -> Result<EnclaveOutput> {
        Ok(EnclaveOutput {
            data: input.data.iter().rev().copied().collect(),
        })
    }

    fn handle_signal(&self, _host: &Host, signal: &EnclaveSignal) -> Result<()> {
        self.journal.signals.lock().unwrap().push(signal.clone());
        Ok(())
    }

    fn finalize(&self, _host: &Host, _input: &EnclaveFinal) -> Result<()> {
        self.journal.finalized.fetch_add(1, Ordering::SeqCst);

        match self.fail_finalize {
            true => Err(Error::Internal("refusing to finalize".into())),
            false => Ok(()),
        }
    }
}

/// A recorder writing to `journal`.
pub fn recorder(journal: Arc<Journal>) -> Arc<dyn TrustedApplication> {
    Arc::new(Recorder {
        journal,
        fail_initialize: false,
        fail_finalize: false,
    })
}

/// A manager with a private runtime and signal table, over a simulation
/// driver that knows the recorder programs.
pub struct Fixture {
    pub manager: Arc<EnclaveManager>,
    pub signals: Arc<SignalDispatcher>,
    pub driver: Arc<sim::Driver>,
    pub journal: Arc<Journal>,
}

pub fn fixture() -> Fixture {
    let signals = Arc::new(SignalDispatcher::new());
    let runtime = Runtime::new(signals.clone());
    runtime.configure(ManagerOptions::default()).unwrap();

    let journal = Arc::new(Journal::default());
    let driver = Arc::new(sim::Driver::with_builtins());

    for (program, fail_initialize, fail_finalize) in [
        (RECORDER, false, false),
        (FAILING_INIT, true, false),
        (FAILING_FINALIZE, false, true),
    ] {
        let journal = journal.clone();
        driver
            .register(program, move || -> Arc<dyn TrustedApplication> {
                Arc::new(Recorder {
                    journal: journal.clone(),
                    fail_initialize,
                    fail_finalize,
                })
            })
            .unwrap();
    }

    Fixture {
        manager: runtime.instance().unwrap(),
        signals,
        driver,
        journal,
    }
}

/// An address at which `size` bytes are currently unmapped.
pub fn free_address(size: usize) -> usize {
    let map = Map::bytes(size)
        .anywhere()
        .anonymously()
        .with(perms::None)
        .unwrap();

    map.addr()
}
