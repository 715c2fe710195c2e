// SPDX-License-Identifier: Apache-2.0

//! A live enclave and its lifecycle operations.

use crate::backend::ClientHandle;
use crate::config::{EnclaveConfig, EnclaveFinal, EnclaveInput, EnclaveOutput, EnclaveSignal};
use crate::error::{Error, Result};
use crate::primitives::{Call, ExitCallProvider, ExitScope};

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use tracing::{debug, instrument};

/// A process-unique client identity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Created,
    Initializing,
    Initialized,
    Finalized,
    Destroyed,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Initializing,
            2 => Self::Initialized,
            3 => Self::Finalized,
            _ => Self::Destroyed,
        }
    }
}

/// One live enclave.
///
/// The client owns the handle of its enclave and the table serving the
/// calls the enclave makes out to the host. Lifecycle state is kept in an
/// atomic so that signal delivery never waits on a lock.
pub struct EnclaveClient {
    id: ClientId,
    name: String,
    handle: Box<dyn ClientHandle>,
    exits: Box<dyn ExitCallProvider>,
    state: AtomicU8,
}

impl fmt::Debug for EnclaveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveClient")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enclave", &self.handle.id())
            .field("state", &self.state())
            .finish()
    }
}

impl EnclaveClient {
    pub fn new(
        name: impl Into<String>,
        handle: Box<dyn ClientHandle>,
        exits: Box<dyn ExitCallProvider>,
    ) -> Self {
        Self {
            id: ClientId::next(),
            name: name.into(),
            handle,
            exits,
            state: AtomicU8::new(State::Created as u8),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn handle(&self) -> &dyn ClientHandle {
        &*self.handle
    }

    pub fn exit_call_provider(&self) -> &dyn ExitCallProvider {
        &*self.exits
    }

    fn transition(&self, from: State, to: State, op: &str) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| {
                Error::FailedPrecondition(format!(
                    "cannot {} enclave {} in state {:?}",
                    op,
                    self.name,
                    State::from_u8(current)
                ))
            })
    }

    fn require(&self, state: State, op: &str) -> Result<()> {
        match self.state() {
            current if current == state => Ok(()),
            current => Err(Error::FailedPrecondition(format!(
                "cannot {} enclave {} in state {:?}",
                op, self.name, current
            ))),
        }
    }

    /// Make a typed call into the enclave.
    ///
    /// Calls the enclave makes out to the host while this runs are served
    /// by this client's exit-call provider.
    pub fn enclave_call(&self, call: Call<'_>) -> Result<()> {
        let (selector, mut params) = call.marshal();
        let _scope = ExitScope::enter(&*self.exits);
        self.handle.enclave_call(selector, &mut params)
    }

    /// Initialize the enclave and return its initialization output.
    #[instrument(level = "debug", skip(self, config), fields(name = %self.name))]
    pub fn enter_and_initialize(&self, config: &EnclaveConfig) -> Result<Vec<u8>> {
        self.transition(State::Created, State::Initializing, "initialize")?;

        let input = bincode::serialize(config)?;
        let mut output = Vec::new();
        let mut output_len = 0usize;

        let result = self.enclave_call(Call::Initialize {
            name: &self.name,
            input: &input,
            output: &mut output,
            output_len: &mut output_len,
        });

        match result {
            Ok(()) => {
                self.transition(State::Initializing, State::Initialized, "initialize")?;
                output.truncate(output_len);
                Ok(output)
            }
            Err(e) => {
                // Failed initialization may be retried until destroyed. A
                // destroy that got in first keeps the enclave destroyed.
                let reset = self.transition(State::Initializing, State::Created, "initialize");
                if let Err(lost) = reset {
                    debug!("not resetting after failed initialization: {}", lost);
                }
                Err(e)
            }
        }
    }

    pub fn enter_and_run(&self, input: &EnclaveInput) -> Result<EnclaveOutput> {
        self.require(State::Initialized, "run")?;

        let input = bincode::serialize(input)?;
        let mut output = Vec::new();
        self.enclave_call(Call::Run {
            input: &input,
            output: &mut output,
        })?;

        Ok(bincode::deserialize(&output)?)
    }

    pub fn enter_and_handle_signal(&self, signal: &EnclaveSignal) -> Result<()> {
        self.require(State::Initialized, "deliver a signal to")?;

        let input = bincode::serialize(signal)?;
        self.enclave_call(Call::HandleSignal { input: &input })
    }

    /// Finalize the enclave. No further runs are accepted afterwards.
    #[instrument(level = "debug", skip(self, input), fields(name = %self.name))]
    pub fn enter_and_finalize(&self, input: &EnclaveFinal) -> Result<()> {
        self.transition(State::Initialized, State::Finalized, "finalize")?;

        let input = bincode::serialize(input)?;
        self.enclave_call(Call::Finalize { input: &input })
    }

    /// Destroy the enclave. This is final.
    #[instrument(level = "debug", skip(self), fields(name = %self.name))]
    pub fn destroy_enclave(&self) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            if State::from_u8(current) == State::Destroyed {
                return Err(Error::FailedPrecondition(format!(
                    "enclave {} is already destroyed",
                    self.name
                )));
            }

            match self.state.compare_exchange_weak(
                current,
                State::Destroyed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        debug!(enclave = self.handle.id(), "destroying enclave");
        self.handle.destroy()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::sim::{self, Driver};
    use crate::backend::{create_with_retry, CreateOptions, Handle, Image};
    use crate::primitives::{DispatchTable, ParameterStack, Selector};

    use std::sync::{Arc, Weak};

    use once_cell::sync::OnceCell;

    fn echo(name: &str) -> EnclaveClient {
        let driver = Arc::new(Driver::with_builtins());
        let image = sim::image("echo");
        let created =
            create_with_retry(&*driver, &Image::Buffer(&image), &CreateOptions::default())
                .unwrap();
        let handle = Handle::new(driver, created).unwrap();

        EnclaveClient::new(name, Box::new(handle), Box::new(DispatchTable::new()))
    }

    #[test]
    fn lifecycle() {
        let client = echo("lifecycle");
        assert_eq!(client.state(), State::Created);

        assert!(matches!(
            client.enter_and_run(&EnclaveInput::default()),
            Err(Error::FailedPrecondition(_))
        ));

        let output = client
            .enter_and_initialize(&EnclaveConfig::default())
            .unwrap();
        assert_eq!(output, b"lifecycle");
        assert_eq!(client.state(), State::Initialized);

        assert!(matches!(
            client.enter_and_initialize(&EnclaveConfig::default()),
            Err(Error::FailedPrecondition(_))
        ));

        let output = client
            .enter_and_run(&EnclaveInput {
                data: b"ping".to_vec(),
            })
            .unwrap();
        assert_eq!(output.data, b"ping");

        client
            .enter_and_handle_signal(&EnclaveSignal {
                signum: libc::SIGUSR1,
                ..Default::default()
            })
            .unwrap();

        client.enter_and_finalize(&EnclaveFinal::default()).unwrap();
        assert_eq!(client.state(), State::Finalized);
        assert!(matches!(
            client.enter_and_run(&EnclaveInput::default()),
            Err(Error::FailedPrecondition(_))
        ));

        client.destroy_enclave().unwrap();
        assert_eq!(client.state(), State::Destroyed);
        assert!(matches!(
            client.destroy_enclave(),
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[test]
    fn destroy_without_initialize() {
        let client = echo("early");
        client.destroy_enclave().unwrap();
        assert!(matches!(
            client.enter_and_initialize(&EnclaveConfig::default()),
            Err(Error::FailedPrecondition(_))
        ));
    }

    /// A handle that destroys its own client from inside initialization.
    struct DestroyedDuringCall(Arc<OnceCell<Weak<EnclaveClient>>>);

    impl ClientHandle for DestroyedDuringCall {
        fn id(&self) -> u64 {
            1
        }

        fn base_address(&self) -> usize {
            0
        }

        fn size(&self) -> usize {
            0
        }

        fn launch_token(&self) -> &[u8] {
            &[]
        }

        fn enclave_call(&self, _selector: Selector, _params: &mut ParameterStack) -> Result<()> {
            if let Some(client) = self.0.get().and_then(Weak::upgrade) {
                client.destroy_enclave()?;
            }
            Err(Error::Internal("enclave went away".into()))
        }

        fn destroy(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn destroy_during_failed_initialize() {
        let cell = Arc::new(OnceCell::new());
        let client = Arc::new(EnclaveClient::new(
            "racing",
            Box::new(DestroyedDuringCall(cell.clone())),
            Box::new(DispatchTable::new()),
        ));
        cell.set(Arc::downgrade(&client)).unwrap();

        assert_eq!(
            client.enter_and_initialize(&EnclaveConfig::default()),
            Err(Error::Internal("enclave went away".into()))
        );
        assert_eq!(client.state(), State::Destroyed);
        assert!(matches!(
            client.enter_and_initialize(&EnclaveConfig::default()),
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[test]
    fn unique_ids() {
        assert_ne!(echo("a").id(), echo("b").id());
    }
}
