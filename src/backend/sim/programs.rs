// SPDX-License-Identifier: Apache-2.0

//! Programs every simulation driver built with
//! [`Driver::with_builtins`](super::Driver::with_builtins) can load.

use super::{Factory, Host, TrustedApplication};
use crate::clock::{MONOTONIC, REALTIME};
use crate::config::{EnclaveConfig, EnclaveFinal, EnclaveInput, EnclaveOutput, EnclaveSignal};
use crate::error::{Error, Result};

use std::sync::Arc;

pub(super) fn builtins() -> Vec<(&'static str, Factory)> {
    vec![
        ("echo", Box::new(|| Arc::new(Echo) as Arc<dyn TrustedApplication>) as Factory),
        ("clock", Box::new(|| Arc::new(Clock) as Arc<dyn TrustedApplication>) as Factory),
    ]
}

/// Returns its input. Initialization hands back the enclave name.
pub struct Echo;

impl TrustedApplication for Echo {
    fn initialize(&self, _: &Host, name: &str, _: &EnclaveConfig) -> Result<Vec<u8>> {
        Ok(name.as_bytes().to_vec())
    }

    fn run(&self, _: &Host, input: &EnclaveInput) -> Result<EnclaveOutput> {
        Ok(EnclaveOutput {
            data: input.data.clone(),
        })
    }

    fn handle_signal(&self, _: &Host, _: &EnclaveSignal) -> Result<()> {
        Ok(())
    }

    fn finalize(&self, _: &Host, _: &EnclaveFinal) -> Result<()> {
        Ok(())
    }
}

/// Reads a host clock through the exit-call path.
///
/// The input names the clock (`monotonic` or `realtime`, default
/// `monotonic`); the output is its value in nanoseconds as decimal text.
pub struct Clock;

impl TrustedApplication for Clock {
    fn initialize(&self, host: &Host, _: &str, _: &EnclaveConfig) -> Result<Vec<u8>> {
        // The host must publish its clocks before any enclave starts.
        host.read_clock(MONOTONIC)?;
        Ok(Vec::new())
    }

    fn run(&self, host: &Host, input: &EnclaveInput) -> Result<EnclaveOutput> {
        let name = match &input.data[..] {
            b"" | b"monotonic" => MONOTONIC,
            b"realtime" => REALTIME,
            _ => return Err(Error::InvalidArgument("unknown clock".into())),
        };

        Ok(EnclaveOutput {
            data: host.read_clock(name)?.to_string().into_bytes(),
        })
    }

    fn handle_signal(&self, _: &Host, _: &EnclaveSignal) -> Result<()> {
        Ok(())
    }

    fn finalize(&self, _: &Host, _: &EnclaveFinal) -> Result<()> {
        Ok(())
    }
}
