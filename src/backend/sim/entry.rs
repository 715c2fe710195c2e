// SPDX-License-Identifier: Apache-2.0

//! The fixed entry point of a simulated enclave.

use super::{Host, TrustedApplication};
use crate::config::{EnclaveConfig, EnclaveFinal, EnclaveInput, EnclaveSignal};
use crate::error::{Error, Result};
use crate::primitives::{selector, Extent, ParameterStack, Transfer};

use tracing::debug;

fn pop(params: &mut ParameterStack) -> Result<Extent> {
    params
        .pop()
        .ok_or_else(|| Error::InvalidArgument("missing call parameter".into()))
}

/// # Safety
///
/// `extent` must name a live, exclusively borrowed `T`.
unsafe fn output<'a, T>(extent: Extent) -> Result<&'a mut T> {
    extent
        .as_mut()
        .ok_or_else(|| Error::InvalidArgument("malformed output parameter".into()))
}

fn initialize(app: &dyn TrustedApplication, host: &Host, params: &mut ParameterStack) -> Result<()> {
    let output_len = pop(params)?;
    let out = pop(params)?;
    let input = pop(params)?;
    let name = pop(params)?;

    // SAFETY: the extents were pushed by reference for the duration of
    // this call.
    let (name, input) = unsafe { (name.as_bytes(), input.as_bytes()) };
    let name = std::str::from_utf8(name)
        .map_err(|_| Error::InvalidArgument("enclave name is not UTF-8".into()))?;
    let config: EnclaveConfig = bincode::deserialize(input)?;

    let bytes = app.initialize(host, name, &config)?;

    let (out, output_len) = unsafe { (output::<Vec<u8>>(out)?, output::<usize>(output_len)?) };
    *output_len = bytes.len();
    *out = bytes;
    Ok(())
}

fn run(app: &dyn TrustedApplication, host: &Host, params: &mut ParameterStack) -> Result<()> {
    let out = pop(params)?;
    let input = pop(params)?;

    let input: EnclaveInput = bincode::deserialize(unsafe { input.as_bytes() })?;
    let output = app.run(host, &input)?;

    *unsafe { self::output::<Vec<u8>>(out)? } = bincode::serialize(&output)?;
    Ok(())
}

fn handle_signal(
    app: &dyn TrustedApplication,
    host: &Host,
    params: &mut ParameterStack,
) -> Result<()> {
    let input = pop(params)?;
    let signal: EnclaveSignal = bincode::deserialize(unsafe { input.as_bytes() })?;
    app.handle_signal(host, &signal)
}

fn finalize(app: &dyn TrustedApplication, host: &Host, params: &mut ParameterStack) -> Result<()> {
    let input = pop(params)?;
    let input: EnclaveFinal = bincode::deserialize(unsafe { input.as_bytes() })?;
    app.finalize(host, &input)
}

/// Dispatch `transfer` by selector and record the outcome in its `retval`.
///
/// Failures inside the enclave are reduced to a nonzero `retval`.
pub(super) fn enter(app: &dyn TrustedApplication, transfer: &mut Transfer) {
    let host = Host(());

    // SAFETY: the caller keeps the parameter stack alive across the call.
    let result = match unsafe { transfer.params.as_mut() } {
        None => Err(Error::InvalidArgument("no parameter stack".into())),
        Some(params) => match transfer.selector {
            selector::INIT => initialize(app, &host, params),
            selector::RUN => run(app, &host, params),
            selector::HANDLE_SIGNAL => handle_signal(app, &host, params),
            selector::FINALIZE => finalize(app, &host, params),
            other => app.call(&host, other, params),
        },
    };

    transfer.retval = match result {
        Ok(()) => 0,
        Err(err) => {
            debug!(selector = transfer.selector, "trusted call failed: {}", err);
            1
        }
    };
}
