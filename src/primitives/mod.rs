// SPDX-License-Identifier: Apache-2.0

//! The trust-boundary call layer
//!
//! Every call into an enclave is a selector plus a [`ParameterStack`] handed
//! to a single fixed entry point inside a [`Transfer`] record. Code above this
//! layer speaks in typed [`Call`]s; only the boundary sees raw extents.

mod exit;
mod extent;

pub use exit::{dispatch_exit_call, DispatchTable, ExitCallProvider, ExitHandler, ExitScope};
pub use extent::{Extent, ParameterStack};

/// An opaque integer naming the operation a call invokes.
pub type Selector = u64;

/// Selectors understood by every enclave entry point.
pub mod selector {
    use super::Selector;

    /// The first selector available to user-defined calls.
    pub const USER: Selector = 128;

    pub const INIT: Selector = USER + 1;
    pub const RUN: Selector = USER + 2;
    pub const FINALIZE: Selector = USER + 3;
    pub const HANDLE_SIGNAL: Selector = USER + 4;

    /// Calls made from inside an enclave out to the host.
    pub mod exit {
        use super::Selector;

        /// Read a named host clock: pushes {name, nanoseconds out}.
        pub const READ_CLOCK: Selector = 1;
    }
}

/// The record handed to the fixed trusted entry point.
#[repr(C)]
#[derive(Debug)]
pub struct Transfer {
    pub selector: Selector,
    pub params: *mut ParameterStack,

    /// Zero when the trusted side completed the call.
    pub retval: i32,
}

impl Transfer {
    pub fn new(selector: Selector, params: &mut ParameterStack) -> Self {
        Self {
            selector,
            params,
            retval: 0,
        }
    }
}

/// A typed call into an enclave.
///
/// Each variant owns the layout of its arguments. Outputs are host buffers
/// the trusted side fills in place.
#[derive(Debug)]
pub enum Call<'a> {
    /// Must be the first call made into a freshly created enclave.
    Initialize {
        name: &'a str,
        input: &'a [u8],
        output: &'a mut Vec<u8>,
        output_len: &'a mut usize,
    },
    Run {
        input: &'a [u8],
        output: &'a mut Vec<u8>,
    },
    HandleSignal {
        input: &'a [u8],
    },
    Finalize {
        input: &'a [u8],
    },
    User {
        selector: Selector,
        params: ParameterStack,
    },
}

impl Call<'_> {
    pub fn selector(&self) -> Selector {
        match self {
            Self::Initialize { .. } => selector::INIT,
            Self::Run { .. } => selector::RUN,
            Self::HandleSignal { .. } => selector::HANDLE_SIGNAL,
            Self::Finalize { .. } => selector::FINALIZE,
            Self::User { selector, .. } => *selector,
        }
    }

    /// Flatten the call into the extents that cross the boundary.
    pub fn marshal(self) -> (Selector, ParameterStack) {
        let selector = self.selector();

        let params = match self {
            Self::Initialize {
                name,
                input,
                output,
                output_len,
            } => {
                let mut params = ParameterStack::new();
                params.push_by_reference(Extent::from_slice(name.as_bytes()));
                params.push_by_reference(Extent::from_slice(input));
                params.push_by_reference(Extent::from_mut(output));
                params.push_by_reference(Extent::from_mut(output_len));
                params
            }

            Self::Run { input, output } => {
                let mut params = ParameterStack::new();
                params.push_by_reference(Extent::from_slice(input));
                params.push_by_reference(Extent::from_mut(output));
                params
            }

            Self::HandleSignal { input } | Self::Finalize { input } => {
                let mut params = ParameterStack::new();
                params.push_by_reference(Extent::from_slice(input));
                params
            }

            Self::User { params, .. } => params,
        };

        (selector, params)
    }
}
