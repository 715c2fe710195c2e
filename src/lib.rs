// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod loader;
pub mod manager;
pub mod primitives;
pub mod resources;
pub mod signal;

mod registry;

pub use client::EnclaveClient;
pub use error::{Error, Result};
pub use loader::Loader;
pub use manager::{EnclaveManager, Runtime};
pub use signal::SignalDispatcher;
