// SPDX-License-Identifier: Apache-2.0

//! Command line front end of the enclave manager.
//!
//! Shows what the available drivers support, writes enclave images for the
//! simulation driver and runs an enclave through a full lifecycle.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

mod cli;

use clap::Parser;

fn main() -> anyhow::Result<()> {
    cli::Options::parse().execute()
}
