// SPDX-License-Identifier: Apache-2.0

use enclave_manager::backend::sim;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Args;

/// Write an enclave image of a built-in program for the simulation driver
#[derive(Args, Debug)]
pub struct Options {
    /// Program the image starts
    #[clap(long)]
    pub program: String,

    /// Path of the image to write
    #[clap(long, short, value_name = "IMAGE", parse(from_os_str))]
    pub output: PathBuf,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let programs = sim::Driver::with_builtins().programs();
        if !programs.contains(&self.program) {
            bail!(
                "unknown program {:?}, expected one of: {}",
                self.program,
                programs.join(", ")
            );
        }

        fs::write(&self.output, sim::image(&self.program))
            .with_context(|| format!("failed to write {}", self.output.display()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_image() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("echo.enclave");

        Options {
            program: "echo".into(),
            output: output.clone(),
        }
        .execute()
        .unwrap();

        assert_eq!(fs::read(&output).unwrap(), sim::image("echo"));
    }

    #[test]
    fn unknown_program() {
        let dir = tempfile::tempdir().unwrap();

        assert!(Options {
            program: "nope".into(),
            output: dir.path().join("nope.enclave"),
        }
        .execute()
        .is_err());
    }
}
