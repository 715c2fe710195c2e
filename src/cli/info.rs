// SPDX-License-Identifier: Apache-2.0

use enclave_manager::backend::{sim, Datum, Driver};

use std::fmt::{self, Formatter};
use std::sync::Arc;

use clap::Args;
use libc::{uname, utsname};
use serde::Serialize;

/// Show details about driver support on this system
#[derive(Args, Debug)]
pub struct Options {
    #[clap(short, long)]
    /// Emit JSON rather than human-readable output
    json: bool,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        fn get_system_info() -> String {
            use std::{ffi::CStr, io, mem::MaybeUninit, os::raw::c_char, str::Utf8Error};

            fn utsname_to_string(mut utsname: utsname) -> Result<String, Utf8Error> {
                fn array_to_str<const N: usize>(
                    array: &'_ mut [c_char; N],
                ) -> Result<&'_ str, Utf8Error> {
                    array[N - 1] = 0;
                    unsafe { CStr::from_ptr(array.as_ptr()) }.to_str()
                }

                Ok(format!(
                    "{} {} {} {}",
                    array_to_str(&mut utsname.sysname)?,
                    array_to_str(&mut utsname.release)?,
                    array_to_str(&mut utsname.version)?,
                    array_to_str(&mut utsname.machine)?,
                ))
            }

            let mut utsname = MaybeUninit::uninit();

            if unsafe { uname(utsname.as_mut_ptr()) } != 0 {
                format!("[{}]", io::Error::last_os_error())
            } else {
                utsname_to_string(unsafe { utsname.assume_init() })
                    .unwrap_or_else(|e| format!("[utf8 error: {e}]"))
            }
        }

        let drivers: Vec<Arc<dyn Driver>> = vec![Arc::new(sim::Driver::with_builtins())];

        let info = Info {
            version: env!("CARGO_PKG_VERSION"),
            system_info: get_system_info(),
            drivers: drivers.iter().map(|d| DriverInfo::new(&**d)).collect(),
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&info)?);
        } else {
            println!("{info}");
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct DriverInfo {
    name: &'static str,
    have: bool,
    data: Vec<Datum>,
}

impl DriverInfo {
    fn new(driver: &dyn Driver) -> Self {
        Self {
            name: driver.name(),
            have: driver.have(),
            data: driver.data(),
        }
    }
}

#[derive(Serialize)]
struct Info {
    version: &'static str,
    system_info: String,
    drivers: Vec<DriverInfo>,
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use colorful::*;

        fn get_icon(is_atty: bool, pass: bool) -> String {
            match is_atty {
                true => match pass {
                    true => "✔".green().to_string(),
                    false => "✗".red().to_string(),
                },
                false => match pass {
                    true => "✔".into(),
                    false => "✗".into(),
                },
            }
        }

        let is_atty = atty::is(atty::Stream::Stdout);

        writeln!(f, "enclave-manager version {}", self.version)?;
        writeln!(f, "System Info: {}", self.system_info)?;

        for driver in &self.drivers {
            let icon = get_icon(is_atty, driver.have);
            writeln!(f, "{} Driver: {}", icon, driver.name)?;

            for datum in &driver.data {
                let icon = get_icon(is_atty, datum.pass);
                write!(f, "  {} {}", icon, datum.name)?;

                if let Some(ref info) = datum.info {
                    write!(f, ": {info}")?;
                }
                writeln!(f)?;
            }

            for datum in &driver.data {
                if let Some(mesg) = datum.mesg.as_ref() {
                    writeln!(f, "\n  {mesg}\n")?;
                }
            }
        }
        Ok(())
    }
}
