// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging macros.
//!
//! Everything the crate logs goes through these. With the `log` feature they
//! forward to the `log` crate at the matching level. Without it the
//! arguments are still checked by `format_args!`, but nothing is formatted
//! and no strings end up in the binary.

#![allow(unused_macros)]

macro_rules! log_at {
    ($level:ident, $($args:tt)*) => {{
        #[cfg(feature = "log")]
        __raw_log::$level!($($args)*);
        #[cfg(not(feature = "log"))]
        let _ = format_args!($($args)*);
    }};
}

macro_rules! trace {
    ($($args:tt)*) => { log_at!(trace, $($args)*) };
}

macro_rules! info {
    ($($args:tt)*) => { log_at!(info, $($args)*) };
}

macro_rules! warn {
    ($($args:tt)*) => { log_at!(warn, $($args)*) };
}

macro_rules! error {
    ($($args:tt)*) => { log_at!(error, $($args)*) };
}

/// Logs a fatal condition and produces it as an `Err`.
macro_rules! fatal {
    ($fatal:expr) => {{
        let fatal = $fatal;
        error!("fatal: {:?}", fatal);
        Err($crate::Error::Fatal(fatal))
    }};
}

/// Routes log output of every test binary to the harness. Filtered by
/// `NORFTL_LOG`, in `env_logger` syntax.
#[cfg(test)]
#[ctor::ctor]
fn install_test_logger() {
    let _ = env_logger::Builder::new()
        .is_test(true)
        .format_timestamp(None)
        .format_module_path(false)
        .parse_env("NORFTL_LOG")
        .try_init();
}

#[cfg(test)]
mod tests {
    use crate::{Error, Fatal};

    #[test]
    fn fatal_logs_and_yields_error() {
        let lba = 7;
        trace!("checking sector {}", lba);
        let r: Result<(), Error<()>> = fatal!(Fatal::NotErased { lba });
        assert_eq!(r, Err(Error::Fatal(Fatal::NotErased { lba: 7 })));
    }
}
