// Copyright 2018-2019 Mozilla

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Arguments;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log};

use crate::error::{ErrorKind, Result};

/// A green light gates each stage of a sync pass. Implementations store a
/// flag, usually as an atomic Boolean, and have `GreenLight::granted` return
/// its value. Revoking the light aborts the pass cleanly: no partial merged
/// state is persisted.
///
/// Since merging is synchronous, it's not possible to revoke the light from
/// the same thread that started the pass. In practice, this means an
/// implementation will be `Send` and `Sync`, too, so that another thread can
/// flip the flag.
pub trait GreenLight {
    /// Indicates if the pass may keep going.
    fn granted(&self) -> bool;

    /// Returns an error if the light was revoked. This helper makes it easier
    /// to use the gate with the `?` operator.
    fn err_if_revoked(&self) -> Result<()> {
        if self.granted() {
            Ok(())
        } else {
            Err(ErrorKind::Aborted.into())
        }
    }
}

/// A default light that's always green.
pub struct AlwaysGreen;

impl GreenLight for AlwaysGreen {
    fn granted(&self) -> bool {
        true
    }
}

/// A revocable green light, shared between the thread running the pass and
/// the thread that owns cancellation.
pub struct LightSwitch {
    revoked: AtomicBool,
}

impl LightSwitch {
    /// Signals the running pass to stop as soon as it can.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release)
    }
}

impl Default for LightSwitch {
    fn default() -> LightSwitch {
        LightSwitch {
            revoked: AtomicBool::new(false),
        }
    }
}

impl GreenLight for LightSwitch {
    fn granted(&self) -> bool {
        !self.revoked.load(Ordering::Acquire)
    }
}

/// A merge driver provides methods to customize merging behavior.
pub trait Driver {
    /// Returns the maximum log level for merge messages. The default
    /// implementation returns the `log` crate's global maximum level.
    fn max_log_level(&self) -> LevelFilter {
        log::max_level()
    }

    /// Returns a logger for merge messages.
    ///
    /// The default implementation returns the `log` crate's global logger.
    ///
    /// Implementations can override this method to return a custom logger,
    /// where using the global logger won't work. For example, Firefox Desktop
    /// has an existing Sync logging setup outside of the `log` crate.
    fn logger(&self) -> &dyn Log {
        log::logger()
    }
}

/// A default implementation of the merge driver.
pub struct DefaultDriver;

impl Driver for DefaultDriver {}

/// Logs a merge message.
pub fn log<D: Driver>(
    driver: &D,
    level: Level,
    args: Arguments<'_>,
    module_path: &'static str,
    file: &'static str,
    line: u32,
) {
    let meta = log::Metadata::builder()
        .level(level)
        .target(module_path)
        .build();
    if driver.logger().enabled(&meta) {
        driver.logger().log(
            &log::Record::builder()
                .args(args)
                .metadata(meta)
                .module_path(Some(module_path))
                .file(Some(file))
                .line(Some(line))
                .build(),
        );
    }
}

#[macro_export]
macro_rules! error {
    ($driver:expr, $($args:tt)+) => {
        if log::Level::Error <= $driver.max_log_level() {
            $crate::driver::log(
                $driver,
                log::Level::Error,
                format_args!($($args)+),
                module_path!(),
                file!(),
                line!(),
            );
        }
    }
}

macro_rules! warn {
    ($driver:expr, $($args:tt)+) => {
        if log::Level::Warn <= $driver.max_log_level() {
            $crate::driver::log(
                $driver,
                log::Level::Warn,
                format_args!($($args)+),
                module_path!(),
                file!(),
                line!(),
            );
        }
    }
}

#[macro_export]
macro_rules! debug {
    ($driver:expr, $($args:tt)+) => {
        if log::Level::Debug <= $driver.max_log_level() {
            $crate::driver::log(
                $driver,
                log::Level::Debug,
                format_args!($($args)+),
                module_path!(),
                file!(),
                line!(),
            );
        }
    }
}

#[macro_export]
macro_rules! trace {
    ($driver:expr, $($args:tt)+) => {
        if log::Level::Trace <= $driver.max_log_level() {
            $crate::driver::log(
                $driver,
                log::Level::Trace,
                format_args!($($args)+),
                module_path!(),
                file!(),
                line!(),
            );
        }
    }
}
