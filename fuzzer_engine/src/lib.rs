//! Fuzzing Engine Library
//!
//! This library implements the host-side control logic for snapshot-based
//! VM fuzzing: seed corpus management, mutation, power scheduling, emulator
//! control and the per-worker fuzzing loop.

use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;

pub mod corpus;
pub mod crash;
pub mod engine;
pub mod mutator;
pub mod power_scheduler;
pub mod qemu;
pub mod qmp;
pub mod serial;
pub mod ssh;
pub mod targets;
pub mod worker;

/// Fatal startup problems. Any of these aborts the engine before fuzzing.
#[derive(Debug)]
pub enum ConfigError {
    /// `fuzzing.fuzzer_target` names no registered target.
    UnknownTarget(String),
    /// `fuzzing.assign_energy_function` names no known policy.
    UnknownEnergyFunction(String),
    /// The seed directory yielded no usable seed file.
    NoSeeds(PathBuf),
    /// An address filter entry does not parse as hex.
    BadAddressFilter {
        which: &'static str,
        source: ParseIntError,
    },
    /// A configuration key the selected target requires is absent.
    MissingKey(&'static str),
    Io(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownTarget(name) => write!(f, "unknown fuzzer target: {name}"),
            ConfigError::UnknownEnergyFunction(name) => {
                write!(f, "unknown energy assignment function: {name}")
            }
            ConfigError::NoSeeds(dir) => {
                write!(f, "no seed files found under {}", dir.display())
            }
            ConfigError::BadAddressFilter { which, source } => {
                write!(f, "malformed {which} address filter: {source}")
            }
            ConfigError::MissingKey(key) => write!(f, "missing configuration key: {key}"),
            ConfigError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(error: std::io::Error) -> Self {
        ConfigError::Io(error)
    }
}
