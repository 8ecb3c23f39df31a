//! Runtime configuration (spec §6 "Configuration").
//!
//! Scaled down from the teacher's TOML-file config: the core only
//! recognises a trace directory and an unobserved front-end verbosity
//! enum, so a single environment variable with a default is sufficient.

use std::path::PathBuf;

const ENV_TRACE_DIR: &str = "TRACEKIT_TRACE_DIR";
const DEFAULT_TRACE_DIR: &str = ".";

/// Front-end verbosity. Not observed by the core; carried only so an
/// embedder's own logging setup can read it from the same config value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tracing_path: PathBuf,
    pub verbosity: Verbosity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracing_path: PathBuf::from(DEFAULT_TRACE_DIR),
            verbosity: Verbosity::default(),
        }
    }
}

impl Config {
    /// Reads `TRACEKIT_TRACE_DIR`, falling back to `.` when unset.
    pub fn load() -> Self {
        let tracing_path = std::env::var(ENV_TRACE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_TRACE_DIR));
        Self {
            tracing_path,
            verbosity: Verbosity::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_current_dir() {
        let cfg = Config::default();
        assert_eq!(cfg.tracing_path, PathBuf::from("."));
    }

    #[test]
    fn env_override() {
        unsafe {
            std::env::set_var(ENV_TRACE_DIR, "/tmp/tracekit-test-dir");
        }
        let cfg = Config::load();
        assert_eq!(cfg.tracing_path, PathBuf::from("/tmp/tracekit-test-dir"));
        unsafe {
            std::env::remove_var(ENV_TRACE_DIR);
        }
    }
}
