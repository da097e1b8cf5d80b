//! Error taxonomy for simulator startup.
//!
//! Only configuration and trace-intake problems surface as `Result` errors;
//! they are fatal before the first simulated cycle. Everything that can go
//! wrong *during* simulation is either back-pressure (the `-2` queue
//! protocol, locally recovered) or an invariant violation (an assertion,
//! never a recoverable runtime condition).

use std::io;
use thiserror::Error;

/// Configuration errors, fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A structural requirement on the configuration does not hold.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),

    /// A cache level was configured with a non-power-of-two set count.
    #[error("cache level {0}: set count must be a power of two")]
    InvalidSets(&'static str),

    /// Trace count does not match the configured core count.
    #[error("{given} trace(s) given for {cpus} configured core(s)")]
    TraceCountMismatch {
        /// Traces supplied on the command line.
        given: usize,
        /// Cores in the configuration.
        cpus: usize,
    },
}

/// Trace-intake errors, fatal at startup or on a torn record.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The trace file could not be opened or read.
    #[error("trace {path}: {source}")]
    Io {
        /// Path of the offending trace.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The file ended in the middle of a record.
    #[error("trace {0}: truncated record")]
    Truncated(String),

    /// The trace contains no records at all.
    #[error("trace {0}: empty")]
    Empty(String),
}
