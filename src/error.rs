// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for one solve attempt. Every attempt terminates with
/// either a `Solution` or exactly one of these; partial solver output is
/// never surfaced as a tentative success.
#[derive(Debug, Error)]
pub enum SolverError {
    /// Malformed or truncated star table data.
    #[error("star table error: {0}")]
    Codec(String),

    /// A usable backend config file could not be materialized.
    #[error("config error: {0}")]
    Config(String),

    /// The requested option combination is not available for the chosen
    /// backend. Raised before any process is spawned.
    #[error("unsupported option for {backend}: {reason}")]
    UnsupportedOption { backend: &'static str, reason: String },

    /// The backend executable is missing or not runnable.
    #[error("could not launch {program}: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The backend ran but did not produce a solution (nonzero exit, crash,
    /// missing output artifact, or a declared in-band failure).
    #[error("solver process failed: {0}")]
    ProcessFailure(String),

    /// The backend exceeded the configured wall-clock bound.
    #[error("solver process exceeded {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the attempt.
    #[error("solve attempt aborted")]
    Aborted,

    /// The output artifact exists but is unreadable or incomplete.
    #[error("solver output parse error: {0}")]
    Parse(String),
}

impl SolverError {
    pub fn codec(msg: impl Into<String>) -> Self {
        SolverError::Codec(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        SolverError::Parse(msg.into())
    }
}
