//! Crate-wide error type.
//!
//! Shutdown paths never stop at the first failure: close, shutdown and
//! callback errors are folded together with [`Error::combine`] so the caller
//! sees every contributing failure.

use std::io;

use thiserror::Error;

/// Errors returned by sockets, engines, runners and the server.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding or listening on a socket failed.
    #[error("listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed with a non-transient error.
    #[error("accept: {0}")]
    Accept(#[source] io::Error),

    /// TLS configuration could not be built or loaded.
    #[error("tls: {0}")]
    Tls(String),

    /// Server options are invalid.
    #[error("configuration: {0}")]
    Config(String),

    /// The engine was shut down or closed. Runners treat it as success.
    #[error("server closed")]
    Closed,

    /// The cancellation scope expired before the operation completed.
    #[error("shutdown scope cancelled")]
    Cancelled,

    /// A protocol engine reported a failure.
    #[error("engine: {0}")]
    Engine(String),

    /// A request handler failed in a way that is not safe to continue from.
    #[error("fatal handler failure: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Several independent failures.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Combine results into one, keeping every failure.
    ///
    /// Returns `Ok(())` when nothing failed, the lone error when exactly one
    /// failed and [`Error::Multiple`] otherwise. Nested aggregates are
    /// flattened.
    pub fn combine<I>(results: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Result<(), Error>>,
    {
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(()) => {}
                Err(Error::Multiple(nested)) => errors.extend(nested),
                Err(e) => errors.push(e),
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// Whether this is the engine-closed sentinel.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Whether this error, or any error it aggregates, is a fatal handler
    /// failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Fatal(_) => true,
            Error::Multiple(errors) => errors.iter().any(Error::is_fatal),
            _ => false,
        }
    }

    /// Iterate over the leaf errors.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Error> + '_> {
        match self {
            Error::Multiple(errors) => Box::new(errors.iter().flat_map(Error::iter)),
            e => Box::new(std::iter::once(e)),
        }
    }
}

/// Map the engine-closed sentinel to success.
pub(crate) fn ignore_closed(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(Error::Closed) => Ok(()),
        other => other,
    }
}
