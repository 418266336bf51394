//! Shutdown coordination shared by the runners of one protocol family.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::error::Error;

/// Runs a shutdown sequence at most once across every clone.
///
/// The first caller runs the sequence and gets its result. Concurrent and
/// later callers wait for it to finish and get `Ok(())`, so the failure is
/// reported once.
#[derive(Debug, Clone, Default)]
pub struct ShutdownOnce {
    done: Arc<OnceCell<()>>,
}

impl ShutdownOnce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_run(&self) -> bool {
        self.done.initialized()
    }

    pub async fn run<F, Fut>(&self, sequence: F) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let mut result = Ok(());
        self.done
            .get_or_init(|| async {
                result = sequence().await;
            })
            .await;
        result
    }
}
