//! Run several units concurrently behind one shared ready callback.
//!
//! Every unit starts its work and then calls its own ready callback with a
//! foreground token that is cancelled when its work stops on its own. Once
//! every unit is ready the shared callback runs once, with a token that is
//! cancelled as soon as any foreground token is. When it returns, every
//! unit is released into its stop phase and all errors are combined.

use futures_util::future::{self, BoxFuture};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Called once a unit (or every unit) is ready. Returning starts shutdown.
pub type ReadyCallback =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), Error>> + Send>;

/// A unit of work with a start phase and a stop phase, separated by the
/// ready callback.
pub trait Runnable: Send + Sync {
    fn run<'a>(
        &'a self,
        scope: &'a CancellationToken,
        ready: ReadyCallback,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

enum Event {
    Ready(CancellationToken),
    Exited,
}

pub async fn run_all(
    units: &[Box<dyn Runnable>],
    scope: &CancellationToken,
    ready: ReadyCallback,
) -> Result<(), Error> {
    if units.is_empty() {
        return ready(scope.child_token()).await;
    }

    let (events, mut inbox) = mpsc::unbounded_channel();
    let release = CancellationToken::new();

    let runs: Vec<_> = units
        .iter()
        .map(|unit| {
            let events = events.clone();
            let on_ready: ReadyCallback = {
                let events = events.clone();
                let release = release.clone();
                Box::new(move |fg| {
                    Box::pin(async move {
                        let _ = events.send(Event::Ready(fg));
                        release.cancelled().await;
                        Ok(())
                    })
                })
            };
            async move {
                let result = unit.run(scope, on_ready).await;
                let _ = events.send(Event::Exited);
                result
            }
        })
        .collect();
    drop(events);

    let coordinate = async {
        let mut foreground = Vec::with_capacity(units.len());
        while foreground.len() < units.len() {
            match inbox.recv().await {
                Some(Event::Ready(fg)) => foreground.push(fg),
                // A unit failed before becoming ready; skip the callback.
                Some(Event::Exited) | None => {
                    release.cancel();
                    return Ok(());
                }
            }
        }

        let merged = scope.child_token();
        let any_stopped = future::select_all(foreground.iter().map(|fg| Box::pin(fg.cancelled())));
        let callback = ready(merged.clone());
        tokio::pin!(callback);
        let result = tokio::select! {
            result = &mut callback => result,
            _ = any_stopped => {
                merged.cancel();
                callback.await
            }
        };
        release.cancel();
        result
    };

    let (results, callback_result) = future::join(future::join_all(runs), coordinate).await;
    Error::combine(results.into_iter().chain(std::iter::once(callback_result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Unit {
        fail_before_ready: bool,
        stop_on_its_own: bool,
        stopped: Arc<AtomicUsize>,
    }

    impl Runnable for Unit {
        fn run<'a>(
            &'a self,
            _scope: &'a CancellationToken,
            ready: ReadyCallback,
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async move {
                if self.fail_before_ready {
                    return Err(Error::Config("bind failed".into()));
                }
                let fg = CancellationToken::new();
                if self.stop_on_its_own {
                    fg.cancel();
                }
                ready(fg).await?;
                self.stopped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn unit(stopped: &Arc<AtomicUsize>) -> Box<dyn Runnable> {
        Box::new(Unit {
            fail_before_ready: false,
            stop_on_its_own: false,
            stopped: stopped.clone(),
        })
    }

    #[tokio::test]
    async fn callback_runs_once_after_all_units_are_ready() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let units = vec![unit(&stopped), unit(&stopped), unit(&stopped)];
        let ready: ReadyCallback = {
            let calls = calls.clone();
            let stopped = stopped.clone();
            Box::new(move |_| {
                Box::pin(async move {
                    assert_eq!(stopped.load(Ordering::SeqCst), 0);
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        run_all(&units, &CancellationToken::new(), ready).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unit_failing_early_skips_callback() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let units = vec![
            unit(&stopped),
            Box::new(Unit {
                fail_before_ready: true,
                stop_on_its_own: false,
                stopped: stopped.clone(),
            }) as Box<dyn Runnable>,
        ];
        let calls = Arc::new(AtomicUsize::new(0));
        let ready: ReadyCallback = {
            let calls = calls.clone();
            Box::new(move |_| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        let err = run_all(&units, &CancellationToken::new(), ready).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stopped_unit_cancels_callback_token() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let units = vec![
            unit(&stopped),
            Box::new(Unit {
                fail_before_ready: false,
                stop_on_its_own: true,
                stopped: stopped.clone(),
            }) as Box<dyn Runnable>,
        ];
        let ready: ReadyCallback = Box::new(|token| {
            Box::pin(async move {
                token.cancelled().await;
                Ok(())
            })
        });

        run_all(&units, &CancellationToken::new(), ready).await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_units_still_runs_callback() {
        let ready: ReadyCallback = Box::new(|_| Box::pin(async { Err(Error::Closed) }));
        assert!(matches!(
            run_all(&[], &CancellationToken::new(), ready).await,
            Err(Error::Closed)
        ));
    }
}
