// ABOUTME: Fan-out executor and channel multiplexer for multi-host work.
// ABOUTME: The executor never fails fast; every task failure ends up in one aggregate error.

use crate::error::{Error, ErrorKind, Result};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Run every task concurrently against a shared cancellation token.
///
/// All tasks run to completion even when some of them fail. Failures are
/// gathered by a dedicated aggregator task in completion order; if any task
/// failed the result is an aggregate [`Error`] whose causes are exactly those
/// failures. A panicking task counts as a failure.
pub async fn run_concurrently<I, F, Fut>(cancel: &CancellationToken, tasks: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<Error>();

    let aggregator = tokio::spawn(async move {
        let mut errors = Vec::new();
        while let Some(err) = err_rx.recv().await {
            errors.push(err);
        }
        errors
    });

    let mut workers = JoinSet::new();
    for task in tasks {
        let work = task(cancel.clone());
        let err_tx = err_tx.clone();
        workers.spawn(async move {
            if let Err(err) = work.await {
                // The aggregator outlives every sender.
                let _ = err_tx.send(err);
            }
        });
    }
    drop(err_tx);

    let mut panics = Vec::new();
    while let Some(joined) = workers.join_next().await {
        if let Err(join_err) = joined {
            tracing::warn!("concurrent task did not complete: {}", join_err);
            panics.push(Error::new(ErrorKind::TaskPanicked(join_err.to_string())));
        }
    }

    let mut errors = aggregator
        .await
        .map_err(|e| Error::new(ErrorKind::TaskPanicked(e.to_string())))?;
    errors.extend(panics);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::caused_by(errors))
    }
}

/// Merge several receivers into one.
///
/// Forwarding stops when `cancel` fires or when every input is exhausted,
/// whichever happens first. The returned receiver then yields `None`; it is
/// closed exactly once, when the last forwarder drops its sender.
///
/// The output holds one item. An item handed over before `cancel` fired can
/// still be received after it; consumers that must not act on it check
/// `cancel.is_cancelled()` after each receive.
pub fn multiplex<T, I>(cancel: &CancellationToken, inputs: I) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = mpsc::Receiver<T>>,
{
    let (tx, rx) = mpsc::channel(1);

    for mut input in inputs {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => match item {
                        Some(item) => item,
                        None => return,
                    },
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    rx
}

/// Race `work` against `cancel`. Cancellation wins ties and yields
/// [`ErrorKind::Cancelled`]; the abandoned future is dropped.
pub async fn with_cancel<T, Fut>(cancel: &CancellationToken, work: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::new(ErrorKind::Cancelled)),
        result = work => result,
    }
}
