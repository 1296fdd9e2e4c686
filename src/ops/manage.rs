//! Operation execution
//!
//! Drives an operation through its phases. A retryable exec failure
//! triggers a retry cycle of rollback, rebuild, and re-exec, with
//! backoff between attempts; the rollback inside the cycle must succeed
//! cleanly or the retry is abandoned. Non-retryable failures roll back
//! once and surface the original cause; when that final rollback fails
//! too it is only logged, and its ledger entry is left for the cleaner.

use super::tracker::{OpClass, OpTracker};
use super::Operation;
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorRef};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Run an operation to completion under tracker admission.
pub async fn run_operation(
    mut op: Box<dyn Operation>,
    executor: ExecutorRef,
    tracker: &OpTracker,
) -> Result<String> {
    if tracker.throttle_or_add(op.id(), OpClass::Normal) {
        return Err(Error::TooManyOperations);
    }
    let result = async {
        op.build()?;
        drive(op.as_mut(), executor.as_ref()).await
    }
    .await;
    tracker.remove(op.id());
    result?;
    Ok(op.resource_url())
}

/// Build synchronously, then finish the operation in a background task.
/// Returns the resource URL as soon as the build has committed, the way
/// asynchronous API endpoints respond with a polling location.
pub async fn run_operation_detached(
    mut op: Box<dyn Operation>,
    executor: ExecutorRef,
    tracker: Arc<OpTracker>,
) -> Result<(String, oneshot::Receiver<Result<()>>)> {
    if tracker.throttle_or_add(op.id(), OpClass::Normal) {
        return Err(Error::TooManyOperations);
    }
    if let Err(err) = op.build() {
        tracker.remove(op.id());
        return Err(err);
    }
    let url = op.resource_url();
    let op_id = op.id().to_string();
    let (tx, rx) = oneshot::channel();
    tokio::spawn({
        let executor = executor.clone();
        async move {
            let result = drive(op.as_mut(), executor.as_ref()).await;
            tracker.remove(&op_id);
            if let Err(err) = &result {
                tracing::error!(op = %op_id, error = %err, "detached operation failed");
            }
            let _ = tx.send(result);
        }
    });
    Ok((url, rx))
}

async fn drive(op: &mut dyn Operation, executor: &dyn Executor) -> Result<()> {
    tracing::info!(op = %op.id(), label = op.label(), "running operation");
    match op.exec(executor).await {
        Ok(()) => {
            op.finalize()?;
            tracing::info!(op = %op.id(), label = op.label(), "operation complete");
            Ok(())
        }
        Err(err) if err.is_retry() && op.max_retries() > 0 => {
            retry_operation(op, executor, err).await
        }
        Err(err) => {
            tracing::error!(op = %op.id(), label = op.label(), error = %err, "operation failed");
            rollback_and_surface(op, executor, err).await
        }
    }
}

/// Final rollback before giving up. The exec error is what the caller
/// gets; a rollback failure never replaces it and its ledger entry is
/// picked up by the cleaner.
async fn rollback_and_surface(
    op: &mut dyn Operation,
    executor: &dyn Executor,
    err: Error,
) -> Result<()> {
    if let Err(rb_err) = op.rollback(executor).await {
        tracing::error!(
            op = %op.id(),
            label = op.label(),
            error = %rb_err,
            "rollback failed, leaving ledger entry for the cleaner"
        );
    }
    Err(err.original())
}

/// Retry cycle after a retryable exec failure: roll back, rebuild,
/// re-exec. Abandons the cycle when rollback itself fails or the retry
/// budget runs out.
async fn retry_operation(
    op: &mut dyn Operation,
    executor: &dyn Executor,
    first_err: Error,
) -> Result<()> {
    let mut backoff = retry_backoff();
    let mut last = first_err;
    for attempt in 1..=op.max_retries() {
        tracing::info!(
            op = %op.id(),
            label = op.label(),
            attempt,
            error = %last,
            "retrying operation"
        );
        op.rollback(executor).await?;
        if let Some(delay) = backoff.next_backoff() {
            tokio::time::sleep(delay).await;
        }
        op.build()?;
        match op.exec(executor).await {
            Ok(()) => return op.finalize(),
            Err(err) if err.is_retry() => last = err,
            Err(err) => {
                return rollback_and_surface(op, executor, err).await;
            }
        }
    }
    rollback_and_surface(op, executor, last).await
}

fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(250),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}
