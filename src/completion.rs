//! # Append Futures and the Completion Watcher
//!
//! `commit()` and `rollback()` hand back an [`AppendFuture`] instead of
//! blocking: the commit runs on the channel's writer thread, and the result
//! arrives through a `tokio::sync::oneshot` channel.
//!
//! ## Memoized, Cloneable Results
//!
//! The oneshot receiver is wrapped in `futures::future::Shared`, so:
//!
//! - the future can be cloned and awaited from several places
//! - every clone resolves to the *same* value
//! - a transaction can keep one clone and hand out others on repeated
//!   `commit()` calls without re-running anything
//!
//! ## Three Ways to Consume
//!
//! ```text
//!   fut.await                          async callers
//!   fut.wait()                         blocking callers
//!   watcher.watch(fut, ok, err, cxl)   fire-and-forget callbacks
//! ```
//!
//! ## The Watcher
//!
//! [`CompletionWatcher`] owns a small tokio runtime. `watch()` spawns a task
//! that awaits the future and then runs the matching callback on the
//! runtime's blocking pool, so a slow callback never stalls other
//! completions. The watcher is constructed explicitly and passed to the
//! components that need it; there is no process-wide instance.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{FutureExt, Shared};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{Error, Result};

// =============================================================================
// AppendFuture
// =============================================================================

/// How an [`AppendFuture`] finished.
#[derive(Debug, Clone)]
pub enum Completion<T> {
    /// The operation produced a value.
    Success(T),
    /// The operation failed.
    Failure(Error),
    /// The producer went away without answering (writer shut down).
    Cancelled,
}

/// Future result of a commit or rollback.
///
/// # Example
///
/// ```rust,ignore
/// let future = appender.commit();
/// let same = future.clone();
/// let result = future.wait()?;
/// assert_eq!(same.wait()?.last_sequence(), result.last_sequence());
/// ```
pub struct AppendFuture<T: Clone> {
    inner: Shared<oneshot::Receiver<Result<T>>>,
    label: Arc<str>,
}

impl<T> AppendFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A future plus the sender that completes it.
    pub(crate) fn pending(label: &str) -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                inner: rx.shared(),
                label: Arc::from(label),
            },
        )
    }

    /// An already-completed future.
    pub fn ready(label: &str, result: Result<T>) -> Self {
        let (tx, future) = Self::pending(label);
        // The receiver is alive inside `future`, so this cannot fail.
        let _ = tx.send(result);
        future
    }

    /// Blocks the calling thread until the result is available.
    pub fn wait(&self) -> Result<T> {
        futures::executor::block_on(self.clone())
    }

    /// Returns true once a result (or cancellation) is available.
    pub fn is_complete(&self) -> bool {
        self.inner.clone().now_or_never().is_some()
    }

    /// Resolves to a [`Completion`], distinguishing cancellation from failure.
    pub async fn outcome(self) -> Completion<T> {
        match self.inner.await {
            Ok(Ok(value)) => Completion::Success(value),
            Ok(Err(e)) => Completion::Failure(e),
            Err(_) => Completion::Cancelled,
        }
    }

    fn cancelled(&self) -> Error {
        Error::EventTransaction {
            transaction: self.label.to_string(),
            reason: "cancelled before a result was produced".to_string(),
        }
    }
}

impl<T: Clone> Clone for AppendFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            label: Arc::clone(&self.label),
        }
    }
}

impl<T> Future for AppendFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(this.cancelled())),
        }
    }
}

impl<T: Clone> std::fmt::Debug for AppendFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendFuture")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CompletionWatcher
// =============================================================================

/// Runs completion callbacks for outstanding futures.
pub struct CompletionWatcher {
    runtime: Option<Runtime>,
    outstanding: Arc<AtomicUsize>,
}

impl CompletionWatcher {
    /// Starts a watcher with `threads` async workers.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the runtime cannot start its threads.
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("canonlog-callback")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Invokes exactly one of the callbacks once `future` completes.
    ///
    /// Returns immediately. Callbacks run on a blocking-capable thread.
    pub fn watch<T, S, F, C>(&self, future: AppendFuture<T>, on_success: S, on_failure: F, on_cancel: C)
    where
        T: Clone + Send + Sync + 'static,
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let Some(runtime) = &self.runtime else {
            warn!("completion watcher is shut down; callback dropped");
            return;
        };

        let outstanding = Arc::clone(&self.outstanding);
        outstanding.fetch_add(1, Ordering::AcqRel);

        runtime.spawn(async move {
            let outcome = future.outcome().await;
            let callback = tokio::task::spawn_blocking(move || match outcome {
                Completion::Success(value) => on_success(value),
                Completion::Failure(e) => on_failure(e),
                Completion::Cancelled => on_cancel(),
            });
            if let Err(e) = callback.await {
                warn!(error = %e, "completion callback panicked");
            }
            outstanding.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Futures watched whose callbacks have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Drop for CompletionWatcher {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Safe to call from inside another runtime, unlike a plain drop.
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for CompletionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionWatcher")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
