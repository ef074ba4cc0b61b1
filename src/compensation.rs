//! Rollback-on-failure transaction primitive.
//!
//! A multistep operation registers a compensating action for every
//! resource it acquires. On success the registrations are discarded; on
//! failure they run once each, newest first, and the original error is
//! surfaced unchanged. A rollback's own failure is logged and never
//! interrupts the remaining rollbacks.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::Result;

type Rollback = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Clone, Default)]
pub struct CompensationStack {
    inner: Arc<Mutex<Vec<(&'static str, Rollback)>>>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a compensating action. `label` names the action in
    /// rollback-failure logs.
    pub fn register<F, Fut>(&self, label: &'static str, rollback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let rollback: Rollback = Box::new(move || {
            let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(rollback());
            fut
        });
        self.lock().push((label, rollback));
    }

    /// Drops every registered rollback without running it.
    pub fn discard(&self) {
        self.lock().clear();
    }

    /// Runs every registered rollback once, in reverse registration order.
    pub async fn unwind(&self) {
        let mut rollbacks = std::mem::take(&mut *self.lock());
        while let Some((label, rollback)) = rollbacks.pop() {
            debug!(rollback = label, "running compensating action");
            if let Err(error) = rollback().await {
                warn!(rollback = label, error = %error, "compensating action failed");
            }
        }
    }

    /// Executes `body` under a fresh stack: discard on success, unwind on
    /// failure, then re-surface the body's error unchanged.
    pub async fn run<T, F, Fut>(body: F) -> Result<T>
    where
        F: FnOnce(CompensationStack) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let stack = CompensationStack::new();
        match body(stack.clone()).await {
            Ok(value) => {
                stack.discard();
                Ok(value)
            }
            Err(error) => {
                stack.unwind().await;
                Err(error)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(&'static str, Rollback)>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
