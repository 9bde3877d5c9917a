//! Compensating-action saga.
//!
//! Each step that changes the outside world registers how to undo itself.
//! When a later step fails, the registered undo actions run in reverse
//! order and the failing step's own error is returned. Undo failures are
//! logged and swallowed so they never hide the original cause.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{error, info};

use crate::error::DirectorResult;

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, DirectorResult<()>> + Send>;

pub struct Saga {
    name: String,
    undo: Vec<(&'static str, Undo)>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            undo: Vec::new(),
        }
    }

    /// Register the undo action for a step that just succeeded.
    pub fn on_failure<F, Fut>(&mut self, step: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DirectorResult<()>> + Send + 'static,
    {
        self.undo.push((step, Box::new(move || Box::pin(undo()))));
    }

    /// Run one step. On failure, compensate everything registered so far
    /// and return the step's error.
    pub async fn attempt<T, Fut>(&mut self, step: &'static str, fut: Fut) -> DirectorResult<T>
    where
        Fut: Future<Output = DirectorResult<T>>,
    {
        match fut.await {
            Ok(value) => Ok(value),
            Err(err) => {
                error!(saga = %self.name, step, error = %err, "saga step failed, compensating");
                self.compensate().await;
                Err(err)
            }
        }
    }

    /// Names of the steps that would be undone, oldest first.
    pub fn pending(&self) -> Vec<&'static str> {
        self.undo.iter().map(|(step, _)| *step).collect()
    }

    async fn compensate(&mut self) {
        while let Some((step, undo)) = self.undo.pop() {
            match undo().await {
                Ok(()) => info!(saga = %self.name, step, "compensated"),
                Err(err) => {
                    error!(saga = %self.name, step, error = %err, "compensation failed")
                }
            }
        }
    }
}
