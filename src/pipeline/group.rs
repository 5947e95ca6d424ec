//! A set of pipeline tasks sharing one cancellation token.
//!
//! The first task to fail cancels the token, which every sibling observes at
//! its next suspension point. [`TaskGroup::wait`] joins everything and
//! reports the first concrete failure.

use crate::{Error, Result};
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub(crate) struct TaskGroup {
    tasks: JoinSet<Result<()>>,
    cancel: CancellationToken,
}

impl TaskGroup {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// Spawns `task`; an `Err` from it cancels the whole group.
    pub(crate) fn spawn<F>(&mut self, stage: &'static str, worker: Option<usize>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let span = tracing::debug_span!("task", stage, worker);
        self.tasks.spawn(
            async move {
                let res = task.await;
                if let Err(e) = &res {
                    if !e.is_cancelled() {
                        tracing::debug!(error = %e, "task failed, cancelling run");
                    }
                    cancel.cancel();
                }
                tracing::debug!("task done");
                res
            }
            .instrument(span),
        );
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every task. Returns the first failure that is not a
    /// cancellation echo, else `Cancelled` if any task was cancelled.
    pub(crate) async fn wait(mut self) -> Result<()> {
        let mut first: Option<Error> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let res = joined.unwrap_or_else(|e| {
                self.cancel.cancel();
                Err(Error::operation("pipeline_task", e))
            });
            let Err(e) = res else { continue };
            match &first {
                None => first = Some(e),
                Some(f) if f.is_cancelled() && !e.is_cancelled() => first = Some(e),
                Some(_) => {},
            }
        }
        first.map_or(Ok(()), Err)
    }
}
