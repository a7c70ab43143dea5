//! Cancellable operation context.
//!
//! Every blocking backend call (listing, attach, mount, unmount, detach,
//! ownership query) is carried on an [`Operation`]. The operation races the
//! call against its cancellation token and optional deadline, so a hung
//! backend surfaces [`StoreError::Cancelled`] or [`StoreError::Timeout`]
//! instead of blocking the caller.
//!
//! ```rust,ignore
//! let op = Operation::new("export").with_timeout(Duration::from_secs(30));
//! let cancel = op.cancellation();
//! // another task may call `cancel.cancel()` at any time
//! let source = store.new_data_source(&op, "c0ffee").await?;
//! ```

use std::{
    future::Future,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct Operation {
    id: String,
    name: String,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Bound the operation, and every child derived from it, by `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Derive an operation for a sub-step. Cancelling the parent cancels the child.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            name: format!("{}/{}", self.name, name.into()),
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle that can cancel this operation from elsewhere.
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn label(&self) -> String {
        format!("{}[{}]", self.name, self.id)
    }

    /// Run `fut` unless the operation is cancelled or its deadline passes first.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<StoreError>,
    {
        if self.token.is_cancelled() {
            return Err(StoreError::Cancelled { op: self.label() });
        }

        let remaining = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return Err(StoreError::Timeout { op: self.label() });
                }
                Some(deadline - now)
            }
            None => None,
        };

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(StoreError::Cancelled { op: self.label() }),
                res = fut => res.map_err(Into::into),
            }
        };

        match remaining {
            Some(remaining) => match tokio::time::timeout(remaining, guarded).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!("operation: deadline exceeded op={}", self.label());
                    Err(StoreError::Timeout { op: self.label() })
                }
            },
            None => guarded.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let op = Operation::new("test");
        let v = op
            .run(async { Ok::<_, BackendError>(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_run_maps_backend_error() {
        let op = Operation::new("test");
        let err = op
            .run(async { Err::<(), _>(BackendError::Fault("boom".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(BackendError::Fault(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let op = Operation::new("test");
        op.cancel();
        let err = op
            .run(async { Ok::<_, BackendError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_call() {
        let op = Operation::new("test");
        let token = op.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = op
            .run(futures::future::pending::<std::result::Result<(), BackendError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_pending_call() {
        let op = Operation::new("test").with_timeout(Duration::from_millis(20));
        let err = op
            .run(futures::future::pending::<std::result::Result<(), BackendError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_child_follows_parent_cancellation() {
        let parent = Operation::new("parent");
        let child = parent.child("mount");
        assert_eq!(child.id(), parent.id());
        assert_eq!(child.name(), "parent/mount");
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
