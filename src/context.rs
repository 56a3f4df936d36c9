//! Per-call context: deadline, cancellation, query settings and progress callbacks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::proto::{ProfileInfo, Progress};

pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;
pub type ProfileInfoFn = Arc<dyn Fn(&ProfileInfo) + Send + Sync>;

/// Cancels every [`Context`] derived from [`Context::with_cancel`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Options that travel with a single call.
///
/// Contexts are cheap to clone; builders return a modified copy.
#[derive(Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
    settings: SmallVec<[(String, String); 4]>,
    query_id: Option<String>,
    quota_key: Option<String>,
    on_progress: Option<ProgressFn>,
    on_profile_info: Option<ProfileInfoFn>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("cancellable", &self.cancel.is_some())
            .field("settings", &self.settings)
            .field("query_id", &self.query_id)
            .finish()
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Set a deadline. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx: Arc::new(tx) })
    }

    pub fn with_setting(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        let name = name.into();
        let value = value.to_string();
        match self.settings.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.settings.push((name, value)),
        }
        self
    }

    pub fn with_query_id(mut self, id: impl Into<String>) -> Self {
        self.query_id = Some(id.into());
        self
    }

    pub fn with_quota_key(mut self, key: impl Into<String>) -> Self {
        self.quota_key = Some(key.into());
        self
    }

    pub fn with_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn with_profile_info<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProfileInfo) + Send + Sync + 'static,
    {
        self.on_profile_info = Some(Arc::new(f));
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn settings(&self) -> &[(String, String)] {
        &self.settings
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    pub fn quota_key(&self) -> Option<&str> {
        self.quota_key.as_deref()
    }

    pub(crate) fn progress(&self, progress: &Progress) {
        if let Some(f) = &self.on_progress {
            f(progress);
        }
    }

    pub(crate) fn profile_info(&self, info: &ProfileInfo) {
        if let Some(f) = &self.on_profile_info {
            f(info);
        }
    }

    /// Why the context is already done, if it is.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Some(Error::Canceled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is canceled. Never resolves for contexts without a handle.
    pub async fn cancelled(&self) {
        let Some(mut rx) = self.cancel.clone() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without canceling.
                return std::future::pending().await;
            }
        }
    }

    /// Run `fut` bounded by the deadline and the cancel handle.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let guarded = async {
            tokio::select! {
                result = fut => result,
                _ = self.cancelled() => Err(Error::Canceled),
            }
        };
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or(Err(Error::DeadlineExceeded)),
            None => guarded.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_deadline_is_reported_verbatim() {
        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(matches!(ctx.err(), Some(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts() {
        let (ctx, handle) = Context::new().with_cancel();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.run(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Canceled)));
        assert!(matches!(ctx.err(), Some(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_run_passes_through() {
        let ctx = Context::new().with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(async { Ok(7) }).await.unwrap(), 7);
    }

    #[test]
    fn test_settings_and_callbacks() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let ctx = Context::new()
            .with_setting("max_threads", 4)
            .with_setting("max_threads", 8)
            .with_query_id("q-1")
            .with_progress(move |p| {
                counter.fetch_add(p.rows, Ordering::SeqCst);
            });
        assert_eq!(
            ctx.settings(),
            &[("max_threads".to_string(), "8".to_string())]
        );
        assert_eq!(ctx.query_id(), Some("q-1"));
        ctx.progress(&Progress {
            rows: 5,
            ..Default::default()
        });
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_earliest_deadline_wins() {
        let now = Instant::now();
        let ctx = Context::new()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}
