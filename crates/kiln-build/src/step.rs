//! Handles to eagerly started build steps.
//!
//! A step's body is spawned onto the runtime as soon as the handle is
//! created. The handle wraps the task in a [`Shared`] future, so any number
//! of dependents can await it and all of them see the same terminal value
//! while the body itself runs exactly once.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use kiln_common::{KilnError, KilnResult};

type SharedResult<T> = Result<T, Arc<KilnError>>;

/// Handle to a single in-flight or finished build step.
pub struct StepHandle<T> {
    name: &'static str,
    index: usize,
    future: Shared<BoxFuture<'static, SharedResult<T>>>,
}

impl<T> Clone for StepHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            index: self.index,
            future: self.future.clone(),
        }
    }
}

impl<T> fmt::Debug for StepHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepHandle")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl<T> StepHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start `body` on the runtime and return a handle to its result.
    pub fn spawn<F>(name: &'static str, index: usize, body: F) -> Self
    where
        F: Future<Output = KilnResult<T>> + Send + 'static,
    {
        tracing::debug!(step = name, index, "Starting step");
        let task = tokio::spawn(body);
        let future = async move {
            match task.await {
                Ok(result) => result.map_err(Arc::new),
                Err(err) => Err(Arc::new(KilnError::internal(format!(
                    "step '{name}' did not finish: {err}"
                )))),
            }
        }
        .boxed()
        .shared();
        Self {
            name,
            index,
            future,
        }
    }

    /// A handle that is already complete with `value`.
    #[must_use]
    pub fn ready(name: &'static str, index: usize, value: T) -> Self {
        Self {
            name,
            index,
            future: futures::future::ready(Ok(value)).boxed().shared(),
        }
    }

    /// Wait for the step's terminal value.
    ///
    /// # Errors
    ///
    /// Returns the step's own failure, shared with every other observer.
    pub async fn get(&self) -> SharedResult<T> {
        self.future.clone().await
    }

    /// Wait for the step on behalf of `dependent`.
    ///
    /// # Errors
    ///
    /// A failure of this step comes back wrapped in
    /// [`KilnError::StepFailed`] naming `dependent`.
    pub async fn wait_for(&self, dependent: &'static str) -> KilnResult<T> {
        self.get().await.map_err(|source| KilnError::StepFailed {
            step: dependent,
            source,
        })
    }

    /// Step name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Ordinal used for display.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn body_runs_once_for_many_observers() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = StepHandle::spawn("count", 0, async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42u32)
        });

        let other = handle.clone();
        assert_eq!(handle.get().await.unwrap(), 42);
        assert_eq!(other.get().await.unwrap(), 42);
        assert_eq!(handle.wait_for("dependent").await.unwrap(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn body_starts_without_being_awaited() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _handle = StepHandle::spawn("eager", 0, async move {
            let _ = tx.send(());
            Ok(())
        });
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn failures_are_shared_and_wrapped() {
        let handle: StepHandle<()> = StepHandle::spawn("auth", 0, async {
            Err(KilnError::Authentication {
                registry: "ghcr.io".to_string(),
                message: "denied".to_string(),
            })
        });

        let first = handle.get().await.unwrap_err();
        let second = handle.get().await.unwrap_err();
        assert!(Arc::ptr_eq(&first, &second));

        let err = handle.wait_for("push image").await.unwrap_err();
        assert!(matches!(err, KilnError::StepFailed { step: "push image", .. }));
        assert!(matches!(err.root_cause(), KilnError::Authentication { .. }));
    }

    #[tokio::test]
    async fn dependent_short_circuits_on_failure() {
        let transfers = Arc::new(AtomicUsize::new(0));
        let independent = StepHandle::spawn("a", 0, async { Ok(1u8) });
        let failing: StepHandle<u8> = StepHandle::spawn("b", 1, async {
            Err(KilnError::Network {
                message: "reset".to_string(),
            })
        });
        let dependent = {
            let failing = failing.clone();
            let transfers = Arc::clone(&transfers);
            StepHandle::spawn("c", 2, async move {
                let value = failing.wait_for("c").await?;
                transfers.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
        };

        assert_eq!(independent.get().await.unwrap(), 1);
        assert!(dependent.get().await.is_err());
        assert_eq!(transfers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let handle: StepHandle<()> = StepHandle::spawn("boom", 0, async {
            let exploded = true;
            assert!(!exploded, "boom");
            Ok(())
        });
        let err = handle.get().await.unwrap_err();
        assert!(matches!(*err, KilnError::Internal { .. }));
    }

    #[tokio::test]
    async fn ready_handles_resolve_immediately() {
        let handle = StepHandle::ready("cached", 3, "done".to_string());
        assert_eq!(handle.index(), 3);
        assert_eq!(handle.name(), "cached");
        assert_eq!(handle.get().await.unwrap(), "done");
    }
}
