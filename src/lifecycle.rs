use once_cell::sync::OnceCell;
use serde::Serialize;
use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Loading,
    Ready,
    Failed,
}

/// Process-wide holder of the detection model. The model is set at most once
/// and never replaced; readers only ever see it through `model()`.
pub struct ModelLifecycle<M> {
    model: OnceCell<Arc<M>>,
    load_started: AtomicBool,
    failed: AtomicBool,
}

impl<M> Default for ModelLifecycle<M> {
    fn default() -> Self {
        Self {
            model: OnceCell::new(),
            load_started: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }
}

impl<M: Send + Sync + 'static> ModelLifecycle<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already constructed model, skipping the load step.
    pub fn ready(model: M) -> Self {
        let lifecycle = Self::default();
        lifecycle.load_started.store(true, Ordering::SeqCst);
        let _ = lifecycle.model.set(Arc::new(model));
        lifecycle
    }

    pub fn is_ready(&self) -> bool {
        self.model.get().is_some()
    }

    pub fn state(&self) -> ModelState {
        if self.is_ready() {
            ModelState::Ready
        } else if self.failed.load(Ordering::SeqCst) {
            ModelState::Failed
        } else {
            ModelState::Loading
        }
    }

    pub fn model(&self) -> Option<Arc<M>> {
        self.model.get().cloned()
    }

    /// Runs `loader` on the blocking pool and publishes its model. Only the
    /// first call does any work. A failed load is logged and leaves the
    /// lifecycle in `Failed` for good. Returns whether the model became ready.
    pub async fn load<F, E>(&self, loader: F) -> bool
    where
        F: FnOnce() -> Result<M, E> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.load_started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Model load already requested, ignoring");
            return false;
        }

        tracing::info!("Loading detection model");
        let started = Instant::now();

        match tokio::task::spawn_blocking(loader).await {
            Ok(Ok(model)) => {
                if self.model.set(Arc::new(model)).is_err() {
                    tracing::warn!("Model was already set, keeping the existing instance");
                }
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Detection model loaded"
                );
                true
            }
            Ok(Err(e)) => {
                self.failed.store(true, Ordering::SeqCst);
                tracing::error!("Failed to load detection model: {}", e);
                false
            }
            Err(e) => {
                self.failed.store(true, Ordering::SeqCst);
                tracing::error!("Model loader task aborted: {}", e);
                false
            }
        }
    }

    pub fn spawn_load<F, E>(self: &Arc<Self>, loader: F) -> JoinHandle<bool>
    where
        F: FnOnce() -> Result<M, E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move { lifecycle.load(loader).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeModel(u32);

    #[tokio::test]
    async fn test_successful_load() {
        let lifecycle = ModelLifecycle::new();
        assert_eq!(lifecycle.state(), ModelState::Loading);
        assert!(!lifecycle.is_ready());

        let loaded = lifecycle.load(|| Ok::<_, String>(FakeModel(1))).await;

        assert!(loaded);
        assert!(lifecycle.is_ready());
        assert_eq!(lifecycle.state(), ModelState::Ready);
        assert_eq!(lifecycle.model().as_deref(), Some(&FakeModel(1)));
    }

    #[tokio::test]
    async fn test_failed_load_stays_unready() {
        let lifecycle = ModelLifecycle::<FakeModel>::new();

        let loaded = lifecycle
            .load(|| Err::<FakeModel, _>("corrupt weights".to_string()))
            .await;

        assert!(!loaded);
        assert!(!lifecycle.is_ready());
        assert_eq!(lifecycle.state(), ModelState::Failed);
        assert!(lifecycle.model().is_none());
    }

    #[tokio::test]
    async fn test_load_runs_once() {
        let lifecycle = ModelLifecycle::new();

        assert!(lifecycle.load(|| Ok::<_, String>(FakeModel(1))).await);
        assert!(!lifecycle.load(|| Ok::<_, String>(FakeModel(2))).await);

        assert_eq!(lifecycle.model().as_deref(), Some(&FakeModel(1)));
    }

    #[tokio::test]
    async fn test_loading_until_loader_finishes() {
        let lifecycle = Arc::new(ModelLifecycle::new());
        let (tx, rx) = std::sync::mpsc::channel::<()>();

        let handle = lifecycle.spawn_load(move || {
            rx.recv().map_err(|e| e.to_string())?;
            Ok::<_, String>(FakeModel(3))
        });

        assert_eq!(lifecycle.state(), ModelState::Loading);

        tx.send(()).unwrap();
        assert!(handle.await.unwrap());
        assert_eq!(lifecycle.state(), ModelState::Ready);
    }

    #[test]
    fn test_ready_constructor() {
        let lifecycle = ModelLifecycle::ready(FakeModel(4));

        assert!(lifecycle.is_ready());
        assert_eq!(lifecycle.state(), ModelState::Ready);
    }
}
