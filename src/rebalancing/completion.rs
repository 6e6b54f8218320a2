//! One-shot completion signal with late-registration continuations.

use parking_lot::Mutex;
use std::fmt;
use tokio::sync::watch;

type Continuation<T> = Box<dyn FnOnce(&T) + Send>;

/// A value that is produced at most once and can be awaited or observed.
///
/// Continuations registered with [`on_done`](Completion::on_done) run exactly
/// once: at completion, or immediately if the value is already there.
pub struct Completion<T> {
    tx: watch::Sender<Option<T>>,
    continuations: Mutex<Vec<Continuation<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    /// Create a pending completion.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            continuations: Mutex::new(Vec::new()),
        }
    }

    /// Complete with `value`. Returns `false` if already completed.
    pub fn complete(&self, value: T) -> bool {
        let pending = {
            let mut continuations = self.continuations.lock();
            let mut won = false;
            // Stored without notifying; waiters wake after the continuations.
            self.tx.send_if_modified(|slot| {
                if slot.is_none() {
                    *slot = Some(value.clone());
                    won = true;
                }
                false
            });
            if !won {
                return false;
            }
            std::mem::take(&mut *continuations)
        };

        for continuation in pending {
            continuation(&value);
        }
        self.tx.send_modify(|_| {});
        true
    }

    /// Whether the value has been produced.
    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The value, if produced.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait for the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(value) = current {
                return value;
            }
            // The sender lives in `self`, so this only fails once `self` is gone.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `f` once the value is produced.
    pub fn on_done(&self, f: impl FnOnce(&T) + Send + 'static) {
        let mut continuations = self.continuations.lock();
        match self.get() {
            Some(value) => {
                drop(continuations);
                f(&value);
            }
            None => continuations.push(Box::new(f)),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("value", &*self.tx.borrow())
            .field("continuations", &self.continuations.lock().len())
            .finish()
    }
}
