//! The "one-shot completion" primitive from `spec.md` §9: a value holder
//! that transitions exactly once from pending to resolved, letting many
//! waiters observe the same resolved value without re-running whatever
//! produces it. Used by the supervisor (a child's exit result), the executor
//! (per-script execution memoization), and service execution (the `ready`
//! and `done` signals of `spec.md` §4.5).
//!
//! Built on `tokio::sync::watch` rather than a plain oneshot channel because
//! a oneshot's receiver is consumed by the first `.await`; this needs many
//! independent waiters to observe the same value.

use tokio::sync::watch;

/// A value that starts pending and is resolved at most once.
///
/// Cloning an [`OnceCompletion`] gives another handle to the *same*
/// underlying value: resolving through any clone resolves all of them.
#[derive(Clone)]
pub struct OnceCompletion<T> {
    sender: std::sync::Arc<std::sync::Mutex<Option<watch::Sender<Option<T>>>>>,
    receiver: watch::Receiver<Option<T>>,
}

impl<T: Clone> OnceCompletion<T> {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self {
            sender: std::sync::Arc::new(std::sync::Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Resolve this completion with `value`. A second (or later) call is a
    /// no-op: the first resolution wins.
    pub fn resolve(&self, value: T) {
        let mut guard = self.sender.lock().expect("OnceCompletion sender mutex poisoned");
        if let Some(sender) = guard.take() {
            let _ = sender.send(Some(value));
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Await the resolved value. Cancellation-safe and callable from any
    /// number of concurrent waiters, all of whom observe the same value.
    pub async fn wait(&self) -> T {
        let mut receiver = self.receiver.clone();
        loop {
            if let Some(value) = receiver.borrow().clone() {
                return value;
            }
            if receiver.changed().await.is_err() {
                // The sender side was dropped without ever resolving, which
                // only happens if every `OnceCompletion` handle (including
                // the one that should have resolved it) was dropped first.
                if let Some(value) = receiver.borrow().clone() {
                    return value;
                }
                panic!("OnceCompletion dropped without ever resolving");
            }
        }
    }
}

impl<T: Clone> Default for OnceCompletion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once_and_fans_out() {
        let completion = OnceCompletion::new();
        let waiter_a = completion.clone();
        let waiter_b = completion.clone();

        let handle_a = tokio::spawn(async move { waiter_a.wait().await });
        let handle_b = tokio::spawn(async move { waiter_b.wait().await });

        completion.resolve(42);
        completion.resolve(7); // ignored, first resolution wins

        assert_eq!(handle_a.await.unwrap(), 42);
        assert_eq!(handle_b.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn already_resolved_returns_immediately() {
        let completion = OnceCompletion::new();
        completion.resolve("done");
        assert!(completion.is_resolved());
        assert_eq!(completion.wait().await, "done");
    }
}
