//! One-shot exit signal shared by a connection and everything that may close it

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Fires at most once; every waiter wakes on the first fire
#[derive(Debug, Default)]
pub struct ExitSignal {
    fired: AtomicBool,
    token: CancellationToken,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, returning `true` only for the caller that fired it first
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has fired
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fire_exactly_once() {
        let signal = Arc::new(ExitSignal::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let signal = signal.clone();
                let winners = winners.clone();
                tokio::spawn(async move {
                    if signal.fire() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_waiters_wake_on_fire() {
        let signal = Arc::new(ExitSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        assert!(signal.fire());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already fired: resolves immediately.
        signal.cancelled().await;
        assert!(!signal.fire());
    }
}
