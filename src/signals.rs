//! Shutdown signalling: a cloneable token that long-running work observes.
//!
//! Every blocking seam takes a [`Shutdown`] token: subprocess runs are killed
//! when it fires, and git transfers abort through their progress callbacks.

use tokio::sync::watch;

/// Cancellation token handed to long-running operations.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Creates the shutdown signal and the token observing it. Sending
    /// `true` on the returned sender cancels every clone of the token.
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx })
    }

    /// A token that never fires, for callers with no shutdown source.
    pub fn none() -> Shutdown {
        let (_tx, rx) = watch::channel(false);
        Shutdown { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled. A token whose sender went away
    /// without signalling never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|&stop| stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Flips the shutdown signal on SIGINT or SIGTERM.
pub async fn handle_termination(tx: watch::Sender<bool>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    log::error!("failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    let _ = tx.send(true);
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    let _ = tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_for_every_clone() {
        let (tx, shutdown) = Shutdown::channel();
        let clone = shutdown.clone();
        assert!(!shutdown.is_cancelled());

        tx.send(true).unwrap();
        assert!(shutdown.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn fires_even_after_sender_is_gone() {
        let (tx, shutdown) = Shutdown::channel();
        tx.send(true).unwrap();
        drop(tx);
        shutdown.cancelled().await;
    }

    #[tokio::test]
    async fn none_never_fires() {
        let shutdown = Shutdown::none();
        assert!(!shutdown.is_cancelled());

        tokio::select! {
            _ = shutdown.cancelled() => panic!("token without a source fired"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }
}
