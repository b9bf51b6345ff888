//! Shutdown coordination between the listener tasks.
//!
//! The [`Controller`] lives in `main`; each listener task holds a
//! [`Watcher`]. Triggering shutdown notifies every watcher and then waits
//! until all of them have been dropped, which happens once their listeners
//! have drained.

use tokio::sync::{mpsc, watch};

#[derive(Debug)]
pub struct Controller {
    notify: watch::Sender<()>,
    done_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
}

impl Controller {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(());
        let (done_tx, done_rx) = mpsc::channel(1);

        Self {
            notify,
            done_tx,
            done_rx,
        }
    }

    /// Hand out a watcher for one listener task to hold.
    pub fn subscribe(&self) -> Watcher {
        Watcher {
            notify: self.notify.subscribe(),
            _done: self.done_tx.clone(),
        }
    }

    /// Notify all watchers and wait for every one of them to be dropped.
    pub async fn shutdown(mut self) {
        let _ = self.notify.send(());

        drop(self.done_tx);
        let _ = self.done_rx.recv().await;
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct Watcher {
    notify: watch::Receiver<()>,
    _done: mpsc::Sender<()>,
}

impl Watcher {
    /// Resolves when shutdown has been requested.
    pub async fn notified(&mut self) {
        let _ = self.notify.changed().await;
    }
}
