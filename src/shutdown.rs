//! Shutdown signal shared by the background loops

use tokio::sync::broadcast;

/// Wraps an optional broadcast receiver; a dropped sender also counts as shutdown
pub struct Shutdown {
    rx: Option<broadcast::Receiver<()>>,
}

impl Shutdown {
    pub fn new(rx: broadcast::Receiver<()>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A signal that never fires
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Resolve once shutdown has been requested
    pub async fn recv(&mut self) {
        match self.rx.as_mut() {
            Some(rx) => {
                let _ = rx.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl From<broadcast::Receiver<()>> for Shutdown {
    fn from(rx: broadcast::Receiver<()>) -> Self {
        Self::new(rx)
    }
}
