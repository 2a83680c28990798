//! Cooperative cancellation. A [`CancelToken`] is cloned into every
//! blocking call (image pull, container wait, log read) and either
//! polled or selected on; delivery is a state change, never a signal.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self { tx: Arc::new(tx), rx }
  }

  /// Request cancellation. Idempotent; wakes every pending
  /// [`cancelled`](Self::cancelled) future.
  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once cancellation has been requested. Safe to use inside
  /// `tokio::select!` at every suspension point.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    loop {
      if *rx.borrow() {
        return;
      }
      // The sender lives in this token, so `changed` cannot error
      // while we hold `self`.
      if rx.changed().await.is_err() {
        return;
      }
    }
  }
}
