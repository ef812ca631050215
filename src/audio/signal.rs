use tokio::sync::{mpsc, Mutex};

/// Edge-triggered, capacity-one signal.
///
/// Raising never blocks: if a signal is already pending the new one is
/// dropped, so any number of raises before a wait collapse into one wakeup.
#[derive(Debug)]
pub struct ControlSignal {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl Default for ControlSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSignal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn raise(&self) {
        let _ = self.tx.try_send(());
    }

    /// Waits for and consumes one pending signal. Cancel safe.
    pub async fn wait(&self) {
        let mut rx = self.rx.lock().await;
        // the sender lives in self, so recv never sees a closed channel
        let _ = rx.recv().await;
    }

    /// Drops a pending signal, if any.
    pub fn clear(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }

    pub fn is_pending(&self) -> bool {
        self.tx.capacity() == 0
    }
}
