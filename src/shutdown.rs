use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Shared flag raised when the operator asks the logger to stop.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal on Ctrl-C instead of killing the process.
    pub fn install_ctrlc_handler() -> Result<Self, ctrlc::Error> {
        let signal = Self::new();
        let handler_signal = signal.clone();
        ctrlc::set_handler(move || {
            info!("Interrupt received, stopping after the current step");
            handler_signal.raise();
        })?;
        Ok(signal)
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}
