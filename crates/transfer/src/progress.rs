use std::sync::{Arc, Mutex, PoisonError};

/// Callback invoked with `(bytes_transferred, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Accumulates committed bytes across workers and notifies a callback.
///
/// Notifications are issued while holding the counter lock, so the values a
/// callback observes never decrease.
pub struct ProgressReporter {
    total: u64,
    transferred: Mutex<u64>,
    callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("total", &self.total)
            .field("transferred", &self.transferred())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ProgressReporter {
    /// Creates a reporter starting at `already` bytes, e.g. the bytes covered
    /// by resumed parts.
    pub fn new(total: u64, already: u64, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            transferred: Mutex::new(already.min(total)),
            callback,
        }
    }

    /// Records `bytes` more committed bytes and notifies the callback.
    pub fn add(&self, bytes: u64) {
        let mut transferred = self.transferred.lock().unwrap_or_else(PoisonError::into_inner);
        *transferred = (*transferred + bytes).min(self.total);
        if let Some(cb) = &self.callback {
            cb(*transferred, self.total);
        }
    }

    /// Reports the current position without changing it.
    pub fn notify(&self) {
        let transferred = self.transferred.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cb) = &self.callback {
            cb(*transferred, self.total);
        }
    }

    pub fn transferred(&self) -> u64 {
        *self.transferred.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
