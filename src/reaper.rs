//! Child-exit notification.
//!
//! The reaper owns spawned children and waits for them on the runtime; when
//! one exits, the callback registered for its pid runs once.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use tokio::process::Child;
use tracing::{debug, warn};

pub type ExitCallback = Box<dyn FnOnce(i32, Option<ExitStatus>) + Send>;

#[derive(Clone, Default)]
pub struct Reaper {
    callbacks: Arc<Mutex<HashMap<i32, ExitCallback>>>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: i32, callback: impl FnOnce(i32, Option<ExitStatus>) + Send + 'static) {
        self.callbacks
            .lock()
            .expect("reaper lock poisoned")
            .insert(pid, Box::new(callback));
    }

    /// Returns whether a callback was pending.
    pub fn cancel(&self, pid: i32) -> bool {
        self.callbacks
            .lock()
            .expect("reaper lock poisoned")
            .remove(&pid)
            .is_some()
    }

    /// Takes ownership of `child` and reaps it when it exits.
    pub fn watch(&self, mut child: Child) -> Option<i32> {
        let pid = child.id()? as i32;
        let reaper = self.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(pid, "Failed to wait for child: {}", e);
                    None
                }
            };
            reaper.reap(pid, status);
        });
        Some(pid)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.callbacks.lock().expect("reaper lock poisoned").len()
    }

    pub fn reap(&self, pid: i32, status: Option<ExitStatus>) {
        let callback = self
            .callbacks
            .lock()
            .expect("reaper lock poisoned")
            .remove(&pid);
        debug!(pid, ?status, has_callback = callback.is_some(), "Reaped child");
        if let Some(callback) = callback {
            callback(pid, status);
        }
    }
}
