use crate::error::{ProcError, Result};
use crate::reaper::Reaper;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-process context handed to whatever spawns jobs.
///
/// Holds the child reaper and guards the one-procd-proxy-per-process rule.
#[derive(Clone, Default)]
pub struct ProcessScope {
    inner: Arc<ScopeInner>,
}

#[derive(Default)]
struct ScopeInner {
    procd_claimed: AtomicBool,
    reaper: Reaper,
}

impl ProcessScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reaper(&self) -> &Reaper {
        &self.inner.reaper
    }

    /// Fails if a procd proxy already lives in this scope.
    pub fn claim_procd_proxy(&self) -> Result<ProxyClaim> {
        if self.inner.procd_claimed.swap(true, Ordering::SeqCst) {
            return Err(ProcError::AlreadyInstantiated);
        }
        Ok(ProxyClaim {
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Releases the claim when dropped.
pub struct ProxyClaim {
    inner: Arc<ScopeInner>,
}

impl Drop for ProxyClaim {
    fn drop(&mut self) {
        self.inner.procd_claimed.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_proxy_is_refused_until_first_is_gone() {
        let scope = ProcessScope::new();
        let first = scope.claim_procd_proxy().unwrap();
        assert!(matches!(
            scope.clone().claim_procd_proxy(),
            Err(ProcError::AlreadyInstantiated)
        ));
        drop(first);
        assert!(scope.claim_procd_proxy().is_ok());
    }
}
