use crate::error::{CoreError, CoreResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub org_id: String,
    pub actor_id: String,
}

/// Caller context. Holds the organizational scope and the per-scope
/// "duplicates already removed" marker for this session's lifetime.
#[derive(Debug, Clone, Default)]
pub struct Session {
    scope: Option<Scope>,
    dedup_ran: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_scope(org_id: &str, actor_id: &str) -> CoreResult<Self> {
        let mut s = Self::new();
        s.set_scope(org_id, actor_id)?;
        Ok(s)
    }

    pub fn set_scope(&mut self, org_id: &str, actor_id: &str) -> CoreResult<()> {
        if org_id.trim().is_empty() {
            return Err(CoreError::Validation("org_id cannot be empty".to_string()));
        }
        if actor_id.trim().is_empty() {
            return Err(CoreError::Validation("actor_id cannot be empty".to_string()));
        }
        let changed = self
            .scope
            .as_ref()
            .map(|s| s.org_id != org_id)
            .unwrap_or(true);
        if changed {
            self.dedup_ran = false;
        }
        self.scope = Some(Scope {
            org_id: org_id.to_string(),
            actor_id: actor_id.to_string(),
        });
        Ok(())
    }

    pub fn scope(&self) -> CoreResult<&Scope> {
        self.scope.as_ref().ok_or(CoreError::NotInitialized)
    }

    pub fn dedup_ran(&self) -> bool {
        self.dedup_ran
    }

    pub(crate) fn mark_dedup_ran(&mut self) {
        self.dedup_ran = true;
    }
}

/// Cooperative cancellation for long maintenance passes. Checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}
