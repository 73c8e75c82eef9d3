//! Filesystem health and the read-only latch.

use fxt_error::{FxtError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Healthy,
    /// Corruption was seen; the fs stays read-only until remounted.
    Sick,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FsStatus {
    pub health: Health,
    pub read_only: bool,
    pub aborted_errno: Option<i32>,
    /// Detail of the first corruption seen.
    pub first_corruption: Option<String>,
}

#[derive(Debug, Default)]
pub struct FsState {
    inner: Mutex<FsStatus>,
}

impl FsState {
    #[must_use]
    pub fn new(read_only: bool) -> Self {
        Self {
            inner: Mutex::new(FsStatus {
                read_only,
                ..FsStatus::default()
            }),
        }
    }

    /// Refuse a mutation once the fs is aborted or read-only.
    pub fn check_writable(&self) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(errno) = inner.aborted_errno {
            return Err(FxtError::Aborted { errno });
        }
        if inner.read_only {
            return Err(FxtError::ReadOnly);
        }
        Ok(())
    }

    #[must_use]
    pub fn aborted(&self) -> Option<i32> {
        self.inner.lock().aborted_errno
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    /// Record an abort; the first errno sticks. Returns true for the first.
    pub fn abort(&self, errno: i32) -> bool {
        let mut inner = self.inner.lock();
        inner.read_only = true;
        if inner.aborted_errno.is_some() {
            return false;
        }
        inner.aborted_errno = Some(errno);
        warn!(errno, "transaction aborted, filesystem is now read-only");
        true
    }

    pub fn mark_sick(&self, err: &FxtError) {
        let mut inner = self.inner.lock();
        inner.health = Health::Sick;
        inner.read_only = true;
        if inner.first_corruption.is_none() {
            error!(error = %err, "corruption detected, filesystem marked sick");
            inner.first_corruption = Some(err.to_string());
        }
    }

    #[must_use]
    pub fn status(&self) -> FsStatus {
        self.inner.lock().clone()
    }
}
