use std::{
    fs::{self, OpenOptions, TryLockError},
    path::Path,
};

use tracing::info;

use crate::error::DispatchError;

/// Exclusive, non-blocking advisory lock guaranteeing that only one daemon
/// instance runs at a time. The lock is released by the OS when the process
/// exits, so a crashed instance never wedges its supervisor-restarted
/// successor.
#[derive(Debug)]
pub struct InstanceLock {
    _file: fs::File,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<InstanceLock, DispatchError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        match file.try_lock() {
            Ok(()) => {
                info!(path = %path.display(), "acquired instance lock");
                Ok(InstanceLock { _file: file })
            }
            Err(TryLockError::WouldBlock) => Err(DispatchError::FatalStartup(format!(
                "another instance is already running (lock file {})",
                path.display()
            ))),
            Err(TryLockError::Error(err)) => Err(DispatchError::Storage(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_first_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatchd.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        match InstanceLock::acquire(&path) {
            Err(DispatchError::FatalStartup(_)) => {}
            other => panic!("expected FatalStartup, got {other:?}"),
        }

        drop(first);
        InstanceLock::acquire(&path).unwrap();
    }
}
