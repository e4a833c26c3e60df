//! Mock GPU Direct Storage capability for testing

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::gds::{Capability, DirectStorage, GdsError, GdsSession};

/// Mock capability with configurable availability and per-direction failure
#[derive(Debug, Clone)]
pub struct MockDirectStorage {
    unavailable: Option<String>,
    fail_write: bool,
    fail_read: bool,
    elapsed: Duration,
    /// Backing files seen by transfers, in order
    touched: Arc<Mutex<Vec<PathBuf>>>,
}

impl MockDirectStorage {
    /// Available capability; transfers take 125ms
    pub fn new() -> Self {
        Self {
            unavailable: None,
            fail_write: false,
            fail_read: false,
            elapsed: Duration::from_millis(125),
            touched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Capability that reports `reason` when probed
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::new()
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Fail the GPU -> Disk write with a cuFile error
    pub fn with_write_failure(mut self) -> Self {
        self.fail_write = true;
        self
    }

    /// Fail the Disk -> GPU read with a short transfer
    pub fn with_read_failure(mut self) -> Self {
        self.fail_read = true;
        self
    }

    /// Backing files that existed when a transfer ran
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        self.touched
            .lock()
            .map(|paths| paths.clone())
            .unwrap_or_default()
    }
}

impl Default for MockDirectStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectStorage for MockDirectStorage {
    fn probe(&self) -> Capability {
        match &self.unavailable {
            Some(reason) => Capability::Unavailable(reason.clone()),
            None => Capability::Available(Box::new(MockSession {
                storage: self.clone(),
                allocated: None,
            })),
        }
    }
}

struct MockSession {
    storage: MockDirectStorage,
    allocated: Option<usize>,
}

impl MockSession {
    fn transfer(&mut self, path: &Path, size: usize) -> Result<Duration, GdsError> {
        if self.allocated.map_or(true, |allocated| allocated < size) {
            return Err(GdsError::NoBuffer);
        }
        std::fs::metadata(path)?;
        if let Ok(mut touched) = self.storage.touched.lock() {
            touched.push(path.to_path_buf());
        }
        Ok(self.storage.elapsed)
    }
}

impl GdsSession for MockSession {
    fn allocate(&mut self, size: usize) -> Result<(), GdsError> {
        self.allocated = Some(size);
        Ok(())
    }

    fn zero(&mut self) -> Result<(), GdsError> {
        self.allocated.map(|_| ()).ok_or(GdsError::NoBuffer)
    }

    fn write(&mut self, path: &Path, size: usize) -> Result<Duration, GdsError> {
        if self.storage.fail_write {
            return Err(GdsError::Cufile {
                call: "cuFileWrite",
                code: -5,
            });
        }
        self.transfer(path, size)
    }

    fn read(&mut self, path: &Path, size: usize) -> Result<Duration, GdsError> {
        if self.storage.fail_read {
            return Err(GdsError::ShortTransfer {
                expected: size,
                actual: 0,
            });
        }
        self.transfer(path, size)
    }
}
