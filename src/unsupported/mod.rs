//! Fallback platform layer: every sampling operation fails fast with
//! `UnsupportedPlatform`, so a host linking the library on an unsupported
//! unix still runs, it just cannot record.

use crate::error::SamplingError;
use crate::shared::types::DynamicLibMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
    tid: u64,
}

impl ThreadHandle {
    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub(crate) fn identity(&self) -> u64 {
        self.tid
    }

    pub fn for_current_thread() -> ThreadHandle {
        ThreadHandle {
            tid: self_identity(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub handle: ThreadHandle,
    pub name: String,
}

pub fn enumerate_threads() -> Result<Vec<ThreadEntry>, SamplingError> {
    Err(SamplingError::UnsupportedPlatform)
}

pub fn stop_signal() -> libc::c_int {
    libc::SIGPROF
}

pub fn self_identity() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

pub fn signal_thread(_handle: &ThreadHandle) -> Result<(), SamplingError> {
    Err(SamplingError::UnsupportedPlatform)
}

pub fn snapshot_mappings() -> std::io::Result<Vec<DynamicLibMapping>> {
    Ok(Vec::new())
}
