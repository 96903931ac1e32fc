mod dyld_maps;
mod thread_registry;

pub use thread_registry::{enumerate_threads, ThreadEntry, ThreadHandle};

use crate::error::SamplingError;
use crate::shared::types::DynamicLibMapping;

/// The reserved profiling signal. macOS has no realtime signals, so the
/// classic profiling signal is claimed instead.
pub fn stop_signal() -> libc::c_int {
    libc::SIGPROF
}

/// `pthread_kill` addresses pthreads, so the handler-side identity is the
/// pthread, not the kernel thread id.
pub fn self_identity() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

pub fn signal_thread(handle: &ThreadHandle) -> Result<(), SamplingError> {
    let errno = unsafe { libc::pthread_kill(handle.pthread(), stop_signal()) };
    match errno {
        0 => Ok(()),
        libc::ESRCH => Err(SamplingError::ThreadGone),
        errno => Err(SamplingError::SignalFailed(errno)),
    }
}

/// Snapshot of the executable ranges of every loaded image, from the dyld
/// image list.
pub fn snapshot_mappings() -> std::io::Result<Vec<DynamicLibMapping>> {
    Ok(dyld_maps::executable_mappings())
}
