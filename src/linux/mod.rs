pub mod proc_maps;
mod thread_registry;

pub use thread_registry::{enumerate_threads, ThreadEntry, ThreadHandle};

use crate::error::SamplingError;
use crate::shared::types::DynamicLibMapping;

/// The reserved profiling signal. The first realtime signal is left alone
/// because some runtimes claim it internally.
pub fn stop_signal() -> libc::c_int {
    libc::SIGRTMIN() + 1
}

/// Kernel thread id of the calling thread; this is what the signal handler
/// compares against the stop slot.
pub fn self_identity() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

pub fn signal_thread(handle: &ThreadHandle) -> Result<(), SamplingError> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::getpid(),
            handle.tid() as libc::pid_t,
            stop_signal(),
        )
    };
    if ret == 0 {
        return Ok(());
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Err(SamplingError::ThreadGone),
        Some(errno) => Err(SamplingError::SignalFailed(errno)),
        None => Err(SamplingError::SignalFailed(-1)),
    }
}

/// Snapshot of the executable file-backed regions of this process.
pub fn snapshot_mappings() -> std::io::Result<Vec<DynamicLibMapping>> {
    let maps = std::fs::read_to_string("/proc/self/maps")?;
    Ok(proc_maps::executable_mappings(&maps))
}
