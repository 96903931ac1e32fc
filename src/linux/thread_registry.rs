use crate::error::SamplingError;

/// Addressable identity of one thread of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
    tid: u64,
}

impl ThreadHandle {
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// The value the signal handler compares against the stop slot.
    pub(crate) fn identity(&self) -> u64 {
        self.tid
    }

    pub fn for_current_thread() -> ThreadHandle {
        ThreadHandle {
            tid: super::self_identity(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub handle: ThreadHandle,
    pub name: String,
}

/// Lists the live threads of this process by reading `/proc/self/task`.
/// The set is consistent with some instant during the call; threads created
/// or destroyed concurrently may or may not appear.
pub fn enumerate_threads() -> Result<Vec<ThreadEntry>, SamplingError> {
    let dir = std::fs::read_dir("/proc/self/task")
        .map_err(|err| SamplingError::Enumerate(err.to_string()))?;

    let mut entries = Vec::new();
    for dirent in dir {
        let dirent = match dirent {
            Ok(dirent) => dirent,
            // The task went away while we were iterating.
            Err(_) => continue,
        };
        let tid: u64 = match dirent.file_name().to_string_lossy().parse() {
            Ok(tid) => tid,
            Err(_) => continue,
        };
        entries.push(ThreadEntry {
            handle: ThreadHandle { tid },
            name: thread_name(tid).unwrap_or_default(),
        });
    }
    entries.sort_by_key(|e| e.handle.tid);
    Ok(entries)
}

fn thread_name(tid: u64) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/self/task/{tid}/comm")).ok()?;
    let name = comm.trim_end_matches('\n').to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
