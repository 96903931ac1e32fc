#![allow(non_camel_case_types)]

use std::mem;

use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::task::task_threads;
use mach2::traps::mach_task_self;
use mach2::vm_types::{integer_t, natural_t};

use crate::error::SamplingError;

const THREAD_IDENTIFIER_INFO: u32 = 4;
const THREAD_EXTENDED_INFO: u32 = 5;
const MAXTHREADNAMESIZE: usize = 64;

type thread_info_t = *mut integer_t;

#[repr(C)]
#[derive(Default)]
struct thread_identifier_info {
    thread_id: u64,
    thread_handle: u64,
    dispatch_qaddr: u64,
}

#[repr(C)]
struct thread_extended_info {
    pth_user_time: u64,
    pth_system_time: u64,
    pth_cpu_usage: i32,
    pth_policy: i32,
    pth_run_state: i32,
    pth_flags: i32,
    pth_sleep_time: i32,
    pth_curpri: i32,
    pth_priority: i32,
    pth_maxpriority: i32,
    pth_name: [libc::c_char; MAXTHREADNAMESIZE],
}

const THREAD_IDENTIFIER_INFO_COUNT: mach_msg_type_number_t =
    (mem::size_of::<thread_identifier_info>() / mem::size_of::<natural_t>()) as _;
const THREAD_EXTENDED_INFO_COUNT: mach_msg_type_number_t =
    (mem::size_of::<thread_extended_info>() / mem::size_of::<natural_t>()) as _;

// Missing from mach2, see https://github.com/JohnTitor/mach2/issues/31.
extern "C" {
    fn thread_info(
        target_act: mach_port_t,
        flavor: u32,
        thread_info_out: thread_info_t,
        thread_info_out_cnt: *mut mach_msg_type_number_t,
    ) -> kern_return_t;
}

/// Addressable identity of one thread of this process. The pthread is kept
/// as a plain word so handles can cross threads regardless of how the libc
/// type is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
    tid: u64,
    pthread: usize,
}

impl ThreadHandle {
    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub(crate) fn pthread(&self) -> libc::pthread_t {
        self.pthread as libc::pthread_t
    }

    /// The value the signal handler compares against the stop slot.
    pub(crate) fn identity(&self) -> u64 {
        self.pthread as u64
    }

    pub fn for_current_thread() -> ThreadHandle {
        let mut tid = 0u64;
        unsafe {
            libc::pthread_threadid_np(libc::pthread_self(), &mut tid);
        }
        ThreadHandle {
            tid,
            pthread: unsafe { libc::pthread_self() } as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub handle: ThreadHandle,
    pub name: String,
}

/// Lists the live threads of this task via `task_threads`, converting each
/// mach thread port to the pthread that `pthread_kill` addresses. Ports are
/// deallocated before returning.
pub fn enumerate_threads() -> Result<Vec<ThreadEntry>, SamplingError> {
    let task = unsafe { mach_task_self() };
    let mut thread_list: *mut mach_port_t = std::ptr::null_mut();
    let mut thread_count: mach_msg_type_number_t = 0;
    let kr = unsafe { task_threads(task, &mut thread_list, &mut thread_count) };
    if kr != KERN_SUCCESS {
        return Err(SamplingError::Enumerate(format!(
            "task_threads returned {kr}"
        )));
    }

    let mut entries = Vec::with_capacity(thread_count as usize);
    for i in 0..thread_count as usize {
        let act = unsafe { *thread_list.add(i) };
        let pthread = unsafe { libc::pthread_from_mach_thread_np(act) } as usize;
        if pthread != 0 {
            if let Some(tid) = thread_id(act) {
                entries.push(ThreadEntry {
                    handle: ThreadHandle { tid, pthread },
                    name: thread_name(act).unwrap_or_default(),
                });
            }
        }
        unsafe {
            mach2::mach_port::mach_port_deallocate(task, act);
        }
    }
    unsafe {
        mach2::vm::mach_vm_deallocate(
            task,
            thread_list as usize as u64,
            (thread_count as usize * mem::size_of::<mach_port_t>()) as u64,
        );
    }

    entries.sort_by_key(|e| e.handle.tid);
    Ok(entries)
}

fn thread_id(act: mach_port_t) -> Option<u64> {
    let mut info = thread_identifier_info::default();
    let mut count = THREAD_IDENTIFIER_INFO_COUNT;
    let kr = unsafe {
        thread_info(
            act,
            THREAD_IDENTIFIER_INFO,
            &mut info as *mut _ as thread_info_t,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return None;
    }
    Some(info.thread_id)
}

fn thread_name(act: mach_port_t) -> Option<String> {
    let mut info: thread_extended_info = unsafe { mem::zeroed() };
    let mut count = THREAD_EXTENDED_INFO_COUNT;
    let kr = unsafe {
        thread_info(
            act,
            THREAD_EXTENDED_INFO,
            &mut info as *mut _ as thread_info_t,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(info.pth_name.as_ptr()) }
        .to_string_lossy()
        .to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
