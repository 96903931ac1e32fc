//! Signal-based suspension of a single thread.
//!
//! One process-wide stop slot, guarded by one mutex that is only ever taken
//! outside signal context. The reserved profiling signal is sent directly to
//! the target thread; its handler publishes the interrupted machine context
//! into the slot and then parks until the control thread posts release. The
//! handler touches nothing but atomics, the preallocated slot, and
//! async-signal-safe syscalls.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::SamplingError;
use crate::platform;
use crate::platform::ThreadHandle;
use crate::shared::types::CapturedContext;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(250);

const STATE_IDLE: u32 = 0;
const STATE_SIGNALLED: u32 = 1;
const STATE_CAPTURED: u32 = 2;
const STATE_RELEASING: u32 = 3;

struct StopSlot {
    state: AtomicU32,
    /// Identity of the thread the in-flight signal is meant for, as compared
    /// by the handler ([`platform::self_identity`]).
    target: AtomicU64,
    context: UnsafeCell<CapturedContext>,
}

// The context cell is only written by the handler between `Signalled` and
// `Captured`, and only read by the control thread between `Captured` and
// `Releasing`; the state transitions order the accesses.
unsafe impl Sync for StopSlot {}

static STOP_SLOT: StopSlot = StopSlot {
    state: AtomicU32::new(STATE_IDLE),
    target: AtomicU64::new(0),
    context: UnsafeCell::new(CapturedContext {
        ip: 0,
        sp: 0,
        fp: 0,
    }),
};

static STOP_LOCK: Mutex<()> = Mutex::new(());

static HANDLER_INSTALL: OnceLock<Result<(), i32>> = OnceLock::new();

fn ensure_handler_installed() -> Result<(), SamplingError> {
    match HANDLER_INSTALL.get_or_init(|| unsafe { install_handler() }) {
        Ok(()) => Ok(()),
        Err(errno) => Err(SamplingError::HandlerInstallFailed(*errno)),
    }
}

unsafe fn install_handler() -> Result<(), i32> {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = stop_signal_handler as *const () as usize;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut sa.sa_mask);
    if libc::sigaction(platform::stop_signal(), &sa, std::ptr::null_mut()) != 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(-1));
    }
    Ok(())
}

/// Async-signal-safe pause so the parked target does not starve the control
/// thread on a loaded machine.
fn park_briefly() {
    let ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 50_000,
    };
    unsafe {
        libc::nanosleep(&ts, std::ptr::null_mut());
    }
}

extern "C" fn stop_signal_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let slot = &STOP_SLOT;
    if slot.state.load(Ordering::Acquire) != STATE_SIGNALLED {
        // Stale delivery: the stop was withdrawn or already finished.
        return;
    }
    if platform::self_identity() != slot.target.load(Ordering::Relaxed) {
        return;
    }

    let context =
        unsafe { context_from_ucontext(ucontext as *const libc::ucontext_t) }.unwrap_or_default();
    unsafe {
        *slot.context.get() = context;
    }
    slot.state.store(STATE_CAPTURED, Ordering::Release);

    // Park on this frame while the control thread reads our stack.
    while slot.state.load(Ordering::Acquire) == STATE_CAPTURED {
        park_briefly();
    }
    slot.state.store(STATE_IDLE, Ordering::Release);
}

/// Stops `handle`, runs `f` on its captured machine context while it is
/// parked in the signal handler, resumes it, and returns `f`'s result.
///
/// `ThreadGone`, `SignalFailed` and `StuckThread` are per-thread failures;
/// the target is guaranteed to be running again whenever this returns.
pub fn with_thread_paused<T>(
    handle: &ThreadHandle,
    timeout: Duration,
    f: impl FnOnce(&CapturedContext) -> T,
) -> Result<T, SamplingError> {
    ensure_handler_installed()?;
    if handle.identity() == platform::self_identity() {
        return Err(SamplingError::AlreadyMe);
    }

    let _guard = STOP_LOCK.lock();
    let slot = &STOP_SLOT;
    assert_eq!(
        slot.state.load(Ordering::Acquire),
        STATE_IDLE,
        "stop slot occupied while the stop lock was free"
    );

    slot.target.store(handle.identity(), Ordering::Relaxed);
    slot.state.store(STATE_SIGNALLED, Ordering::Release);

    if let Err(err) = platform::signal_thread(handle) {
        slot.state.store(STATE_IDLE, Ordering::Release);
        return Err(err);
    }

    let deadline = Instant::now() + timeout;
    loop {
        match slot.state.load(Ordering::Acquire) {
            STATE_CAPTURED => break,
            _ if Instant::now() >= deadline => {
                // Withdraw the stop. Losing the race means the handler got
                // there after all, so continue as a normal capture.
                if slot
                    .state
                    .compare_exchange(
                        STATE_SIGNALLED,
                        STATE_IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Err(SamplingError::StuckThread(timeout.as_millis() as u64));
                }
            }
            _ => std::thread::sleep(Duration::from_micros(20)),
        }
    }

    let context = unsafe { *slot.context.get() };
    let result = f(&context);

    // Release the target and wait for its acknowledgement so the slot is
    // clean before the lock is dropped.
    slot.state.store(STATE_RELEASING, Ordering::Release);
    while slot.state.load(Ordering::Acquire) != STATE_IDLE {
        std::hint::spin_loop();
    }

    Ok(result)
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        unsafe fn context_from_ucontext(ucontext: *const libc::ucontext_t) -> Option<CapturedContext> {
            if ucontext.is_null() {
                return None;
            }
            let mcontext = &(*ucontext).uc_mcontext;
            Some(CapturedContext {
                ip: mcontext.gregs[libc::REG_RIP as usize] as u64,
                sp: mcontext.gregs[libc::REG_RSP as usize] as u64,
                fp: mcontext.gregs[libc::REG_RBP as usize] as u64,
            })
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        unsafe fn context_from_ucontext(ucontext: *const libc::ucontext_t) -> Option<CapturedContext> {
            if ucontext.is_null() {
                return None;
            }
            let mcontext = &(*ucontext).uc_mcontext;
            Some(CapturedContext {
                ip: mcontext.pc,
                sp: mcontext.sp,
                // x29 is the frame pointer.
                fp: mcontext.regs[29],
            })
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
        unsafe fn context_from_ucontext(ucontext: *const libc::ucontext_t) -> Option<CapturedContext> {
            if ucontext.is_null() {
                return None;
            }
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                return None;
            }
            let ss = &(*mcontext).__ss;
            Some(CapturedContext {
                ip: ss.__rip,
                sp: ss.__rsp,
                fp: ss.__rbp,
            })
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
        unsafe fn context_from_ucontext(ucontext: *const libc::ucontext_t) -> Option<CapturedContext> {
            if ucontext.is_null() {
                return None;
            }
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                return None;
            }
            let ss = &(*mcontext).__ss;
            Some(CapturedContext {
                ip: ss.__pc,
                sp: ss.__sp,
                fp: ss.__fp,
            })
        }
    } else {
        unsafe fn context_from_ucontext(_ucontext: *const libc::ucontext_t) -> Option<CapturedContext> {
            None
        }
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "macos")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn spin_target(stop: Arc<AtomicBool>) -> (std::thread::JoinHandle<()>, ThreadHandle) {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = std::thread::spawn(move || {
            tx.send(ThreadHandle::for_current_thread()).unwrap();
            while !stop.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        });
        let handle = rx.recv().unwrap();
        (thread, handle)
    }

    #[test]
    fn captures_a_context_and_releases() {
        let stop = Arc::new(AtomicBool::new(false));
        let (target, handle) = spin_target(stop.clone());
        std::thread::sleep(Duration::from_millis(50));

        let context = with_thread_paused(&handle, DEFAULT_STOP_TIMEOUT, |ctx| *ctx).unwrap();
        assert_ne!(context.ip, 0);
        assert_ne!(context.sp, 0);
        assert_eq!(STOP_SLOT.state.load(Ordering::Acquire), STATE_IDLE);

        stop.store(true, Ordering::Relaxed);
        target.join().unwrap();
    }

    #[test]
    fn refuses_to_stop_the_calling_thread() {
        let me = ThreadHandle::for_current_thread();
        match with_thread_paused(&me, DEFAULT_STOP_TIMEOUT, |_| ()) {
            Err(SamplingError::AlreadyMe) => {}
            other => panic!("expected AlreadyMe, got {other:?}"),
        }
    }

    #[test]
    fn stops_are_serialized_across_threads() {
        let stop = Arc::new(AtomicBool::new(false));
        let (target, handle) = spin_target(stop.clone());
        std::thread::sleep(Duration::from_millis(50));
        let handle = Arc::new(handle);

        let mut stoppers = Vec::new();
        for _ in 0..4 {
            let handle = handle.clone();
            stoppers.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    with_thread_paused(&handle, DEFAULT_STOP_TIMEOUT, |ctx| {
                        // The slot is exclusively ours for the whole window.
                        assert_eq!(STOP_SLOT.state.load(Ordering::Acquire), STATE_CAPTURED);
                        assert_ne!(ctx.sp, 0);
                    })
                    .unwrap();
                }
            }));
        }
        for stopper in stoppers {
            stopper.join().unwrap();
        }
        assert_eq!(STOP_SLOT.state.load(Ordering::Acquire), STATE_IDLE);

        stop.store(true, Ordering::Relaxed);
        target.join().unwrap();
    }
}
