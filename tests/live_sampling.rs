//! End-to-end liveness: stop a real thread parked in a distinctive call
//! chain, walk it, symbolize natively, and find the chain in the output.

#![cfg(any(target_os = "linux", target_os = "macos"))]
#![allow(non_snake_case)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use profile_recorder::{run_session, OutputFormat, SessionProps, SymbolizerChoice};
use tokio_util::sync::CancellationToken;

static WORKER_READY: AtomicBool = AtomicBool::new(false);
static WORKER_STOP: AtomicBool = AtomicBool::new(false);

// Each link adds to the callee's result after the call returns, so none of
// the calls can become a tail call and every frame stays on the stack.

#[no_mangle]
#[inline(never)]
extern "C" fn QUUUX() -> u64 {
    WORKER_READY.store(true, Ordering::SeqCst);
    let mut spins = 0u64;
    while !WORKER_STOP.load(Ordering::SeqCst) {
        spins = spins.wrapping_add(1);
        std::hint::spin_loop();
    }
    std::hint::black_box(spins)
}

#[no_mangle]
#[inline(never)]
extern "C" fn QUUX() -> u64 {
    std::hint::black_box(QUUUX()) + 1
}

#[no_mangle]
#[inline(never)]
extern "C" fn QUX() -> u64 {
    std::hint::black_box(QUUX()) + 1
}

#[no_mangle]
#[inline(never)]
extern "C" fn BUZ() -> u64 {
    std::hint::black_box(QUX()) + 1
}

#[no_mangle]
#[inline(never)]
extern "C" fn BAR() -> u64 {
    std::hint::black_box(BUZ()) + 1
}

#[no_mangle]
#[inline(never)]
extern "C" fn FOO() -> u64 {
    std::hint::black_box(BAR()) + 1
}

#[test]
fn blocked_worker_chain_appears_in_symbolized_output() {
    let worker = std::thread::spawn(|| std::hint::black_box(FOO()));
    while !WORKER_READY.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    let props = SessionProps {
        sample_count: 1,
        interval: Duration::from_millis(1),
        format: OutputFormat::Collapsed,
        symbolizer: SymbolizerChoice::Native,
        ..SessionProps::default()
    };
    let cancel = CancellationToken::new();
    let mut sink = Vec::new();
    let stats = run_session(&props, &cancel, &mut sink).expect("session failed");
    assert_eq!(stats.rounds, 1);

    WORKER_STOP.store(true, Ordering::SeqCst);
    worker.join().unwrap();

    let output = String::from_utf8(sink).unwrap();
    let worker_line = output
        .lines()
        .find(|line| line.contains("QUUUX"))
        .unwrap_or_else(|| panic!("no line contains the worker's innermost frame:\n{output}"));

    // Outermost to innermost, as one contiguous run, with the anchor's
    // unmangled name verbatim.
    assert!(
        worker_line.contains("FOO;BAR;BUZ;QUX;QUUX;QUUUX"),
        "chain not contiguous in: {worker_line}"
    );
    assert!(worker_line.contains("FOO"));
}
