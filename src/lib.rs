//! An in-process sampling profiler.
//!
//! Linked into a host program, this crate periodically stops every live
//! thread with a directed signal, records each thread's stack by walking
//! frame pointers, symbolizes the captured addresses against the process's
//! own loaded objects, and renders the result as `perf script` text, folded
//! stacks for FlameGraph tooling, or a gzip-compressed pprof protobuf.
//! No elevated privileges are needed: the profiler only ever inspects its
//! own process.
//!
//! The usual entry points are [`sampler::run_session`] for a one-shot
//! recording and [`server::serve`] for the HTTP control surface.

#[cfg(not(unix))]
compile_error!("profile-recorder requires a unix platform (Linux, Android or macOS)");

#[cfg(any(target_os = "android", target_os = "linux"))]
mod linux;
#[cfg(target_os = "macos")]
mod mac;
#[cfg(not(any(target_os = "android", target_os = "linux", target_os = "macos")))]
mod unsupported;

#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) use linux as platform;
#[cfg(target_os = "macos")]
pub(crate) use mac as platform;
#[cfg(not(any(target_os = "android", target_os = "linux", target_os = "macos")))]
pub(crate) use unsupported as platform;

pub mod error;
pub mod render;
pub mod sampler;
pub mod server;
pub mod shared;
pub mod symbolize;

pub use error::{SamplingError, SessionError, SymbolizeError};
pub use platform::{enumerate_threads, ThreadEntry, ThreadHandle};
pub use render::OutputFormat;
pub use sampler::{run_session, SessionProps, SessionStats, SymbolizerChoice};
pub use shared::frame_parser::parse_frame_line;
pub use shared::stopper::with_thread_paused;
pub use shared::types::{
    DynamicLibMapping, Sample, SingleFrame, StackFrame, SymbolisedStackFrame,
};
