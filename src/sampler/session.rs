//! The sampling orchestrator: drives N rounds at a fixed cadence, stops and
//! walks every live thread per round, spools the raw samples, and then
//! streams the spool through the symbolizer into the chosen renderer.

use std::io::Write;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{SessionError, SymbolizeError};
use crate::platform::{self, ThreadEntry};
use crate::render::{OutputFormat, RenderProps};
use crate::sampler::spool::{SpoolReader, SpoolWriter};
use crate::shared::stack_walker::{self, DEFAULT_MAX_STACK_DEPTH};
use crate::shared::stopper::{self, DEFAULT_STOP_TIMEOUT};
use crate::shared::types::{Sample, StackFrame};
use crate::symbolize::{
    ExternalSymbolizer, ExternalSymbolizerProps, FakeSymbolizer, MappingStore, NativeSymbolizer,
    SymbolCache, Symbolizer, SymbolizerBackend,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SymbolizerChoice {
    #[default]
    Native,
    Fake,
    External(ExternalSymbolizerProps),
}

impl SymbolizerChoice {
    pub fn parse(text: &str) -> Option<SymbolizerChoice> {
        match text {
            "native" => Some(SymbolizerChoice::Native),
            "fake" => Some(SymbolizerChoice::Fake),
            _ => None,
        }
    }

    fn create_backend(&self) -> Result<Arc<dyn SymbolizerBackend>, SymbolizeError> {
        match self {
            SymbolizerChoice::Native => Ok(Arc::new(NativeSymbolizer::new())),
            SymbolizerChoice::Fake => Ok(Arc::new(FakeSymbolizer)),
            SymbolizerChoice::External(props) => {
                Ok(Arc::new(ExternalSymbolizer::spawn(props.clone())?))
            }
        }
    }

    /// The process-wide cache for this backend kind. Resolutions are only
    /// comparable within a kind, so each kind gets its own map.
    fn shared_cache(&self) -> Arc<SymbolCache> {
        static NATIVE: OnceLock<Arc<SymbolCache>> = OnceLock::new();
        static FAKE: OnceLock<Arc<SymbolCache>> = OnceLock::new();
        static EXTERNAL: OnceLock<Arc<SymbolCache>> = OnceLock::new();
        let cache = match self {
            SymbolizerChoice::Native => &NATIVE,
            SymbolizerChoice::Fake => &FAKE,
            SymbolizerChoice::External(_) => &EXTERNAL,
        };
        cache.get_or_init(|| Arc::new(SymbolCache::new())).clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProps {
    pub sample_count: u32,
    pub interval: Duration,
    pub format: OutputFormat,
    pub symbolizer: SymbolizerChoice,
    pub max_stack_depth: usize,
    pub stop_timeout: Duration,
}

impl Default for SessionProps {
    fn default() -> Self {
        SessionProps {
            sample_count: 10,
            interval: Duration::from_millis(10),
            format: OutputFormat::default(),
            symbolizer: SymbolizerChoice::default(),
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub rounds: u32,
    pub samples: u64,
    /// Rounds whose deadline had already passed when they started.
    pub falling_behind: u32,
}

fn wall_clock_now() -> (i64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => (since_epoch.as_secs() as i64, since_epoch.subsec_nanos()),
        // A clock before the epoch still has to produce monotonic-ish stamps.
        Err(err) => (-(err.duration().as_secs() as i64), 0),
    }
}

/// Runs one complete sampling session and writes the rendered output to
/// `sink`. Cancellation between rounds finalises the renderer with whatever
/// has been recorded; an in-flight stop always completes first.
pub fn run_session(
    props: &SessionProps,
    cancel: &CancellationToken,
    sink: &mut dyn Write,
) -> Result<SessionStats, SessionError> {
    if props.sample_count == 0 {
        return Err(SessionError::InvalidConfig("sample count is zero".into()));
    }
    if props.interval.is_zero() {
        return Err(SessionError::InvalidConfig("interval is zero".into()));
    }

    // Snapshot once per run, before any samples reference it.
    let mappings = MappingStore::snapshot().map_err(SessionError::Spool)?;
    if mappings.is_empty() {
        warn!("no executable mappings found; all frames will be unknown");
    }

    let mut writer = SpoolWriter::create()?;
    let stats = match record_rounds(props, cancel, &mut writer) {
        Ok(stats) => stats,
        Err(err) => {
            if let Some(path) = writer.persist_for_debugging() {
                warn!("sampling failed; partial spool kept at {}", path.display());
            }
            return Err(err);
        }
    };
    debug!(
        "recorded {} samples over {} rounds ({} behind schedule)",
        stats.samples, stats.rounds, stats.falling_behind
    );
    if stats.falling_behind > 0 {
        warn!(
            "sampling fell behind its {}ms cadence in {} of {} rounds",
            props.interval.as_millis(),
            stats.falling_behind,
            stats.rounds
        );
    }

    let reader = writer.into_reader()?;
    let backend = props
        .symbolizer
        .create_backend()
        .map_err(|err| SessionError::InvalidConfig(err.to_string()))?;
    backend
        .start()
        .map_err(|err| SessionError::InvalidConfig(err.to_string()))?;
    let symbolizer = Symbolizer::new(mappings, backend, props.symbolizer.shared_cache());

    let render_result = render_spool(props, reader, &symbolizer, sink);
    symbolizer.shutdown();
    render_result?;
    Ok(stats)
}

fn record_rounds(
    props: &SessionProps,
    cancel: &CancellationToken,
    writer: &mut SpoolWriter,
) -> Result<SessionStats, SessionError> {
    let pid = std::process::id();
    let mut frame_buf = vec![StackFrame::new(0, 0); props.max_stack_depth];
    let mut stats = SessionStats::default();
    let start = Instant::now();

    for round in 0..props.sample_count {
        if cancel.is_cancelled() {
            debug!("sampling cancelled after {} rounds", stats.rounds);
            break;
        }

        let (time_sec, time_nsec) = wall_clock_now();
        let threads = platform::enumerate_threads()?;
        for entry in &threads {
            let sample =
                sample_one_thread(pid, entry, time_sec, time_nsec, &mut frame_buf, props)?;
            writer.write_sample(&sample)?;
            stats.samples += 1;
        }
        writer.flush()?;
        stats.rounds += 1;

        let deadline = start + props.interval * (round + 1);
        if !sleep_until(deadline, cancel) && round + 1 < props.sample_count {
            stats.falling_behind += 1;
        }
    }
    Ok(stats)
}

/// Absolute-deadline pacing: sleeps until `deadline`, waking early on
/// cancellation. Returns false when the deadline had already passed.
fn sleep_until(deadline: Instant, cancel: &CancellationToken) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }
    let mut remaining = deadline - now;
    while !remaining.is_zero() && !cancel.is_cancelled() {
        let slice = remaining.min(Duration::from_millis(50));
        std::thread::sleep(slice);
        remaining = deadline.saturating_duration_since(Instant::now());
    }
    true
}

fn sample_one_thread(
    pid: u32,
    entry: &ThreadEntry,
    time_sec: i64,
    time_nsec: u32,
    frame_buf: &mut [StackFrame],
    props: &SessionProps,
) -> Result<Sample, SessionError> {
    let mut frame_count = 0;
    let mut truncated = false;

    let walked = stopper::with_thread_paused(&entry.handle, props.stop_timeout, |context| {
        let outcome = unsafe { stack_walker::walk_stack(context, frame_buf) };
        frame_count = outcome.frame_count;
        truncated = outcome.truncated;
    });
    match walked {
        Ok(()) => {}
        Err(err) if err.is_per_thread() => {
            debug!("no stack for thread {}: {err}", entry.handle.tid());
            frame_count = 0;
            truncated = false;
        }
        Err(err) => return Err(err.into()),
    }

    Ok(Sample {
        pid,
        tid: entry.handle.tid(),
        thread_name: entry.name.clone(),
        time_sec,
        time_nsec,
        truncated,
        frames: frame_buf[..frame_count].to_vec(),
    })
}

fn render_spool(
    props: &SessionProps,
    mut reader: SpoolReader,
    symbolizer: &Symbolizer,
    sink: &mut dyn Write,
) -> Result<(), SessionError> {
    let result = render_spool_inner(props, &mut reader, symbolizer, sink);
    if matches!(result, Err(SessionError::Render(_))) && props.format != OutputFormat::Pprof {
        // Cut the text stream with a visible marker; a compressed sink gets
        // nothing it could misparse as a valid profile.
        let _ = sink.write_all(b"# profile stream aborted\n");
    }
    result
}

fn render_spool_inner(
    props: &SessionProps,
    reader: &mut SpoolReader,
    symbolizer: &Symbolizer,
    sink: &mut dyn Write,
) -> Result<(), SessionError> {
    let mut renderer = props.format.create_renderer();
    let render_props = RenderProps::default();

    while let Some(sample) = reader.next_sample()? {
        let bytes = renderer
            .consume_single_sample(&sample, &render_props, symbolizer)
            .map_err(|err| SessionError::Render(err.to_string()))?;
        sink.write_all(&bytes)
            .map_err(|err| SessionError::Render(err.to_string()))?;
    }
    let bytes = renderer
        .finalise(&render_props, symbolizer)
        .map_err(|err| SessionError::Render(err.to_string()))?;
    sink.write_all(&bytes)
        .map_err(|err| SessionError::Render(err.to_string()))?;
    Ok(())
}
