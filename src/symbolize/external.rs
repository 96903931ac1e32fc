//! Driver for an out-of-process, line-oriented symbolizer.
//!
//! One background thread owns the child's pipes and serves queries in
//! arrival order; callers block on a per-query reply channel with a timeout,
//! so a stalled child fails individual queries without wedging the process.
//! The wire format is the `llvm-symbolizer` one: a request is
//! `"<library-path>" 0x<hex>` on one line, the response either one JSON
//! document per line or `function` / `file:line:column` line pairs ending
//! with a blank line. Libraries that do not exist on disk are requested
//! under a `/file/not/found` prefix so the child reliably errors instead of
//! hanging on them.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::SymbolizeError;
use crate::shared::types::{DynamicLibMapping, SingleFrame};
use crate::symbolize::SymbolizerBackend;

const MISSING_FILE_PREFIX: &str = "/file/not/found";

/// The address injected by the unstucker to probe child liveness.
const SENTINEL_ADDRESS: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSymbolizerProps {
    /// Program and arguments, e.g. `["llvm-symbolizer", "--inlines"]`.
    pub command: Vec<String>,
    pub query_timeout: Duration,
    /// Periodically probe the child with a sentinel query and abandon it if
    /// the probe times out.
    pub unstucker: bool,
}

impl ExternalSymbolizerProps {
    pub fn new(command: Vec<String>) -> Self {
        ExternalSymbolizerProps {
            command,
            query_timeout: Duration::from_secs(10),
            unstucker: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedFrame {
    function: String,
    file: Option<String>,
    line: Option<u32>,
}

struct Query {
    request_line: String,
    reply_tx: Sender<Result<Vec<ParsedFrame>, SymbolizeError>>,
}

struct BackendShared {
    child_pid: u32,
    dead: AtomicBool,
    shutting_down: AtomicBool,
}

pub struct ExternalSymbolizer {
    props: ExternalSymbolizerProps,
    query_tx: Mutex<Option<Sender<Query>>>,
    shared: Arc<BackendShared>,
}

impl ExternalSymbolizer {
    pub fn spawn(props: ExternalSymbolizerProps) -> Result<Self, SymbolizeError> {
        let (program, args) = props
            .command
            .split_first()
            .ok_or_else(|| SymbolizeError::BackendParse("empty symbolizer command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| SymbolizeError::LibraryIo {
                path: program.clone(),
                source: Arc::new(err),
            })?;

        let shared = Arc::new(BackendShared {
            child_pid: child.id(),
            dead: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });

        let (query_tx, query_rx) = unbounded::<Query>();
        {
            let shared = shared.clone();
            let stdin = child.stdin.take();
            let stdout = child.stdout.take();
            std::thread::Builder::new()
                .name("symbolizer-io".to_string())
                .spawn(move || run_io_thread(child, stdin, stdout, query_rx, shared))
                .map_err(|err| SymbolizeError::LibraryIo {
                    path: "symbolizer-io".to_string(),
                    source: Arc::new(err),
                })?;
        }

        let backend = ExternalSymbolizer {
            props,
            query_tx: Mutex::new(Some(query_tx)),
            shared,
        };
        if backend.props.unstucker {
            backend.spawn_unstucker();
        }
        Ok(backend)
    }

    fn request(
        &self,
        request_line: String,
        timeout: Duration,
    ) -> Result<Vec<ParsedFrame>, SymbolizeError> {
        if self.shared.dead.load(Ordering::Acquire) {
            return Err(SymbolizeError::BackendGone);
        }
        let (reply_tx, reply_rx) = bounded(1);
        {
            let query_tx = self.query_tx.lock();
            let query_tx = query_tx.as_ref().ok_or(SymbolizeError::Cancelled)?;
            query_tx
                .send(Query {
                    request_line,
                    reply_tx,
                })
                .map_err(|_| SymbolizeError::BackendGone)?;
        }
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                Err(SymbolizeError::BackendTimeout(timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => {
                if self.shared.shutting_down.load(Ordering::Acquire) {
                    Err(SymbolizeError::Cancelled)
                } else {
                    Err(SymbolizeError::BackendGone)
                }
            }
        }
    }

    fn spawn_unstucker(&self) {
        let shared = self.shared.clone();
        let query_tx = self
            .query_tx
            .lock()
            .clone()
            .expect("unstucker spawned after shutdown");
        let timeout = self.props.query_timeout;
        std::thread::Builder::new()
            .name("symbolizer-unstucker".to_string())
            .spawn(move || {
                let probe_interval = timeout.max(Duration::from_secs(1));
                loop {
                    // Sleep in slices so shutdown is not delayed by a whole
                    // probe interval; the sender clone held here keeps the
                    // query channel open until this thread exits.
                    let mut slept = Duration::ZERO;
                    while slept < probe_interval {
                        let slice = Duration::from_millis(100).min(probe_interval - slept);
                        std::thread::sleep(slice);
                        slept += slice;
                        if shared.shutting_down.load(Ordering::Acquire)
                            || shared.dead.load(Ordering::Acquire)
                        {
                            return;
                        }
                    }
                    let (reply_tx, reply_rx) = bounded(1);
                    let request_line =
                        format!("\"{MISSING_FILE_PREFIX}/unstucker\" {SENTINEL_ADDRESS:#x}\n");
                    if query_tx
                        .send(Query {
                            request_line,
                            reply_tx,
                        })
                        .is_err()
                    {
                        return;
                    }
                    if reply_rx.recv_timeout(timeout).is_err() {
                        warn!("external symbolizer wedged; abandoning it");
                        shared.dead.store(true, Ordering::Release);
                        unsafe {
                            libc::kill(shared.child_pid as libc::pid_t, libc::SIGKILL);
                        }
                        return;
                    }
                }
            })
            .ok();
    }
}

impl SymbolizerBackend for ExternalSymbolizer {
    fn symbolize(
        &self,
        file_virtual_address: u64,
        mapping: &DynamicLibMapping,
    ) -> Result<Vec<SingleFrame>, SymbolizeError> {
        let path = &mapping.path;
        let request_path = if path.exists() {
            path.display().to_string()
        } else {
            format!("{MISSING_FILE_PREFIX}{}", path.display())
        };
        let request_line = format!("\"{request_path}\" {file_virtual_address:#x}\n");
        let parsed = self.request(request_line, self.props.query_timeout)?;

        Ok(parsed
            .into_iter()
            .filter(|frame| frame.function != "??")
            .map(|frame| SingleFrame {
                address: file_virtual_address,
                function_name: frame.function,
                function_offset: 0,
                library: Some(mapping.basename()),
                vmap: Some(mapping.clone()),
                source_file: frame.file,
                source_line: frame.line,
            })
            .collect())
    }

    fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        // Dropping the sender lets the io thread close the pipes and reap
        // the child; outstanding queries observe `Cancelled`.
        self.query_tx.lock().take();
    }
}

impl Drop for ExternalSymbolizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_io_thread(
    mut child: Child,
    stdin: Option<std::process::ChildStdin>,
    stdout: Option<std::process::ChildStdout>,
    query_rx: crossbeam_channel::Receiver<Query>,
    shared: Arc<BackendShared>,
) {
    let (Some(mut stdin), Some(stdout)) = (stdin, stdout) else {
        shared.dead.store(true, Ordering::Release);
        return;
    };
    let mut stdout = BufReader::new(stdout);

    for query in query_rx.iter() {
        if shared.dead.load(Ordering::Acquire) {
            let _ = query.reply_tx.send(Err(SymbolizeError::BackendGone));
            continue;
        }
        let result = stdin
            .write_all(query.request_line.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|err| {
                SymbolizeError::BackendParse(format!("cannot write to symbolizer: {err}"))
            })
            .and_then(|()| read_response(&mut stdout));
        if result.is_err() {
            shared.dead.store(true, Ordering::Release);
        }
        let _ = query.reply_tx.send(result);
    }

    // All senders gone: session shutdown. Close the pipe and reap.
    drop(stdin);
    debug!("shutting down external symbolizer pid {}", shared.child_pid);
    unsafe {
        libc::kill(shared.child_pid as libc::pid_t, libc::SIGKILL);
    }
    let _ = child.wait();
}

/// Reads one response: a single JSON line, or `function` / `file:line:col`
/// pairs terminated by a blank line. An address echo line (`0x...`) before
/// the pairs is tolerated.
fn read_response(
    stdout: &mut BufReader<std::process::ChildStdout>,
) -> Result<Vec<ParsedFrame>, SymbolizeError> {
    let mut first = String::new();
    let n = stdout
        .read_line(&mut first)
        .map_err(|err| SymbolizeError::BackendParse(format!("cannot read response: {err}")))?;
    if n == 0 {
        return Err(SymbolizeError::BackendGone);
    }
    let first_trimmed = first.trim();

    if first_trimmed.starts_with('{') {
        return parse_json_response(first_trimmed);
    }

    let mut frames = Vec::new();
    let mut pending_function: Option<String> = None;

    let mut handle_line = |line: &str, frames: &mut Vec<ParsedFrame>| match pending_function.take()
    {
        None => pending_function = Some(line.to_string()),
        Some(function) => {
            let (file, line_no) = parse_file_line(line);
            frames.push(ParsedFrame {
                function,
                file,
                line: line_no,
            });
        }
    };

    if !first_trimmed.is_empty() && !is_address_echo(first_trimmed) {
        handle_line(first_trimmed, &mut frames);
    }
    if !first_trimmed.is_empty() {
        loop {
            let mut line = String::new();
            let n = stdout.read_line(&mut line).map_err(|err| {
                SymbolizeError::BackendParse(format!("cannot read response: {err}"))
            })?;
            if n == 0 {
                return Err(SymbolizeError::BackendGone);
            }
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            handle_line(line, &mut frames);
        }
    }

    // A dangling function line without a location still names a frame.
    if let Some(function) = pending_function.take() {
        frames.push(ParsedFrame {
            function,
            file: None,
            line: None,
        });
    }
    Ok(frames)
}

fn is_address_echo(line: &str) -> bool {
    let token = line.split_whitespace().next().unwrap_or("");
    let token = token.trim_end_matches(':');
    token.starts_with("0x") && u64::from_str_radix(token.trim_start_matches("0x"), 16).is_ok()
}

/// `path/to/file.rs:12:34` with the trailing column and line optional.
/// `??:0` and `??:?` mean "no location".
fn parse_file_line(text: &str) -> (Option<String>, Option<u32>) {
    let mut parts = text.rsplitn(3, ':');
    let last = parts.next().unwrap_or("");
    let middle = parts.next();
    let first = parts.next();

    let (file, line) = match (first, middle) {
        // file:line:col
        (Some(file), Some(line)) => (file, line.parse().ok()),
        // file:line
        (None, Some(file)) => (file, last.parse().ok()),
        _ => (text, None),
    };
    if file.is_empty() || file == "??" {
        (None, None)
    } else {
        (Some(file.to_string()), line)
    }
}

fn parse_json_response(line: &str) -> Result<Vec<ParsedFrame>, SymbolizeError> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|err| SymbolizeError::BackendParse(format!("bad JSON response: {err}")))?;

    // Either {"frames": [...]} or a single frame object.
    let frame_values: Vec<&serde_json::Value> = match value.get("frames").and_then(|f| f.as_array())
    {
        Some(frames) => frames.iter().collect(),
        None => vec![&value],
    };

    let mut frames = Vec::new();
    for frame in frame_values {
        if let Some(error) = frame.get("error") {
            return Err(SymbolizeError::BackendParse(error.to_string()));
        }
        let Some(function) = frame
            .get("function")
            .or_else(|| frame.get("functionName"))
            .and_then(|f| f.as_str())
        else {
            continue;
        };
        frames.push(ParsedFrame {
            function: function.to_string(),
            file: frame
                .get("file")
                .and_then(|f| f.as_str())
                .filter(|f| !f.is_empty() && *f != "??")
                .map(|f| f.to_string()),
            line: frame.get("line").and_then(|l| l.as_u64()).map(|l| l as u32),
        });
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_line_parsing() {
        assert_eq!(
            parse_file_line("src/main.rs:42:7"),
            (Some("src/main.rs".to_string()), Some(42))
        );
        assert_eq!(
            parse_file_line("src/main.rs:42"),
            (Some("src/main.rs".to_string()), Some(42))
        );
        assert_eq!(parse_file_line("??:0"), (None, None));
        assert_eq!(parse_file_line("??:?"), (None, None));
    }

    #[test]
    fn address_echo_detection() {
        assert!(is_address_echo("0x1234:"));
        assert!(is_address_echo("0xdeadbeef"));
        assert!(!is_address_echo("my_function"));
        assert!(!is_address_echo("0xnothex"));
    }

    #[test]
    fn json_response_with_frames_array() {
        let frames = parse_json_response(
            r#"{"frames":[{"function":"inner","file":"a.rs","line":3},{"function":"outer"}]}"#,
        )
        .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].function, "inner");
        assert_eq!(frames[0].file.as_deref(), Some("a.rs"));
        assert_eq!(frames[0].line, Some(3));
        assert_eq!(frames[1].function, "outer");
        assert_eq!(frames[1].file, None);
    }

    #[test]
    fn json_single_object_response() {
        let frames =
            parse_json_response(r#"{"functionName":"solo","file":"??","line":0}"#).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function, "solo");
        assert_eq!(frames[0].file, None);
    }

    /// Drives the whole pipe protocol against a tiny shell symbolizer that
    /// prints one function/location pair and a terminating blank line per
    /// request.
    #[test]
    fn line_oriented_response_through_a_real_child() {
        let props = ExternalSymbolizerProps::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "while read -r line; do echo my_func; echo lib.rs:7:1; echo; done".to_string(),
        ]);
        let backend = ExternalSymbolizer::spawn(props).unwrap();
        let mapping = DynamicLibMapping {
            path: std::path::PathBuf::from("/definitely/not/here.so"),
            arch: "x86_64",
            segment_slide: 0,
            segment_start: 0x1000,
            segment_end: 0x2000,
        };
        let frames = backend.symbolize(0x1234, &mapping).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function_name, "my_func");
        assert_eq!(frames[0].source_file.as_deref(), Some("lib.rs"));
        assert_eq!(frames[0].source_line, Some(7));
        backend.shutdown();
    }

    #[test]
    fn queries_after_shutdown_are_cancelled() {
        let props = ExternalSymbolizerProps::new(vec!["cat".to_string()]);
        let backend = ExternalSymbolizer::spawn(props).unwrap();
        backend.shutdown();
        let mapping = DynamicLibMapping {
            path: std::path::PathBuf::from("/x.so"),
            arch: "x86_64",
            segment_slide: 0,
            segment_start: 0x1000,
            segment_end: 0x2000,
        };
        match backend.symbolize(0x1000, &mapping) {
            Err(SymbolizeError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
