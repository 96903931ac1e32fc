//! The `perf script` text format, as consumed by FlameGraph's
//! stackcollapse-perf, the Firefox Profiler importer, and speedscope.
//!
//! Per sample: a header line
//! `<thread_name> <pid>/<tid> <sec>.<nsec> [001] cycles:`, one frame line
//! `\t<hex-ip> <name>+0x<offset> (<library>)` per frame innermost first,
//! then a blank line.

use std::fmt::Write;

use crate::render::{render_ips, RenderError, RenderProps, Renderer};
use crate::shared::types::Sample;
use crate::symbolize::Symbolizer;

#[derive(Default)]
pub struct PerfScriptRenderer;

impl PerfScriptRenderer {
    pub fn new() -> Self {
        PerfScriptRenderer
    }
}

fn header_timestamp(time_sec: i64, time_nsec: u32) -> String {
    if time_sec == 0 {
        format!("{time_sec}.{time_nsec}")
    } else {
        format!("{time_sec}.{time_nsec:09}")
    }
}

impl Renderer for PerfScriptRenderer {
    fn consume_single_sample(
        &mut self,
        sample: &Sample,
        props: &RenderProps,
        symbolizer: &Symbolizer,
    ) -> Result<Vec<u8>, RenderError> {
        let mut out = String::new();
        let name = if sample.thread_name.is_empty() {
            "unknown"
        } else {
            &sample.thread_name
        };
        let _ = writeln!(
            out,
            "{} {}/{} {} [001] cycles:",
            name,
            sample.pid,
            sample.tid,
            header_timestamp(sample.time_sec, sample.time_nsec),
        );

        for ip in render_ips(sample, props) {
            let resolved = symbolizer.symbolize_ip(ip);
            for frame in &resolved.frames {
                let library = frame.library.as_deref().unwrap_or("unknown");
                let _ = writeln!(
                    out,
                    "\t{ip:x} {}+{:#x} ({library})",
                    frame.function_name, frame.function_offset,
                );
            }
        }
        out.push('\n');
        Ok(out.into_bytes())
    }

    fn finalise(
        &mut self,
        _props: &RenderProps,
        _symbolizer: &Symbolizer,
    ) -> Result<Vec<u8>, RenderError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::types::{DynamicLibMapping, StackFrame};
    use crate::symbolize::{FakeSymbolizer, MappingStore, SymbolCache, Symbolizer};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn fake_symbolizer() -> Symbolizer {
        Symbolizer::new(
            MappingStore::new(vec![DynamicLibMapping {
                path: PathBuf::from("/lib/libfoo.so"),
                arch: "x86_64",
                segment_slide: 0x1000,
                segment_start: 0x2000,
                segment_end: 0x3000,
            }]),
            Arc::new(FakeSymbolizer),
            Arc::new(SymbolCache::new()),
        )
    }

    #[test]
    fn sample_renders_header_frames_and_separator() {
        let symbolizer = fake_symbolizer();
        let mut renderer = PerfScriptRenderer::new();
        let sample = Sample {
            pid: 10,
            tid: 20,
            thread_name: "worker".into(),
            time_sec: 4,
            time_nsec: 5,
            truncated: false,
            frames: vec![StackFrame::new(0x2345, 0x1)],
        };
        let bytes = renderer
            .consume_single_sample(&sample, &RenderProps::default(), &symbolizer)
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "worker 10/20 4.000000005 [001] cycles:\n\t2345 fake+0x5 (libfoo.so)\n\n"
        );
    }

    #[test]
    fn bare_nanoseconds_when_seconds_are_zero() {
        assert_eq!(header_timestamp(0, 5), "0.5");
        assert_eq!(header_timestamp(4, 5), "4.000000005");
    }

    #[test]
    fn unmapped_ip_renders_as_unknown() {
        let symbolizer = fake_symbolizer();
        let mut renderer = PerfScriptRenderer::new();
        let sample = Sample {
            pid: 10,
            tid: 20,
            thread_name: "worker".into(),
            time_sec: 0,
            time_nsec: 7,
            truncated: false,
            frames: vec![StackFrame::new(0x9999, 0x1)],
        };
        let text = String::from_utf8(
            renderer
                .consume_single_sample(&sample, &RenderProps::default(), &symbolizer)
                .unwrap(),
        )
        .unwrap();
        assert!(text.contains("unknown @ 0x9999+0x0 (unknown)"));
    }

    #[test]
    fn empty_stack_still_emits_the_sample() {
        let symbolizer = fake_symbolizer();
        let mut renderer = PerfScriptRenderer::new();
        let sample = Sample {
            pid: 1,
            tid: 2,
            thread_name: String::new(),
            time_sec: 1,
            time_nsec: 0,
            truncated: false,
            frames: vec![],
        };
        let text = String::from_utf8(
            renderer
                .consume_single_sample(&sample, &RenderProps::default(), &symbolizer)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(text, "unknown 1/2 1.000000000 [001] cycles:\n\n");
    }

    #[test]
    fn finalise_with_no_samples_is_empty() {
        let symbolizer = fake_symbolizer();
        let mut renderer = PerfScriptRenderer::new();
        assert!(renderer
            .finalise(&RenderProps::default(), &symbolizer)
            .unwrap()
            .is_empty());
    }
}
