//! Output renderers. Each renderer consumes raw samples one at a time and
//! produces bytes for the sink; `finalise` flushes whatever the format
//! accumulates (everything, in the pprof case). Renderers are driven
//! single-threaded by the post-pass and are not thread-safe.

pub mod collapsed;
pub mod perf_script;
pub mod pprof;
mod pprof_proto;

pub use collapsed::CollapsedRenderer;
pub use perf_script::PerfScriptRenderer;
pub use pprof::PprofRenderer;

use thiserror::Error;

use crate::shared::types::Sample;
use crate::symbolize::Symbolizer;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("could not encode the profile: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    PerfScript,
    Collapsed,
    Pprof,
}

impl OutputFormat {
    pub fn parse(text: &str) -> Option<OutputFormat> {
        match text {
            "perf" | "perf-script" | "perfScript" => Some(OutputFormat::PerfScript),
            "collapsed" | "folded" | "flamegraph" => Some(OutputFormat::Collapsed),
            "pprof" => Some(OutputFormat::Pprof),
            _ => None,
        }
    }

    pub fn create_renderer(&self) -> Box<dyn Renderer> {
        match self {
            OutputFormat::PerfScript => Box::new(PerfScriptRenderer::new()),
            OutputFormat::Collapsed => Box::new(CollapsedRenderer::new()),
            OutputFormat::Pprof => Box::new(PprofRenderer::new()),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::PerfScript | OutputFormat::Collapsed => "text/plain; charset=utf-8",
            OutputFormat::Pprof => "application/octet-stream",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderProps {
    /// Move non-innermost instruction pointers from the return address back
    /// into the call instruction before symbolizing. The raw samples always
    /// keep the verbatim return addresses.
    pub fixup_return_addresses: bool,
}

impl Default for RenderProps {
    fn default() -> Self {
        RenderProps {
            fixup_return_addresses: true,
        }
    }
}

pub trait Renderer {
    fn consume_single_sample(
        &mut self,
        sample: &Sample,
        props: &RenderProps,
        symbolizer: &Symbolizer,
    ) -> Result<Vec<u8>, RenderError>;

    fn finalise(
        &mut self,
        props: &RenderProps,
        symbolizer: &Symbolizer,
    ) -> Result<Vec<u8>, RenderError>;
}

/// How far a return address sits past its call instruction.
fn return_address_delta() -> u64 {
    if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
        4
    } else {
        1
    }
}

/// The instruction pointers of a sample, innermost first, with end-of-unwind
/// sentinels dropped and the return-address fixup applied to every frame but
/// the innermost.
pub(crate) fn render_ips(sample: &Sample, props: &RenderProps) -> Vec<u64> {
    sample
        .frames
        .iter()
        .filter(|frame| !frame.is_end_of_unwind())
        .enumerate()
        .map(|(index, frame)| {
            if index == 0 || !props.fixup_return_addresses {
                frame.instruction_pointer
            } else {
                frame
                    .instruction_pointer
                    .saturating_sub(return_address_delta())
            }
        })
        .collect()
}

/// The time stamp rendering shared by the text formats: seconds and
/// nanoseconds concatenated with the nanoseconds zero-padded to 9 digits,
/// except that a zero second count yields the bare nanoseconds.
pub(crate) fn concat_timestamp(time_sec: i64, time_nsec: u32) -> String {
    if time_sec == 0 {
        format!("{time_nsec}")
    } else {
        format!("{time_sec}{time_nsec:09}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::types::StackFrame;

    #[test]
    fn fixup_skips_the_innermost_frame() {
        let sample = Sample {
            pid: 1,
            tid: 2,
            thread_name: "t".into(),
            time_sec: 0,
            time_nsec: 0,
            truncated: false,
            frames: vec![
                StackFrame::new(0x1000, 0x10),
                StackFrame::new(0x2000, 0x20),
                StackFrame::new(0x3000, StackFrame::END_OF_UNWIND),
            ],
        };
        let ips = render_ips(&sample, &RenderProps::default());
        assert_eq!(ips[0], 0x1000);
        assert_eq!(ips[1], 0x2000 - return_address_delta());
        assert_eq!(ips.len(), 2);

        let raw = render_ips(
            &sample,
            &RenderProps {
                fixup_return_addresses: false,
            },
        );
        assert_eq!(raw, vec![0x1000, 0x2000]);
    }

    #[test]
    fn timestamp_concatenation() {
        assert_eq!(concat_timestamp(4, 5), "4000000005");
        assert_eq!(concat_timestamp(0, 5), "5");
        assert_eq!(concat_timestamp(4, 987_654_321), "4987654321");
    }
}
