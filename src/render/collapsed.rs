//! Folded stacks for FlameGraph tooling: one line per sample, frame names
//! joined outermost to innermost with `;`, then a space and the sample time
//! as one integer (`sec * 1e9 + nsec`, written as the concatenation of the
//! seconds and the 9-digit zero-padded nanoseconds).

use crate::render::{concat_timestamp, render_ips, RenderError, RenderProps, Renderer};
use crate::shared::types::Sample;
use crate::symbolize::Symbolizer;

#[derive(Default)]
pub struct CollapsedRenderer;

impl CollapsedRenderer {
    pub fn new() -> Self {
        CollapsedRenderer
    }
}

impl Renderer for CollapsedRenderer {
    fn consume_single_sample(
        &mut self,
        sample: &Sample,
        props: &RenderProps,
        symbolizer: &Symbolizer,
    ) -> Result<Vec<u8>, RenderError> {
        // Symbolize innermost-first, emit outermost-first.
        let mut names = Vec::new();
        for ip in render_ips(sample, props) {
            let resolved = symbolizer.symbolize_ip(ip);
            for frame in &resolved.frames {
                names.push(frame.function_name.clone());
            }
        }
        names.reverse();

        let line = format!(
            "{} {}\n",
            names.join(";"),
            concat_timestamp(sample.time_sec, sample.time_nsec)
        );
        Ok(line.into_bytes())
    }

    fn finalise(
        &mut self,
        _props: &RenderProps,
        _symbolizer: &Symbolizer,
    ) -> Result<Vec<u8>, RenderError> {
        Ok(Vec::new())
    }
}
