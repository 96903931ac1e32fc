//! The gzip-compressed pprof protobuf renderer.
//!
//! Samples are accumulated into interned tables (strings, functions keyed by
//! name+file, locations keyed by address) and the whole profile is encoded
//! and compressed only at `finalise`. Each pprof sample carries
//! `value = [1, nanoseconds since the previous sample]`.

use std::io::Write as _;

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use rustc_hash::FxHashMap;

use crate::render::pprof_proto as proto;
use crate::render::{render_ips, RenderError, RenderProps, Renderer};
use crate::shared::types::Sample;
use crate::symbolize::Symbolizer;

pub struct PprofRenderer {
    strings: FxHashMap<String, i64>,
    string_table: Vec<String>,
    functions: FxHashMap<(i64, i64), u64>,
    function_table: Vec<proto::Function>,
    locations: FxHashMap<u64, u64>,
    location_table: Vec<proto::Location>,
    samples: Vec<proto::Sample>,
    first_sample_nanos: Option<i64>,
    previous_sample_nanos: Option<i64>,
}

impl Default for PprofRenderer {
    fn default() -> Self {
        let mut renderer = PprofRenderer {
            strings: FxHashMap::default(),
            string_table: Vec::new(),
            functions: FxHashMap::default(),
            function_table: Vec::new(),
            locations: FxHashMap::default(),
            location_table: Vec::new(),
            samples: Vec::new(),
            first_sample_nanos: None,
            previous_sample_nanos: None,
        };
        // String index 0 must be the empty string.
        renderer.intern("");
        renderer
    }
}

impl PprofRenderer {
    pub fn new() -> Self {
        PprofRenderer::default()
    }

    fn intern(&mut self, text: &str) -> i64 {
        if let Some(&index) = self.strings.get(text) {
            return index;
        }
        let index = self.string_table.len() as i64;
        self.string_table.push(text.to_string());
        self.strings.insert(text.to_string(), index);
        index
    }

    fn function_id(&mut self, name: &str, file: Option<&str>) -> u64 {
        let name = self.intern(name);
        let filename = file.map(|f| self.intern(f)).unwrap_or(0);
        if let Some(&id) = self.functions.get(&(name, filename)) {
            return id;
        }
        let id = self.function_table.len() as u64 + 1;
        self.function_table.push(proto::Function {
            id,
            name,
            system_name: name,
            filename,
            start_line: 0,
        });
        self.functions.insert((name, filename), id);
        id
    }

    fn location_id(&mut self, address: u64, symbolizer: &Symbolizer) -> u64 {
        if let Some(&id) = self.locations.get(&address) {
            return id;
        }
        let resolved = symbolizer.symbolize_ip(address);
        let line: Vec<proto::Line> = resolved
            .frames
            .iter()
            .map(|frame| proto::Line {
                function_id: self.function_id(&frame.function_name, frame.source_file.as_deref()),
                line: frame.source_line.unwrap_or(0) as i64,
            })
            .collect();
        let id = self.location_table.len() as u64 + 1;
        self.location_table.push(proto::Location {
            id,
            mapping_id: 0,
            address,
            line,
        });
        self.locations.insert(address, id);
        id
    }
}

impl Renderer for PprofRenderer {
    fn consume_single_sample(
        &mut self,
        sample: &Sample,
        props: &RenderProps,
        symbolizer: &Symbolizer,
    ) -> Result<Vec<u8>, RenderError> {
        let nanos = sample.time_sec * 1_000_000_000 + sample.time_nsec as i64;
        let delta = match self.previous_sample_nanos {
            Some(previous) => nanos.saturating_sub(previous),
            None => 0,
        };
        self.previous_sample_nanos = Some(nanos);
        self.first_sample_nanos.get_or_insert(nanos);

        let location_id: Vec<u64> = render_ips(sample, props)
            .into_iter()
            .map(|ip| self.location_id(ip, symbolizer))
            .collect();
        self.samples.push(proto::Sample {
            location_id,
            value: vec![1, delta],
            label: Vec::new(),
        });
        Ok(Vec::new())
    }

    fn finalise(
        &mut self,
        _props: &RenderProps,
        _symbolizer: &Symbolizer,
    ) -> Result<Vec<u8>, RenderError> {
        let samples_type = proto::ValueType {
            r#type: self.intern("samples"),
            unit: self.intern("count"),
        };
        let time_type = proto::ValueType {
            r#type: self.intern("time"),
            unit: self.intern("nanoseconds"),
        };
        let duration = match (self.first_sample_nanos, self.previous_sample_nanos) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        };
        let profile = proto::Profile {
            sample_type: vec![samples_type, time_type],
            sample: std::mem::take(&mut self.samples),
            mapping: Vec::new(),
            location: std::mem::take(&mut self.location_table),
            function: std::mem::take(&mut self.function_table),
            string_table: std::mem::take(&mut self.string_table),
            time_nanos: self.first_sample_nanos.unwrap_or(0),
            duration_nanos: duration,
            period_type: Some(time_type),
            period: 0,
            default_sample_type: 0,
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&profile.encode_to_vec())
            .and_then(|()| encoder.finish())
            .map_err(|err| RenderError::Encode(err.to_string()))
    }
}
