//! Translation of runtime instruction pointers to source-level frames.
//!
//! Layering: a sorted mapping snapshot locates the containing library, the
//! slide translates the runtime address to a file virtual address, a
//! pluggable backend resolves that address, and a process-wide single-flight
//! cache memoizes the results.

mod cache;
mod external;
mod native;

pub use cache::{CacheKey, SymbolCache};
pub use external::{ExternalSymbolizer, ExternalSymbolizerProps};
pub use native::NativeSymbolizer;

use std::sync::Arc;

use log::warn;

use crate::error::SymbolizeError;
use crate::shared::types::{DynamicLibMapping, SingleFrame, SymbolisedStackFrame};

/// A symbolization backend: resolves a file virtual address within one
/// library to one or more source-level frames. Returning an empty list means
/// "library understood, no symbol there"; the caller synthesizes the
/// `<unknown-unset>` frame.
pub trait SymbolizerBackend: Send + Sync {
    fn start(&self) -> Result<(), SymbolizeError> {
        Ok(())
    }

    fn symbolize(
        &self,
        file_virtual_address: u64,
        mapping: &DynamicLibMapping,
    ) -> Result<Vec<SingleFrame>, SymbolizeError>;

    fn shutdown(&self) {}
}

/// Deterministic test backend.
pub struct FakeSymbolizer;

impl SymbolizerBackend for FakeSymbolizer {
    fn symbolize(
        &self,
        file_virtual_address: u64,
        mapping: &DynamicLibMapping,
    ) -> Result<Vec<SingleFrame>, SymbolizeError> {
        Ok(vec![SingleFrame {
            address: file_virtual_address,
            function_name: "fake".to_string(),
            function_offset: 5,
            library: Some(mapping.basename()),
            vmap: Some(mapping.clone()),
            source_file: None,
            source_line: None,
        }])
    }
}

/// The mapping snapshot of one sampling run, sorted by start address.
#[derive(Debug, Clone, Default)]
pub struct MappingStore {
    mappings: Vec<DynamicLibMapping>,
}

impl MappingStore {
    pub fn new(mut mappings: Vec<DynamicLibMapping>) -> Self {
        mappings.sort_by_key(|m| m.segment_start);
        MappingStore { mappings }
    }

    /// Snapshots the calling process's own memory map.
    pub fn snapshot() -> std::io::Result<Self> {
        Ok(MappingStore::new(crate::platform::snapshot_mappings()?))
    }

    pub fn lookup(&self, ip: u64) -> Option<&DynamicLibMapping> {
        let index = self.mappings.partition_point(|m| m.segment_start <= ip);
        let mapping = self.mappings[..index].last()?;
        if ip < mapping.segment_end {
            Some(mapping)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// The full pipeline for one sampling run: mapping snapshot, backend, and
/// the shared cache.
pub struct Symbolizer {
    mappings: MappingStore,
    backend: Arc<dyn SymbolizerBackend>,
    cache: Arc<SymbolCache>,
}

impl Symbolizer {
    pub fn new(
        mappings: MappingStore,
        backend: Arc<dyn SymbolizerBackend>,
        cache: Arc<SymbolCache>,
    ) -> Self {
        Symbolizer {
            mappings,
            backend,
            cache,
        }
    }

    /// Never fails: addresses outside every mapping and failed backend
    /// queries come back as a synthetic `unknown @ 0x<ip>` frame.
    pub fn symbolize_ip(&self, ip: u64) -> SymbolisedStackFrame {
        let Some(mapping) = self.mappings.lookup(ip) else {
            return SymbolisedStackFrame::single(SingleFrame::unknown(ip));
        };
        let file_virtual_address = ip.wrapping_sub(mapping.segment_slide);
        let key = CacheKey::new(&mapping.path, file_virtual_address);

        let resolved = self.cache.get_or_resolve(key, || {
            let frames = self.backend.symbolize(file_virtual_address, mapping)?;
            if frames.is_empty() {
                Ok(SymbolisedStackFrame::single(SingleFrame::unset(
                    file_virtual_address,
                    mapping,
                )))
            } else {
                Ok(SymbolisedStackFrame { frames })
            }
        });

        match resolved {
            Ok(frames) => frames,
            Err(err) => {
                warn!(
                    "symbolization of {ip:#x} in {} failed: {err}",
                    mapping.path.display()
                );
                SymbolisedStackFrame::single(SingleFrame::unknown(ip))
            }
        }
    }

    pub fn shutdown(&self) {
        self.backend.shutdown();
    }
}
