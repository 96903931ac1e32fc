//! In-process symbolication against the mapped object files themselves.
//!
//! Each library is opened and parsed once: the symbol table (regular plus
//! dynamic) for name+offset lookup, and the DWARF sections for inline frames
//! and file/line info when present. Parsed libraries are kept for the life
//! of the backend; the underlying file mapping is only held during parsing
//! because the DWARF reader copies the sections it needs.

use std::borrow::Cow;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use gimli::{EndianArcSlice, RunTimeEndian};
use log::{debug, warn};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::SymbolizeError;
use crate::shared::types::{DynamicLibMapping, SingleFrame};
use crate::symbolize::SymbolizerBackend;

type DebugContext = addr2line::Context<EndianArcSlice<RunTimeEndian>>;

struct SymbolEntry {
    address: u64,
    name: String,
}

struct LibraryData {
    /// Sorted by address.
    symbols: Vec<SymbolEntry>,
    debug: Option<DebugContext>,
}

#[derive(Default)]
pub struct NativeSymbolizer {
    /// `None` records a library that could not be read or parsed, so it is
    /// not retried for every address.
    libraries: Mutex<FxHashMap<std::path::PathBuf, Option<LibraryData>>>,
}

impl NativeSymbolizer {
    pub fn new() -> Self {
        NativeSymbolizer::default()
    }
}

impl SymbolizerBackend for NativeSymbolizer {
    fn symbolize(
        &self,
        file_virtual_address: u64,
        mapping: &DynamicLibMapping,
    ) -> Result<Vec<SingleFrame>, SymbolizeError> {
        let mut libraries = self.libraries.lock();
        let library = libraries
            .entry(mapping.path.clone())
            .or_insert_with(|| match load_library(&mapping.path) {
                Ok(library) => Some(library),
                Err(err) => {
                    warn!("cannot symbolize against {}: {err}", mapping.path.display());
                    None
                }
            });
        let Some(library) = library else {
            return Ok(Vec::new());
        };

        let mut frames = Vec::new();
        if let Some(context) = &library.debug {
            if let Ok(mut frame_iter) = context.find_frames(file_virtual_address).skip_all_loads()
            {
                while let Ok(Some(frame)) = frame_iter.next() {
                    let Some(function) = frame.function.as_ref() else {
                        continue;
                    };
                    let Ok(raw_name) = function.raw_name() else {
                        continue;
                    };
                    let (source_file, source_line) = match &frame.location {
                        Some(location) => (
                            location.file.map(|f| f.to_string()),
                            location.line,
                        ),
                        None => (None, None),
                    };
                    frames.push(SingleFrame {
                        address: file_virtual_address,
                        function_name: demangle_any(&raw_name),
                        function_offset: 0,
                        library: Some(mapping.basename()),
                        vmap: Some(mapping.clone()),
                        source_file,
                        source_line,
                    });
                }
            }
        }

        let symbol = enclosing_symbol(&library.symbols, file_virtual_address);
        match (frames.is_empty(), symbol) {
            (true, Some(symbol)) => {
                frames.push(SingleFrame {
                    address: file_virtual_address,
                    function_name: demangle_any(&symbol.name),
                    function_offset: file_virtual_address - symbol.address,
                    library: Some(mapping.basename()),
                    vmap: Some(mapping.clone()),
                    source_file: None,
                    source_line: None,
                });
            }
            (false, Some(symbol)) => {
                // The physical frame is the last entry; give it the symbol
                // table offset.
                if let Some(physical) = frames.last_mut() {
                    physical.function_offset = file_virtual_address - symbol.address;
                }
            }
            _ => {}
        }
        Ok(frames)
    }
}

fn enclosing_symbol(symbols: &[SymbolEntry], address: u64) -> Option<&SymbolEntry> {
    let index = symbols.partition_point(|s| s.address <= address);
    symbols[..index].last()
}

fn io_error(path: &Path, source: std::io::Error) -> SymbolizeError {
    SymbolizeError::LibraryIo {
        path: path.display().to_string(),
        source: Arc::new(source),
    }
}

fn load_library(path: &Path) -> Result<LibraryData, SymbolizeError> {
    let file = File::open(path).map_err(|err| io_error(path, err))?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|err| io_error(path, err))?;
    let object = object::File::parse(&*mmap)
        .map_err(|err| SymbolizeError::BackendParse(format!("{}: {err}", path.display())))?;

    let mut symbols: Vec<SymbolEntry> = object
        .symbols()
        .chain(object.dynamic_symbols())
        .filter_map(|symbol| {
            if symbol.address() == 0 {
                return None;
            }
            if symbol.kind() != SymbolKind::Text && symbol.size() == 0 {
                return None;
            }
            let name = symbol.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(SymbolEntry {
                address: symbol.address(),
                name: name.to_string(),
            })
        })
        .collect();
    symbols.sort_by(|a, b| a.address.cmp(&b.address).then(a.name.cmp(&b.name)));
    symbols.dedup_by(|a, b| a.address == b.address);

    let debug = match load_debug_context(&object) {
        Ok(debug) => debug,
        Err(err) => {
            debug!("no usable debug info in {}: {err}", path.display());
            None
        }
    };

    Ok(LibraryData { symbols, debug })
}

fn load_debug_context(object: &object::File) -> Result<Option<DebugContext>, gimli::Error> {
    if object.section_by_name(".debug_info").is_none() {
        return Ok(None);
    }
    let endian = if object.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let load_section = |id: gimli::SectionId| -> Result<EndianArcSlice<RunTimeEndian>, gimli::Error> {
        let data = object
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok(EndianArcSlice::new(Arc::from(data.as_ref()), endian))
    };
    let dwarf = gimli::Dwarf::load(load_section)?;
    Ok(Some(addr2line::Context::from_dwarf(dwarf)?))
}

/// Best-effort demangling: Rust first, then Itanium C++, otherwise the raw
/// name unchanged.
pub fn demangle_any(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{demangled:#}");
    }

    if name.starts_with("_Z") || name.starts_with("__Z") {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle_with_options(&options) {
                return demangled;
            }
        }
    }

    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangles_rust_and_cpp() {
        assert_eq!(
            demangle_any("_ZN3std6thread5sleep17h8a7b3c9d0e1f2a3bE"),
            "std::thread::sleep"
        );
        assert_eq!(
            demangle_any("_ZNK8KxVectorI16KxfArcFileRecordjEixEj"),
            "KxVector<KxfArcFileRecord, unsigned int>::operator[](unsigned int) const"
        );
        assert_eq!(demangle_any("plain_c_symbol"), "plain_c_symbol");
    }

    #[test]
    fn enclosing_symbol_picks_the_nearest_preceding_entry() {
        let symbols = vec![
            SymbolEntry {
                address: 0x100,
                name: "a".into(),
            },
            SymbolEntry {
                address: 0x200,
                name: "b".into(),
            },
        ];
        assert_eq!(enclosing_symbol(&symbols, 0x150).unwrap().name, "a");
        assert_eq!(enclosing_symbol(&symbols, 0x200).unwrap().name, "b");
        assert!(enclosing_symbol(&symbols, 0x50).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn symbolizes_an_address_in_our_own_executable() {
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        let mappings = crate::linux::proc_maps::executable_mappings(&maps);
        let probe = symbolizes_an_address_in_our_own_executable as usize as u64;
        let mapping = mappings
            .iter()
            .find(|m| m.contains(probe))
            .expect("test function not covered by an executable mapping");

        let backend = NativeSymbolizer::new();
        let frames = backend
            .symbolize(probe.wrapping_sub(mapping.segment_slide), mapping)
            .unwrap();
        assert!(!frames.is_empty());
        let innermost = &frames[0];
        assert!(
            innermost
                .function_name
                .contains("symbolizes_an_address_in_our_own_executable"),
            "unexpected symbol: {}",
            innermost.function_name
        );
    }
}
