//! `/proc/self/maps` parsing.

use std::path::PathBuf;

use crate::shared::types::DynamicLibMapping;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub is_read: bool,
    pub is_write: bool,
    pub is_executable: bool,
    pub is_shared: bool,
    pub file_offset: u64,
    pub name: String,
}

fn get_until<'a>(p: &mut &'a str, delimiter: char) -> &'a str {
    match p.find(delimiter) {
        Some(index) => {
            let (before, after) = p.split_at(index);
            *p = &after[delimiter.len_utf8()..];
            before
        }
        None => {
            let before = *p;
            *p = "";
            before
        }
    }
}

fn get_char(p: &mut &str) -> Option<char> {
    let ch = p.chars().next()?;
    *p = &p[ch.len_utf8()..];
    Some(ch)
}

fn skip_spaces(p: &mut &str) {
    *p = p.trim_start_matches(' ');
}

fn parse_line(mut line: &str) -> Option<Region> {
    let start = u64::from_str_radix(get_until(&mut line, '-'), 16).ok()?;
    let end = u64::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let is_read = get_char(&mut line)? == 'r';
    let is_write = get_char(&mut line)? == 'w';
    let is_executable = get_char(&mut line)? == 'x';
    let is_shared = get_char(&mut line)? == 's';
    get_char(&mut line)?;

    let file_offset = u64::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let _device = get_until(&mut line, ' ');
    let _inode = get_until(&mut line, ' ');
    skip_spaces(&mut line);

    Some(Region {
        start,
        end,
        is_read,
        is_write,
        is_executable,
        is_shared,
        file_offset,
        name: line.to_owned(),
    })
}

pub fn parse(maps: &str) -> Vec<Region> {
    maps.trim()
        .split('\n')
        .filter(|line| !line.is_empty())
        .filter_map(parse_line)
        .collect()
}

/// The executable file-backed regions of a maps dump, as mappings ready for
/// symbolization. Pseudo-entries such as `[vdso]` and anonymous executable
/// regions carry no file to symbolize against and are dropped.
pub fn executable_mappings(maps: &str) -> Vec<DynamicLibMapping> {
    let mut mappings: Vec<DynamicLibMapping> = parse(maps)
        .into_iter()
        .filter(|region| region.is_executable && region.name.starts_with('/'))
        .map(|region| DynamicLibMapping {
            path: PathBuf::from(region.name.trim_end_matches(" (deleted)")),
            arch: std::env::consts::ARCH,
            segment_slide: region.start.wrapping_sub(region.file_offset),
            segment_start: region.start,
            segment_end: region.end,
        })
        .collect();
    mappings.sort_by_key(|m| m.segment_start);
    mappings
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0a0400000-55d0a040c000 r-xp 00002000 08:02 1321238  /usr/bin/cat
55d0a060d000-55d0a062e000 rw-p 00000000 00:00 0        [heap]
7f2b44c00000-7f2b44d80000 r-xp 00024000 08:02 1335289  /usr/lib/libfoo-1.2.so (deleted)
7f2b45000000-7f2b45001000 r-xp 00000000 00:00 0        [vdso]
7f2b45600000-7f2b45800000 rw-p 00000000 00:00 0
";

    #[test]
    fn parses_permissions_and_offsets() {
        let regions = parse(MAPS);
        assert_eq!(regions.len(), 5);
        assert_eq!(regions[0].start, 0x55d0a0400000);
        assert_eq!(regions[0].end, 0x55d0a040c000);
        assert!(regions[0].is_executable);
        assert!(!regions[0].is_write);
        assert_eq!(regions[0].file_offset, 0x2000);
        assert_eq!(regions[0].name, "/usr/bin/cat");
        assert_eq!(regions[1].name, "[heap]");
        assert_eq!(regions[4].name, "");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let regions = parse("not a mapping line\n55-56 r-xp 00000000 00:00 0  /x\n");
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].name, "/x");
    }

    #[test]
    fn executable_mappings_keep_only_file_backed_code() {
        let mappings = executable_mappings(MAPS);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].path, PathBuf::from("/usr/bin/cat"));
        assert_eq!(
            mappings[0].segment_slide,
            0x55d0a0400000 - 0x2000
        );
        // The deleted suffix is stripped so the backend sees the real path.
        assert_eq!(mappings[1].path, PathBuf::from("/usr/lib/libfoo-1.2.so"));
        assert_eq!(mappings[1].segment_start, 0x7f2b44c00000);
        assert_eq!(mappings[1].segment_end, 0x7f2b44d80000);
    }

    #[test]
    fn own_maps_parse_and_contain_an_executable_mapping() {
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        let mappings = executable_mappings(&maps);
        assert!(!mappings.is_empty());
        for window in mappings.windows(2) {
            assert!(window[0].segment_start <= window[1].segment_start);
        }
    }
}
