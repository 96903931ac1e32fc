//! Executable mappings from the dyld image list.
//!
//! Each loaded image's `__TEXT` segment gives the runtime code range; the
//! reported vmaddr slide is exactly the constant that translates file
//! virtual addresses to runtime addresses.

#![allow(non_camel_case_types)]

use std::ffi::CStr;
use std::path::PathBuf;

use crate::shared::types::DynamicLibMapping;

const LC_SEGMENT_64: u32 = 0x19;

#[repr(C)]
struct mach_header_64 {
    magic: u32,
    cputype: i32,
    cpusubtype: i32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    flags: u32,
    reserved: u32,
}

#[repr(C)]
struct load_command {
    cmd: u32,
    cmdsize: u32,
}

#[repr(C)]
struct segment_command_64 {
    cmd: u32,
    cmdsize: u32,
    segname: [u8; 16],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: i32,
    initprot: i32,
    nsects: u32,
    flags: u32,
}

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(image_index: u32) -> *const mach_header_64;
    fn _dyld_get_image_vmaddr_slide(image_index: u32) -> libc::intptr_t;
    fn _dyld_get_image_name(image_index: u32) -> *const libc::c_char;
}

/// The `__TEXT` segment of one in-memory image, read from its load commands.
///
/// Safety: `header` must point at a mach header currently mapped by dyld.
unsafe fn text_segment(header: *const mach_header_64) -> Option<(u64, u64)> {
    let ncmds = (*header).ncmds;
    let mut cmd_ptr = (header as *const u8).add(std::mem::size_of::<mach_header_64>());
    for _ in 0..ncmds {
        let cmd = &*(cmd_ptr as *const load_command);
        if cmd.cmd == LC_SEGMENT_64 {
            let segment = &*(cmd_ptr as *const segment_command_64);
            if &segment.segname[..7] == b"__TEXT\0" {
                return Some((segment.vmaddr, segment.vmsize));
            }
        }
        if cmd.cmdsize == 0 {
            return None;
        }
        cmd_ptr = cmd_ptr.add(cmd.cmdsize as usize);
    }
    None
}

pub fn executable_mappings() -> Vec<DynamicLibMapping> {
    let count = unsafe { _dyld_image_count() };
    let mut mappings = Vec::with_capacity(count as usize);
    for index in 0..count {
        let header = unsafe { _dyld_get_image_header(index) };
        let name = unsafe { _dyld_get_image_name(index) };
        if header.is_null() || name.is_null() {
            continue;
        }
        let slide = unsafe { _dyld_get_image_vmaddr_slide(index) } as u64;
        let Some((vmaddr, vmsize)) = (unsafe { text_segment(header) }) else {
            continue;
        };
        let path = PathBuf::from(
            unsafe { CStr::from_ptr(name) }
                .to_string_lossy()
                .to_string(),
        );
        let start = vmaddr.wrapping_add(slide);
        mappings.push(DynamicLibMapping {
            path,
            arch: std::env::consts::ARCH,
            segment_slide: slide,
            segment_start: start,
            segment_end: start.wrapping_add(vmsize),
        });
    }
    mappings.sort_by_key(|m| m.segment_start);
    mappings
}
