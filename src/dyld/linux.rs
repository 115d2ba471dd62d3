use crate::module_cache::{Module, ModuleLocator};
use crate::utils::AddressRange;
use byteorder::{ByteOrder, NativeEndian};
use std::ffi::{CStr, OsStr};
use std::fmt::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::slice;

const NT_GNU_BUILD_ID: u32 = 3;
const ELF_NOTE_GNU: &[u8] = b"GNU\0";
const NOTE_HEADER_LEN: usize = 12;

/// Builds [Module]s by walking the objects registered with the dynamic
/// loader (`dl_iterate_phdr`).
#[derive(Debug, Default)]
pub struct DynamicLoaderLocator {
    _private: (),
}

impl ModuleLocator for DynamicLoaderLocator {
    fn create_module_for_address(&mut self, address: usize) -> Option<Module> {
        let object = find_loaded_object(address)?;
        let filename = if object.name.as_os_str().is_empty() {
            // The `dlpi_name` of the current executable is an empty string.
            std::env::current_exe().unwrap_or_default()
        } else {
            object.name
        };
        Some(Module::new(
            object.range.start,
            encode_id(&object.build_id),
            filename,
            object.range.len(),
        ))
    }
}

/// An object loaded by the dynamic loader, spanning from its lowest to its
/// highest `PT_LOAD` segment.
#[derive(Debug)]
struct LoadedObject {
    range: AddressRange,
    name: PathBuf,
    build_id: Vec<u8>,
}

struct Search {
    target: usize,
    found: Option<LoadedObject>,
}

fn find_loaded_object(target: usize) -> Option<LoadedObject> {
    let mut search = Search { target, found: None };
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut search as *mut _ as *mut libc::c_void);
    }
    search.found
}

extern "C" fn callback(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut libc::c_void) -> libc::c_int {
    unsafe {
        let search = &mut *(data as *mut Search);
        let info = &*info;
        if info.dlpi_phnum == 0 || info.dlpi_phdr.is_null() {
            return 0;
        }
        let bias = info.dlpi_addr as usize;
        let hdrs = slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let mut range: Option<AddressRange> = None;
        for hdr in hdrs.iter().filter(|hdr| hdr.p_type == libc::PT_LOAD) {
            let segment = AddressRange::new(bias + hdr.p_vaddr as usize, hdr.p_memsz as usize);
            range = Some(match range {
                Some(r) => AddressRange {
                    start: r.start.min(segment.start),
                    end: r.end.max(segment.end),
                },
                None => segment,
            });
        }
        // Match against the whole span, gaps between segments included, so the
        // answer agrees with `Module::contains` for the module it produces.
        let range = match range {
            Some(r) if r.contains(search.target) => r,
            _ => return 0,
        };
        let name = if info.dlpi_name.is_null() {
            PathBuf::new()
        } else {
            PathBuf::from(OsStr::from_bytes(CStr::from_ptr(info.dlpi_name).to_bytes()))
        };
        let mut build_id = Vec::new();
        for hdr in hdrs.iter().filter(|hdr| hdr.p_type == libc::PT_NOTE) {
            let notes = slice::from_raw_parts((bias + hdr.p_vaddr as usize) as *const u8, hdr.p_memsz as usize);
            if let Some(id) = find_build_id(notes, hdr.p_align as usize) {
                build_id.extend_from_slice(id);
                break;
            }
        }
        search.found = Some(LoadedObject { range, name, build_id });
        // Non-zero stops the iteration.
        1
    }
}

/// Scans an ELF note segment for the `NT_GNU_BUILD_ID` descriptor.
///
/// Each note is `namesz`, `descsz`, `type` (native endian u32) followed by
/// the name and the descriptor, each padded to the segment alignment.
fn find_build_id(mut notes: &[u8], align: usize) -> Option<&[u8]> {
    let align = if align == 8 { 8 } else { 4 };
    while notes.len() >= NOTE_HEADER_LEN {
        let namesz = NativeEndian::read_u32(&notes[0..4]) as usize;
        let descsz = NativeEndian::read_u32(&notes[4..8]) as usize;
        let kind = NativeEndian::read_u32(&notes[8..12]);
        let name_start = NOTE_HEADER_LEN;
        let desc_start = name_start.checked_add(align_up(namesz, align)?)?;
        let desc_end = desc_start.checked_add(descsz)?;
        if desc_end > notes.len() {
            return None;
        }
        if kind == NT_GNU_BUILD_ID && &notes[name_start..name_start + namesz] == ELF_NOTE_GNU {
            return Some(&notes[desc_start..desc_end]);
        }
        let next = align_up(desc_end, align)?;
        notes = notes.get(next..)?;
    }
    None
}

#[inline]
fn align_up(v: usize, align: usize) -> Option<usize> {
    Some(v.checked_add(align - 1)? & !(align - 1))
}

fn encode_id(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02X}", b);
    }
    s
}
