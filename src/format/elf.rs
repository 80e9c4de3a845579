use crate::exec::{address_alignment, Executable, Relocation, Segment};
use crate::format::FormatError;

pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_X86_64: u16 = 62;

pub const EHDR_SIZE: u16 = 64;
pub const PHDR_SIZE: u16 = 56;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const DT_RELA: i64 = 7;
pub const DT_RELASZ: i64 = 8;
pub const DT_REL: i64 = 17;
pub const DT_RELSZ: i64 = 18;

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_RELATIVE: u32 = 8;

const DYN_ENTRY_SIZE: u64 = 16;
const RELA_ENTRY_SIZE: u64 = 24;
const REL_ENTRY_SIZE: u64 = 16;

/// Bounds-checked view into the raw file, reporting what was being read.
fn bytes_at<'a>(
    data: &'a [u8],
    purpose: &'static str,
    offset: u64,
    size: u64,
) -> Result<&'a [u8], FormatError> {
    let end = offset.checked_add(size);
    match end {
        Some(end) if end <= data.len() as u64 => {
            Ok(&data[offset as usize..end as usize])
        }
        _ => Err(FormatError::Truncated {
            purpose,
            offset,
            size,
            actual: data.len() as u64,
        }),
    }
}

fn u16_at(raw: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([raw[off], raw[off + 1]])
}

fn u32_at(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

fn u64_at(raw: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[off..off + 8]);
    u64::from_le_bytes(bytes)
}

fn i64_at(raw: &[u8], off: usize) -> i64 {
    u64_at(raw, off) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ehdr {
    pub entry: u64,
    pub phoff: u64,
    pub phnum: u16,
}

/// Parses and validates the ELF file header. Anything but a little-endian
/// x86_64 ELF64 executable or shared object is rejected.
pub fn parse_ehdr(elf: &[u8]) -> Result<Ehdr, FormatError> {
    let raw = bytes_at(elf, "ELF header", 0, u64::from(EHDR_SIZE))?;

    if &raw[0..4] != b"\x7fELF" {
        return Err(FormatError::BadMagic);
    }
    if raw[4] != ELFCLASS64 {
        return Err(FormatError::UnsupportedClass(raw[4]));
    }
    if raw[5] != ELFDATA2LSB {
        return Err(FormatError::UnsupportedEndianness(raw[5]));
    }

    let e_type = u16_at(raw, 16);
    if e_type != ET_EXEC && e_type != ET_DYN {
        return Err(FormatError::UnsupportedType(e_type));
    }

    let machine = u16_at(raw, 18);
    if machine != EM_X86_64 {
        return Err(FormatError::UnsupportedMachine(machine));
    }

    let ehsize = u16_at(raw, 52);
    if ehsize != EHDR_SIZE {
        return Err(FormatError::UnsupportedEhdrSize(ehsize));
    }
    let phentsize = u16_at(raw, 54);
    if phentsize != PHDR_SIZE {
        return Err(FormatError::UnsupportedPhdrSize(phentsize));
    }

    Ok(Ehdr {
        entry: u64_at(raw, 24),
        phoff: u64_at(raw, 32),
        phnum: u16_at(raw, 56),
    })
}

#[derive(Debug, Clone, Copy)]
struct Phdr {
    kind: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
    align: u64,
}

fn parse_phdr(raw: &[u8]) -> Phdr {
    Phdr {
        kind: u32_at(raw, 0),
        flags: u32_at(raw, 4),
        offset: u64_at(raw, 8),
        vaddr: u64_at(raw, 16),
        file_size: u64_at(raw, 32),
        mem_size: u64_at(raw, 40),
        align: u64_at(raw, 48),
    }
}

/// Copies one loadable region out of the file, zero-extended from its
/// in-file size to its in-memory size.
fn load_segment(elf: &[u8], phdr: &Phdr, verbosity: u8) -> Result<Segment, FormatError> {
    if phdr.mem_size < phdr.file_size {
        return Err(FormatError::SegmentSizeMismatch {
            offset: phdr.offset,
            mem_size: phdr.mem_size,
            file_size: phdr.file_size,
        });
    }
    // p_align of 0 or 1 both mean "no alignment constraint".
    let align = phdr.align.max(1);
    if !align.is_power_of_two() {
        return Err(FormatError::BadAlignment(phdr.align));
    }

    if verbosity >= 2 {
        eprintln!(
            "loading segment at offset {:#x}, size {}, vaddr = {:#x}",
            phdr.offset, phdr.file_size, phdr.vaddr
        );
    }

    let file_bytes = bytes_at(elf, "segment data", phdr.offset, phdr.file_size)?;
    let mut data = vec![0u8; phdr.mem_size as usize];
    data[..file_bytes.len()].copy_from_slice(file_bytes);

    Ok(Segment {
        vaddr: phdr.vaddr,
        mem_size: phdr.mem_size,
        file_size: phdr.file_size,
        align,
        readable: phdr.flags & PF_R != 0,
        writable: phdr.flags & PF_W != 0,
        executable: phdr.flags & PF_X != 0,
        data,
    })
}

/// Walks the program headers once, producing the loadable segments and the
/// mandatory dynamic region. Non-loadable, non-dynamic entries are ignored.
fn load_segments(
    elf: &[u8],
    ehdr: &Ehdr,
    verbosity: u8,
) -> Result<(Vec<Segment>, Segment), FormatError> {
    let table_size = u64::from(ehdr.phnum) * u64::from(PHDR_SIZE);
    let table = bytes_at(elf, "program headers", ehdr.phoff, table_size)?;

    let mut segments = Vec::new();
    let mut dynamic = None;

    for (index, raw) in table.chunks_exact(usize::from(PHDR_SIZE)).enumerate() {
        let phdr = parse_phdr(raw);
        match phdr.kind {
            PT_DYNAMIC => {
                if verbosity >= 1 {
                    eprintln!("found PT_DYNAMIC segment at index {index}");
                }
                dynamic = Some(load_segment(elf, &phdr, verbosity)?);
            }
            PT_LOAD => {
                if verbosity >= 1 {
                    eprintln!("found PT_LOAD segment at index {index}");
                }
                segments.push(load_segment(elf, &phdr, verbosity)?);
            }
            kind => {
                if verbosity >= 2 {
                    eprintln!(
                        "ignoring segment {index}, type = {kind:#x}, \
                         file offset {:#x}",
                        phdr.offset
                    );
                }
            }
        }
    }

    let dynamic = dynamic.ok_or(FormatError::MissingDynamic)?;
    if segments.is_empty() {
        return Err(FormatError::MissingLoadable);
    }

    if verbosity >= 1 {
        eprintln!(
            "{} program headers in total, loaded {}",
            ehdr.phnum,
            segments.len() + 1
        );
    }

    Ok((segments, dynamic))
}

fn lookup_dynamic_tag(dynamic: &Segment, tag: i64) -> Option<u64> {
    let used = dynamic.file_size as usize;
    for entry in dynamic.data[..used].chunks_exact(DYN_ENTRY_SIZE as usize) {
        if i64_at(entry, 0) == tag {
            return Some(u64_at(entry, 8));
        }
    }
    None
}

/// Resolves one (table, byte-size) tag pair. Either both tags are present,
/// neither is, or the input is rejected.
fn lookup_table(
    dynamic: &Segment,
    table_tag: i64,
    table_name: &'static str,
    size_tag: i64,
    size_name: &'static str,
) -> Result<Option<(u64, u64)>, FormatError> {
    let table = lookup_dynamic_tag(dynamic, table_tag);
    let size = lookup_dynamic_tag(dynamic, size_tag);
    match (table, size) {
        (Some(table), Some(size)) => Ok(Some((table, size))),
        (Some(_), None) => Err(FormatError::MissingSizeTag {
            table_tag: table_name,
            size_tag: size_name,
        }),
        (None, Some(_)) => Err(FormatError::MissingTableTag {
            table_tag: table_name,
            size_tag: size_name,
        }),
        (None, None) => Ok(None),
    }
}

fn check_relocation_kind(
    table: &'static str,
    kind: u32,
    index: usize,
) -> Result<bool, FormatError> {
    match kind {
        R_X86_64_NONE => Ok(false),
        R_X86_64_RELATIVE => Ok(true),
        kind => Err(FormatError::UnsupportedRelocation { table, kind, index }),
    }
}

/// Decodes a RELA table: addends are carried inline in each entry.
fn load_rela_relocations(
    elf: &[u8],
    offset: u64,
    size: u64,
    verbosity: u8,
) -> Result<Vec<Relocation>, FormatError> {
    let count = size / RELA_ENTRY_SIZE;
    let table = bytes_at(elf, "RELA relocations", offset, count * RELA_ENTRY_SIZE)?;

    let mut relocations = Vec::new();
    for (index, raw) in table.chunks_exact(RELA_ENTRY_SIZE as usize).enumerate() {
        let kind = u64_at(raw, 8) as u32;
        if !check_relocation_kind("RELA", kind, index)? {
            continue;
        }
        let reloc = Relocation {
            vaddr: u64_at(raw, 0),
            value: u64_at(raw, 16),
        };
        if verbosity >= 2 {
            eprintln!(
                "found relative relocation against {:#x}, addend {:#x}",
                reloc.vaddr, reloc.value
            );
        }
        relocations.push(reloc);
    }
    Ok(relocations)
}

/// Decodes a REL table: each addend is read from the owning segment's
/// current in-memory bytes at the target address.
fn load_rel_relocations(
    exec: &Executable,
    elf: &[u8],
    offset: u64,
    size: u64,
    verbosity: u8,
) -> Result<Vec<Relocation>, FormatError> {
    let count = size / REL_ENTRY_SIZE;
    let table = bytes_at(elf, "REL relocations", offset, count * REL_ENTRY_SIZE)?;

    let mut relocations = Vec::new();
    for (index, raw) in table.chunks_exact(REL_ENTRY_SIZE as usize).enumerate() {
        let kind = u64_at(raw, 8) as u32;
        if !check_relocation_kind("REL", kind, index)? {
            continue;
        }
        let vaddr = u64_at(raw, 0);
        let reloc = Relocation {
            vaddr,
            value: exec.read_u64_at("addend for DT_REL", vaddr)?,
        };
        if verbosity >= 2 {
            eprintln!(
                "found relative relocation against {:#x}, addend {:#x}",
                reloc.vaddr, reloc.value
            );
        }
        relocations.push(reloc);
    }
    Ok(relocations)
}

/// Extracts load-address-relative relocations from both dynamic tables.
/// Missing tables are fine; any other relocation kind is not.
fn load_relocations(
    exec: &Executable,
    elf: &[u8],
    dynamic: &Segment,
    verbosity: u8,
) -> Result<Vec<Relocation>, FormatError> {
    let mut relocations = Vec::new();

    match lookup_table(dynamic, DT_RELA, "DT_RELA", DT_RELASZ, "DT_RELASZ")? {
        Some((offset, size)) => {
            if verbosity >= 1 {
                eprintln!(
                    "RELA relocations are at {offset:#x}, {} entries",
                    size / RELA_ENTRY_SIZE
                );
            }
            relocations.extend(load_rela_relocations(elf, offset, size, verbosity)?);
        }
        None => {
            if verbosity >= 1 {
                eprintln!("no RELA relocations found");
            }
        }
    }

    match lookup_table(dynamic, DT_REL, "DT_REL", DT_RELSZ, "DT_RELSZ")? {
        Some((offset, size)) => {
            if verbosity >= 1 {
                eprintln!(
                    "REL relocations are at {offset:#x}, {} entries",
                    size / REL_ENTRY_SIZE
                );
            }
            relocations.extend(load_rel_relocations(exec, elf, offset, size, verbosity)?);
        }
        None => {
            if verbosity >= 1 {
                eprintln!("no REL relocations found");
            }
        }
    }

    relocations.sort_by_key(|reloc| reloc.vaddr);
    Ok(relocations)
}

/// Parses a whole position-independent ELF image into segments and
/// relocations, everything still expressed against the source addresses.
pub fn parse_executable(elf: &[u8], verbosity: u8) -> Result<Executable, FormatError> {
    let ehdr = parse_ehdr(elf)?;
    if verbosity >= 1 {
        eprintln!("ELF entry point {:#x}", ehdr.entry);
    }

    let (mut segments, dynamic) = load_segments(elf, &ehdr, verbosity)?;
    segments.sort_by_key(|segment| segment.vaddr);
    for pair in segments.windows(2) {
        if pair[0].vaddr.saturating_add(pair[0].mem_size) > pair[1].vaddr {
            return Err(FormatError::OverlappingSegments {
                first: pair[0].vaddr,
                second: pair[1].vaddr,
            });
        }
    }

    let mut exec = Executable {
        entry: ehdr.entry,
        address_alignment: address_alignment(&segments),
        segments,
        relocations: Vec::new(),
    };

    exec.relocations = load_relocations(&exec, elf, &dynamic, verbosity)?;
    if verbosity >= 1 {
        eprintln!("{} necessary relocations to process", exec.relocations.len());
    }

    Ok(exec)
}
