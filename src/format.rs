use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid ELF magic")]
    BadMagic,
    #[error("only 64-bit ELF files are supported, got {0:#04x} in EI_CLASS")]
    UnsupportedClass(u8),
    #[error("only little-endian ELF files are supported, got {0:#04x} in EI_DATA")]
    UnsupportedEndianness(u8),
    #[error("require an executable or shared object file, got e_type {0:#06x}")]
    UnsupportedType(u16),
    #[error("unsupported machine type {0:#06x}")]
    UnsupportedMachine(u16),
    #[error("unsupported ELF header size {0}")]
    UnsupportedEhdrSize(u16),
    #[error("unsupported program header size {0}")]
    UnsupportedPhdrSize(u16),
    #[error(
        "attempt to read {purpose} at offset {offset:#x} with size {size:#x}, \
         but the file is truncated to {actual:#x} bytes"
    )]
    Truncated {
        purpose: &'static str,
        offset: u64,
        size: u64,
        actual: u64,
    },
    #[error(
        "invalid in-memory size {mem_size:#x} for segment at offset {offset:#x}, \
         which is smaller than in-file size {file_size:#x}"
    )]
    SegmentSizeMismatch {
        offset: u64,
        mem_size: u64,
        file_size: u64,
    },
    #[error("segment alignment {0:#x} is not a power of two")]
    BadAlignment(u64),
    #[error("no PT_DYNAMIC segment found")]
    MissingDynamic,
    #[error("no PT_LOAD segment found")]
    MissingLoadable,
    #[error("segments at {first:#x} and {second:#x} overlap")]
    OverlappingSegments { first: u64, second: u64 },
    #[error("missing {size_tag} entry paired with {table_tag}")]
    MissingSizeTag {
        table_tag: &'static str,
        size_tag: &'static str,
    },
    #[error("{size_tag} entry is present without a paired {table_tag}")]
    MissingTableTag {
        table_tag: &'static str,
        size_tag: &'static str,
    },
    #[error("unsupported {table} relocation type {kind} at index {index}")]
    UnsupportedRelocation {
        table: &'static str,
        kind: u32,
        index: usize,
    },
    #[error(
        "virtual address {vaddr:#x} with size {size} used as {purpose} \
         is not fully covered by any segment"
    )]
    UnmappedAddress {
        purpose: &'static str,
        vaddr: u64,
        size: u64,
    },
}

pub mod elf;
