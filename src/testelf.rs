//! Synthetic ELF images for unit tests.

use crate::format::elf::{
    DT_REL, DT_RELA, DT_RELASZ, DT_RELSZ, EM_X86_64, ET_DYN, PF_R, PF_X, PT_DYNAMIC, PT_LOAD,
};

struct SegmentSpec {
    vaddr: u64,
    align: u64,
    data: Vec<u8>,
    mem_size: u64,
}

pub struct TestElf {
    entry: u64,
    segments: Vec<SegmentSpec>,
    dynamic: Option<Vec<(i64, u64)>>,
    rela: Vec<(u64, u32, u64)>,
    rel: Vec<(u64, u32)>,
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_phdr(
    out: &mut Vec<u8>,
    kind: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
    align: u64,
) {
    push_u32(out, kind);
    push_u32(out, flags);
    push_u64(out, offset);
    push_u64(out, vaddr);
    push_u64(out, vaddr); // paddr
    push_u64(out, file_size);
    push_u64(out, mem_size);
    push_u64(out, align);
}

impl TestElf {
    pub fn new() -> Self {
        Self {
            entry: 0x1000,
            segments: Vec::new(),
            dynamic: None,
            rela: Vec::new(),
            rel: Vec::new(),
        }
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    pub fn segment(mut self, vaddr: u64, align: u64, data: &[u8], mem_size: u64) -> Self {
        self.segments.push(SegmentSpec {
            vaddr,
            align,
            data: data.to_vec(),
            mem_size,
        });
        self
    }

    pub fn dynamic(mut self, tags: &[(i64, u64)]) -> Self {
        self.dynamic = Some(tags.to_vec());
        self
    }

    pub fn rela(mut self, entries: &[(u64, u32, u64)]) -> Self {
        self.rela.extend_from_slice(entries);
        self
    }

    pub fn rel(mut self, entries: &[(u64, u32)]) -> Self {
        self.rel.extend_from_slice(entries);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let dynamic_present =
            self.dynamic.is_some() || !self.rela.is_empty() || !self.rel.is_empty();
        let phnum = self.segments.len() + usize::from(dynamic_present);

        let mut cursor = 64 + phnum as u64 * 56;
        let mut segment_offsets = Vec::new();
        for spec in &self.segments {
            segment_offsets.push(cursor);
            cursor += spec.data.len() as u64;
        }
        let rela_offset = cursor;
        cursor += self.rela.len() as u64 * 24;
        let rel_offset = cursor;
        cursor += self.rel.len() as u64 * 16;
        let dynamic_offset = cursor;

        let mut dynamic_blob = Vec::new();
        if !self.rela.is_empty() {
            push_u64(&mut dynamic_blob, DT_RELA as u64);
            push_u64(&mut dynamic_blob, rela_offset);
            push_u64(&mut dynamic_blob, DT_RELASZ as u64);
            push_u64(&mut dynamic_blob, self.rela.len() as u64 * 24);
        }
        if !self.rel.is_empty() {
            push_u64(&mut dynamic_blob, DT_REL as u64);
            push_u64(&mut dynamic_blob, rel_offset);
            push_u64(&mut dynamic_blob, DT_RELSZ as u64);
            push_u64(&mut dynamic_blob, self.rel.len() as u64 * 16);
        }
        for (tag, value) in self.dynamic.iter().flatten() {
            push_u64(&mut dynamic_blob, *tag as u64);
            push_u64(&mut dynamic_blob, *value);
        }
        push_u64(&mut dynamic_blob, 0); // DT_NULL
        push_u64(&mut dynamic_blob, 0);

        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        out.push(2); // ELFCLASS64
        out.push(1); // ELFDATA2LSB
        out.push(1); // EV_CURRENT
        out.resize(16, 0);
        push_u16(&mut out, ET_DYN);
        push_u16(&mut out, EM_X86_64);
        push_u32(&mut out, 1);
        push_u64(&mut out, self.entry);
        push_u64(&mut out, 64); // phoff
        push_u64(&mut out, 0); // shoff
        push_u32(&mut out, 0); // flags
        push_u16(&mut out, 64); // ehsize
        push_u16(&mut out, 56); // phentsize
        push_u16(&mut out, phnum as u16);
        push_u16(&mut out, 0); // shentsize
        push_u16(&mut out, 0); // shnum
        push_u16(&mut out, 0); // shstrndx

        for (spec, offset) in self.segments.iter().zip(&segment_offsets) {
            push_phdr(
                &mut out,
                PT_LOAD,
                PF_R | PF_X,
                *offset,
                spec.vaddr,
                spec.data.len() as u64,
                spec.mem_size,
                spec.align,
            );
        }
        if dynamic_present {
            push_phdr(
                &mut out,
                PT_DYNAMIC,
                PF_R,
                dynamic_offset,
                0x40_0000,
                dynamic_blob.len() as u64,
                dynamic_blob.len() as u64,
                8,
            );
        }

        for spec in &self.segments {
            out.extend_from_slice(&spec.data);
        }
        for (offset, kind, addend) in &self.rela {
            push_u64(&mut out, *offset);
            push_u64(&mut out, u64::from(*kind));
            push_u64(&mut out, *addend);
        }
        for (offset, kind) in &self.rel {
            push_u64(&mut out, *offset);
            push_u64(&mut out, u64::from(*kind));
        }
        out.extend_from_slice(&dynamic_blob);

        out
    }
}

impl Default for TestElf {
    fn default() -> Self {
        Self::new()
            .segment(0x1000, 0x1000, &[0u8; 0x20], 0x20)
            .dynamic(&[])
    }
}
