use crate::format::FormatError;
use crate::layout::{align_down, align_up, header_region_size};

/// One loadable region of the source image. `data` always holds exactly
/// `mem_size` bytes; bytes past `file_size` are zero until a relocation
/// lands there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub mem_size: u64,
    pub file_size: u64,
    pub align: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub data: Vec<u8>,
}

/// Target virtual address and the absolute value to be written there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub vaddr: u64,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub entry: u64,
    pub segments: Vec<Segment>,
    pub relocations: Vec<Relocation>,
    pub address_alignment: u64,
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// Least common multiple of every segment's alignment.
pub fn address_alignment(segments: &[Segment]) -> u64 {
    segments.iter().fold(1, |acc, segment| lcm(acc, segment.align))
}

impl Executable {
    fn segment_containing(&self, vaddr: u64, size: u64) -> Option<usize> {
        self.segments.iter().position(|segment| {
            vaddr >= segment.vaddr
                && (vaddr - segment.vaddr)
                    .checked_add(size)
                    .is_some_and(|need| need <= segment.mem_size)
        })
    }

    /// Reads the current 8-byte little-endian value at a virtual address.
    pub fn read_u64_at(&self, purpose: &'static str, vaddr: u64) -> Result<u64, FormatError> {
        let index = self
            .segment_containing(vaddr, 8)
            .ok_or(FormatError::UnmappedAddress {
                purpose,
                vaddr,
                size: 8,
            })?;
        let segment = &self.segments[index];
        let offset = (vaddr - segment.vaddr) as usize;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&segment.data[offset..offset + 8]);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Shifts every address in the executable to the chosen base. When the
    /// lowest segment would collide with the output's header region, the
    /// applied base is bumped by the alignment-rounded header size; the
    /// caller keeps using the original base for all RVA arithmetic.
    pub fn relocate(&mut self, base_address: u64, verbosity: u8) {
        let header_size = header_region_size(self.segments.len() + 1);
        let mut base = base_address;
        if self.segments.first().is_some_and(|first| first.vaddr <= header_size) {
            let offset = align_up(header_size, self.address_alignment);
            if verbosity >= 1 {
                eprintln!(
                    "address of the first section is too low, adding {offset:#x} offset"
                );
            }
            base += offset;
        }

        self.entry += base;
        for (index, segment) in self.segments.iter_mut().enumerate() {
            segment.vaddr += base;

            // Align down to the segment's own alignment and grow the buffer
            // on the low side so the content keeps its absolute address.
            let aligned = align_down(segment.vaddr, segment.align);
            let offset = segment.vaddr - aligned;
            if offset > 0 {
                let mut data = vec![0u8; offset as usize + segment.data.len()];
                data[offset as usize..].copy_from_slice(&segment.data);
                segment.data = data;
            }
            segment.vaddr = aligned;
            segment.file_size += offset;
            segment.mem_size += offset;

            if verbosity >= 2 {
                eprintln!("segment {index} relocated to {:#x}", segment.vaddr);
            }
        }

        for reloc in &mut self.relocations {
            reloc.vaddr += base;
            reloc.value += base;
        }
    }

    /// Writes every relocation's value into its owning segment, marking
    /// bytes written into the zero-filled tail as meaningful.
    pub fn apply_relocations(&mut self, verbosity: u8) -> Result<(), FormatError> {
        for i in 0..self.relocations.len() {
            let reloc = self.relocations[i];
            let index = self.segment_containing(reloc.vaddr, 8).ok_or(
                FormatError::UnmappedAddress {
                    purpose: "relocation target",
                    vaddr: reloc.vaddr,
                    size: 8,
                },
            )?;
            let segment = &mut self.segments[index];
            let offset = reloc.vaddr - segment.vaddr;
            segment.data[offset as usize..offset as usize + 8]
                .copy_from_slice(&reloc.value.to_le_bytes());

            if verbosity >= 2 {
                eprintln!(
                    "virtual address {:#x} relocated to value {:#x}",
                    reloc.vaddr, reloc.value
                );
            }

            if offset >= segment.file_size {
                segment.file_size = offset + 8;
                if verbosity >= 2 {
                    eprintln!(
                        "relocation against uninitialized memory extends in-file \
                         size of the segment at {:#x} to {}",
                        segment.vaddr, segment.file_size
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn segment(vaddr: u64, align: u64, file_size: u64, mem_size: u64) -> Segment {
        let mut data = vec![0u8; mem_size as usize];
        for (i, byte) in data[..file_size as usize].iter_mut().enumerate() {
            *byte = i as u8;
        }
        Segment {
            vaddr,
            mem_size,
            file_size,
            align,
            readable: true,
            writable: false,
            executable: true,
            data,
        }
    }

    fn exec(segments: Vec<Segment>, relocations: Vec<Relocation>) -> Executable {
        Executable {
            entry: segments[0].vaddr,
            address_alignment: address_alignment(&segments),
            segments,
            relocations,
        }
    }

    #[test]
    fn address_alignment_is_the_lcm_of_segment_alignments() {
        let segments = vec![
            segment(0x1000, 0x1000, 0, 0x10),
            segment(0x200000, 0x200000, 0, 0x10),
        ];
        assert_eq!(address_alignment(&segments), 0x200000);
    }

    #[test]
    fn relocate_shifts_entry_segments_and_relocations() {
        let mut exec = exec(
            vec![segment(0x1000, 0x1000, 0x20, 0x20)],
            vec![Relocation { vaddr: 0x1008, value: 0x1000 }],
        );
        exec.relocate(0x1000_0000, 0);

        assert_eq!(exec.entry, 0x1000_1000);
        assert_eq!(exec.segments[0].vaddr, 0x1000_1000);
        assert_eq!(
            exec.relocations[0],
            Relocation { vaddr: 0x1000_1008, value: 0x1000_1000 }
        );
    }

    #[test]
    fn relocate_bumps_base_when_headers_would_overlap() {
        let mut exec = exec(vec![segment(0, 0x1000, 0x20, 0x20)], Vec::new());
        exec.relocate(0x1000_0000, 0);

        // header size for 2 sections rounds up to one 0x1000 page
        assert_eq!(exec.segments[0].vaddr, 0x1000_1000);
        assert_eq!(exec.entry, 0x1000_1000);
    }

    #[test]
    fn relocate_realigns_segments_downward_and_grows_their_buffers() {
        let mut exec = exec(vec![segment(0x1200, 0x1000, 0x20, 0x20)], Vec::new());
        exec.relocate(0x1000_0000, 0);

        let segment = &exec.segments[0];
        assert_eq!(segment.vaddr, 0x1000_1000);
        assert_eq!(segment.file_size, 0x220);
        assert_eq!(segment.mem_size, 0x220);
        assert_eq!(segment.data.len(), 0x220);
        assert_eq!(&segment.data[..0x200], &vec![0u8; 0x200][..]);
        assert_eq!(segment.data[0x200], 0);
        assert_eq!(segment.data[0x201], 1);
    }

    #[test]
    fn apply_writes_values_little_endian() {
        let mut exec = exec(
            vec![segment(0x1000, 0x1000, 0x20, 0x20)],
            vec![Relocation { vaddr: 0x1008, value: 0x1122_3344_5566_7788 }],
        );
        exec.apply_relocations(0).expect("apply");
        assert_eq!(
            &exec.segments[0].data[8..16],
            &0x1122_3344_5566_7788u64.to_le_bytes()
        );
        assert_eq!(exec.segments[0].file_size, 0x20);
    }

    #[test]
    fn apply_extends_file_size_into_the_zero_tail() {
        let mut exec = exec(
            vec![segment(0x1000, 0x1000, 0x10, 0x40)],
            vec![Relocation { vaddr: 0x1030, value: 0xdead_beef }],
        );
        exec.apply_relocations(0).expect("apply");
        assert_eq!(exec.segments[0].file_size, 0x38);
    }

    #[test]
    fn apply_rejects_targets_outside_all_segments() {
        let mut exec = exec(
            vec![segment(0x1000, 0x1000, 0x20, 0x20)],
            vec![Relocation { vaddr: 0x5000, value: 0 }],
        );
        let err = exec.apply_relocations(0).expect_err("must fail");
        assert_eq!(
            err,
            FormatError::UnmappedAddress {
                purpose: "relocation target",
                vaddr: 0x5000,
                size: 8,
            }
        );
    }

    #[test]
    fn apply_rejects_targets_straddling_a_segment_end() {
        let mut exec = exec(
            vec![segment(0x1000, 0x1000, 0x20, 0x20)],
            vec![Relocation { vaddr: 0x101c, value: 0 }],
        );
        assert!(exec.apply_relocations(0).is_err());
    }
}
