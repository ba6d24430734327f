//! Input and output section records.
//!
//! The front end (file parsing, symbol resolution, section merging) is
//! outside this crate; it hands over input sections whose relocations are
//! already parsed and whose symbols are resolved. The back end owns the
//! layout state that changes while thunks are planned.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::relocation::ElfRel;
use crate::thunk::{RangeExtensionRef, RangeExtensionThunk};

/// The handful of section-header fields the back end reads and writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SectionHeader {
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_addralign: u64,
}

impl SectionHeader {
    pub fn new(sh_flags: u64, sh_size: u64, sh_addralign: u64) -> Self {
        Self {
            sh_flags,
            sh_addr: 0,
            sh_offset: 0,
            sh_size,
            sh_addralign,
        }
    }
}

/// A slice of an input object destined for an output section.
pub struct InputSection {
    /// Owning input file.
    pub file: u32,
    pub name: String,
    pub shdr: SectionHeader,
    pub data: Vec<u8>,
    pub rels: Vec<ElfRel>,
    /// Output section this member belongs to.
    pub output_section: u32,
    /// Offset within the output section. Written by the layout passes,
    /// read concurrently afterwards; passes are separated by joins, so
    /// relaxed ordering is enough.
    offset: AtomicU64,
    /// Per-relocation action flags set by the scanner.
    pub needs_dynrel: Vec<bool>,
    pub needs_baserel: Vec<bool>,
    /// Merged-string fragment references, sorted by relocation index.
    pub rel_fragments: Vec<FragmentRef>,
    /// Populated exactly for the call/jump relocations that cannot reach
    /// their target directly.
    pub range_extn: Vec<RangeExtensionRef>,
    /// Byte offset of this section's reserved slots in `.rela.dyn`.
    pub reldyn_offset: u64,
    /// Number of `.rela.dyn` slots this section's relocations need.
    pub(crate) num_dynrel: u64,
}

impl InputSection {
    pub fn new(
        file: u32,
        name: impl Into<String>,
        shdr: SectionHeader,
        data: Vec<u8>,
        rels: Vec<ElfRel>,
        output_section: u32,
    ) -> Self {
        let n = rels.len();
        Self {
            file,
            name: name.into(),
            shdr,
            data,
            rels,
            output_section,
            offset: AtomicU64::new(0),
            needs_dynrel: vec![false; n],
            needs_baserel: vec![false; n],
            rel_fragments: Vec::new(),
            range_extn: (0..n).map(|_| RangeExtensionRef::default()).collect(),
            reldyn_offset: 0,
            num_dynrel: 0,
        }
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

/// An ordered list of members and thunks forming one output section.
pub struct OutputSection {
    pub name: String,
    pub shdr: SectionHeader,
    /// Input-section ids in layout order.
    pub members: Vec<u32>,
    pub thunks: Vec<RangeExtensionThunk>,
}

impl OutputSection {
    pub fn new(name: impl Into<String>, sh_flags: u64, sh_addralign: u64) -> Self {
        Self {
            name: name.into(),
            shdr: SectionHeader::new(sh_flags, 0, sh_addralign),
            members: Vec::new(),
            thunks: Vec::new(),
        }
    }
}

/// A piece of a merged section (deduplicated strings and the like).
/// Merging happens in the front end; the back end only resolves addresses.
#[derive(Debug, Clone, Copy)]
pub struct Fragment {
    /// Output section carrying the merged contents.
    pub osec: u32,
    /// Offset within that output section.
    pub offset: u64,
}

impl Fragment {
    pub fn get_addr(&self, ctx: &crate::context::Context) -> u64 {
        ctx.output_sections[self.osec as usize].shdr.sh_addr + self.offset
    }
}

/// Attaches a fragment to one relocation of an input section.
#[derive(Debug, Clone, Copy)]
pub struct FragmentRef {
    /// Index of the relocation this entry applies to.
    pub rel_idx: u32,
    /// Fragment id in [`crate::Context::fragments`].
    pub frag: u32,
    pub addend: i64,
}
