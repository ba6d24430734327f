//! The linking context threaded through every back-end pass.

use std::cell::UnsafeCell;

use crate::error::DiagnosticSink;
use crate::section::{Fragment, InputSection, OutputSection, SectionHeader};
use crate::symbol::Symbol;

/// Output link mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A shared object (DSO).
    SharedObject,
    /// A position-independent executable.
    PieExecutable,
    /// A position-dependent executable.
    Executable,
}

impl OutputKind {
    /// Row index into the relocation dispatch tables.
    #[inline]
    pub(crate) fn row(self) -> usize {
        match self {
            OutputKind::SharedObject => 0,
            OutputKind::PieExecutable => 1,
            OutputKind::Executable => 2,
        }
    }

    #[inline]
    pub fn is_pic(self) -> bool {
        !matches!(self, OutputKind::Executable)
    }
}

/// Configuration handed down from the driver.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub output: OutputKind,
    /// Rewrite TLSDESC sequences of local symbols to the LE model.
    pub relax_tlsdesc: bool,
    /// Fold eligible base relocations into a packed RELR section.
    pub pack_relr: bool,
    /// Virtual address the image is linked at.
    pub image_base: u64,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            output: OutputKind::Executable,
            relax_tlsdesc: true,
            pack_relr: false,
            image_base: 0x20_0000,
        }
    }
}

/// One input object; owns the mapping from file-local symbol indices (as
/// used by relocations) to the global symbol table.
pub struct ObjectFile {
    pub name: String,
    /// Global symbol ids, indexed by the file-local symbol index.
    pub symbols: Vec<u32>,
    /// Input sections contributed by this file.
    pub sections: Vec<u32>,
}

/// A linker-synthesized chunk (`.got`, `.got.plt`, `.plt`, `.plt.got`,
/// `.rela.dyn`).
pub struct SyntheticSection {
    pub name: &'static str,
    pub shdr: SectionHeader,
    /// Symbols with an entry in this chunk, in assignment order.
    pub symbols: Vec<u32>,
}

impl SyntheticSection {
    fn new(name: &'static str, sh_flags: u64, sh_addralign: u64) -> Self {
        Self {
            name,
            shdr: SectionHeader::new(sh_flags, 0, sh_addralign),
            symbols: Vec::new(),
        }
    }
}

/// The final output image.
///
/// Parallel writers patch disjoint slices of one allocation: every input
/// section, PLT entry, and thunk owns its own byte range, so no locking is
/// needed. `slice_mut` hands out those ranges; callers must keep them
/// disjoint.
pub struct OutputBuffer {
    data: UnsafeCell<Vec<u8>>,
}

unsafe impl Sync for OutputBuffer {}

impl OutputBuffer {
    pub fn new() -> Self {
        Self {
            data: UnsafeCell::new(Vec::new()),
        }
    }

    /// Grow the image to `len` zeroed bytes.
    pub fn resize(&mut self, len: usize) {
        self.data.get_mut().clear();
        self.data.get_mut().resize(len, 0);
    }

    #[inline]
    pub fn len(&self) -> usize {
        unsafe { (*self.data.get()).len() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow a byte range of the image for writing.
    ///
    /// # Safety
    /// The caller must ensure no two live slices overlap. The back end
    /// guarantees this by construction: each worker writes only the range
    /// belonging to its own input section, PLT entry, or thunk.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let data = unsafe { &mut *self.data.get() };
        &mut data[offset..offset + len]
    }

    pub fn as_slice(&mut self) -> &[u8] {
        self.data.get_mut().as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.get_mut().as_mut_slice()
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the back end reads and writes during a link.
pub struct Context {
    pub opts: LinkOptions,
    pub files: Vec<ObjectFile>,
    pub symbols: Vec<Symbol>,
    /// Input-section arena; `OutputSection::members` index into it.
    pub sections: Vec<InputSection>,
    pub output_sections: Vec<OutputSection>,
    pub fragments: Vec<Fragment>,
    pub got: SyntheticSection,
    pub gotplt: SyntheticSection,
    pub plt: SyntheticSection,
    pub pltgot: SyntheticSection,
    pub reldyn: SyntheticSection,
    /// Address of `_DYNAMIC`, when a dynamic section exists.
    pub dynamic_addr: Option<u64>,
    /// Start of the TLS initialization image.
    pub tls_begin: u64,
    pub buf: OutputBuffer,
    pub diags: DiagnosticSink,
}

impl Context {
    pub fn new(opts: LinkOptions) -> Self {
        use elf::abi::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE};
        let rw = (SHF_ALLOC | SHF_WRITE) as u64;
        let rx = (SHF_ALLOC | SHF_EXECINSTR) as u64;
        Self {
            opts,
            files: Vec::new(),
            symbols: Vec::new(),
            sections: Vec::new(),
            output_sections: Vec::new(),
            fragments: Vec::new(),
            got: SyntheticSection::new(".got", rw, 8),
            gotplt: SyntheticSection::new(".got.plt", rw, 8),
            plt: SyntheticSection::new(".plt", rx, 16),
            pltgot: SyntheticSection::new(".plt.got", rx, 16),
            reldyn: SyntheticSection::new(".rela.dyn", SHF_ALLOC as u64, 8),
            dynamic_addr: None,
            tls_begin: 0,
            buf: OutputBuffer::new(),
            diags: DiagnosticSink::new(),
        }
    }

    pub fn add_file(&mut self, name: impl Into<String>) -> u32 {
        let id = self.files.len() as u32;
        self.files.push(ObjectFile {
            name: name.into(),
            symbols: Vec::new(),
            sections: Vec::new(),
        });
        id
    }

    pub fn add_output_section(
        &mut self,
        name: impl Into<String>,
        sh_flags: u64,
        sh_addralign: u64,
    ) -> u32 {
        let id = self.output_sections.len() as u32;
        self.output_sections
            .push(OutputSection::new(name, sh_flags, sh_addralign));
        id
    }

    /// Register a symbol with `file`, returning the file-local index that
    /// relocations use to refer to it.
    pub fn add_symbol(&mut self, file: u32, sym: Symbol) -> u32 {
        let global = self.symbols.len() as u32;
        self.symbols.push(sym);
        let locals = &mut self.files[file as usize].symbols;
        locals.push(global);
        (locals.len() - 1) as u32
    }

    /// Append an input section to the arena and to its file and output
    /// section, returning its id.
    pub fn add_input_section(&mut self, isec: InputSection) -> u32 {
        let id = self.sections.len() as u32;
        self.files[isec.file as usize].sections.push(id);
        self.output_sections[isec.output_section as usize]
            .members
            .push(id);
        self.sections.push(isec);
        id
    }

    /// Global symbol id for relocation `rel_sym` of `file`.
    #[inline]
    pub(crate) fn symbol_id(&self, file: u32, rel_sym: u32) -> u32 {
        self.files[file as usize].symbols[rel_sym as usize]
    }
}
