//! Relocation processing.
//!
//! The scanner classifies every relocation against the resolved symbol and
//! the output link mode before any layout exists; the applier patches the
//! final bytes once the layout is stable. Relocation types that admit more
//! than one handling are routed through a small dispatch table indexed by
//! output mode and symbol class.

mod apply;
mod scan;

pub use apply::{apply_eh_frame_reloc, apply_reloc_alloc, apply_reloc_nonalloc};
pub use scan::{reserve_dynrel, scan_relocations};

use elf::abi::STT_FUNC;

use crate::arch::rel_type_to_str;
use crate::context::LinkOptions;
use crate::error::{DiagnosticSink, illegal_relocation_error};
use crate::section::InputSection;
use crate::symbol::{Symbol, SymbolFlags};

/// Size of one `Elf64_Rela` record in `.rela.dyn`.
pub(crate) const DYNREL_SIZE: u64 = 24;

/// A relocation of an input section, already parsed by the front end.
#[derive(Debug, Clone, Copy)]
pub struct ElfRel {
    pub r_offset: u64,
    pub r_type: u32,
    /// File-local symbol index.
    pub r_sym: u32,
    pub r_addend: i64,
}

impl ElfRel {
    pub fn new(r_offset: u64, r_type: u32, r_sym: u32, r_addend: i64) -> Self {
        Self {
            r_offset,
            r_type,
            r_sym,
            r_addend,
        }
    }
}

/// How one relocation is to be resolved, picked per relocation type from a
/// 3×4 table (output mode × symbol class).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationAction {
    None,
    Error,
    Copyrel,
    Plt,
    Dynrel,
    Baserel,
}

pub(crate) type ActionTable = [[RelocationAction; 4]; 3];

/// Column index into an [`ActionTable`]: absolute, local, imported data,
/// imported code.
#[inline]
fn symbol_class(sym: &Symbol) -> usize {
    if sym.is_absolute() {
        0
    } else if !sym.is_imported {
        1
    } else if sym.sym_type == STT_FUNC {
        3
    } else {
        2
    }
}

/// Whether a base relocation is folded into the packed RELR section instead
/// of occupying a `.rela.dyn` slot. RELR can only encode 8-byte-aligned
/// locations.
#[inline]
pub fn is_relr_reloc(opts: &LinkOptions, rel: &ElfRel) -> bool {
    opts.pack_relr && rel.r_offset % 8 == 0
}

/// Resolve one multi-way relocation through `table`, recording action flags
/// on the relocation's side-table entries and capability flags on the
/// symbol.
pub(crate) fn dispatch(
    opts: &LinkOptions,
    diags: &DiagnosticSink,
    isec: &mut InputSection,
    i: usize,
    rel: &ElfRel,
    sym: &Symbol,
    table: &ActionTable,
) {
    use self::RelocationAction as A;

    match table[opts.output.row()][symbol_class(sym)] {
        A::None => {}
        A::Error => diags.report(illegal_relocation_error(format!(
            "{}: relocation {} against {} can not be used when making a shared object; \
             recompile with -fPIC",
            isec.name,
            rel_type_to_str(rel.r_type),
            sym.name,
        ))),
        A::Copyrel => {
            sym.merge_flags(SymbolFlags::NEEDS_COPYREL | SymbolFlags::NEEDS_DYNSYM);
        }
        A::Plt => {
            sym.merge_flags(SymbolFlags::NEEDS_PLT | SymbolFlags::NEEDS_DYNSYM);
        }
        A::Dynrel => {
            sym.merge_flags(SymbolFlags::NEEDS_DYNSYM);
            isec.needs_dynrel[i] = true;
            isec.num_dynrel += 1;
        }
        A::Baserel => {
            isec.needs_baserel[i] = true;
            if !is_relr_reloc(opts, rel) {
                isec.num_dynrel += 1;
            }
        }
    }
}
