//! Resolved program symbols and their capability flags.
//!
//! Symbols are created by the resolver (outside this crate), mutated by the
//! relocation scanner through atomic flag merges and by the thunk planner
//! through the thunk bookkeeping fields, and read by the emit stage.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use bitflags::bitflags;
use elf::abi::{STB_GLOBAL, STB_WEAK, STT_NOTYPE};

use crate::arch::{PLT_ENTRY_SIZE, PLT_HDR_SIZE, PLTGOT_ENTRY_SIZE};
use crate::context::Context;

bitflags! {
    /// Capability flags raised by the relocation scanner and consumed by the
    /// synthetic-section builders. Merged with atomic OR; `NEEDS_THUNK` is
    /// additionally used as a test-and-set deciding which thunk owns the
    /// symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u32 {
        const NEEDS_GOT     = 1 << 0;
        const NEEDS_PLT     = 1 << 1;
        const NEEDS_GOTTP   = 1 << 2;
        const NEEDS_TLSGD   = 1 << 3;
        const NEEDS_TLSDESC = 1 << 4;
        const NEEDS_COPYREL = 1 << 5;
        const NEEDS_DYNSYM  = 1 << 6;
        const NEEDS_THUNK   = 1 << 7;
    }
}

/// A resolved program symbol.
pub struct Symbol {
    pub name: String,
    /// Defining input file; `None` means undefined.
    pub file: Option<u32>,
    /// Defining input section; `None` for absolute and imported symbols.
    pub isec: Option<u32>,
    /// Section-relative value, or the absolute address.
    pub value: u64,
    /// `STT_*` symbol type.
    pub sym_type: u8,
    /// `STB_*` binding.
    pub bind: u8,
    pub is_imported: bool,
    flags: AtomicU32,
    // Indices into the synthesized tables, -1 when unassigned.
    pub got_idx: i32,
    pub gotplt_idx: i32,
    pub plt_idx: i32,
    pub pltgot_idx: i32,
    pub gottp_idx: i32,
    pub tlsgd_idx: i32,
    pub tlsdesc_idx: i32,
    pub dynsym_idx: i32,
    // Thunk bookkeeping, assigned by the planner that wins the NEEDS_THUNK
    // test-and-set and read thereafter.
    thunk_idx: AtomicI32,
    thunk_sym_idx: AtomicI32,
}

impl Symbol {
    fn base(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: None,
            isec: None,
            value: 0,
            sym_type: STT_NOTYPE,
            bind: STB_GLOBAL,
            is_imported: false,
            flags: AtomicU32::new(0),
            got_idx: -1,
            gotplt_idx: -1,
            plt_idx: -1,
            pltgot_idx: -1,
            gottp_idx: -1,
            tlsgd_idx: -1,
            tlsdesc_idx: -1,
            dynsym_idx: -1,
            thunk_idx: AtomicI32::new(-1),
            thunk_sym_idx: AtomicI32::new(-1),
        }
    }

    /// A symbol defined at `value` bytes into input section `isec` of `file`.
    pub fn defined(name: impl Into<String>, file: u32, isec: u32, value: u64) -> Self {
        Self {
            file: Some(file),
            isec: Some(isec),
            value,
            ..Self::base(name)
        }
    }

    /// An absolute symbol (`SHN_ABS`) with a fixed address.
    pub fn absolute(name: impl Into<String>, file: u32, value: u64) -> Self {
        Self {
            file: Some(file),
            value,
            ..Self::base(name)
        }
    }

    /// A symbol imported from a shared object.
    pub fn imported(name: impl Into<String>, sym_type: u8) -> Self {
        Self {
            is_imported: true,
            sym_type,
            ..Self::base(name)
        }
    }

    /// An unresolved symbol reference.
    pub fn undefined(name: impl Into<String>, bind: u8) -> Self {
        Self {
            bind,
            ..Self::base(name)
        }
    }

    pub fn with_type(mut self, sym_type: u8) -> Self {
        self.sym_type = sym_type;
        self
    }

    #[inline]
    pub fn flags(&self) -> SymbolFlags {
        SymbolFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    /// Atomically OR `flags` in, returning the previously set flags.
    #[inline]
    pub fn merge_flags(&self, flags: SymbolFlags) -> SymbolFlags {
        SymbolFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn clear_flags(&self, flags: SymbolFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_undef(&self) -> bool {
        self.file.is_none() && !self.is_imported
    }

    #[inline]
    pub fn is_undef_weak(&self) -> bool {
        self.is_undef() && self.bind == STB_WEAK
    }

    /// An absolute symbol has a defining file but lives in no section.
    #[inline]
    pub fn is_absolute(&self) -> bool {
        self.file.is_some() && self.isec.is_none() && !self.is_imported
    }

    #[inline]
    pub fn has_plt(&self) -> bool {
        self.plt_idx >= 0 || self.pltgot_idx >= 0
    }

    #[inline]
    pub(crate) fn thunk_idx(&self) -> i32 {
        self.thunk_idx.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn thunk_sym_idx(&self) -> i32 {
        self.thunk_sym_idx.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_thunk(&self, thunk_idx: i32, thunk_sym_idx: i32) {
        self.thunk_idx.store(thunk_idx, Ordering::Relaxed);
        self.thunk_sym_idx.store(thunk_sym_idx, Ordering::Relaxed);
    }

    /// Address of the symbol under the current layout. An imported symbol
    /// with a PLT entry resolves to that entry; a weak undefined symbol
    /// resolves to zero.
    pub fn get_addr(&self, ctx: &Context) -> u64 {
        if let Some(isec) = self.isec {
            let isec = &ctx.sections[isec as usize];
            let osec = &ctx.output_sections[isec.output_section as usize];
            return osec.shdr.sh_addr + isec.offset() + self.value;
        }
        if self.is_imported {
            if self.has_plt() {
                return self.get_plt_addr(ctx);
            }
            return 0;
        }
        // Absolute symbols carry their address; undefined ones resolve to 0.
        self.value
    }

    pub fn get_got_addr(&self, ctx: &Context) -> u64 {
        debug_assert!(self.got_idx >= 0);
        ctx.got.shdr.sh_addr + self.got_idx as u64 * 8
    }

    pub fn get_gotplt_addr(&self, ctx: &Context) -> u64 {
        debug_assert!(self.gotplt_idx >= 0);
        ctx.gotplt.shdr.sh_addr + self.gotplt_idx as u64 * 8
    }

    pub fn get_plt_addr(&self, ctx: &Context) -> u64 {
        if self.plt_idx >= 0 {
            return ctx.plt.shdr.sh_addr
                + PLT_HDR_SIZE as u64
                + self.plt_idx as u64 * PLT_ENTRY_SIZE as u64;
        }
        debug_assert!(self.pltgot_idx >= 0);
        ctx.pltgot.shdr.sh_addr + self.pltgot_idx as u64 * PLTGOT_ENTRY_SIZE as u64
    }

    pub fn get_gottp_addr(&self, ctx: &Context) -> u64 {
        debug_assert!(self.gottp_idx >= 0);
        ctx.got.shdr.sh_addr + self.gottp_idx as u64 * 8
    }

    pub fn get_tlsgd_addr(&self, ctx: &Context) -> u64 {
        debug_assert!(self.tlsgd_idx >= 0);
        ctx.got.shdr.sh_addr + self.tlsgd_idx as u64 * 8
    }

    pub fn get_tlsdesc_addr(&self, ctx: &Context) -> u64 {
        debug_assert!(self.tlsdesc_idx >= 0);
        ctx.got.shdr.sh_addr + self.tlsdesc_idx as u64 * 8
    }
}
