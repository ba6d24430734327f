//! Synthesized PLT, `.got.plt` and PLT-via-GOT chunks.
//!
//! The generic GOT/dynamic-section builders live in the surrounding linker;
//! this module assigns the per-symbol table indices implied by the
//! scanner's capability flags, sizes the chunks, and emits the
//! architecture-specific entries.

use rayon::prelude::*;

use crate::arch::{
    PLT_ENTRY_SIZE, PLT_HDR_SIZE, PLTGOT_ENTRY_SIZE, write_plt_entry, write_plt_header,
    write_pltgot_entry,
};
use crate::arch::write64;
use crate::context::Context;
use crate::symbol::SymbolFlags;

/// Walk the symbol table in index order and hand out GOT, PLT, PLT-via-GOT,
/// TLS and dynamic-symbol slots. Deterministic: slot order is symbol order.
pub fn reserve_synthetic_entries(ctx: &mut Context) {
    let mut ngot: i32 = 0;
    let mut nplt: i32 = 0;
    let mut npltgot: i32 = 0;
    // Dynamic symbol index 0 is the reserved null entry.
    let mut ndynsym: i32 = 1;

    let mut plt_syms = Vec::new();
    let mut pltgot_syms = Vec::new();

    for (i, sym) in ctx.symbols.iter_mut().enumerate() {
        let flags = sym.flags();

        if flags.contains(SymbolFlags::NEEDS_GOT) {
            sym.got_idx = ngot;
            ngot += 1;
        }
        if flags.contains(SymbolFlags::NEEDS_PLT) {
            if flags.contains(SymbolFlags::NEEDS_GOT) {
                // The symbol already has a GOT slot; a PLT-via-GOT entry
                // jumps through it and needs no .got.plt slot.
                sym.pltgot_idx = npltgot;
                npltgot += 1;
                pltgot_syms.push(i as u32);
            } else {
                sym.plt_idx = nplt;
                // The first three .got.plt slots are reserved.
                sym.gotplt_idx = 3 + nplt;
                nplt += 1;
                plt_syms.push(i as u32);
            }
        }
        if flags.contains(SymbolFlags::NEEDS_GOTTP) {
            sym.gottp_idx = ngot;
            ngot += 1;
        }
        if flags.contains(SymbolFlags::NEEDS_TLSGD) {
            // Module id and offset.
            sym.tlsgd_idx = ngot;
            ngot += 2;
        }
        if flags.contains(SymbolFlags::NEEDS_TLSDESC) {
            // Resolver function and argument.
            sym.tlsdesc_idx = ngot;
            ngot += 2;
        }
        if sym.is_imported || flags.contains(SymbolFlags::NEEDS_DYNSYM) {
            sym.dynsym_idx = ndynsym;
            ndynsym += 1;
        }
    }

    ctx.got.shdr.sh_size = ngot as u64 * 8;
    ctx.gotplt.shdr.sh_size = if nplt > 0 { (3 + nplt) as u64 * 8 } else { 0 };
    ctx.plt.shdr.sh_size = if nplt > 0 {
        PLT_HDR_SIZE as u64 + nplt as u64 * PLT_ENTRY_SIZE as u64
    } else {
        0
    };
    ctx.pltgot.shdr.sh_size = npltgot as u64 * PLTGOT_ENTRY_SIZE as u64;
    ctx.plt.symbols = plt_syms;
    ctx.pltgot.symbols = pltgot_syms;
}

/// Emit `.got.plt`: slot 0 holds the address of `_DYNAMIC` (or 0 when there
/// is none), slots 1 and 2 are reserved for the dynamic loader, and every
/// PLT symbol's slot starts out pointing at the PLT header so the first
/// call falls through into the resolver.
pub fn copy_gotplt(ctx: &Context) {
    let shdr = &ctx.gotplt.shdr;
    if shdr.sh_size == 0 {
        return;
    }
    let buf = unsafe { ctx.buf.slice_mut(shdr.sh_offset as usize, shdr.sh_size as usize) };

    write64(&mut buf[0..], ctx.dynamic_addr.unwrap_or(0));
    for &sid in &ctx.plt.symbols {
        let sym = &ctx.symbols[sid as usize];
        write64(
            &mut buf[sym.gotplt_idx as usize * 8..],
            ctx.plt.shdr.sh_addr,
        );
    }
}

/// Emit the PLT header and every PLT entry.
pub fn copy_plt(ctx: &Context) {
    let shdr = &ctx.plt.shdr;
    if shdr.sh_size == 0 {
        return;
    }
    let buf = unsafe { ctx.buf.slice_mut(shdr.sh_offset as usize, shdr.sh_size as usize) };
    write_plt_header(buf, ctx.gotplt.shdr.sh_addr, shdr.sh_addr);

    for &sid in &ctx.plt.symbols {
        let sym = &ctx.symbols[sid as usize];
        let ent = &mut buf
            [PLT_HDR_SIZE + sym.plt_idx as usize * PLT_ENTRY_SIZE..];
        write_plt_entry(ent, sym.get_gotplt_addr(ctx), sym.get_plt_addr(ctx));
    }
}

/// Emit the PLT-via-GOT entries, in parallel; each entry is a disjoint
/// slice of the chunk.
pub fn copy_pltgot(ctx: &Context) {
    let shdr = &ctx.pltgot.shdr;
    if shdr.sh_size == 0 {
        return;
    }
    ctx.pltgot.symbols.par_iter().for_each(|&sid| {
        let sym = &ctx.symbols[sid as usize];
        let ent = unsafe {
            ctx.buf.slice_mut(
                shdr.sh_offset as usize + sym.pltgot_idx as usize * PLTGOT_ENTRY_SIZE,
                PLTGOT_ENTRY_SIZE,
            )
        };
        write_pltgot_entry(ent, sym.get_got_addr(ctx), sym.get_plt_addr(ctx));
    });
}
