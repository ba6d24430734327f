//! Relocation application.
//!
//! Patches each relocation site in the output image once the layout is
//! final. Allocated sections get the full repertoire, including TLS models,
//! TLSDESC relaxation and thunk redirection; non-allocated sections accept
//! absolute words only, and `.eh_frame` absolute and PC-relative words only.

use elf::abi::*;

use crate::arch::{bits, or32, page, rel_type_to_str, write16, write32, write64, write_adr};
use crate::arch::BRANCH_REACH;
use crate::context::Context;
use crate::error::{invalid_relocation_error, out_of_range_error};
use crate::relocation::{DYNREL_SIZE, ElfRel, is_relr_reloc};
use crate::section::InputSection;

/// One AArch64 `nop`.
const NOP: u32 = 0xd503_201f;

#[inline]
fn s_plus_a(s: u64, a: i64) -> u64 {
    s.wrapping_add_signed(a)
}

/// Append one `Elf64_Rela` record to the section's reserved `.rela.dyn`
/// window.
fn put_dynrel(dynrel: &mut [u8], cursor: &mut usize, r_offset: u64, r_type: u32, r_sym: u32, r_addend: i64) {
    let slot = &mut dynrel[*cursor..*cursor + DYNREL_SIZE as usize];
    write64(&mut slot[0..], r_offset);
    write64(&mut slot[8..], ((r_sym as u64) << 32) | r_type as u64);
    write64(&mut slot[16..], r_addend as u64);
    *cursor += DYNREL_SIZE as usize;
}

/// Look up the merged-string fragment attached to relocation `i`, advancing
/// the cursor. `rel_fragments` is sorted by relocation index.
#[inline]
fn next_fragment(isec: &InputSection, frag_idx: &mut usize, i: usize) -> Option<(u32, i64)> {
    if *frag_idx < isec.rel_fragments.len() && isec.rel_fragments[*frag_idx].rel_idx == i as u32 {
        let r = isec.rel_fragments[*frag_idx];
        *frag_idx += 1;
        Some((r.frag, r.addend))
    } else {
        None
    }
}

/// Apply all relocations of an allocated input section.
///
/// `base` is the section's slice of the output image; `dynrel` is the
/// section's reserved window in `.rela.dyn`. The scanner must have run, and
/// the layout must be final; unknown relocation types were rejected by the
/// scanner, so reaching one here is a bug.
pub fn apply_reloc_alloc(ctx: &Context, isec: &InputSection, base: &mut [u8], dynrel: &mut [u8]) {
    let osec = &ctx.output_sections[isec.output_section as usize];
    let got = ctx.got.shdr.sh_addr;
    let mut cursor = 0usize;
    let mut frag_idx = 0usize;

    for i in 0..isec.rels.len() {
        let rel = isec.rels[i];
        if rel.r_type == R_AARCH64_NONE {
            continue;
        }

        let sym_id = ctx.symbol_id(isec.file, rel.r_sym);
        let sym = &ctx.symbols[sym_id as usize];
        let loc = &mut base[rel.r_offset as usize..];

        let frag = next_fragment(isec, &mut frag_idx, i);
        let s = match frag {
            Some((frag, _)) => ctx.fragments[frag as usize].get_addr(ctx),
            None => sym.get_addr(ctx),
        };
        let a = match frag {
            Some((_, addend)) => addend,
            None => rel.r_addend,
        };
        let p = osec.shdr.sh_addr + isec.offset() + rel.r_offset;
        let sa = s_plus_a(s, a);

        let overflow_check = |val: i64, lo: i64, hi: i64| {
            if val < lo || hi <= val {
                ctx.diags.report(out_of_range_error(format!(
                    "{}: relocation {} against {}: {} is not in [{}, {})",
                    isec.name,
                    rel_type_to_str(rel.r_type),
                    sym.name,
                    val,
                    lo,
                    hi,
                )));
            }
        };

        if isec.needs_dynrel[i] {
            put_dynrel(dynrel, &mut cursor, p, R_AARCH64_ABS64, sym.dynsym_idx as u32, a);
            write64(loc, a as u64);
            continue;
        }

        if isec.needs_baserel[i] {
            if !is_relr_reloc(&ctx.opts, &rel) {
                put_dynrel(dynrel, &mut cursor, p, R_AARCH64_RELATIVE, 0, sa as i64);
            }
            write64(loc, sa);
            continue;
        }

        match rel.r_type {
            R_AARCH64_ABS64 => write64(loc, sa),
            R_AARCH64_LDST8_ABS_LO12_NC => or32(loc, (bits(sa, 11, 0) << 10) as u32),
            R_AARCH64_LDST16_ABS_LO12_NC => or32(loc, (bits(sa, 11, 1) << 10) as u32),
            R_AARCH64_LDST32_ABS_LO12_NC => or32(loc, (bits(sa, 11, 2) << 10) as u32),
            R_AARCH64_LDST64_ABS_LO12_NC => or32(loc, (bits(sa, 11, 3) << 10) as u32),
            R_AARCH64_LDST128_ABS_LO12_NC => or32(loc, (bits(sa, 11, 4) << 10) as u32),
            R_AARCH64_ADD_ABS_LO12_NC => or32(loc, (bits(sa, 11, 0) << 10) as u32),
            R_AARCH64_MOVW_UABS_G0_NC => or32(loc, (bits(sa, 15, 0) << 5) as u32),
            R_AARCH64_MOVW_UABS_G1_NC => or32(loc, (bits(sa, 31, 16) << 5) as u32),
            R_AARCH64_MOVW_UABS_G2_NC => or32(loc, (bits(sa, 47, 32) << 5) as u32),
            R_AARCH64_MOVW_UABS_G3 => or32(loc, (bits(sa, 63, 48) << 5) as u32),
            R_AARCH64_ADR_GOT_PAGE => {
                let entry = s_plus_a(sym.get_got_addr(ctx), a);
                let val = page(entry).wrapping_sub(page(p)) as i64;
                overflow_check(val, -(1 << 32), 1 << 32);
                write_adr(loc, bits(val as u64, 32, 12));
            }
            R_AARCH64_ADR_PREL_PG_HI21 => {
                let val = page(sa).wrapping_sub(page(p)) as i64;
                overflow_check(val, -(1 << 32), 1 << 32);
                write_adr(loc, bits(val as u64, 32, 12));
            }
            R_AARCH64_ADR_PREL_LO21 => {
                let val = sa.wrapping_sub(p) as i64;
                overflow_check(val, -(1 << 20), 1 << 20);
                write_adr(loc, val as u64);
            }
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                if sym.is_undef_weak() {
                    // Calling a weak undefined symbol jumps to the next
                    // instruction.
                    or32(loc, 1);
                    continue;
                }

                let mut val = sa.wrapping_sub(p) as i64;
                if !(-BRANCH_REACH..BRANCH_REACH).contains(&val) {
                    let r = &isec.range_extn[i];
                    let thunk = &osec.thunks[r.thunk_idx() as usize];
                    let entry = thunk.get_addr(osec.shdr.sh_addr, r.sym_idx() as usize);
                    val = s_plus_a(entry, a).wrapping_sub(p) as i64;
                    debug_assert!((-BRANCH_REACH..BRANCH_REACH).contains(&val));
                }
                or32(loc, ((val >> 2) & 0x3ff_ffff) as u32);
            }
            R_AARCH64_CONDBR19 => {
                let val = sa.wrapping_sub(p) as i64;
                overflow_check(val, -(1 << 20), 1 << 20);
                or32(loc, (bits(val as u64, 20, 2) << 5) as u32);
            }
            R_AARCH64_PREL16 => {
                let val = sa.wrapping_sub(p) as i64;
                overflow_check(val, -(1 << 15), 1 << 15);
                write16(loc, val as u16);
            }
            R_AARCH64_PREL32 => {
                let val = sa.wrapping_sub(p) as i64;
                overflow_check(val, -(1 << 31), 1 << 32);
                write32(loc, val as u32);
            }
            R_AARCH64_PREL64 => write64(loc, sa.wrapping_sub(p)),
            R_AARCH64_LD64_GOT_LO12_NC => {
                let entry = s_plus_a(sym.get_got_addr(ctx), a);
                or32(loc, (bits(entry, 11, 3) << 10) as u32);
            }
            R_AARCH64_LD64_GOTPAGE_LO15 => {
                let entry = s_plus_a(sym.get_got_addr(ctx), a);
                let val = entry.wrapping_sub(page(got)) as i64;
                overflow_check(val, 0, 1 << 15);
                or32(loc, (bits(val as u64, 14, 3) << 10) as u32);
            }
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => {
                let entry = s_plus_a(sym.get_gottp_addr(ctx), a);
                let val = page(entry).wrapping_sub(page(p)) as i64;
                overflow_check(val, -(1 << 32), 1 << 32);
                write_adr(loc, bits(val as u64, 32, 12));
            }
            R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                let entry = s_plus_a(sym.get_gottp_addr(ctx), a);
                or32(loc, (bits(entry, 11, 3) << 10) as u32);
            }
            R_AARCH64_TLSLE_ADD_TPREL_HI12 => {
                let val = tprel(ctx, sa);
                overflow_check(val, 0, 1 << 24);
                or32(loc, (bits(val as u64, 23, 12) << 10) as u32);
            }
            R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                let val = tprel(ctx, sa);
                or32(loc, (bits(val as u64, 11, 0) << 10) as u32);
            }
            R_AARCH64_TLSGD_ADR_PAGE21 => {
                let entry = s_plus_a(sym.get_tlsgd_addr(ctx), a);
                let val = page(entry).wrapping_sub(page(p)) as i64;
                overflow_check(val, -(1 << 32), 1 << 32);
                write_adr(loc, bits(val as u64, 32, 12));
            }
            R_AARCH64_TLSGD_ADD_LO12_NC => {
                let entry = s_plus_a(sym.get_tlsgd_addr(ctx), a);
                or32(loc, (bits(entry, 11, 0) << 10) as u32);
            }
            R_AARCH64_TLSDESC_ADR_PAGE21 => {
                if relaxed_tlsdesc(ctx, sym) {
                    // adrp x0, 0 -> movz x0, #tls_offset_hi, lsl #16
                    let val = tprel(ctx, sa);
                    overflow_check(val, -(1 << 32), 1 << 32);
                    write32(loc, 0xd2a0_0000 | ((bits(val as u64, 32, 16) as u32) << 5));
                } else {
                    let entry = s_plus_a(sym.get_tlsdesc_addr(ctx), a);
                    let val = page(entry).wrapping_sub(page(p)) as i64;
                    overflow_check(val, -(1 << 32), 1 << 32);
                    write_adr(loc, bits(val as u64, 32, 12));
                }
            }
            R_AARCH64_TLSDESC_LD64_LO12 => {
                if relaxed_tlsdesc(ctx, sym) {
                    // ldr x2, [x0] -> movk x0, #tls_offset_lo
                    let lo = (tprel(ctx, sa) as u64 & 0xffff) as u32;
                    write32(loc, 0xf280_0000 | (lo << 5));
                } else {
                    let entry = s_plus_a(sym.get_tlsdesc_addr(ctx), a);
                    or32(loc, (bits(entry, 11, 3) << 10) as u32);
                }
            }
            R_AARCH64_TLSDESC_ADD_LO12 => {
                if relaxed_tlsdesc(ctx, sym) {
                    // add x0, x0, #0 -> nop
                    write32(loc, NOP);
                } else {
                    let entry = s_plus_a(sym.get_tlsdesc_addr(ctx), a);
                    or32(loc, (bits(entry, 11, 0) << 10) as u32);
                }
            }
            R_AARCH64_TLSDESC_CALL => {
                if relaxed_tlsdesc(ctx, sym) {
                    // blr x2 -> nop
                    write32(loc, NOP);
                }
            }
            _ => unreachable!("unknown relocation {}", rel.r_type),
        }
    }
}

/// Thread-pointer-relative offset of a TLS symbol. The AArch64 TCB occupies
/// the first 16 bytes past the thread pointer.
#[inline]
fn tprel(ctx: &Context, sa: u64) -> i64 {
    sa.wrapping_sub(ctx.tls_begin).wrapping_add(16) as i64
}

#[inline]
fn relaxed_tlsdesc(ctx: &Context, sym: &crate::symbol::Symbol) -> bool {
    ctx.opts.relax_tlsdesc && !sym.is_imported
}

/// Apply the relocations of a non-allocated (debug) section. Only absolute
/// words are meaningful there; anything else aborts the link.
pub fn apply_reloc_nonalloc(ctx: &Context, isec: &InputSection, base: &mut [u8]) -> crate::Result<()> {
    let mut frag_idx = 0usize;

    for i in 0..isec.rels.len() {
        let rel = isec.rels[i];
        if rel.r_type == R_AARCH64_NONE {
            continue;
        }

        let sym_id = ctx.symbol_id(isec.file, rel.r_sym);
        let sym = &ctx.symbols[sym_id as usize];
        let loc = &mut base[rel.r_offset as usize..];

        if sym.is_undef() {
            if sym.bind != STB_WEAK {
                ctx.diags.report_undef(sym_id, &sym.name, &isec.name);
            }
            continue;
        }

        let frag = next_fragment(isec, &mut frag_idx, i);
        let s = match frag {
            Some((frag, _)) => ctx.fragments[frag as usize].get_addr(ctx),
            None => sym.get_addr(ctx),
        };
        let a = match frag {
            Some((_, addend)) => addend,
            None => rel.r_addend,
        };

        match rel.r_type {
            R_AARCH64_ABS64 => write64(loc, s_plus_a(s, a)),
            R_AARCH64_ABS32 => write32(loc, s_plus_a(s, a) as u32),
            _ => {
                return Err(invalid_relocation_error(format!(
                    "{}: invalid relocation for non-allocated sections: {}",
                    isec.name,
                    rel_type_to_str(rel.r_type),
                )));
            }
        }
    }
    Ok(())
}

/// Apply one `.eh_frame` relocation. `loc` is the offset within the section,
/// `val` the already-resolved `S + A`, and `base` the section's slice of the
/// output image.
pub fn apply_eh_frame_reloc(
    ehframe: &crate::section::SectionHeader,
    rel: &ElfRel,
    loc: u64,
    base: &mut [u8],
    val: u64,
) -> crate::Result<()> {
    let target = &mut base[loc as usize..];
    match rel.r_type {
        R_AARCH64_ABS64 => write64(target, val),
        R_AARCH64_PREL32 => write32(
            target,
            val.wrapping_sub(ehframe.sh_addr).wrapping_sub(loc) as u32,
        ),
        R_AARCH64_PREL64 => write64(target, val.wrapping_sub(ehframe.sh_addr).wrapping_sub(loc)),
        _ => {
            return Err(invalid_relocation_error(format!(
                "unsupported relocation in .eh_frame: {}",
                rel_type_to_str(rel.r_type),
            )));
        }
    }
    Ok(())
}
