//! Output layout.
//!
//! The real driver owns segment assignment and header emission; the back end
//! only needs virtual addresses and file offsets that are deterministic,
//! aligned, and no more spread out than the pessimistic layout the thunk
//! planner starts from.

use elf::abi::SHF_ALLOC;

use crate::context::Context;

/// Round `val` up to a multiple of `align` (0 and 1 mean unaligned).
#[inline]
pub fn align_to(val: u64, align: u64) -> u64 {
    if align <= 1 {
        val
    } else {
        debug_assert!(align.is_power_of_two());
        (val + align - 1) & !(align - 1)
    }
}

/// Assign virtual addresses and file offsets to every chunk and return the
/// total image size.
///
/// Output sections that the thunk planner laid out keep their member
/// offsets and size; all other output sections get their members packed
/// here. Allocated chunks get addresses from the image base; non-allocated
/// sections only get file offsets.
pub fn set_osec_offsets(ctx: &mut Context) -> u64 {
    let base = ctx.opts.image_base;
    let mut addr = base;

    for osec in &mut ctx.output_sections {
        if osec.shdr.sh_flags & SHF_ALLOC as u64 == 0 {
            continue;
        }
        if osec.thunks.is_empty() {
            let mut offset = 0u64;
            for &id in &osec.members {
                let isec = &ctx.sections[id as usize];
                offset = align_to(offset, isec.shdr.sh_addralign);
                isec.set_offset(offset);
                offset += isec.shdr.sh_size;
            }
            osec.shdr.sh_size = offset;
        }
        addr = align_to(addr, osec.shdr.sh_addralign.max(1));
        osec.shdr.sh_addr = addr;
        osec.shdr.sh_offset = addr - base;
        addr += osec.shdr.sh_size;
    }

    for chunk in [
        &mut ctx.got,
        &mut ctx.gotplt,
        &mut ctx.plt,
        &mut ctx.pltgot,
        &mut ctx.reldyn,
    ] {
        addr = align_to(addr, chunk.shdr.sh_addralign);
        chunk.shdr.sh_addr = addr;
        chunk.shdr.sh_offset = addr - base;
        addr += chunk.shdr.sh_size;
    }

    let mut offset = addr - base;
    for osec in &mut ctx.output_sections {
        if osec.shdr.sh_flags & SHF_ALLOC as u64 != 0 {
            continue;
        }
        let mut sec_off = 0u64;
        for &id in &osec.members {
            let isec = &ctx.sections[id as usize];
            sec_off = align_to(sec_off, isec.shdr.sh_addralign);
            isec.set_offset(sec_off);
            sec_off += isec.shdr.sh_size;
        }
        osec.shdr.sh_size = sec_off;
        offset = align_to(offset, osec.shdr.sh_addralign.max(1));
        osec.shdr.sh_addr = 0;
        osec.shdr.sh_offset = offset;
        offset += osec.shdr.sh_size;
    }

    offset
}
