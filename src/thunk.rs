//! Range-extension thunks.
//!
//! AArch64 call/jump instructions take a 27-bit signed displacement, so they
//! reach only ±128 MiB. A branch whose target is further away is redirected
//! to a linker-synthesized `adrp`/`add`/`br` trampoline placed near the
//! caller. Thunk count depends on distances and distances depend on thunk
//! count; the cycle is broken by a pessimistic layout, a reality check
//! against the recomputed layout, and a monotonic shrink.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use elf::abi::{R_AARCH64_CALL26, R_AARCH64_JUMP26, SHF_EXECINSTR};
use rayon::prelude::*;

use crate::arch::{BRANCH_REACH, THUNK_ENTRY_SIZE, write_thunk_entry};
use crate::context::Context;
use crate::layout::{align_to, set_osec_offsets};
use crate::relocation::ElfRel;
use crate::section::{InputSection, OutputSection};
use crate::symbol::{Symbol, SymbolFlags};

/// We create a thunk no further than 100 MiB from any section.
const MAX_DISTANCE: i64 = 100 * 1024 * 1024;

/// We create a thunk for each 10 MiB of input sections.
const GROUP_SIZE: i64 = 10 * 1024 * 1024;

/// Attaches a relocation to its thunk entry; both fields are -1 until the
/// planner assigns them.
pub struct RangeExtensionRef {
    thunk_idx: AtomicI32,
    sym_idx: AtomicI32,
}

impl RangeExtensionRef {
    #[inline]
    pub fn thunk_idx(&self) -> i32 {
        self.thunk_idx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sym_idx(&self) -> i32 {
        self.sym_idx.load(Ordering::Relaxed)
    }

    #[inline]
    fn set(&self, thunk_idx: i32, sym_idx: i32) {
        self.thunk_idx.store(thunk_idx, Ordering::Relaxed);
        self.sym_idx.store(sym_idx, Ordering::Relaxed);
    }

    #[inline]
    fn set_sym_idx(&self, sym_idx: i32) {
        self.sym_idx.store(sym_idx, Ordering::Relaxed);
    }
}

impl Default for RangeExtensionRef {
    fn default() -> Self {
        Self {
            thunk_idx: AtomicI32::new(-1),
            sym_idx: AtomicI32::new(-1),
        }
    }
}

/// A synthesized block of trampolines inside an executable output section.
pub struct RangeExtensionThunk {
    pub thunk_idx: u32,
    /// Offset within the owning output section.
    pub offset: u64,
    /// Symbols trampolined from here, in a deterministic total order.
    /// Grown under the mutex during the parallel group scan.
    symbols: Mutex<Vec<u32>>,
    /// Maps a pre-compaction entry index to its final index.
    symbol_map: Vec<u32>,
    used: Vec<AtomicBool>,
}

impl RangeExtensionThunk {
    fn new(thunk_idx: u32, offset: u64) -> Self {
        Self {
            thunk_idx,
            offset,
            symbols: Mutex::new(Vec::new()),
            symbol_map: Vec::new(),
            used: Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        (self.symbols.lock().unwrap().len() * THUNK_ENTRY_SIZE) as u64
    }

    pub fn symbols(&self) -> Vec<u32> {
        self.symbols.lock().unwrap().clone()
    }

    /// Output address of the entry a relocation was assigned to. `sym_idx`
    /// is the pre-compaction index stored in the relocation's
    /// [`RangeExtensionRef`].
    pub fn get_addr(&self, osec_addr: u64, sym_idx: usize) -> u64 {
        osec_addr + self.offset + self.symbol_map[sym_idx] as u64 * THUNK_ENTRY_SIZE as u64
    }
}

fn reset_thunk(thunk: &mut RangeExtensionThunk, symbols: &[Symbol]) {
    for &sid in thunk.symbols.get_mut().unwrap().iter() {
        let sym = &symbols[sid as usize];
        sym.set_thunk(-1, -1);
        sym.clear_flags(SymbolFlags::NEEDS_THUNK);
    }
}

/// Whether the branch at `rel` reaches `sym` directly under the current
/// layout. An absolute symbol is never considered reachable: a later shrink
/// pass may move the caller.
fn is_reachable(ctx: &Context, sym: &Symbol, isec: &InputSection, rel: &ElfRel) -> bool {
    if sym.is_absolute() {
        return false;
    }
    let osec = &ctx.output_sections[isec.output_section as usize];
    let s = sym.get_addr(ctx) as i64;
    let p = (osec.shdr.sh_addr + isec.offset() + rel.r_offset) as i64;
    let val = s.wrapping_add(rel.r_addend).wrapping_sub(p);
    (-BRANCH_REACH..BRANCH_REACH).contains(&val)
}

/// Plan thunks for one executable output section under the pessimistic
/// layout, returning the thunk list and the resulting section size.
///
/// Progress is managed with four monotonically increasing member cursors
/// `a <= b <= c <= d` and a running offset: `[b, c)` is the group being
/// planned, `d` is how far the group can reach forward, and `a` trails to
/// retire thunks that fell out of range behind the group.
fn create_thunks(ctx: &Context, osec: &OutputSection) -> (Vec<RangeExtensionThunk>, u64) {
    let members = &osec.members;
    let sections = &ctx.sections;

    // Members that have no real offset yet must read as far away; start
    // everything except the head at a huge dummy offset.
    sections[members[0] as usize].set_offset(0);
    members[1..]
        .par_iter()
        .for_each(|&id| sections[id as usize].set_offset(1 << 31));

    let mut thunks: Vec<RangeExtensionThunk> = Vec::new();
    let mut a = 0usize;
    let mut b = 0usize;
    let mut c = 0usize;
    let mut d = 0usize;
    let mut offset: u64 = 0;

    while b < members.len() {
        // Move D forward as far as we can jump from B to D.
        while d < members.len()
            && (offset as i64) - (sections[members[b] as usize].offset() as i64) < MAX_DISTANCE
        {
            let m = &sections[members[d] as usize];
            offset = align_to(offset, m.shdr.sh_addralign);
            m.set_offset(offset);
            offset += m.shdr.sh_size;
            d += 1;
        }

        // Move C forward so that C is apart from B by GROUP_SIZE.
        while c < members.len()
            && (sections[members[c] as usize].offset() as i64)
                - (sections[members[b] as usize].offset() as i64)
                < GROUP_SIZE
        {
            c += 1;
        }

        // Move A forward so that A is reachable from C.
        if c > 0 {
            let last = &sections[members[c - 1] as usize];
            let c_end = (last.offset() + last.shdr.sh_size) as i64;
            while a < thunks.len() && (thunks[a].offset as i64) < c_end - MAX_DISTANCE {
                reset_thunk(&mut thunks[a], &ctx.symbols);
                a += 1;
            }
        }

        // Create a thunk for the input sections between B and C, placed at D.
        let mut thunk = RangeExtensionThunk::new(thunks.len() as u32, offset);

        // Scan relocations between B and C to collect symbols that need
        // thunks.
        members[b..c].par_iter().for_each(|&id| {
            let isec = &sections[id as usize];
            for (i, rel) in isec.rels.iter().enumerate() {
                if rel.r_type != R_AARCH64_CALL26 && rel.r_type != R_AARCH64_JUMP26 {
                    continue;
                }

                let sym_id = ctx.symbol_id(isec.file, rel.r_sym);
                let sym = &ctx.symbols[sym_id as usize];

                // Skip if the destination is within reach.
                if is_reachable(ctx, sym, isec, rel) {
                    continue;
                }

                // If the symbol is already in another thunk, reuse it.
                let tidx = sym.thunk_idx();
                if tidx != -1 {
                    isec.range_extn[i].set(tidx, sym.thunk_sym_idx());
                    continue;
                }

                // Otherwise, add the symbol to this thunk unless another
                // relocation already did. The fetch-or decides ownership.
                isec.range_extn[i].set(thunk.thunk_idx as i32, -1);

                if !sym
                    .merge_flags(SymbolFlags::NEEDS_THUNK)
                    .contains(SymbolFlags::NEEDS_THUNK)
                {
                    thunk.symbols.lock().unwrap().push(sym_id);
                }
            }
        });

        offset += thunk.size();

        // Sort the thunk's symbols to make the output deterministic, then
        // assign each its entry index. The global symbol id is an input-only
        // total order (file order times local symbol order).
        {
            let syms = thunk.symbols.get_mut().unwrap();
            syms.sort_unstable();
            for (i, &sid) in syms.iter().enumerate() {
                ctx.symbols[sid as usize].set_thunk(thunk.thunk_idx as i32, i as i32);
            }
        }

        // Scan the group again to fill in the entry indices of relocations
        // whose symbol was freshly added above.
        members[b..c].par_iter().for_each(|&id| {
            let isec = &sections[id as usize];
            for (i, rel) in isec.rels.iter().enumerate() {
                let r = &isec.range_extn[i];
                if r.thunk_idx() == thunk.thunk_idx as i32 {
                    let sym_id = ctx.symbol_id(isec.file, rel.r_sym);
                    r.set_sym_idx(ctx.symbols[sym_id as usize].thunk_sym_idx());
                }
            }
        });

        thunks.push(thunk);

        // Move B forward to the beginning of the next group.
        b = c;
    }

    while a < thunks.len() {
        reset_thunk(&mut thunks[a], &ctx.symbols);
        a += 1;
    }

    (thunks, offset)
}

/// Re-evaluate every redirected relocation against the current (real)
/// layout and mark the thunk entries that are still needed.
fn mark_thunk_symbols(ctx: &Context, osec: &OutputSection) {
    osec.members.par_iter().for_each(|&id| {
        let isec = &ctx.sections[id as usize];
        for (i, rel) in isec.rels.iter().enumerate() {
            let r = &isec.range_extn[i];
            if r.thunk_idx() == -1 {
                continue;
            }
            let sym_id = ctx.symbol_id(isec.file, rel.r_sym);
            let sym = &ctx.symbols[sym_id as usize];
            if !is_reachable(ctx, sym, isec, rel) {
                osec.thunks[r.thunk_idx() as usize].used[r.sym_idx() as usize]
                    .store(true, Ordering::Relaxed);
            }
        }
    });
}

/// Drop the entries of a thunk that no relocation marked, recording the
/// compaction in `symbol_map`.
fn compact_thunk(thunk: &mut RangeExtensionThunk) {
    let RangeExtensionThunk {
        symbols,
        symbol_map,
        used,
        ..
    } = thunk;
    let syms = symbols.get_mut().unwrap();
    let mut i = 0usize;
    for j in 0..syms.len() {
        if used[j].load(Ordering::Relaxed) {
            symbol_map[j] = i as u32;
            syms[i] = syms[j];
            i += 1;
        }
    }
    syms.truncate(i);
}

/// Re-pack the members and (now compacted) thunks of a section in their
/// current offset order. The new size never exceeds the old one, so every
/// branch that could reach its thunk still can.
pub fn shrink_section(osec: &mut OutputSection, sections: &[InputSection]) {
    let mut offset: u64 = 0;
    let mut t = 0usize;
    let mut m = 0usize;

    let members = &osec.members;
    let thunks = &mut osec.thunks;

    while t < thunks.len() && m < members.len() {
        let isec = &sections[members[m] as usize];
        if thunks[t].offset < isec.offset() {
            thunks[t].offset = offset;
            offset += thunks[t].size();
            t += 1;
        } else {
            offset = align_to(offset, isec.shdr.sh_addralign);
            isec.set_offset(offset);
            offset += isec.shdr.sh_size;
            m += 1;
        }
    }
    while t < thunks.len() {
        thunks[t].offset = offset;
        offset += thunks[t].size();
        t += 1;
    }
    while m < members.len() {
        let isec = &sections[members[m] as usize];
        offset = align_to(offset, isec.shdr.sh_addralign);
        isec.set_offset(offset);
        offset += isec.shdr.sh_size;
        m += 1;
    }

    debug_assert!(offset <= osec.shdr.sh_size);
    osec.shdr.sh_size = offset;
}

/// Interleave range-extension thunks with the input sections of every
/// executable output section until each call/jump relocation reaches its
/// target, then compute the final layout. Returns the total image size.
pub fn create_range_extension_thunks(ctx: &mut Context) -> u64 {
    let start = Instant::now();

    // First, create thunks with the pessimistic assumption that every
    // cross-section branch needs one: spread the chunks so far apart that
    // nothing reaches anything outside its own section.
    let mut i: u64 = 0;
    for chunk in [
        &mut ctx.got,
        &mut ctx.gotplt,
        &mut ctx.plt,
        &mut ctx.pltgot,
        &mut ctx.reldyn,
    ] {
        chunk.shdr.sh_addr = i << 31;
        i += 1;
    }
    for osec in &mut ctx.output_sections {
        osec.shdr.sh_addr = i << 31;
        i += 1;
    }

    let exec: Vec<usize> = ctx
        .output_sections
        .iter()
        .enumerate()
        .filter(|(_, o)| {
            !o.members.is_empty() && o.shdr.sh_flags & SHF_EXECINSTR as u64 != 0
        })
        .map(|(i, _)| i)
        .collect();

    for &id in &exec {
        let (thunks, size) = create_thunks(ctx, &ctx.output_sections[id]);
        let osec = &mut ctx.output_sections[id];
        osec.thunks = thunks;
        osec.shdr.sh_size = size;
    }

    // Recompute the file layout.
    set_osec_offsets(ctx);

    // Based on the current layout, drop the thunk entries that turned out
    // to be unnecessary.
    for &id in &exec {
        for thunk in &mut ctx.output_sections[id].thunks {
            let n = thunk.symbols.get_mut().unwrap().len();
            thunk.symbol_map = vec![0; n];
            thunk.used = (0..n).map(|_| AtomicBool::new(false)).collect();
        }
    }
    {
        let ctx = &*ctx;
        exec.par_iter()
            .for_each(|&id| mark_thunk_symbols(ctx, &ctx.output_sections[id]));
    }
    for &id in &exec {
        ctx.output_sections[id]
            .thunks
            .par_iter_mut()
            .for_each(compact_thunk);
    }

    // Shrunk sizes are never larger than before, so every relocation that
    // was reachable stays reachable.
    {
        let Context {
            ref sections,
            ref mut output_sections,
            ..
        } = *ctx;
        for &id in &exec {
            shrink_section(&mut output_sections[id], sections);
        }
    }

    // Compute the final layout.
    let total = set_osec_offsets(ctx);
    log::debug!(
        "[Thunk] planned {} executable section(s) in {:?}",
        exec.len(),
        start.elapsed()
    );
    total
}

/// Emit every thunk into the output image.
pub fn write_thunks(ctx: &Context) {
    ctx.output_sections.par_iter().for_each(|osec| {
        osec.thunks.par_iter().for_each(|thunk| {
            let syms = thunk.symbols.lock().unwrap();
            if syms.is_empty() {
                return;
            }
            let buf = unsafe {
                ctx.buf.slice_mut(
                    (osec.shdr.sh_offset + thunk.offset) as usize,
                    syms.len() * THUNK_ENTRY_SIZE,
                )
            };
            for (i, &sid) in syms.iter().enumerate() {
                let s = ctx.symbols[sid as usize].get_addr(ctx);
                let p = osec.shdr.sh_addr + thunk.offset + (i * THUNK_ENTRY_SIZE) as u64;
                write_thunk_entry(&mut buf[i * THUNK_ENTRY_SIZE..], s, p);
            }
        });
    });
}
