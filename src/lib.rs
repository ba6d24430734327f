//! AArch64 back end of a parallel ELF linker.
//!
//! Given input sections with parsed relocation tables and resolved symbols,
//! this crate classifies how every symbol must be reached (directly, via
//! GOT, PLT, TLS helpers, copy relocation, dynamic relocation, or a
//! range-extension thunk), synthesizes the PLT and thunk code with
//! bit-exact AArch64 encodings, interleaves thunks with input sections
//! until every `B`/`BL` reaches its target, and patches each relocation
//! site in the output image.
//!
//! The surrounding linker owns everything else: command-line handling, file
//! parsing, symbol resolution, section merging, and the generic dynamic
//! section, GOT and symbol-table builders.
//!
//! The passes run in this order:
//!
//! 1. [`scan_relocations`] classifies relocations and raises per-symbol
//!    capability flags.
//! 2. [`reserve_dynrel`] and [`reserve_synthetic_entries`] turn those flags
//!    into reserved `.rela.dyn` windows and GOT/PLT slots.
//! 3. [`create_range_extension_thunks`] finds a stable, minimal layout.
//! 4. [`link`]'s emission stage copies section bytes, applies relocations,
//!    and writes the PLT and thunks, all in parallel over disjoint slices
//!    of the output image.

mod arch;
mod context;
mod error;
mod layout;
mod relocation;
mod section;
mod symbol;
mod synth;
mod thunk;

use elf::abi::SHF_ALLOC;
use rayon::prelude::*;

pub use arch::{
    BRANCH_REACH, EM_ARCH, PLT_ENTRY_SIZE, PLT_HDR_SIZE, PLTGOT_ENTRY_SIZE, THUNK_ENTRY_SIZE,
    bits, page, rel_type_to_str, write_adr, write_plt_entry, write_plt_header, write_pltgot_entry,
    write_thunk_entry,
};
pub use context::{Context, LinkOptions, ObjectFile, OutputBuffer, OutputKind, SyntheticSection};
pub use error::{DiagnosticSink, Error};
pub use layout::{align_to, set_osec_offsets};
pub use relocation::{
    ElfRel, RelocationAction, apply_eh_frame_reloc, apply_reloc_alloc, apply_reloc_nonalloc,
    is_relr_reloc, reserve_dynrel, scan_relocations,
};
pub use section::{Fragment, FragmentRef, InputSection, OutputSection, SectionHeader};
pub use symbol::{Symbol, SymbolFlags};
pub use synth::{copy_gotplt, copy_plt, copy_pltgot, reserve_synthetic_entries};
pub use thunk::{
    RangeExtensionRef, RangeExtensionThunk, create_range_extension_thunks, shrink_section,
    write_thunks,
};

pub type Result<T> = std::result::Result<T, Error>;

use relocation::DYNREL_SIZE;

/// Run the whole back end over a prepared [`Context`] and return the total
/// image size. The image bytes are left in `ctx.buf`.
pub fn link(ctx: &mut Context) -> Result<u64> {
    scan_relocations(ctx);
    // Scan diagnostics (unknown or illegal relocations, undefined symbols)
    // make applying pointless; stop here.
    ctx.diags.finish()?;

    reserve_dynrel(ctx);
    reserve_synthetic_entries(ctx);

    let total = create_range_extension_thunks(ctx);
    ctx.buf.resize(total as usize);

    copy_sections(ctx)?;
    copy_plt(ctx);
    copy_gotplt(ctx);
    copy_pltgot(ctx);
    write_thunks(ctx);

    ctx.diags.finish()?;
    Ok(total)
}

/// Copy every input section into the image and apply its relocations.
/// Each worker writes only its own section's slice and its own reserved
/// `.rela.dyn` window.
fn copy_sections(ctx: &Context) -> Result<()> {
    (0..ctx.sections.len()).into_par_iter().try_for_each(|i| {
        let isec = &ctx.sections[i];
        let osec = &ctx.output_sections[isec.output_section as usize];
        let size = isec.shdr.sh_size as usize;
        if size == 0 {
            return Ok(());
        }

        let base = unsafe {
            ctx.buf
                .slice_mut((osec.shdr.sh_offset + isec.offset()) as usize, size)
        };
        let have = isec.data.len().min(size);
        base[..have].copy_from_slice(&isec.data[..have]);

        if isec.shdr.sh_flags & SHF_ALLOC as u64 != 0 {
            let dynrel = unsafe {
                ctx.buf.slice_mut(
                    (ctx.reldyn.shdr.sh_offset + isec.reldyn_offset) as usize,
                    (isec.num_dynrel * DYNREL_SIZE) as usize,
                )
            };
            apply_reloc_alloc(ctx, isec, base, dynrel);
            Ok(())
        } else {
            apply_reloc_nonalloc(ctx, isec, base)
        }
    })
}
