//! Relocation scanning.
//!
//! Runs over all allocated input sections before any layout exists and
//! decides, per relocation and per symbol, how each reference will be
//! resolved. The capability flags raised here drive the GOT/PLT builders;
//! the per-relocation side tables drive the applier.

use elf::abi::*;
use rayon::prelude::*;

use crate::arch::rel_type_to_str;
use crate::context::{Context, LinkOptions, ObjectFile};
use crate::error::{DiagnosticSink, unknown_relocation_error};
use crate::relocation::{ActionTable, DYNREL_SIZE, RelocationAction as A, dispatch};
use crate::section::InputSection;
use crate::symbol::{Symbol, SymbolFlags};

const ABS64_TABLE: ActionTable = [
    // Absolute  Local       Imported data  Imported code
    [A::None, A::Baserel, A::Dynrel, A::Dynrel], // DSO
    [A::None, A::Baserel, A::Dynrel, A::Dynrel], // PIE
    [A::None, A::None, A::Copyrel, A::Plt],      // PDE
];

const ADR_PREL_PG_HI21_TABLE: ActionTable = [
    // Absolute  Local    Imported data  Imported code
    [A::None, A::None, A::Error, A::Error], // DSO
    [A::None, A::None, A::Copyrel, A::Plt], // PIE
    [A::None, A::None, A::Copyrel, A::Plt], // PDE
];

/// Scan the relocations of every allocated input section in parallel.
pub fn scan_relocations(ctx: &mut Context) {
    let Context {
        ref opts,
        ref files,
        ref symbols,
        ref mut sections,
        ref diags,
        ..
    } = *ctx;

    sections.par_iter_mut().for_each(|isec| {
        if isec.shdr.sh_flags & SHF_ALLOC as u64 != 0 {
            scan_section(opts, files, symbols, isec, diags);
        }
    });
}

fn scan_section(
    opts: &LinkOptions,
    files: &[ObjectFile],
    symbols: &[Symbol],
    isec: &mut InputSection,
    diags: &DiagnosticSink,
) {
    for i in 0..isec.rels.len() {
        let rel = isec.rels[i];
        if rel.r_type == R_AARCH64_NONE {
            continue;
        }

        let sym_id = files[isec.file as usize].symbols[rel.r_sym as usize];
        let sym = &symbols[sym_id as usize];

        if sym.is_undef() {
            if sym.bind != STB_WEAK {
                diags.report_undef(sym_id, &sym.name, &isec.name);
            }
            continue;
        }

        if sym.sym_type == STT_GNU_IFUNC {
            sym.merge_flags(SymbolFlags::NEEDS_GOT | SymbolFlags::NEEDS_PLT);
        }

        match rel.r_type {
            R_AARCH64_ABS64 => {
                dispatch(opts, diags, isec, i, &rel, sym, &ABS64_TABLE);
            }
            R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC | R_AARCH64_LD64_GOTPAGE_LO15 => {
                sym.merge_flags(SymbolFlags::NEEDS_GOT);
            }
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                if sym.is_imported {
                    sym.merge_flags(SymbolFlags::NEEDS_PLT | SymbolFlags::NEEDS_DYNSYM);
                }
            }
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                sym.merge_flags(SymbolFlags::NEEDS_GOTTP);
            }
            R_AARCH64_ADR_PREL_PG_HI21 => {
                dispatch(opts, diags, isec, i, &rel, sym, &ADR_PREL_PG_HI21_TABLE);
            }
            R_AARCH64_TLSGD_ADR_PAGE21 => {
                sym.merge_flags(SymbolFlags::NEEDS_TLSGD);
            }
            R_AARCH64_TLSDESC_ADR_PAGE21 | R_AARCH64_TLSDESC_LD64_LO12
            | R_AARCH64_TLSDESC_ADD_LO12 => {
                if !opts.relax_tlsdesc || sym.is_imported {
                    sym.merge_flags(SymbolFlags::NEEDS_TLSDESC);
                }
            }
            R_AARCH64_ADD_ABS_LO12_NC
            | R_AARCH64_ADR_PREL_LO21
            | R_AARCH64_CONDBR19
            | R_AARCH64_LDST8_ABS_LO12_NC
            | R_AARCH64_LDST16_ABS_LO12_NC
            | R_AARCH64_LDST32_ABS_LO12_NC
            | R_AARCH64_LDST64_ABS_LO12_NC
            | R_AARCH64_LDST128_ABS_LO12_NC
            | R_AARCH64_MOVW_UABS_G0_NC
            | R_AARCH64_MOVW_UABS_G1_NC
            | R_AARCH64_MOVW_UABS_G2_NC
            | R_AARCH64_MOVW_UABS_G3
            | R_AARCH64_PREL16
            | R_AARCH64_PREL32
            | R_AARCH64_PREL64
            | R_AARCH64_TLSLE_ADD_TPREL_HI12
            | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC
            | R_AARCH64_TLSGD_ADD_LO12_NC
            | R_AARCH64_TLSDESC_CALL => {}
            _ => diags.report(unknown_relocation_error(format!(
                "{}: {} ({})",
                isec.name,
                rel_type_to_str(rel.r_type),
                rel.r_type,
            ))),
        }
    }
}

/// Turn the per-section dynamic-relocation counts collected by the scanner
/// into reserved byte windows in `.rela.dyn`. The applier writes into its
/// own window only, so emission never races on growth.
pub fn reserve_dynrel(ctx: &mut Context) {
    let mut offset = 0u64;
    for isec in &mut ctx.sections {
        isec.reldyn_offset = offset;
        offset += isec.num_dynrel * DYNREL_SIZE;
    }
    ctx.reldyn.shdr.sh_size = offset;
}
