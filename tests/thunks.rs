mod common;

use common::{Fixture, decode_adr_imm, decode_branch_disp, read32};
use elf::abi::*;
use elf_linker::{
    BRANCH_REACH, ElfRel, OutputKind, Symbol, THUNK_ENTRY_SIZE, bits,
    create_range_extension_thunks, reserve_dynrel, reserve_synthetic_entries, scan_relocations,
    set_osec_offsets, shrink_section,
};

const MIB: u64 = 1024 * 1024;

/// A caller at the start of `.text` and a callee 200 MiB away, far past the
/// ±128 MiB branch reach.
fn far_call_fixture() -> (Fixture, u32, u32) {
    let mut f = Fixture::new(OutputKind::Executable);
    let callee = f.add_symbol(Symbol::defined("far_away", 0, 9999, 0));
    let caller = f.add_text(
        "t.o:(.text.start)",
        0x1000,
        vec![ElfRel::new(0, R_AARCH64_CALL26, callee, 0)],
    );
    for i in 0..20 {
        f.add_filler(&format!("t.o:(.text.fill{i})"), 10 * MIB);
    }
    let target_sec = f.add_filler("t.o:(.text.target)", 0x1000);
    f.sym_mut(callee).isec = Some(target_sec);
    (f, caller, callee)
}

fn plan(f: &mut Fixture) -> u64 {
    scan_relocations(&mut f.ctx);
    reserve_dynrel(&mut f.ctx);
    reserve_synthetic_entries(&mut f.ctx);
    create_range_extension_thunks(&mut f.ctx)
}

#[test]
fn far_call_gets_a_thunk_within_reach() {
    let (mut f, caller, callee) = far_call_fixture();
    plan(&mut f);

    let osec = &f.ctx.output_sections[f.text as usize];
    let surviving: usize = osec.thunks.iter().map(|t| t.symbols().len()).sum();
    assert_eq!(surviving, 1);

    let isec = &f.ctx.sections[caller as usize];
    let r = &isec.range_extn[0];
    assert!(r.thunk_idx() >= 0);
    assert!(r.sym_idx() >= 0);

    // Apply the caller's relocations and follow the branch.
    let mut base = vec![0u8; 0x1000];
    let mut dynrel: Vec<u8> = Vec::new();
    elf_linker::apply_reloc_alloc(&f.ctx, isec, &mut base, &mut dynrel);
    let disp = decode_branch_disp(read32(&base, 0));
    assert!((-BRANCH_REACH..BRANCH_REACH).contains(&disp));

    let p = osec.shdr.sh_addr + isec.offset();
    let branch_target = (p as i64 + disp) as u64;
    let thunk = &osec.thunks[r.thunk_idx() as usize];
    assert_eq!(branch_target, thunk.get_addr(osec.shdr.sh_addr, r.sym_idx() as usize));

    // The thunk itself must reach the callee's real address.
    let s = f.ctx.symbols[f.global(callee) as usize].get_addr(&f.ctx);
    let mut entry = [0u8; THUNK_ENTRY_SIZE];
    elf_linker::write_thunk_entry(&mut entry, s, branch_target);
    let formed = ((elf_linker::page(branch_target) as i64
        + (decode_adr_imm(read32(&entry, 0)) << 12)) as u64)
        + bits(read32(&entry, 4) as u64, 21, 10);
    assert_eq!(formed, s);
}

#[test]
fn near_calls_need_no_thunks() {
    let mut f = Fixture::new(OutputKind::Executable);
    let callee = f.add_symbol(Symbol::defined("near", 0, 9999, 0));
    f.add_text(
        "t.o:(.text.a)",
        0x1000,
        vec![ElfRel::new(0, R_AARCH64_CALL26, callee, 0)],
    );
    let tsec = f.add_filler("t.o:(.text.b)", 0x1000);
    f.sym_mut(callee).isec = Some(tsec);

    plan(&mut f);

    let osec = &f.ctx.output_sections[f.text as usize];
    let surviving: usize = osec.thunks.iter().map(|t| t.symbols().len()).sum();
    assert_eq!(surviving, 0);
    assert_eq!(f.ctx.sections[0].range_extn[0].thunk_idx(), -1);
}

#[test]
fn absolute_targets_are_always_thunked() {
    let mut f = Fixture::new(OutputKind::Executable);
    // Within direct reach of the image base, but absolute symbols may drift
    // out of range while sections shrink, so a thunk is kept regardless.
    let target = f.add_symbol(Symbol::absolute("vector_table", 0, 0x20_0000));
    f.add_text(
        "t.o:(.text)",
        0x1000,
        vec![ElfRel::new(0, R_AARCH64_CALL26, target, 0)],
    );

    plan(&mut f);

    let osec = &f.ctx.output_sections[f.text as usize];
    let surviving: usize = osec.thunks.iter().map(|t| t.symbols().len()).sum();
    assert_eq!(surviving, 1);
}

#[test]
fn branch_reach_holds_for_every_call_after_planning() {
    let (f, ..) = {
        let (mut f, caller, callee) = far_call_fixture();
        plan(&mut f);
        (f, caller, callee)
    };

    for isec in &f.ctx.sections {
        let osec = &f.ctx.output_sections[isec.output_section as usize];
        for (i, rel) in isec.rels.iter().enumerate() {
            if rel.r_type != R_AARCH64_CALL26 && rel.r_type != R_AARCH64_JUMP26 {
                continue;
            }
            let sym = &f.ctx.symbols[f.ctx.files[isec.file as usize].symbols
                [rel.r_sym as usize] as usize];
            let p = osec.shdr.sh_addr + isec.offset() + rel.r_offset;
            let direct = sym.get_addr(&f.ctx) as i64 + rel.r_addend - p as i64;

            let reachable = if (-BRANCH_REACH..BRANCH_REACH).contains(&direct) {
                true
            } else {
                let r = &isec.range_extn[i];
                assert!(r.thunk_idx() >= 0, "out-of-range call without a thunk");
                let thunk = &osec.thunks[r.thunk_idx() as usize];
                let via = thunk.get_addr(osec.shdr.sh_addr, r.sym_idx() as usize) as i64
                    + rel.r_addend
                    - p as i64;
                (-BRANCH_REACH..BRANCH_REACH).contains(&via)
            };
            assert!(reachable);
        }
    }
}

#[test]
fn planning_is_deterministic() {
    let run = || {
        let mut f = Fixture::new(OutputKind::Executable);
        // Several absolute targets so thunks survive into emission while the
        // image stays small.
        let mut rels = Vec::new();
        for (i, name) in ["isr0", "isr1", "isr2", "isr3"].iter().enumerate() {
            let local = f.add_symbol(Symbol::absolute(*name, 0, 0x1_0000 + i as u64 * 0x100));
            rels.push(ElfRel::new(i as u64 * 4, R_AARCH64_CALL26, local, 0));
        }
        let ext = f.add_symbol(Symbol::imported("extfn", STT_FUNC));
        rels.push(ElfRel::new(16, R_AARCH64_CALL26, ext, 0));
        f.add_text("t.o:(.text)", 0x1000, rels);
        let total = elf_linker::link(&mut f.ctx).unwrap();
        (total, f.ctx.buf.as_slice().to_vec())
    };

    let (size_a, image_a) = run();
    let (size_b, image_b) = run();
    assert_eq!(size_a, size_b);
    assert_eq!(image_a, image_b);
}

#[test]
fn shrinking_is_monotonic_and_idempotent() {
    let (mut f, ..) = far_call_fixture();
    let total = plan(&mut f);

    let text = f.text as usize;
    let before_size = f.ctx.output_sections[text].shdr.sh_size;
    let member_offsets: Vec<u64> = f.ctx.output_sections[text]
        .members
        .iter()
        .map(|&id| f.ctx.sections[id as usize].offset())
        .collect();
    let thunk_offsets: Vec<u64> = f.ctx.output_sections[text]
        .thunks
        .iter()
        .map(|t| t.offset)
        .collect();

    // A second shrink over the already-stable layout must not move anything.
    {
        let elf_linker::Context {
            ref sections,
            ref mut output_sections,
            ..
        } = f.ctx;
        shrink_section(&mut output_sections[text], sections);
    }
    let total2 = set_osec_offsets(&mut f.ctx);

    assert_eq!(f.ctx.output_sections[text].shdr.sh_size, before_size);
    assert_eq!(total2, total);
    let member_offsets2: Vec<u64> = f.ctx.output_sections[text]
        .members
        .iter()
        .map(|&id| f.ctx.sections[id as usize].offset())
        .collect();
    let thunk_offsets2: Vec<u64> = f.ctx.output_sections[text]
        .thunks
        .iter()
        .map(|t| t.offset)
        .collect();
    assert_eq!(member_offsets, member_offsets2);
    assert_eq!(thunk_offsets, thunk_offsets2);
}

#[test]
fn member_and_thunk_offsets_interleave_monotonically() {
    let (mut f, ..) = far_call_fixture();
    plan(&mut f);

    let osec = &f.ctx.output_sections[f.text as usize];
    let mut spans: Vec<(u64, u64)> = osec
        .members
        .iter()
        .map(|&id| {
            let s = &f.ctx.sections[id as usize];
            (s.offset(), s.shdr.sh_size)
        })
        .chain(osec.thunks.iter().map(|t| (t.offset, t.size())))
        .collect();
    spans.sort_by_key(|&(off, _)| off);

    let mut end = 0u64;
    for (off, size) in spans {
        assert!(off >= end, "overlapping layout at {off:#x}");
        end = off + size;
    }
    assert!(end <= osec.shdr.sh_size);
}
