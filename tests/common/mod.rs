#![allow(dead_code)]

use elf::abi::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE};
use elf_linker::{
    Context, ElfRel, InputSection, LinkOptions, OutputKind, SectionHeader, Symbol,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const EXEC_FLAGS: u64 = (SHF_ALLOC | SHF_EXECINSTR) as u64;
pub const DATA_FLAGS: u64 = (SHF_ALLOC | SHF_WRITE) as u64;

/// One input file feeding a `.text` and a `.data` output section; enough
/// scaffolding for most scenarios.
pub struct Fixture {
    pub ctx: Context,
    pub file: u32,
    pub text: u32,
    pub data: u32,
}

impl Fixture {
    pub fn new(output: OutputKind) -> Self {
        init_logger();
        let opts = LinkOptions {
            output,
            ..Default::default()
        };
        let mut ctx = Context::new(opts);
        let file = ctx.add_file("test.o");
        let text = ctx.add_output_section(".text", EXEC_FLAGS, 4);
        let data = ctx.add_output_section(".data", DATA_FLAGS, 8);
        Self {
            ctx,
            file,
            text,
            data,
        }
    }

    /// Add a zero-filled executable section carrying `rels`.
    pub fn add_text(&mut self, name: &str, size: u64, rels: Vec<ElfRel>) -> u32 {
        self.ctx.add_input_section(InputSection::new(
            self.file,
            name,
            SectionHeader::new(EXEC_FLAGS, size, 4),
            vec![0u8; size as usize],
            rels,
            self.text,
        ))
    }

    /// Add an executable section with a size but no backing bytes; used as
    /// layout filler in thunk tests so they stay cheap.
    pub fn add_filler(&mut self, name: &str, size: u64) -> u32 {
        self.ctx.add_input_section(InputSection::new(
            self.file,
            name,
            SectionHeader::new(EXEC_FLAGS, size, 4),
            Vec::new(),
            Vec::new(),
            self.text,
        ))
    }

    pub fn add_data(&mut self, name: &str, size: u64, rels: Vec<ElfRel>) -> u32 {
        self.ctx.add_input_section(InputSection::new(
            self.file,
            name,
            SectionHeader::new(DATA_FLAGS, size, 8),
            vec![0u8; size as usize],
            rels,
            self.data,
        ))
    }

    /// Register a symbol, returning the file-local index used in `ElfRel`.
    pub fn add_symbol(&mut self, sym: Symbol) -> u32 {
        self.ctx.add_symbol(self.file, sym)
    }

    /// Global symbol id of a file-local index.
    pub fn global(&self, local: u32) -> u32 {
        self.ctx.files[self.file as usize].symbols[local as usize]
    }

    pub fn sym(&self, local: u32) -> &Symbol {
        &self.ctx.symbols[self.global(local) as usize]
    }

    pub fn sym_mut(&mut self, local: u32) -> &mut Symbol {
        let id = self.global(local);
        &mut self.ctx.symbols[id as usize]
    }
}

pub fn read32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

pub fn read64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Recover the sign-extended 21-bit immediate of an `ADR`/`ADRP` word.
pub fn decode_adr_imm(word: u32) -> i64 {
    let immlo = ((word >> 29) & 3) as u64;
    let immhi = ((word >> 5) & 0x7_ffff) as u64;
    let imm = (immhi << 2) | immlo;
    ((imm << 43) as i64) >> 43
}

/// Recover the sign-extended 26-bit branch displacement in bytes.
pub fn decode_branch_disp(word: u32) -> i64 {
    let imm = (word & 0x3ff_ffff) as u64;
    (((imm << 38) as i64) >> 38) << 2
}
