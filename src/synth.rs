//! Synthetic module binaries
//!
//! Writes small x86-64 ELF images whose symbol table and call sites describe
//! a module's functions: how long each body is and which other symbols it
//! calls. Two shapes are produced. [`ModuleBinary::build`] emits a
//! relocatable object where calls are relocations. [`ModuleBinary::build_linked`]
//! emits a shared object where calls are resolved `rel32` branches and
//! imports go through `.plt` stubs and `.got` slots. The inspector reads both
//! exactly like a real extension binary, which lets the demo host and the
//! tests exercise the on-disk eligibility checks without a compiler at hand.

use anyhow::{Context, Result};
use object::elf;
use object::write::elf::{FileHeader, Rel, SectionHeader, Sym, Writer};
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolKind, SymbolScope,
};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const CALL_LEN: usize = 5;
const NOP: u8 = 0x90;
const RET: u8 = 0xC3;
const CALL_REL32: u8 = 0xE8;
const INT3: u8 = 0xCC;
const JMP_INDIRECT: [u8; 2] = [0xFF, 0x25];

const FUNCTION_ALIGN: usize = 16;
const PLT_ENTRY: usize = 16;
const GOT_ENTRY: usize = 8;

#[derive(Debug, Clone)]
struct FunctionDef {
    name: String,
    body_len: usize,
    calls: Vec<String>,
}

/// Builder for a synthetic module binary
///
/// # Example
/// ```
/// use modperf::synth::ModuleBinary;
///
/// let bytes = ModuleBinary::new()
///     .function("WeatherMod::update", 64)
///     .function_calling("WeatherMod::on_enable", 32, &["Harmony::Patch"])
///     .build()
///     .unwrap();
/// assert!(!bytes.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ModuleBinary {
    functions: Vec<FunctionDef>,
}

impl ModuleBinary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Function with a body of `body_len` bytes and no calls
    pub fn function(self, name: &str, body_len: usize) -> Self {
        self.function_calling(name, body_len, &[])
    }

    /// Function whose body calls each of `callees` in order
    ///
    /// Callees defined elsewhere in this builder resolve to those functions;
    /// anything else becomes an undefined (imported) symbol. The body grows
    /// if `body_len` is too short to hold the calls.
    pub fn function_calling(mut self, name: &str, body_len: usize, callees: &[&str]) -> Self {
        self.functions.push(FunctionDef {
            name: name.to_string(),
            body_len,
            calls: callees.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    /// Serialize to ELF bytes
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);

        let mut ids: HashMap<&str, SymbolId> = HashMap::new();
        for function in &self.functions {
            let id = obj.add_symbol(Symbol {
                name: function.name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
            ids.insert(function.name.as_str(), id);
        }
        for function in &self.functions {
            for callee in &function.calls {
                if !ids.contains_key(callee.as_str()) {
                    let id = obj.add_symbol(Symbol {
                        name: callee.as_bytes().to_vec(),
                        value: 0,
                        size: 0,
                        kind: SymbolKind::Text,
                        scope: SymbolScope::Linkage,
                        weak: false,
                        section: SymbolSection::Undefined,
                        flags: SymbolFlags::None,
                    });
                    ids.insert(callee.as_str(), id);
                }
            }
        }

        for function in &self.functions {
            let body = encode_body(function);
            let offset = obj.add_symbol_data(ids[function.name.as_str()], text, &body, 16);
            for (i, callee) in function.calls.iter().enumerate() {
                obj.add_relocation(
                    text,
                    Relocation {
                        offset: offset + (i * CALL_LEN + 1) as u64,
                        symbol: ids[callee.as_str()],
                        addend: -4,
                        flags: RelocationFlags::Generic {
                            kind: RelocationKind::Relative,
                            encoding: RelocationEncoding::X86Branch,
                            size: 32,
                        },
                    },
                )
                .with_context(|| format!("Failed to add relocation {} -> {}", function.name, callee))?;
            }
        }

        obj.write().context("Failed to write synthetic module binary")
    }

    /// Serialize to a linked x86-64 shared object
    ///
    /// Calls between functions of this builder branch straight to the callee.
    /// Every other callee is imported: its calls target a `.plt` stub doing
    /// `jmp *slot(%rip)` through a `.got` slot that carries a
    /// `R_X86_64_JUMP_SLOT` relocation against the imported symbol.
    pub fn build_linked(&self) -> Result<Vec<u8>> {
        let mut imports: Vec<&str> = Vec::new();
        for callee in self.functions.iter().flat_map(|f| &f.calls) {
            if !self.defines(callee) && !imports.contains(&callee.as_str()) {
                imports.push(callee);
            }
        }

        let bodies: Vec<Vec<u8>> = self.functions.iter().map(encode_body).collect();
        let mut offsets = Vec::with_capacity(bodies.len());
        let mut text_len = 0;
        for body in &bodies {
            text_len = align(text_len, FUNCTION_ALIGN);
            offsets.push(text_len);
            text_len += body.len();
        }

        let mut buffer = Vec::new();
        {
            let mut writer = Writer::new(Endianness::Little, true, &mut buffer);

            let text_name = writer.add_section_name(b".text");
            let plt_name = writer.add_section_name(b".plt");
            let got_name = writer.add_section_name(b".got");
            let rela_name = writer.add_section_name(b".rela.plt");

            let text_index = writer.reserve_section_index();
            let _plt_index = writer.reserve_section_index();
            let got_index = writer.reserve_section_index();
            let dynsym_index = writer.reserve_dynsym_section_index();
            writer.reserve_dynstr_section_index();
            let _rela_index = writer.reserve_section_index();
            writer.reserve_symtab_section_index();
            writer.reserve_strtab_section_index();
            writer.reserve_shstrtab_section_index();

            let function_names: Vec<_> = self
                .functions
                .iter()
                .map(|f| writer.add_string(f.name.as_bytes()))
                .collect();
            let import_names: Vec<_> = imports
                .iter()
                .map(|&name| writer.add_dynamic_string(name.as_bytes()))
                .collect();
            writer.require_dynstr();

            writer.reserve_null_dynamic_symbol_index();
            let import_symbols: Vec<_> = imports
                .iter()
                .map(|_| writer.reserve_dynamic_symbol_index())
                .collect();
            writer.reserve_null_symbol_index();
            for _ in &self.functions {
                writer.reserve_symbol_index(Some(text_index));
            }

            writer.reserve_file_header();
            let text_addr = writer.reserve(text_len, FUNCTION_ALIGN) as u64;
            let plt_addr = writer.reserve(imports.len() * PLT_ENTRY, PLT_ENTRY) as u64;
            let got_addr = writer.reserve(imports.len() * GOT_ENTRY, GOT_ENTRY) as u64;
            let dynsym_offset = writer.reserve_dynsym();
            let dynstr_offset = writer.reserve_dynstr();
            let rela_offset = writer.reserve_relocations(imports.len(), true);
            writer.reserve_symtab();
            writer.reserve_strtab();
            writer.reserve_shstrtab();
            writer.reserve_section_headers();

            let plt_stub = |import: usize| plt_addr + (import * PLT_ENTRY) as u64;
            let got_slot = |import: usize| got_addr + (import * GOT_ENTRY) as u64;

            let mut text = vec![INT3; text_len];
            for (i, (function, body)) in self.functions.iter().zip(&bodies).enumerate() {
                let mut body = body.clone();
                let start = text_addr + offsets[i] as u64;
                for (k, callee) in function.calls.iter().enumerate() {
                    let target = match self.functions.iter().position(|f| f.name == *callee) {
                        Some(j) => text_addr + offsets[j] as u64,
                        None => {
                            let import = imports
                                .iter()
                                .position(|name| name == callee)
                                .context("Callee missing from import table")?;
                            plt_stub(import)
                        }
                    };
                    let next = start + ((k + 1) * CALL_LEN) as u64;
                    body[k * CALL_LEN + 1..(k + 1) * CALL_LEN]
                        .copy_from_slice(&rel32(next, target)?.to_le_bytes());
                }
                text[offsets[i]..offsets[i] + body.len()].copy_from_slice(&body);
            }

            let mut plt = Vec::with_capacity(imports.len() * PLT_ENTRY);
            for import in 0..imports.len() {
                let next = plt_stub(import) + (JMP_INDIRECT.len() + 4) as u64;
                plt.extend_from_slice(&JMP_INDIRECT);
                plt.extend_from_slice(&rel32(next, got_slot(import))?.to_le_bytes());
                plt.resize((import + 1) * PLT_ENTRY, INT3);
            }

            writer
                .write_file_header(&FileHeader {
                    os_abi: elf::ELFOSABI_NONE,
                    abi_version: 0,
                    e_type: elf::ET_DYN,
                    e_machine: elf::EM_X86_64,
                    e_entry: 0,
                    e_flags: 0,
                })
                .context("Failed to write ELF header")?;
            writer.write_align(FUNCTION_ALIGN);
            writer.write(&text);
            writer.write_align(PLT_ENTRY);
            writer.write(&plt);
            writer.write_align(GOT_ENTRY);
            writer.write(&vec![0u8; imports.len() * GOT_ENTRY]);

            writer.write_null_dynamic_symbol();
            for name in &import_names {
                writer.write_dynamic_symbol(&Sym {
                    name: Some(*name),
                    section: None,
                    st_info: (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
                    st_other: elf::STV_DEFAULT,
                    st_shndx: elf::SHN_UNDEF,
                    st_value: 0,
                    st_size: 0,
                });
            }
            writer.write_dynstr();

            writer.write_align_relocation();
            for (import, symbol) in import_symbols.iter().enumerate() {
                writer.write_relocation(
                    true,
                    &Rel {
                        r_offset: got_slot(import),
                        r_sym: symbol.0,
                        r_type: elf::R_X86_64_JUMP_SLOT,
                        r_addend: 0,
                    },
                );
            }

            writer.write_null_symbol();
            for (i, name) in function_names.iter().enumerate() {
                writer.write_symbol(&Sym {
                    name: Some(*name),
                    section: Some(text_index),
                    st_info: (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
                    st_other: elf::STV_DEFAULT,
                    st_shndx: 0,
                    st_value: text_addr + offsets[i] as u64,
                    st_size: bodies[i].len() as u64,
                });
            }
            writer.write_strtab();
            writer.write_shstrtab();

            writer.write_null_section_header();
            writer.write_section_header(&SectionHeader {
                name: Some(text_name),
                sh_type: elf::SHT_PROGBITS,
                sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
                sh_addr: text_addr,
                sh_offset: text_addr,
                sh_size: text_len as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: FUNCTION_ALIGN as u64,
                sh_entsize: 0,
            });
            writer.write_section_header(&SectionHeader {
                name: Some(plt_name),
                sh_type: elf::SHT_PROGBITS,
                sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
                sh_addr: plt_addr,
                sh_offset: plt_addr,
                sh_size: plt.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: PLT_ENTRY as u64,
                sh_entsize: PLT_ENTRY as u64,
            });
            writer.write_section_header(&SectionHeader {
                name: Some(got_name),
                sh_type: elf::SHT_PROGBITS,
                sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
                sh_addr: got_addr,
                sh_offset: got_addr,
                sh_size: (imports.len() * GOT_ENTRY) as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: GOT_ENTRY as u64,
                sh_entsize: GOT_ENTRY as u64,
            });
            writer.write_dynsym_section_header(dynsym_offset as u64, 1);
            writer.write_dynstr_section_header(dynstr_offset as u64);
            writer.write_relocation_section_header(
                rela_name,
                got_index,
                dynsym_index,
                rela_offset,
                imports.len(),
                true,
            );
            writer.write_symtab_section_header(1);
            writer.write_strtab_section_header();
            writer.write_shstrtab_section_header();
        }
        Ok(buffer)
    }

    fn defines(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.name == name)
    }

    /// Build and write to `path`
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.build()?;
        fs::write(path.as_ref(), bytes)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))
    }
}

fn align(offset: usize, to: usize) -> usize {
    offset.next_multiple_of(to)
}

/// Displacement of a `rel32` branch whose next instruction is at `next`
fn rel32(next: u64, target: u64) -> Result<i32> {
    i32::try_from(target as i64 - next as i64).context("Branch target out of rel32 range")
}

/// `call rel32` per callee, NOP padding, trailing `ret`
fn encode_body(function: &FunctionDef) -> Vec<u8> {
    let min_len = function.calls.len() * CALL_LEN + 1;
    let len = function.body_len.max(min_len);

    let mut body = Vec::with_capacity(len);
    for _ in &function.calls {
        body.push(CALL_REL32);
        body.extend_from_slice(&[0; 4]);
    }
    body.resize(len - 1, NOP);
    body.push(RET);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Object as _, ObjectSection, ObjectSymbol, RelocationTarget};

    #[test]
    fn test_body_encoding() {
        let def = FunctionDef {
            name: "f".to_string(),
            body_len: 12,
            calls: vec!["g".to_string()],
        };
        let body = encode_body(&def);
        assert_eq!(body.len(), 12);
        assert_eq!(body[0], CALL_REL32);
        assert_eq!(body[5], NOP);
        assert_eq!(body[11], RET);
    }

    #[test]
    fn test_body_grows_to_fit_calls() {
        let def = FunctionDef {
            name: "f".to_string(),
            body_len: 1,
            calls: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(encode_body(&def).len(), 11);
    }

    #[test]
    fn test_written_object_has_sized_symbols_and_relocations() {
        let bytes = ModuleBinary::new()
            .function("Mod::update", 40)
            .function_calling("Mod::setup", 24, &["Harmony::Patch"])
            .build()
            .unwrap();
        let file = object::File::parse(&*bytes).unwrap();

        let update = file
            .symbols()
            .find(|s| s.name().map_or(false, |n| n == "Mod::update"))
            .unwrap();
        assert_eq!(update.size(), 40);
        assert!(update.is_definition());

        let text = file.section_by_name(".text").unwrap();
        let targets: Vec<String> = text
            .relocations()
            .filter_map(|(_, reloc)| match reloc.target() {
                RelocationTarget::Symbol(idx) => {
                    file.symbol_by_index(idx).ok()?.name().ok().map(str::to_string)
                }
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["Harmony::Patch"]);
    }

    #[test]
    fn test_linked_object_routes_imports_through_plt() {
        use object::{ObjectKind, ObjectSymbolTable};

        let bytes = ModuleBinary::new()
            .function_calling("Mod::setup", 24, &["Mod::helper", "Harmony::Patch"])
            .function("Mod::helper", 16)
            .build_linked()
            .unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.kind(), ObjectKind::Dynamic);

        let setup = file
            .symbols()
            .find(|s| s.name().map_or(false, |n| n == "Mod::setup"))
            .unwrap();
        let helper = file
            .symbols()
            .find(|s| s.name().map_or(false, |n| n == "Mod::helper"))
            .unwrap();
        assert_eq!(setup.size(), 24);
        assert!(setup.is_definition());

        let text = file.section_by_name(".text").unwrap();
        let code = &text.data().unwrap()[(setup.address() - text.address()) as usize..];
        let target = |k: usize| {
            let at = k * CALL_LEN;
            let rel = i32::from_le_bytes(code[at + 1..at + 5].try_into().unwrap());
            (setup.address() + (at + CALL_LEN) as u64).wrapping_add(rel as i64 as u64)
        };
        assert_eq!(target(0), helper.address());

        let plt = file.section_by_name(".plt").unwrap();
        assert_eq!(target(1), plt.address());

        let dynsyms = file.dynamic_symbol_table().unwrap();
        let imports: Vec<(u64, String)> = file
            .dynamic_relocations()
            .unwrap()
            .filter_map(|(slot, reloc)| match reloc.target() {
                RelocationTarget::Symbol(idx) => {
                    Some((slot, dynsyms.symbol_by_index(idx).ok()?.name().ok()?.to_string()))
                }
                _ => None,
            })
            .collect();
        let got = file.section_by_name(".got").unwrap();
        assert_eq!(imports, vec![(got.address(), "Harmony::Patch".to_string())]);
    }

    #[test]
    fn test_write_to_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ext.o");
        ModuleBinary::new().function("A::b", 16).write_to(&path).unwrap();
        assert!(path.metadata().unwrap().len() > 0);
    }
}
