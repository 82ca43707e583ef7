//! On-disk eligibility checks for candidate methods
//!
//! The selector works from what the host *says* a module contains. Before a
//! hook goes in, the inspector re-reads the module's binary from disk and
//! confirms the method is worth and safe to time:
//!
//! - the binary exists, is readable and parses (ELF, Mach-O, PE, COFF);
//! - a defined symbol for `Type::method` exists and has a body;
//! - the body is at least `min_body_bytes` long;
//! - the body never calls a hook-install operation, directly or through a
//!   helper defined in the same binary.
//!
//! Any failure means "skip". Callers log the reason and move on. That
//! includes a body whose calls cannot be followed: the inspector never
//! keeps a method it could not read to the end.
//!
//! Relocatable objects are followed through their relocations. Linked ELF
//! x86-64 images are followed through `call`/`jmp rel32` targets, with calls
//! into `.plt`, `.plt.sec` and `.plt.got` stubs and `call *slot(%rip)`
//! resolved to the imported symbol through the dynamic relocations on the
//! GOT. Linked images in any other format or architecture are unanalyzable.

use crate::config::MonitorConfig;
use crate::selector::Candidate;
use memmap2::Mmap;
use object::{
    Architecture, BinaryFormat, Object, ObjectKind, ObjectSection, ObjectSymbol,
    ObjectSymbolTable, RelocationTarget, SectionIndex, SymbolIndex, SymbolKind,
};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Why a candidate was skipped
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("binary path unknown")]
    UnknownPath,

    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse binary: {0}")]
    Parse(#[from] object::Error),

    #[error("symbol {0} not found")]
    SymbolNotFound(String),

    #[error("{0} has no body")]
    NoBody(String),

    #[error("{symbol} body is {len} bytes (minimum {min})")]
    Trivial { symbol: String, len: u64, min: u64 },

    #[error("{symbol} calls hook installer {installer}")]
    InstallsHooks { symbol: String, installer: String },

    #[error("calls not analyzable: {0}")]
    Unanalyzable(String),
}

impl InspectError {
    /// Skips decided by policy, as opposed to introspection failures
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Trivial { .. } | Self::InstallsHooks { .. })
    }
}

/// Strip a trailing legacy Rust hash (`::h0123456789abcdef`)
fn strip_hash(name: &str) -> &str {
    if let Some(pos) = name.rfind("::h") {
        let hash = &name[pos + 3..];
        if hash.len() == 16 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return &name[..pos];
        }
    }
    name
}

/// Demangle a raw symbol name into a plain `a::b::c` path
pub fn normalize_symbol(raw: &str) -> String {
    let demangled = addr2line::demangle_auto(Cow::Borrowed(raw), None);
    strip_hash(&demangled).replace(&['<', '>'][..], "")
}

/// Whether a raw symbol names `qualified` (matched on whole path segments)
///
/// # Example
/// ```
/// use modperf::inspector::symbol_matches;
///
/// assert!(symbol_matches("WeatherMod::update", "WeatherMod::update"));
/// assert!(symbol_matches("weather::WeatherMod::update::h0123456789abcdef", "WeatherMod::update"));
/// assert!(!symbol_matches("MyWeatherMod::update", "WeatherMod::update"));
/// ```
pub fn symbol_matches(raw: &str, qualified: &str) -> bool {
    let normalized = normalize_symbol(raw);
    normalized == qualified
        || normalized
            .strip_suffix(qualified)
            .is_some_and(|prefix| prefix.ends_with("::"))
}

/// Location of a function body inside a parsed binary
#[derive(Debug, Clone, Copy)]
struct Body {
    section: SectionIndex,
    address: u64,
    size: u64,
}

#[derive(Debug)]
pub struct EligibilityInspector {
    min_body_bytes: u64,
    max_helper_depth: usize,
    hook_install_symbols: Vec<String>,
    /// Binaries mapped during the current pass
    cache: Mutex<HashMap<PathBuf, Arc<Mmap>>>,
}

impl EligibilityInspector {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            min_body_bytes: config.min_body_bytes,
            max_helper_depth: config.max_helper_depth,
            hook_install_symbols: config.hook_install_symbols.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether `candidate` may be hooked
    ///
    /// `Ok(())` means keep; every `Err` means skip.
    pub fn inspect(
        &self,
        location: Option<&Path>,
        candidate: &Candidate,
    ) -> Result<(), InspectError> {
        let path = location.ok_or(InspectError::UnknownPath)?;
        let data = self.map(path)?;
        self.inspect_bytes(&data, &candidate.qualified_name())
    }

    /// Same as [`inspect`](Self::inspect) on an in-memory image
    pub fn inspect_bytes(&self, data: &[u8], qualified: &str) -> Result<(), InspectError> {
        let file = object::File::parse(data)?;

        let body = find_body(&file, qualified)?;
        if body.size < self.min_body_bytes {
            return Err(InspectError::Trivial {
                symbol: qualified.to_string(),
                len: body.size,
                min: self.min_body_bytes,
            });
        }

        let linked = match file.kind() {
            ObjectKind::Relocatable => None,
            _ => Some(LinkedCalls::new(&file)?),
        };
        let mut visited = HashSet::new();
        let installer = self.find_installer(&file, linked.as_ref(), body, 0, &mut visited)?;
        if let Some(installer) = installer {
            return Err(InspectError::InstallsHooks {
                symbol: qualified.to_string(),
                installer,
            });
        }
        Ok(())
    }

    /// Drop every mapped binary; the controller calls this after each pass
    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn map(&self, path: &Path) -> Result<Arc<Mmap>, InspectError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mmap) = cache.get(path) {
            return Ok(Arc::clone(mmap));
        }

        let unreadable = |source| InspectError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(unreadable)?;
        // SAFETY: the mapping is read-only and dropped at the end of the pass.
        let mmap = unsafe { Mmap::map(&file) }.map_err(unreadable)?;
        let mmap = Arc::new(mmap);
        cache.insert(path.to_path_buf(), Arc::clone(&mmap));
        Ok(mmap)
    }

    fn is_installer(&self, raw: &str) -> bool {
        self.hook_install_symbols
            .iter()
            .any(|installer| symbol_matches(raw, installer))
    }

    /// Classify a call target: installer name, helper body to follow, or neither
    fn check_target(
        &self,
        file: &object::File<'_>,
        linked: Option<&LinkedCalls>,
        target: SymbolIndex,
        depth: usize,
        visited: &mut HashSet<SymbolIndex>,
    ) -> Result<Option<String>, InspectError> {
        let symbol = file.symbol_by_index(target)?;
        let name = symbol.name()?;
        if self.is_installer(name) {
            return Ok(Some(normalize_symbol(name)));
        }

        // Imported and non-code targets have nothing to follow
        let Some(section) = symbol.section_index() else {
            return Ok(None);
        };
        if symbol.kind() != SymbolKind::Text
            || depth >= self.max_helper_depth
            || !visited.insert(target)
        {
            return Ok(None);
        }
        let helper = Body {
            section,
            address: symbol.address(),
            size: symbol.size(),
        };
        self.find_installer(file, linked, helper, depth + 1, visited)
    }

    /// Name of the first hook installer `body` reaches, if any
    fn find_installer(
        &self,
        file: &object::File<'_>,
        linked: Option<&LinkedCalls>,
        body: Body,
        depth: usize,
        visited: &mut HashSet<SymbolIndex>,
    ) -> Result<Option<String>, InspectError> {
        let section = file.section_by_index(body.section)?;
        let outside = || {
            InspectError::Unanalyzable(format!(
                "body at {:#x} lies outside its section",
                body.address
            ))
        };
        let start = body.address.checked_sub(section.address()).ok_or_else(outside)?;
        let end = start.checked_add(body.size).ok_or_else(outside)?;

        let Some(linked) = linked else {
            for (offset, relocation) in section.relocations() {
                if offset < start || offset >= end {
                    continue;
                }
                if let RelocationTarget::Symbol(target) = relocation.target() {
                    let installer = self.check_target(file, None, target, depth, visited)?;
                    if installer.is_some() {
                        return Ok(installer);
                    }
                }
            }
            return Ok(None);
        };

        let data = section.data()?;
        let code = usize::try_from(start)
            .ok()
            .zip(usize::try_from(end).ok())
            .and_then(|(start, end)| data.get(start..end))
            .ok_or_else(outside)?;

        for target in direct_branch_targets(code, body.address) {
            if let Some(&index) = linked.starts.get(&target) {
                if let Some(installer) =
                    self.check_target(file, Some(linked), index, depth, visited)?
                {
                    return Ok(Some(installer));
                }
            } else if let Some(name) = linked.import_at_stub(target)? {
                if self.is_installer(name) {
                    return Ok(Some(normalize_symbol(name)));
                }
            }
        }
        for slot in indirect_branch_slots(code, body.address) {
            if let Some(name) = linked.imports.get(&slot) {
                if self.is_installer(name) {
                    return Ok(Some(normalize_symbol(name)));
                }
            }
        }
        Ok(None)
    }
}

/// Call resolution tables for a linked ELF x86-64 image
#[derive(Debug)]
struct LinkedCalls {
    /// Function start address to static symbol
    starts: HashMap<u64, SymbolIndex>,
    /// GOT slot address to imported symbol name
    imports: HashMap<u64, String>,
    /// PLT stub address to the GOT slot it jumps through
    stubs: HashMap<u64, u64>,
    plt: Vec<Range<u64>>,
}

impl LinkedCalls {
    fn new(file: &object::File<'_>) -> Result<Self, InspectError> {
        if file.format() != BinaryFormat::Elf || file.architecture() != Architecture::X86_64 {
            return Err(InspectError::Unanalyzable(format!(
                "no call scanner for linked {:?} {:?} images",
                file.format(),
                file.architecture()
            )));
        }

        let mut imports = HashMap::new();
        if let (Some(relocations), Some(symbols)) =
            (file.dynamic_relocations(), file.dynamic_symbol_table())
        {
            for (slot, relocation) in relocations {
                if let RelocationTarget::Symbol(index) = relocation.target() {
                    let symbol = symbols.symbol_by_index(index)?;
                    imports.insert(slot, symbol.name()?.to_string());
                }
            }
        }

        let mut stubs = HashMap::new();
        let mut plt = Vec::new();
        for section in file.sections() {
            if !matches!(section.name(), Ok(".plt" | ".plt.sec" | ".plt.got")) {
                continue;
            }
            let data = section.data()?;
            stubs.extend(plt_stubs(data, section.address()));
            plt.push(section.address()..section.address().saturating_add(section.size()));
        }

        Ok(Self {
            starts: function_starts(file),
            imports,
            stubs,
            plt,
        })
    }

    /// Imported name behind a branch to `target`; `None` outside every PLT
    fn import_at_stub(&self, target: u64) -> Result<Option<&str>, InspectError> {
        if !self.plt.iter().any(|range| range.contains(&target)) {
            return Ok(None);
        }
        self.stubs
            .get(&target)
            .and_then(|slot| self.imports.get(slot))
            .map(|name| Some(name.as_str()))
            .ok_or_else(|| {
                InspectError::Unanalyzable(format!("PLT call to {target:#x} has no import"))
            })
    }
}

/// Find the defined symbol for `qualified`, in the static or dynamic table
fn find_body(file: &object::File<'_>, qualified: &str) -> Result<Body, InspectError> {
    let mut declared = false;
    for symbol in file.symbols().chain(file.dynamic_symbols()) {
        let Ok(name) = symbol.name() else { continue };
        if !symbol_matches(name, qualified) {
            continue;
        }
        declared = true;
        if !symbol.is_definition() || symbol.size() == 0 {
            continue;
        }
        if let Some(section) = symbol.section_index() {
            return Ok(Body {
                section,
                address: symbol.address(),
                size: symbol.size(),
            });
        }
    }

    if declared {
        Err(InspectError::NoBody(qualified.to_string()))
    } else {
        Err(InspectError::SymbolNotFound(qualified.to_string()))
    }
}

/// Map from function start address to symbol
fn function_starts(file: &object::File<'_>) -> HashMap<u64, SymbolIndex> {
    file.symbols()
        .filter(|s| s.kind() == SymbolKind::Text && s.is_definition())
        .map(|s| (s.address(), s.index()))
        .collect()
}

/// Absolute targets of every `E8`/`E9 rel32` in `code`
///
/// This is a linear byte scan, not a disassembly, so it can report targets
/// that are really operand bytes. Those only matter if they land exactly on a
/// function start, and then the result leans toward skipping.
fn direct_branch_targets(code: &[u8], base: u64) -> Vec<u64> {
    let mut targets = Vec::new();
    for i in 0..code.len().saturating_sub(4) {
        if code[i] != 0xE8 && code[i] != 0xE9 {
            continue;
        }
        let Some(rel) = code.get(i + 1..i + 5) else { break };
        let rel = i32::from_le_bytes([rel[0], rel[1], rel[2], rel[3]]);
        let next = base.wrapping_add(i as u64 + 5);
        targets.push(next.wrapping_add(rel as i64 as u64));
    }
    targets
}

/// Stubs in a PLT section as `(stub address, GOT slot)`
///
/// Every `jmp *disp32(%rip)` is a stub body. The stub starts at the jump
/// itself or at a leading `endbr64` / `bnd` prefix, which is where callers
/// branch to.
fn plt_stubs(code: &[u8], base: u64) -> Vec<(u64, u64)> {
    const ENDBR64: [u8; 4] = [0xF3, 0x0F, 0x1E, 0xFA];
    const BND: u8 = 0xF2;

    let mut stubs = Vec::new();
    for i in 0..code.len().saturating_sub(5) {
        if code[i] != 0xFF || code[i + 1] != 0x25 {
            continue;
        }
        let Some(disp) = code.get(i + 2..i + 6) else { break };
        let disp = i32::from_le_bytes([disp[0], disp[1], disp[2], disp[3]]);
        let slot = base.wrapping_add(i as u64 + 6).wrapping_add(disp as i64 as u64);

        let mut start = i;
        if start >= 1 && code[start - 1] == BND {
            start -= 1;
        }
        if start >= ENDBR64.len() && code[start - ENDBR64.len()..start] == ENDBR64 {
            start -= ENDBR64.len();
        }
        stubs.push((base.wrapping_add(start as u64), slot));
    }
    stubs
}

/// GOT slots read by every `call`/`jmp *disp32(%rip)` in `code`
fn indirect_branch_slots(code: &[u8], base: u64) -> Vec<u64> {
    let mut slots = Vec::new();
    for i in 0..code.len().saturating_sub(5) {
        if code[i] != 0xFF || (code[i + 1] != 0x15 && code[i + 1] != 0x25) {
            continue;
        }
        let Some(disp) = code.get(i + 2..i + 6) else { break };
        let disp = i32::from_le_bytes([disp[0], disp[1], disp[2], disp[3]]);
        slots.push(base.wrapping_add(i as u64 + 6).wrapping_add(disp as i64 as u64));
    }
    slots
}
