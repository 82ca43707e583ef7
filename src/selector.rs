//! Candidate selection: which methods of a module are worth hooking
//!
//! Works purely on the host's type descriptions. Binary-level checks happen
//! afterwards in [`crate::inspector`].
//!
//! Rules, in order:
//! 1. Modules without a type deriving from an extension base are ignored.
//! 2. Compiler-generated types (`<`, `>`, `{`, `}` in the name) are skipped.
//! 3. Types that carry, declare or nest an interception-framework marker are
//!    skipped, so the monitor never hooks patching machinery.
//! 4. Compiler-generated method names are skipped.
//! 5. In the monitor's own module only the configured entry points survive.
//!
//! On top of that, methods marked with the opt-out attribute or listed in
//! `never_instrument` are dropped.

use crate::config::MonitorConfig;
use crate::module::{CallSite, ModuleId, ModuleSource, TypeDescriptor};
use anyhow::Result;
use std::collections::HashSet;

/// A (type, method) pair that passed selection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub module: ModuleId,
    /// Declaring type; nested types are spelled `Outer::Inner`
    pub type_name: String,
    pub method: String,
}

impl Candidate {
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.type_name, self.method)
    }

    pub fn call_site(&self) -> CallSite {
        CallSite::new(self.module.clone(), &self.type_name, &self.method)
    }
}

/// True for names the compiler invents (closures, anonymous types, ...)
pub fn is_compiler_generated(name: &str) -> bool {
    name.contains(&['<', '>', '{', '}'][..])
}

struct FlatType<'a> {
    name: String,
    ty: &'a TypeDescriptor,
}

fn flatten<'a>(types: &'a [TypeDescriptor], prefix: Option<&str>, out: &mut Vec<FlatType<'a>>) {
    for ty in types {
        let name = match prefix {
            Some(outer) => format!("{}::{}", outer, ty.name),
            None => ty.name.clone(),
        };
        flatten(&ty.nested, Some(&name), out);
        out.push(FlatType { name, ty });
    }
}

#[derive(Debug, Clone)]
pub struct CandidateSelector {
    extension_bases: Vec<String>,
    framework_markers: Vec<String>,
    no_instrument_marker: String,
    never_instrument: HashSet<String>,
    self_module: Option<ModuleId>,
    self_entry_points: Vec<String>,
}

impl CandidateSelector {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            extension_bases: config.extension_base_types.clone(),
            framework_markers: config.framework_markers.clone(),
            no_instrument_marker: config.no_instrument_marker.clone(),
            never_instrument: config.never_instrument.iter().cloned().collect(),
            self_module: config.self_module_path.as_ref().map(|path| {
                let short_name = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                ModuleId::from_binary(path, short_name)
            }),
            self_entry_points: config.self_entry_points.clone(),
        }
    }

    /// Tell the selector which module is the monitor itself
    ///
    /// Overrides `self_module_path` from the configuration.
    pub fn with_self_module(mut self, module: ModuleId) -> Self {
        self.self_module = Some(module);
        self
    }

    fn is_framework_marker(&self, attribute: &str) -> bool {
        self.framework_markers
            .iter()
            .any(|marker| !marker.is_empty() && attribute.contains(marker.as_str()))
    }

    fn carries_framework_marker(&self, ty: &TypeDescriptor) -> bool {
        let marked = |attrs: &[String]| attrs.iter().any(|a| self.is_framework_marker(a));

        marked(&ty.attributes)
            || ty.methods.iter().any(|m| marked(&m.attributes))
            || ty.nested.iter().any(|n| marked(&n.attributes))
    }

    fn is_extension_type(&self, ty: &TypeDescriptor) -> bool {
        ty.bases
            .iter()
            .any(|base| self.extension_bases.iter().any(|b| b == base))
    }

    /// Whether any type of the module (nested ones included) is an extension
    pub fn is_extension(&self, types: &[TypeDescriptor]) -> bool {
        types
            .iter()
            .any(|ty| self.is_extension_type(ty) || self.is_extension(&ty.nested))
    }

    /// Select candidates, propagating enumeration failures
    pub fn try_select(&self, module: &dyn ModuleSource) -> Result<Vec<Candidate>> {
        let types = module.types()?;
        if !self.is_extension(&types) {
            return Ok(Vec::new());
        }

        let id = module.id();
        let is_self = self.self_module.as_ref() == Some(id);

        let mut flat = Vec::new();
        flatten(&types, None, &mut flat);

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for FlatType { name, ty } in flat {
            if is_compiler_generated(&name) || self.carries_framework_marker(ty) {
                continue;
            }

            let mut picked = Vec::new();
            for method in &ty.methods {
                if is_compiler_generated(&method.name) {
                    continue;
                }
                if is_self && !self.self_entry_points.contains(&method.name) {
                    continue;
                }
                if method.attributes.contains(&self.no_instrument_marker) {
                    continue;
                }
                let candidate = Candidate {
                    module: id.clone(),
                    type_name: name.clone(),
                    method: method.name.clone(),
                };
                if self.never_instrument.contains(&candidate.qualified_name()) {
                    continue;
                }
                if seen.insert(candidate.qualified_name()) {
                    picked.push(method.name.as_str());
                    candidates.push(candidate);
                }
            }

            if !picked.is_empty() {
                tracing::debug!("Selected {} {}: {}", id, name, picked.join(" "));
            }
        }

        Ok(candidates)
    }

    /// Select candidates; any enumeration failure yields an empty set
    pub fn select(&self, module: &dyn ModuleSource) -> Vec<Candidate> {
        self.try_select(module).unwrap_or_else(|e| {
            tracing::debug!("Skipping module {}: {:#}", module.id(), e);
            Vec::new()
        })
    }
}
