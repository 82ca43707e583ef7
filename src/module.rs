//! Host-side description of loaded extension modules
//!
//! The host describes each module it loads as plain metadata: where its
//! binary lives, which types it defines, which bases and marker attributes
//! those types carry and which methods they declare. The monitor never
//! executes anything from this description; it only reads it to pick call
//! sites and then re-reads the binary on disk to confirm each pick.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identity of an owner module: the canonical path of its binary
///
/// Equality and hashing use the path only; the short name is carried for
/// display fallback.
#[derive(Clone)]
pub struct ModuleId {
    path: Arc<Path>,
    short_name: Arc<str>,
}

impl ModuleId {
    /// Identity for a module loaded from a binary on disk
    ///
    /// The path is canonicalized when possible so that two spellings of the
    /// same file map to one module.
    pub fn from_binary(path: impl AsRef<Path>, short_name: impl Into<Arc<str>>) -> Self {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self {
            path: Arc::from(canonical),
            short_name: short_name.into(),
        }
    }

    /// Identity for a module with no binary on disk
    pub fn in_memory(short_name: impl Into<Arc<str>>) -> Self {
        let short_name: Arc<str> = short_name.into();
        let path = PathBuf::from("<memory>").join(&*short_name);
        Self {
            path: Arc::from(path),
            short_name,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module's own internal name
    pub fn short_name(&self) -> &str {
        &self.short_name
    }
}

impl PartialEq for ModuleId {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for ModuleId {}

impl Hash for ModuleId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.short_name, self.path.display())
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name)
    }
}

/// A method declared by a type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    /// Names of marker attributes attached to the method
    pub attributes: Vec<String>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.push(attribute.into());
        self
    }
}

/// A type defined by a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    /// Base types (or implemented host contracts)
    pub bases: Vec<String>,
    /// Names of marker attributes attached to the type
    pub attributes: Vec<String>,
    /// Methods declared directly on this type
    pub methods: Vec<MethodDescriptor>,
    /// Types declared inside this one
    pub nested: Vec<TypeDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bases: Vec::new(),
            attributes: Vec::new(),
            methods: Vec::new(),
            nested: Vec::new(),
        }
    }

    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.bases.push(base.into());
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.push(attribute.into());
        self
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// Shorthand for a method without attributes
    pub fn with_methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods
            .extend(names.into_iter().map(MethodDescriptor::new));
        self
    }

    pub fn with_nested(mut self, nested: TypeDescriptor) -> Self {
        self.nested.push(nested);
        self
    }
}

/// Anything the monitor can introspect as a module
///
/// `types()` is allowed to fail (and hosts backed by live reflection may
/// even panic); callers treat both as "nothing to instrument".
pub trait ModuleSource {
    fn id(&self) -> &ModuleId;

    /// Path of the module's binary, if the host knows it
    fn location(&self) -> Option<&Path>;

    fn types(&self) -> anyhow::Result<Vec<TypeDescriptor>>;
}

/// The host's view of which modules are currently loaded
pub trait ModuleHost {
    fn loaded_modules(&self) -> Vec<&dyn ModuleSource>;
}

/// Static description of a module
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub id: ModuleId,
    pub location: Option<PathBuf>,
    pub types: Vec<TypeDescriptor>,
}

impl ModuleDescriptor {
    /// Module whose binary lives at `path`
    pub fn from_binary(path: impl AsRef<Path>, short_name: impl Into<Arc<str>>) -> Self {
        let id = ModuleId::from_binary(path.as_ref(), short_name);
        Self {
            location: Some(id.path().to_path_buf()),
            id,
            types: Vec::new(),
        }
    }

    /// Module with no known binary; the inspector will skip all of it
    pub fn in_memory(short_name: impl Into<Arc<str>>) -> Self {
        Self {
            id: ModuleId::in_memory(short_name),
            location: None,
            types: Vec::new(),
        }
    }

    pub fn with_type(mut self, ty: TypeDescriptor) -> Self {
        self.types.push(ty);
        self
    }

    /// Call site for a method of this module
    pub fn call_site(&self, type_name: &str, method: &str) -> CallSite {
        CallSite::new(self.id.clone(), type_name, method)
    }
}

impl ModuleSource for ModuleDescriptor {
    fn id(&self) -> &ModuleId {
        &self.id
    }

    fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    fn types(&self) -> anyhow::Result<Vec<TypeDescriptor>> {
        Ok(self.types.clone())
    }
}

impl ModuleHost for [ModuleDescriptor] {
    fn loaded_modules(&self) -> Vec<&dyn ModuleSource> {
        self.iter().map(|m| m as &dyn ModuleSource).collect()
    }
}

impl ModuleHost for Vec<ModuleDescriptor> {
    fn loaded_modules(&self) -> Vec<&dyn ModuleSource> {
        self.as_slice().loaded_modules()
    }
}

/// Runtime identity of one callable unit
///
/// This is what the pre-call and post-call interception points receive.
/// The owner module may be unknown (e.g. host-generated code); such call
/// sites are never timed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    module: Option<ModuleId>,
    type_name: Arc<str>,
    method: Arc<str>,
}

impl CallSite {
    pub fn new(module: ModuleId, type_name: &str, method: &str) -> Self {
        Self {
            module: Some(module),
            type_name: Arc::from(type_name),
            method: Arc::from(method),
        }
    }

    /// Call site whose owner module cannot be resolved
    pub fn detached(type_name: &str, method: &str) -> Self {
        Self {
            module: None,
            type_name: Arc::from(type_name),
            method: Arc::from(method),
        }
    }

    pub fn module(&self) -> Option<&ModuleId> {
        self.module.as_ref()
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// `Type::method`
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.type_name, self.method)
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}!{}::{}", module, self.type_name, self.method),
            None => write!(f, "?!{}::{}", self.type_name, self.method),
        }
    }
}
