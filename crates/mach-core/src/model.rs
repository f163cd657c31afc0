//! The data model (§3): stats, located values, directives, units and the graph state.

use std::path::{Path, PathBuf};

/// The two source-file extensions the runtime understands. A module may be written in
/// either dialect; the interface extension is derived from the source extension.
pub const PRIMARY_EXT: &str = "ml";
pub const PRIMARY_INTF_EXT: &str = "mli";
pub const ALTERNATE_EXT: &str = "re";
pub const ALTERNATE_INTF_EXT: &str = "rei";

/// Name of the manifest file a library directory must contain.
pub const LIBRARY_MANIFEST_NAME: &str = "lib.manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Primary,
    Alternate,
}

impl Dialect {
    pub fn from_ext(ext: &str) -> Option<Dialect> {
        match ext {
            PRIMARY_EXT => Some(Dialect::Primary),
            ALTERNATE_EXT => Some(Dialect::Alternate),
            _ => None,
        }
    }

    pub fn source_ext(self) -> &'static str {
        match self {
            Dialect::Primary => PRIMARY_EXT,
            Dialect::Alternate => ALTERNATE_EXT,
        }
    }

    pub fn intf_ext(self) -> &'static str {
        match self {
            Dialect::Primary => PRIMARY_INTF_EXT,
            Dialect::Alternate => ALTERNATE_INTF_EXT,
        }
    }
}

/// `mtime`/`size` snapshot of a file or directory at the moment it was observed.
/// Equality is field-wise, matching invariant 3/4 in §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: i64,
    pub size: u64,
}

/// A value together with the source location it was declared at. Equality ignores the
/// location, so two directives that resolve to the same target compare equal regardless
/// of which line required them.
#[derive(Debug, Clone)]
pub struct WithLoc<T> {
    pub value: T,
    pub source_file: PathBuf,
    pub line: usize,
}

impl<T> WithLoc<T> {
    pub fn new(value: T, source_file: impl Into<PathBuf>, line: usize) -> Self {
        Self {
            value,
            source_file: source_file.into(),
            line,
        }
    }
}

impl<T: PartialEq> PartialEq for WithLoc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}
impl<T: Eq> Eq for WithLoc<T> {}

/// A resolved `#require "X"` directive (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Module(PathBuf),
    Library(PathBuf),
    ExternalLib { name: String, version: String },
}

impl Directive {
    /// The `kind` token used in the persisted state format (§4.3).
    pub fn kind_token(&self) -> &'static str {
        match self {
            Directive::Module(_) => "module",
            Directive::Library(_) => "library",
            Directive::ExternalLib { .. } => "external",
        }
    }

    /// The single payload token written after `kind` in the persisted state format.
    pub fn payload_token(&self) -> String {
        match self {
            Directive::Module(p) | Directive::Library(p) => p.display().to_string(),
            Directive::ExternalLib { name, version } => format!("{name}@{version}"),
        }
    }

    /// The path this directive points at, for directives that target a unit in the graph.
    pub fn path_target(&self) -> Option<&Path> {
        match self {
            Directive::Module(p) | Directive::Library(p) => Some(p),
            Directive::ExternalLib { .. } => None,
        }
    }
}

/// A compilable source unit (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleUnit {
    pub path_src: PathBuf,
    pub stat_src: FileStat,
    pub path_intf: Option<PathBuf>,
    pub stat_intf: Option<FileStat>,
    pub dialect: Dialect,
    pub requires: Vec<WithLoc<Directive>>,
}

impl ModuleUnit {
    pub fn has_interface(&self) -> bool {
        self.path_intf.is_some()
    }
}

/// One member source file (and optional interface) inside a library directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryMember {
    pub file_src: PathBuf,
    pub file_intf: Option<PathBuf>,
}

/// A directory packaging multiple source files under one manifest (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryUnit {
    pub path_dir: PathBuf,
    pub stat_dir: FileStat,
    pub stat_manifest: FileStat,
    /// Stable-sorted by `file_src`.
    pub members: Vec<LibraryMember>,
    pub requires: Vec<WithLoc<Directive>>,
}

/// Tagged union over the two kinds of graph node (§9: "avoid virtual dispatch").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Module(ModuleUnit),
    Library(LibraryUnit),
}

impl Unit {
    /// The canonical path identifying this unit: the source file for a module, the
    /// directory for a library.
    pub fn path(&self) -> &Path {
        match self {
            Unit::Module(m) => &m.path_src,
            Unit::Library(l) => &l.path_dir,
        }
    }

    pub fn requires(&self) -> &[WithLoc<Directive>] {
        match self {
            Unit::Module(m) => &m.requires,
            Unit::Library(l) => &l.requires,
        }
    }

    pub fn as_module(&self) -> Option<&ModuleUnit> {
        match self {
            Unit::Module(m) => Some(m),
            Unit::Library(_) => None,
        }
    }

    pub fn as_library(&self) -> Option<&LibraryUnit> {
        match self {
            Unit::Library(l) => Some(l),
            Unit::Module(_) => None,
        }
    }
}

/// The toolchain-identity triple (§3, §4.6). A difference in any field forces a full
/// reconfigure: every unit's build directory is wiped and rebuilt from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvFingerprint {
    pub runtime_self_path: PathBuf,
    pub compiler_version: String,
    pub package_index_version: Option<String>,
}

/// The full persisted build graph (§3). `units` is a DFS-post-order linearization of the
/// dependency DAG rooted at the entry point; the entry point is always the last element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphState {
    pub env_fingerprint: EnvFingerprint,
    pub units: Vec<Unit>,
}

impl GraphState {
    pub fn entry_point(&self) -> Option<&Unit> {
        self.units.last()
    }

    pub fn find_unit(&self, path: &Path) -> Option<&Unit> {
        self.units.iter().find(|u| u.path() == path)
    }
}
