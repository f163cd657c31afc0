//! Require Resolver (§4.2): classify a raw directive string into a [`Directive`], and
//! parse library manifests.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::file_provider::FileProvider;
use crate::model::{Dialect, Directive, LIBRARY_MANIFEST_NAME, WithLoc};

/// The ambient package index: name → version lookup for external libraries (§4.2,
/// §9 "no-ocamlfind" open question). A missing index is modeled as `lookup` never being
/// called — callers check `is_available()` first and fail `PackageIndexMissing`
/// otherwise, matching the universal error the spec settles on.
pub trait PackageIndex {
    fn is_available(&self) -> bool;
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Models "no package manager installed" (§7 `PackageIndexMissing`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPackageIndex;

impl PackageIndex for NoPackageIndex {
    fn is_available(&self) -> bool {
        false
    }
    fn lookup(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Resolve one raw directive string (the payload of a `#require "…"` line) into a
/// [`Directive`], relative to the file it was declared in.
pub fn resolve_directive(
    files: &dyn FileProvider,
    index: &dyn PackageIndex,
    raw: &str,
    source_file: &Path,
    line: usize,
) -> Result<Directive> {
    if raw.contains('/') {
        resolve_path_like(files, raw, source_file, line)
    } else {
        resolve_external(index, raw)
    }
}

fn resolve_path_like(
    files: &dyn FileProvider,
    raw: &str,
    source_file: &Path,
    _line: usize,
) -> Result<Directive> {
    let raw_path = Path::new(raw);
    let base_dir = source_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let candidate_base = if raw_path.is_absolute() {
        raw_path.to_path_buf()
    } else {
        base_dir.join(raw_path)
    };

    if files.is_directory(&candidate_base) {
        let canon_dir = files.canonicalize(&candidate_base).map_err(|_| {
            Error::NotFound(candidate_base.clone())
        })?;
        let manifest = canon_dir.join(LIBRARY_MANIFEST_NAME);
        if !files.exists(&manifest) {
            return Err(Error::BadLibrary(canon_dir));
        }
        return Ok(Directive::Library(canon_dir));
    }

    let module_path = resolve_module_file(files, &candidate_base)?;
    let canon = files
        .canonicalize(&module_path)
        .map_err(|_| Error::NotFound(module_path.clone()))?;
    Ok(Directive::Module(canon))
}

/// Find the actual module source file a path-like directive (with no existing directory
/// at that path) names: if the string already carries an accepted extension, use it
/// as-is; otherwise try the primary extension before the alternate one (§4.2 "deterministic
/// tie-break").
fn resolve_module_file(files: &dyn FileProvider, candidate_base: &Path) -> Result<PathBuf> {
    if let Some(ext) = candidate_base.extension().and_then(|e| e.to_str()) {
        if Dialect::from_ext(ext).is_some() {
            return if files.exists(candidate_base) {
                Ok(candidate_base.to_path_buf())
            } else {
                Err(Error::NotFound(candidate_base.to_path_buf()))
            };
        }
    }

    for dialect in [Dialect::Primary, Dialect::Alternate] {
        let candidate = with_ext(candidate_base, dialect.source_ext());
        if files.exists(&candidate) {
            return Ok(candidate);
        }
    }

    Err(Error::NotFound(candidate_base.to_path_buf()))
}

fn with_ext(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn resolve_external(index: &dyn PackageIndex, name: &str) -> Result<Directive> {
    if !index.is_available() {
        return Err(Error::PackageIndexMissing);
    }
    match index.lookup(name) {
        Some(version) => Ok(Directive::ExternalLib {
            name: name.to_string(),
            version,
        }),
        None => Err(Error::UnknownLibrary(name.to_string())),
    }
}

/// Parse a library manifest: a sequence of `(require "r1" "r2" …)` forms (§4.2). Every
/// string argument across every `require` form is resolved, in file order.
pub fn resolve_manifest(
    files: &dyn FileProvider,
    index: &dyn PackageIndex,
    manifest_path: &Path,
) -> Result<Vec<WithLoc<Directive>>> {
    let body = files
        .read_file(manifest_path)
        .map_err(|_| Error::NotFound(manifest_path.to_path_buf()))?;

    let forms = mach_sexpr::parse_all(&body).map_err(|e| Error::BadLibrary(manifest_path.to_path_buf()).with_message(e))?;

    let mut out = Vec::new();
    for form in &forms {
        if form.tag() != Some("require") {
            continue;
        }
        let items = form.as_list().unwrap();
        for item in &items[1..] {
            let Some(raw) = item.as_str() else {
                return Err(Error::BadLibrary(manifest_path.to_path_buf()));
            };
            let directive = resolve_directive(files, index, raw, manifest_path, 0)?;
            out.push(WithLoc::new(directive, manifest_path, 0));
        }
    }
    Ok(out)
}

// Small helper so the manifest-parse error path reads naturally above without adding a
// dedicated Error variant for a sexpr syntax error (it folds into `BadLibrary`, since a
// malformed manifest is exactly that: a library directory without a usable manifest).
trait WithMessage {
    fn with_message(self, msg: impl std::fmt::Display) -> Self;
}
impl WithMessage for Error {
    fn with_message(self, msg: impl std::fmt::Display) -> Self {
        log::debug!("manifest parse error: {msg}");
        self
    }
}
