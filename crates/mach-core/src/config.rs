//! Config (§6): locate the per-user home directory, load the optional settings file, and
//! record the toolchain fingerprint used to detect environment changes (§4.3, §4.6).

use std::path::{Path, PathBuf};

use crate::model::EnvFingerprint;

pub const HOME_ENV_VAR: &str = "MACH_HOME";
pub const HOME_FILE: &str = ".machrc";

/// The parsed contents of `.machrc`. Reserved for future keys; presently recognizes none
/// (§6: "the only currently recognized key is absent").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings;

/// Parse a `.machrc` file body. Any top-level forms are accepted and ignored — this
/// keeps forward compatibility with a file written by a newer runtime without forcing a
/// parse error today.
pub fn parse_settings(body: &str) -> Result<Settings, mach_sexpr::ParseError> {
    mach_sexpr::parse_all(body)?;
    Ok(Settings)
}

/// Walk from `start` upward looking for `HOME_FILE`, returning the directory containing
/// it (not the file itself).
fn find_home_file(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        if d.join(HOME_FILE).is_file() {
            return Some(d.to_path_buf());
        }
        dir = d.parent();
    }
    None
}

/// Home directory discovery (§6), in priority order:
/// 1. `MACH_HOME` environment variable.
/// 2. The nearest ancestor of `cwd` containing a `.machrc` file.
/// 3. The standard per-user data directory (`dirs::data_dir()/mach`).
pub fn discover_home(cwd: &Path) -> PathBuf {
    if let Ok(val) = std::env::var(HOME_ENV_VAR) {
        if !val.is_empty() {
            log::debug!("home directory from {HOME_ENV_VAR}: {val}");
            return PathBuf::from(val);
        }
    }

    if let Some(dir) = find_home_file(cwd) {
        log::debug!("home directory from {HOME_FILE} at {}", dir.display());
        return dir;
    }

    let fallback = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mach");
    log::debug!("home directory falling back to {}", fallback.display());
    fallback
}

/// Bundle of everything the engine needs to know about the running environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub home: PathBuf,
    pub runtime_self_path: PathBuf,
    pub compiler_version: String,
    pub package_index_version: Option<String>,
    pub settings: Settings,
}

impl Config {
    pub fn env_fingerprint(&self) -> EnvFingerprint {
        EnvFingerprint {
            runtime_self_path: self.runtime_self_path.clone(),
            compiler_version: self.compiler_version.clone(),
            package_index_version: self.package_index_version.clone(),
        }
    }
}
