//! Configure Orchestrator (§4.6): decide full vs. partial reconfigure from the persisted
//! state's diff against the filesystem, clean stale outputs, materialize rule files, and
//! persist the new state.

use std::path::Path;

use crate::command::CommandRunner;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor;
use crate::file_provider::FileProvider;
use crate::graph;
use crate::model::GraphState;
use crate::paths::build_dir_for;
use crate::resolver::PackageIndex;
use crate::rules::{self, UNIT_FRAGMENT_NAME};
use crate::state_store::{self, ReconfigureReason};

/// The name the build driver is invoked under (§6).
pub const DRIVER: &str = "ninja";

/// Outcome of a configure pass: the (possibly just-recollected) graph state, and whether
/// a reconfigure actually happened this invocation.
pub struct ConfigureOutcome {
    pub state: GraphState,
    pub reconfigured: bool,
    pub reason: Option<ReconfigureReason>,
}

/// Run the full Configure Orchestrator algorithm for `entry_path` (§4.6).
pub fn configure(
    files: &dyn FileProvider,
    index: &dyn PackageIndex,
    runner: &dyn CommandRunner,
    config: &Config,
    entry_path: &Path,
) -> Result<ConfigureOutcome> {
    let build_dir = build_dir_for(&config.home, entry_path);
    let state_path = build_dir.join("state");

    let persisted = state_store::read_from_disk(&state_path);
    let env = config.env_fingerprint();

    let (reason, base_state) = match persisted {
        None => {
            log::info!("no persisted state at {}; full reconfigure", state_path.display());
            (ReconfigureReason::Env, None)
        }
        Some(state) => {
            let reason = state_store::check_reconfigure(files, index, &state, &env);
            (reason, Some(state))
        }
    };

    if matches!(reason, ReconfigureReason::None) {
        log::debug!("{}: up to date, no reconfigure", entry_path.display());
        return Ok(ConfigureOutcome {
            state: base_state.expect("None reason only returned alongside persisted state"),
            reconfigured: false,
            reason: None,
        });
    }

    match &reason {
        ReconfigureReason::Env => log::info!("{}: environment changed, full reconfigure", entry_path.display()),
        ReconfigureReason::Paths(paths) => log::info!(
            "{}: structural change in {} unit(s), partial reconfigure",
            entry_path.display(),
            paths.len()
        ),
        ReconfigureReason::None => unreachable!("handled above"),
    }

    if matches!(reason, ReconfigureReason::Env) {
        if let Some(old) = &base_state {
            clean_all_build_dirs(&config.home, old);
        }
    }

    let new_state = graph::collect(files, index, config, entry_path)?;

    std::fs::create_dir_all(&build_dir)
        .map_err(|e| Error::internal("create build dir", e.to_string()))?;

    let units_to_emit = match &reason {
        ReconfigureReason::Env => None,
        ReconfigureReason::Paths(paths) => Some(paths.clone()),
        ReconfigureReason::None => unreachable!("handled above"),
    };

    let fragments = rules::emit(
        &new_state,
        &config.home,
        entry_path,
        &config.runtime_self_path,
        units_to_emit.as_ref(),
        |dir| dir.exists(),
    );

    for fragment in &fragments {
        std::fs::create_dir_all(&fragment.build_dir)
            .map_err(|e| Error::internal("create unit build dir", e.to_string()))?;
        let is_root = fragment.build_dir == build_dir;
        let file_name = if is_root {
            rules::ROOT_FRAGMENT_NAME
        } else {
            UNIT_FRAGMENT_NAME
        };
        std::fs::write(fragment.build_dir.join(file_name), &fragment.contents)
            .map_err(|e| Error::internal("write rule fragment", e.to_string()))?;
    }

    executor::clean_dead(runner, DRIVER, &build_dir)?;

    state_store::write_atomic(&state_path, &new_state)?;

    Ok(ConfigureOutcome {
        state: new_state,
        reconfigured: true,
        reason: Some(reason),
    })
}

fn clean_all_build_dirs(home: &Path, state: &GraphState) {
    for unit in &state.units {
        let dir = build_dir_for(home, unit.path());
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to clean {}: {err}", dir.display());
            }
        }
    }
}

/// Remove the build directory tree for a single entry point. Exposed for callers that
/// want to force a from-scratch rebuild outside the normal diff path.
pub fn clean_entry(home: &Path, entry_path: &Path) -> std::io::Result<()> {
    let dir = build_dir_for(home, entry_path);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ChildHandle, CommandError, CommandOutput};
    use crate::config::Settings;
    use crate::file_provider::InMemoryFileProvider;
    use crate::resolver::NoPackageIndex;
    use std::io::BufRead;
    use std::path::PathBuf;

    struct NoopRunner;
    impl CommandRunner for NoopRunner {
        fn run(&self, _program: &str, _args: &[&str], _dir: &Path) -> Result<CommandOutput, CommandError> {
            Ok(CommandOutput {
                combined: String::new(),
                exit_code: 0,
            })
        }
        fn spawn_streaming(
            &self,
            _program: &str,
            _args: &[&str],
            _dir: &Path,
        ) -> Result<(Box<dyn ChildHandle>, Box<dyn BufRead + Send>), CommandError> {
            unimplemented!()
        }
        fn is_available(&self, _program: &str) -> bool {
            true
        }
    }

    fn config(home: &Path) -> Config {
        Config {
            home: home.to_path_buf(),
            runtime_self_path: PathBuf::from("/usr/bin/mach"),
            compiler_version: "1.0.0".to_string(),
            package_index_version: None,
            settings: Settings,
        }
    }

    #[test]
    fn first_configure_is_a_full_reconfigure() {
        let tmp = tempfile::tempdir().unwrap();
        let files = InMemoryFileProvider::new();
        files.add_file("/proj/main.ml", "let () = ()");

        let outcome = configure(
            &files,
            &NoPackageIndex,
            &NoopRunner,
            &config(tmp.path()),
            Path::new("/proj/main.ml"),
        )
        .unwrap();

        assert!(outcome.reconfigured);
        assert_eq!(outcome.state.units.len(), 1);

        let build_dir = build_dir_for(tmp.path(), Path::new("/proj/main.ml"));
        assert!(build_dir.join("state").exists());
        assert!(build_dir.join(rules::ROOT_FRAGMENT_NAME).exists());
    }

    #[test]
    fn second_configure_with_no_changes_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let files = InMemoryFileProvider::new();
        files.add_file("/proj/main.ml", "let () = ()");
        let cfg = config(tmp.path());

        configure(&files, &NoPackageIndex, &NoopRunner, &cfg, Path::new("/proj/main.ml")).unwrap();
        let second = configure(&files, &NoPackageIndex, &NoopRunner, &cfg, Path::new("/proj/main.ml"))
            .unwrap();

        assert!(!second.reconfigured);
    }
}

