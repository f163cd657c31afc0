//! Watch Loop (§4.8): stream file-change events from an ambient watcher, trigger
//! rebuilds, restart the watcher when the watched set changes, and manage the lifecycle
//! of an optional run-with-watch child process.

use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::command::{ChildHandle, CommandRunner};
use crate::config::Config;
use crate::configure;
use crate::error::{Error, Result};
use crate::executor;
use crate::file_provider::FileProvider;
use crate::model::{GraphState, Unit};
use crate::paths::build_dir_for;
use crate::resolver::PackageIndex;

/// The watcher executable name (§6).
pub const WATCHER: &str = "mach-watch";

/// One `<event_kind>:<absolute_path>` line from the watcher (§4.8). The event kind itself
/// is not interpreted — only the path matters for invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
}

fn parse_event_line(line: &str) -> Option<WatchEvent> {
    let (_kind, path) = line.split_once(':')?;
    Some(WatchEvent {
        path: PathBuf::from(path),
    })
}

/// Derive the watched set (§4.8 step 3): module source directories, plus every library
/// directory.
pub fn watched_set(state: &GraphState) -> HashSet<PathBuf> {
    let mut dirs = HashSet::new();
    for unit in &state.units {
        match unit {
            Unit::Module(m) => {
                if let Some(parent) = m.path_src.parent() {
                    dirs.insert(parent.to_path_buf());
                }
            }
            Unit::Library(l) => {
                dirs.insert(l.path_dir.clone());
            }
        }
    }
    dirs
}

/// The set of files whose change should trigger a rebuild: every unit's source,
/// interface and (for libraries) manifest file.
pub fn watched_files(state: &GraphState) -> HashSet<PathBuf> {
    let mut files = HashSet::new();
    for unit in &state.units {
        match unit {
            Unit::Module(m) => {
                files.insert(m.path_src.clone());
                if let Some(intf) = &m.path_intf {
                    files.insert(intf.clone());
                }
            }
            Unit::Library(l) => {
                files.insert(l.path_dir.join(crate::model::LIBRARY_MANIFEST_NAME));
                for member in &l.members {
                    files.insert(member.file_src.clone());
                    if let Some(intf) = &member.file_intf {
                        files.insert(intf.clone());
                    }
                }
            }
        }
    }
    files
}

/// Render the watchlist file contents for the watcher invocation (§6): one `-W <dir>`
/// pair per line.
pub fn render_watchlist(dirs: &HashSet<PathBuf>) -> String {
    let mut sorted: Vec<_> = dirs.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .map(|d| format!("-W {}\n", d.display()))
        .collect()
}

/// Read one batch of events from `reader`: lines until a blank line terminates it, or EOF.
/// Returns `None` at EOF with nothing read (watcher exited).
fn read_batch(reader: &mut dyn BufRead) -> Option<Vec<WatchEvent>> {
    let mut events = Vec::new();
    let mut saw_any_line = false;
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return if saw_any_line { Some(events) } else { None },
            Ok(_) => {
                saw_any_line = true;
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    return Some(events);
                }
                if let Some(event) = parse_event_line(trimmed) {
                    events.push(event);
                }
            }
            Err(_) => return if saw_any_line { Some(events) } else { None },
        }
    }
}

/// One rebuild-triggering pass over a batch of raw watcher lines, exposed separately from
/// the blocking I/O loop so the batching/dedup logic is unit-testable with canned lines.
pub fn relevant_paths(events: &[WatchEvent], tracked: &HashSet<PathBuf>) -> HashSet<PathBuf> {
    events
        .iter()
        .map(|e| e.path.clone())
        .filter(|p| tracked.contains(p))
        .collect()
}

/// Run the watch loop for `entry_path` until interrupted (§4.8). `run_child` selects
/// run-with-watch mode: after each successful build, the freshly built executable is
/// spawned as a child, and the previous one is terminated before the next is launched.
pub fn watch(
    files: &dyn FileProvider,
    index: &dyn PackageIndex,
    runner: &dyn CommandRunner,
    config: &Config,
    entry_path: &Path,
    run_child: bool,
) -> Result<()> {
    if !runner.is_available(WATCHER) {
        return Err(Error::WatcherMissing(WATCHER.to_string()));
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| Error::internal("install signal handler", e.to_string()))?;

    let mut child: Option<Box<dyn ChildHandle>> = None;

    // Initial build (§4.8 step 2): failure is logged and the loop continues.
    let mut outcome = configure::configure(files, index, runner, config, entry_path);
    match &outcome {
        Ok(_) => {
            if let Err(e) = executor::execute(runner, configure::DRIVER, &build_dir_for(&config.home, entry_path)) {
                log::error!("initial build failed: {e}");
            } else if run_child {
                child = spawn_entry_child(runner, config, entry_path, child);
            }
        }
        Err(e) => log::error!("initial configure failed: {e}"),
    }

    'outer: while !interrupted.load(Ordering::SeqCst) {
        let state = match &outcome {
            Ok(o) => &o.state,
            Err(_) => return Ok(()),
        };
        let watchlist_path = write_watchlist_tempfile(state)?;
        let tracked = watched_files(state);

        let (mut watcher_child, mut reader) =
            runner
                .spawn_streaming(
                    WATCHER,
                    &[
                        "--only-emit-events",
                        "--emit-events-to=stdio",
                        "--stdin-quit",
                        "-e",
                        "ml,mli,re,rei",
                        &format!("@{}", watchlist_path.display()),
                    ],
                    &config.home,
                )
                .map_err(|e| Error::internal("spawn watcher", e.to_string()))?;

        loop {
            if interrupted.load(Ordering::SeqCst) {
                watcher_child.terminate();
                let _ = std::fs::remove_file(&watchlist_path);
                if let Some(c) = &mut child {
                    c.terminate();
                }
                return Ok(());
            }

            let Some(batch) = read_batch(reader.as_mut()) else {
                // Watcher exited on its own.
                let _ = std::fs::remove_file(&watchlist_path);
                break;
            };

            let hits = relevant_paths(&batch, &tracked);
            if hits.is_empty() {
                continue;
            }

            log::info!("watch: {} tracked file(s) changed, rebuilding", hits.len());
            outcome = configure::configure(files, index, runner, config, entry_path);
            let reconfigured = match &outcome {
                Ok(o) => {
                    if let Err(e) = executor::execute(
                        runner,
                        configure::DRIVER,
                        &build_dir_for(&config.home, entry_path),
                    ) {
                        log::error!("rebuild failed: {e}");
                    } else if run_child {
                        child = spawn_entry_child(runner, config, entry_path, child);
                    }
                    o.reconfigured
                }
                Err(e) => {
                    log::error!("reconfigure failed: {e}");
                    false
                }
            };

            if reconfigured {
                // The watched set may have changed; restart the watcher from step 3.
                watcher_child.terminate();
                let _ = std::fs::remove_file(&watchlist_path);
                continue 'outer;
            }
        }
    }

    if let Some(c) = &mut child {
        c.terminate();
    }
    Ok(())
}

fn write_watchlist_tempfile(state: &GraphState) -> Result<PathBuf> {
    let dirs = watched_set(state);
    let body = render_watchlist(&dirs);
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|e| Error::internal("create watchlist tempfile", e.to_string()))?;
    file.write_all(body.as_bytes())
        .map_err(|e| Error::internal("write watchlist tempfile", e.to_string()))?;
    let (_, path) = file
        .keep()
        .map_err(|e| Error::internal("persist watchlist tempfile", e.to_string()))?;
    Ok(path)
}

fn spawn_entry_child(
    runner: &dyn CommandRunner,
    config: &Config,
    entry_path: &Path,
    previous: Option<Box<dyn ChildHandle>>,
) -> Option<Box<dyn ChildHandle>> {
    if let Some(mut old) = previous {
        old.terminate();
    }
    let build_dir = build_dir_for(&config.home, entry_path);
    let exe = build_dir.join("a.out");
    match runner.spawn_streaming(exe.to_string_lossy().as_ref(), &[], &config.home) {
        Ok((handle, _reader)) => Some(handle),
        Err(e) => {
            log::error!("failed to spawn {}: {e}", exe.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dialect, EnvFingerprint, FileStat, LibraryMember, LibraryUnit, ModuleUnit};
    use std::io::Cursor;

    fn sample_state() -> GraphState {
        GraphState {
            env_fingerprint: EnvFingerprint {
                runtime_self_path: PathBuf::from("/usr/bin/mach"),
                compiler_version: "1.0.0".into(),
                package_index_version: None,
            },
            units: vec![
                Unit::Module(ModuleUnit {
                    path_src: PathBuf::from("/proj/src/main.ml"),
                    stat_src: FileStat { mtime: 1, size: 1 },
                    path_intf: Some(PathBuf::from("/proj/src/main.mli")),
                    stat_intf: Some(FileStat { mtime: 1, size: 1 }),
                    dialect: Dialect::Primary,
                    requires: Vec::new(),
                }),
                Unit::Library(LibraryUnit {
                    path_dir: PathBuf::from("/proj/lib"),
                    stat_dir: FileStat { mtime: 1, size: 0 },
                    stat_manifest: FileStat { mtime: 1, size: 0 },
                    members: vec![LibraryMember {
                        file_src: PathBuf::from("/proj/lib/a.ml"),
                        file_intf: None,
                    }],
                    requires: Vec::new(),
                }),
            ],
        }
    }

    #[test]
    fn watched_set_is_directories_not_files() {
        let dirs = watched_set(&sample_state());
        assert!(dirs.contains(Path::new("/proj/src")));
        assert!(dirs.contains(Path::new("/proj/lib")));
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn watchlist_renders_one_dash_w_pair_per_line_sorted() {
        let dirs = watched_set(&sample_state());
        let body = render_watchlist(&dirs);
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines, vec!["-W /proj/lib", "-W /proj/src"]);
    }

    #[test]
    fn read_batch_stops_at_blank_line() {
        let mut cursor = Cursor::new(b"create:/proj/src/main.ml\nmodify:/proj/lib/a.ml\n\nstray:/never/read\n".to_vec());
        let batch = read_batch(&mut cursor).unwrap();
        assert_eq!(
            batch,
            vec![
                WatchEvent { path: PathBuf::from("/proj/src/main.ml") },
                WatchEvent { path: PathBuf::from("/proj/lib/a.ml") },
            ]
        );
    }

    #[test]
    fn relevant_paths_filters_to_tracked_files() {
        let tracked = watched_files(&sample_state());
        let events = vec![
            WatchEvent { path: PathBuf::from("/proj/src/main.ml") },
            WatchEvent { path: PathBuf::from("/unrelated/file.ml") },
        ];
        let hits = relevant_paths(&events, &tracked);
        assert_eq!(hits.len(), 1);
        assert!(hits.contains(Path::new("/proj/src/main.ml")));
    }

    #[test]
    fn eof_with_no_lines_read_is_none() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_batch(&mut cursor).is_none());
    }
}
