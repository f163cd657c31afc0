//! Build Executor (§4.7): invoke the external build driver and filter its output down to
//! the lines the prefixing shim (§6) marked as compiler diagnostics.

use std::path::Path;

use crate::command::CommandRunner;
use crate::error::{Error, Result};

/// The sentinel the prefixing shim writes before every line it forwards (§6).
const SENTINEL: &str = ">>>";

/// Run the driver in `build_dir`, returning the filtered diagnostic lines (sentinel
/// stripped, in order). `BuildFailed` if the driver exits non-zero.
pub fn execute(runner: &dyn CommandRunner, driver: &str, build_dir: &Path) -> Result<Vec<String>> {
    log::debug!("invoking driver `{driver}` in {}", build_dir.display());
    let dir_arg = build_dir.display().to_string();
    let output = runner
        .run(driver, &["-C", &dir_arg], build_dir)
        .map_err(|e| Error::internal("build executor", e.to_string()))?;

    let diagnostics = filter_sentinel_lines(&output.combined);

    if output.exit_code != 0 {
        for line in &diagnostics {
            log::error!("{line}");
        }
        return Err(Error::BuildFailed(output.exit_code));
    }
    Ok(diagnostics)
}

/// Ask the driver to clean orphaned outputs (§4.6 step 7, §6 `-t cleandead`).
pub fn clean_dead(runner: &dyn CommandRunner, driver: &str, build_dir: &Path) -> Result<()> {
    log::debug!("cleaning orphans in {}", build_dir.display());
    let dir_arg = build_dir.display().to_string();
    let output = runner
        .run(driver, &["-C", &dir_arg, "-t", "cleandead"], build_dir)
        .map_err(|e| Error::internal("cleandead", e.to_string()))?;
    if output.exit_code != 0 {
        return Err(Error::internal(
            "cleandead",
            format!("driver exited with status {}", output.exit_code),
        ));
    }
    Ok(())
}

fn filter_sentinel_lines(combined: &str) -> Vec<String> {
    combined
        .lines()
        .filter_map(|line| line.strip_prefix(SENTINEL))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ChildHandle, CommandError, CommandOutput};
    use std::io::BufRead;
    use std::sync::Mutex;

    struct ScriptedRunner {
        combined: String,
        exit_code: i32,
        calls: Mutex<Vec<String>>,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str], _dir: &Path) -> Result<CommandOutput, CommandError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            Ok(CommandOutput {
                combined: self.combined.clone(),
                exit_code: self.exit_code,
            })
        }

        fn spawn_streaming(
            &self,
            _program: &str,
            _args: &[&str],
            _dir: &Path,
        ) -> Result<(Box<dyn ChildHandle>, Box<dyn BufRead + Send>), CommandError> {
            unimplemented!("not exercised by executor tests")
        }

        fn is_available(&self, _program: &str) -> bool {
            true
        }
    }

    #[test]
    fn only_sentinel_lines_are_kept() {
        let runner = ScriptedRunner {
            combined: "ninja: entering directory\n>>>error: type mismatch\nninja: done\n"
                .to_string(),
            exit_code: 0,
            calls: Mutex::new(Vec::new()),
        };
        let lines = execute(&runner, "ninja", Path::new("/build")).unwrap();
        assert_eq!(lines, vec!["error: type mismatch".to_string()]);
    }

    #[test]
    fn nonzero_exit_is_build_failed() {
        let runner = ScriptedRunner {
            combined: ">>>error: boom\n".to_string(),
            exit_code: 1,
            calls: Mutex::new(Vec::new()),
        };
        let err = execute(&runner, "ninja", Path::new("/build")).unwrap_err();
        assert!(matches!(err, Error::BuildFailed(1)));
    }

    #[test]
    fn clean_dead_invokes_cleandead_flag() {
        let runner = ScriptedRunner {
            combined: String::new(),
            exit_code: 0,
            calls: Mutex::new(Vec::new()),
        };
        clean_dead(&runner, "ninja", Path::new("/build")).unwrap();
        assert_eq!(
            runner.calls.lock().unwrap()[0],
            "ninja -C /build -t cleandead"
        );
    }
}
