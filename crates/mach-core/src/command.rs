//! Process-spawn abstraction used by the Build Executor and Watch Loop (§4.7, §4.8), so
//! both are testable against canned output without a real driver/watcher/compiler on the
//! machine.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error communicating with `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// The combined output and exit status of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub combined: String,
    pub exit_code: i32,
}

/// A handle to a still-running child process, abstracted enough to let the watch loop's
/// child-run lifecycle management (§4.8) be exercised without a real executable.
pub trait ChildHandle: Send {
    /// Ask the process to stop without waiting for it to exit.
    fn terminate(&mut self);
    /// Reap the process if it has already exited.
    fn try_wait(&mut self) -> bool;
}

/// Spawn external processes and capture their output. Implemented once for real
/// subprocesses ([`SystemCommandRunner`]) and by hand in tests with a canned script.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` in `dir`, waiting for completion and returning its
    /// combined stdout+stderr and exit code.
    fn run(&self, program: &str, args: &[&str], dir: &Path) -> Result<CommandOutput, CommandError>;

    /// Spawn `program` with `args` in `dir`, keeping stdin open, and return a line reader
    /// over its stdout plus a handle to manage its lifecycle. Used for the file watcher
    /// and for run-with-watch child processes (§4.8).
    fn spawn_streaming(
        &self,
        program: &str,
        args: &[&str],
        dir: &Path,
    ) -> Result<(Box<dyn ChildHandle>, Box<dyn std::io::BufRead + Send>), CommandError>;

    /// Check whether `program` can be located (used by [`WatcherMissing`](crate::Error)).
    fn is_available(&self, program: &str) -> bool;
}

/// Spawns real OS processes via `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

struct SystemChildHandle {
    child: Child,
}

impl ChildHandle for SystemChildHandle {
    fn terminate(&mut self) {
        if let Err(err) = self.child.kill() {
            log::debug!("failed to terminate child process: {err}");
        }
    }

    fn try_wait(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str], dir: &Path) -> Result<CommandOutput, CommandError> {
        log::debug!("running `{program} {}` in {}", args.join(" "), dir.display());
        let output = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            combined,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn spawn_streaming(
        &self,
        program: &str,
        args: &[&str],
        dir: &Path,
    ) -> Result<(Box<dyn ChildHandle>, Box<dyn std::io::BufRead + Send>), CommandError> {
        log::debug!("spawning `{program} {}` in {}", args.join(" "), dir.display());
        let mut child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| CommandError::Io {
            program: program.to_string(),
            source: std::io::Error::other("child had no stdout pipe"),
        })?;
        let reader: Box<dyn std::io::BufRead + Send> = Box::new(std::io::BufReader::new(stdout));
        Ok((Box::new(SystemChildHandle { child }), reader))
    }

    fn is_available(&self, program: &str) -> bool {
        which(program).is_some()
    }
}

/// A minimal `$PATH` search, enough to answer "is the driver/watcher executable
/// present" without pulling in a dedicated crate for it.
fn which(program: &str) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(program).is_file().then(|| PathBuf::from(program));
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Read everything remaining on `reader` into a string. Used by implementations that
/// prefer pull-based reads over the default streaming hookup.
pub fn read_to_string_lossy(mut reader: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_a_known_coreutil() {
        // `sh` is present on every platform this crate targets in CI.
        assert!(SystemCommandRunner.is_available("sh") || SystemCommandRunner.is_available("cmd"));
    }

    #[test]
    fn which_rejects_unknown_program() {
        assert!(!SystemCommandRunner.is_available("definitely-not-a-real-mach-driver"));
    }
}
