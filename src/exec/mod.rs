//! Command Execution
//!
//! Concrete [`CommandRunner`] implementation over tokio process spawning,
//! plus lookup of administrative executables on `PATH`. All controller and
//! OS state in this crate is observed through these two entry points.

use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Tool Discovery
// =============================================================================

/// Locate an administrative executable, trying each candidate name in order.
///
/// Some tools ship under more than one name (storcli vs. storcli64); the
/// first hit on `PATH` wins.
pub fn locate_tool(names: &[&str]) -> Result<PathBuf> {
    for name in names {
        if let Ok(path) = which::which(name) {
            debug!(tool = name, path = %path.display(), "located administrative tool");
            return Ok(path);
        }
    }
    Err(Error::ToolNotFound {
        tool: names.join("|"),
    })
}

// =============================================================================
// System Runner
// =============================================================================

/// Runs external commands on the local system and captures their output.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput> {
        debug!(program = %program.display(), ?args, "running command");
        let output = Command::new(program).args(args).output().await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Terminated by signal; no exit code to report
            code: output.status.code().unwrap_or(-1),
        })
    }
}

// =============================================================================
// Scripted Runner (test support)
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Step {
        program: String,
        output: CommandOutput,
    }

    /// A [`CommandRunner`] that replays recorded tool output in order.
    ///
    /// Each expected invocation is matched by program basename; the actual
    /// argument vectors are logged for assertion.
    pub struct ScriptedRunner {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self {
                steps: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Queue a successful invocation with the given stdout.
        pub fn push_ok(&self, program: &str, stdout: &str) {
            self.push(program, stdout, "", 0);
        }

        /// Queue an invocation with full control over the captured output.
        pub fn push(&self, program: &str, stdout: &str, stderr: &str, code: i32) {
            self.steps.lock().unwrap().push_back(Step {
                program: program.to_string(),
                output: CommandOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    code,
                },
            });
        }

        /// All invocations observed so far, as (program basename, args).
        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn remaining(&self) -> usize {
            self.steps.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput> {
            let basename = program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.calls
                .lock()
                .unwrap()
                .push((basename.clone(), args.iter().map(|a| a.to_string()).collect()));

            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected command: {basename} {args:?}"));
            assert_eq!(
                step.program, basename,
                "command order mismatch: expected {}, got {basename} {args:?}",
                step.program
            );
            Ok(step.output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new();
        let out = runner
            .run(Path::new("sh"), &["-c", "echo hello; echo oops >&2"])
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_system_runner_reports_exit_code() {
        let runner = SystemRunner::new();
        let out = runner.run(Path::new("sh"), &["-c", "exit 3"]).await.unwrap();
        assert_eq!(out.code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_scripted_runner_replays_in_order() {
        let runner = ScriptedRunner::new();
        runner.push_ok("lsblk", "sda\n");
        runner.push("mdadm", "", "cannot open", 1);

        let first = runner.run(Path::new("/usr/bin/lsblk"), &["-l"]).await.unwrap();
        assert_eq!(first.stdout, "sda\n");

        let second = runner.run(Path::new("mdadm"), &["--stop"]).await.unwrap();
        assert_eq!(second.code, 1);

        assert_eq!(runner.calls().len(), 2);
        assert_eq!(runner.calls()[0].0, "lsblk");
        assert_eq!(runner.remaining(), 0);
    }

    #[test]
    fn test_locate_tool_missing() {
        let err = locate_tool(&["definitely-not-a-raid-tool-9000"]).unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
    }
}
