//! Host command execution.
//!
//! Every networking step and the fake device creation go through
//! [`CommandRunner`] so that tests can swap the host tooling for a recorder.

use std::process::Command;

use thiserror::Error;
use tracing::debug;

/// Errors returned by a [`CommandRunner`].
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },
}

/// Executes a shell command string on the host.
///
/// The call is synchronous; async callers are expected to move it onto the
/// blocking pool.
pub trait CommandRunner: Send + Sync {
    /// Runs `command` and returns its combined stdout and stderr.
    fn run(&self, command: &str) -> Result<String, CommandError>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run(&self, command: &str) -> Result<String, CommandError> {
        debug!(command, "executing host command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|source| CommandError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(CommandError::Failed {
                command: command.to_string(),
                status: output.status.to_string(),
                output: combined.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// Records every command and fails the ones matching a registered prefix.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingRunner {
        pub(crate) commands: Mutex<Vec<String>>,
        failing_prefixes: Mutex<HashSet<String>>,
    }

    impl RecordingRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn fail_on(&self, prefix: &str) {
            self.failing_prefixes
                .lock()
                .unwrap()
                .insert(prefix.to_string());
        }

        pub(crate) fn recorded(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, command: &str) -> Result<String, CommandError> {
            self.commands.lock().unwrap().push(command.to_string());

            let fails = self
                .failing_prefixes
                .lock()
                .unwrap()
                .iter()
                .any(|prefix| command.starts_with(prefix.as_str()));

            if fails {
                Err(CommandError::Failed {
                    command: command.to_string(),
                    status: "exit status: 2".to_string(),
                    output: "RTNETLINK answers: Operation not permitted".to_string(),
                })
            } else {
                Ok(String::new())
            }
        }
    }
}
