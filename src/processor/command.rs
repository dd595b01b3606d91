//! Handlers backed by external executables.
//!
//! A handlers file maps each job type to a command:
//!
//! ```toml
//! [handlers.meeting-rescan]
//! command = "bin/meeting-rescan"
//! args = ["--quiet"]
//! ```
//!
//! The command receives the payload as JSON on stdin and the job identity in
//! `JOBQ_*` environment variables. Whatever it prints on stdout is parsed as
//! the JSON result (empty output means `{}`). A non-zero exit is a retryable
//! failure whose cause is the tail of stderr.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{HandlerContext, HandlerError, HandlerRegistry, JobHandler};
use crate::error::{Error, Result};
use crate::model::JobType;

/// Bytes of stderr kept as the failure cause.
const STDERR_TAIL: usize = 2_000;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct HandlersFile {
    #[serde(default)]
    handlers: HashMap<String, CommandConfig>,
}

/// One `[handlers.<job-type>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Runs one external command per job.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    config: CommandConfig,
}

impl CommandHandler {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    /// Load a handlers file into a registry. Unknown job type keys are a
    /// config error; completeness is checked later by `build()`.
    pub fn load_registry(path: &Path) -> Result<HandlerRegistry> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read handlers file {}: {e}", path.display()))
        })?;
        Self::parse_registry(&content)
            .map_err(|e| Error::Config(format!("bad handlers file {}: {e}", path.display())))
    }

    fn parse_registry(content: &str) -> Result<HandlerRegistry> {
        let file: HandlersFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;

        let mut registry = HandlerRegistry::new();
        for (name, config) in file.handlers {
            let job_type: JobType = name.parse()?;
            registry = registry.register(job_type, CommandHandler::new(config));
        }
        Ok(registry)
    }

    fn resolved_command(&self) -> std::io::Result<PathBuf> {
        // Relative commands resolve against the process CWD.
        if self.config.command.is_relative() && self.config.command.components().count() > 1 {
            Ok(std::env::current_dir()?.join(&self.config.command))
        } else {
            Ok(self.config.command.clone())
        }
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn handle(&self, ctx: HandlerContext) -> std::result::Result<serde_json::Value, HandlerError> {
        let command = self
            .resolved_command()
            .map_err(|e| HandlerError::retryable("cannot resolve handler command").with_cause(e.to_string()))?;
        let input = serde_json::to_vec(&ctx.payload)
            .map_err(|e| HandlerError::permanent("payload is not serializable").with_cause(e.to_string()))?;

        debug!(
            parent: &ctx.span,
            command = %command.display(),
            "running handler command"
        );

        let mut child = Command::new(&command)
            .args(&self.config.args)
            .env("JOBQ_JOB_ID", ctx.job_id.to_string())
            .env("JOBQ_JOB_TYPE", ctx.job_type.as_str())
            .env("JOBQ_USER_ID", &ctx.user_id)
            .env("JOBQ_CORRELATION_ID", &ctx.correlation_id)
            .env("JOBQ_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HandlerError::retryable(format!("cannot start {}", command.display()))
                    .with_cause(e.to_string())
            })?;

        // Feed stdin while stdout and stderr drain; a handler that writes
        // before reading would otherwise block on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok::<(), HandlerError>(());
            };
            match stdin.write_all(&input).await {
                // The command exited without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(HandlerError::retryable("cannot write payload to handler")
                    .with_cause(e.to_string())),
                Ok(()) => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output = output.map_err(|e| {
            HandlerError::retryable("handler command did not complete").with_cause(e.to_string())
        })?;
        fed?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_chars(stderr.trim(), STDERR_TAIL);
            return Err(HandlerError::retryable(format!(
                "{} handler exited with status {}",
                ctx.job_type,
                output.status.code().unwrap_or(-1)
            ))
            .with_cause(tail));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(stdout.trim()).map_err(|e| {
            HandlerError::retryable(format!("{} handler printed invalid JSON", ctx.job_type))
                .with_cause(e.to_string())
        })
    }
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handlers_table() {
        let registry = CommandHandler::parse_registry(
            r#"
            [handlers.meeting-rescan]
            command = "bin/rescan"

            [handlers.fathom-sync]
            command = "/usr/bin/true"
            args = ["--fast"]
            "#,
        )
        .unwrap();
        let missing = registry.missing();
        assert!(!missing.contains(&JobType::MeetingRescan));
        assert!(!missing.contains(&JobType::FathomSync));
        assert!(missing.contains(&JobType::SlackUsersSync));
    }

    #[test]
    fn unknown_job_type_key_is_rejected() {
        let err = CommandHandler::parse_registry(
            r#"
            [handlers.calendar-sync]
            command = "bin/cal"
            "#,
        )
        .err()
        .expect("unknown type must fail");
        assert!(err.to_string().contains("calendar-sync"));
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
