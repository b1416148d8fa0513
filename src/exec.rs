use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::chainload::ChainloadTarget;

/// Flag a target answers with a JSON description of its own options.
pub const DESCRIBE_OPTIONS_FLAG: &str = "--describe-options";

/// Flag a target answers with its version on stdout.
pub const VERSION_FLAG: &str = "--version";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("entrypoint `{name}` cannot be found on PATH")]
    EntrypointNotFound {
        name:   String,
        #[source]
        source: which::Error,
    },
    #[error("{} cannot be found (did it download properly?)", path.display())]
    Missing { path: PathBuf },
    #[error("failed to start {}", path.display())]
    Spawn {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One option advertised by the target artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetOption {
    pub long:       String,
    #[serde(default)]
    pub short:      Option<char>,
    #[serde(default)]
    pub value_name: Option<String>,
    #[serde(default)]
    pub help:       String,
}

impl TargetOption {
    /// Help line in the same shape clap prints launcher options.
    pub fn help_line(&self) -> String {
        let mut usage = match self.short {
            Some(short) => format!("  -{short}, --{}", self.long),
            None => format!("      --{}", self.long),
        };
        if let Some(value) = &self.value_name {
            usage.push_str(&format!(" <{value}>"));
        }
        format!("{usage:<36}{}", self.help)
    }
}

/// Runs the program that takes over once the launcher is done.
pub trait TargetRunner {
    /// Hand execution to `program`. Returns the program's exit code where the
    /// platform cannot replace the current process.
    fn hand_off(&self, program: &Path, args: &[String]) -> Result<i32, ExecError>;

    /// Ask `artifact` to describe its options; `None` if it cannot.
    fn describe_options(&self, artifact: &Path) -> Option<Vec<TargetOption>>;
    /// What `artifact` prints for `--version`, if it answers at all.
    fn query_version(&self, artifact: &Path) -> Option<String>;
}

/// Turn a chainload target into something runnable.
pub fn resolve_program(target: &ChainloadTarget) -> Result<Option<PathBuf>, ExecError> {
    match target {
        ChainloadTarget::None => Ok(None),
        ChainloadTarget::Entrypoint(name) => which::which(name)
            .map(Some)
            .map_err(|source| ExecError::EntrypointNotFound {
                name: name.clone(),
                source,
            }),
        ChainloadTarget::Artifact(path) => Ok(Some(path.clone())),
    }
}

/// A bare relative file name would be looked up on PATH; anchor it to the
/// working directory instead.
fn anchored(program: &Path) -> PathBuf {
    if program.is_relative() && program.parent().is_some_and(|p| p.as_os_str().is_empty()) {
        Path::new(".").join(program)
    } else {
        program.to_path_buf()
    }
}

/// Starts targets as real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl TargetRunner for ProcessRunner {
    /// Unix: replace the current process image, so the target inherits the
    /// launcher's PID and signals. Only returns on failure.
    #[cfg(unix)]
    fn hand_off(&self, program: &Path, args: &[String]) -> Result<i32, ExecError> {
        use std::os::unix::process::CommandExt;

        if !program.exists() {
            return Err(ExecError::Missing { path: program.to_path_buf() });
        }
        let program = anchored(program);
        debug!(program = %program.display(), ?args, "exec");
        let source = Command::new(&program).args(args).exec();
        Err(ExecError::Spawn { path: program, source })
    }

    /// Elsewhere: run the target to completion and pass its exit code back.
    #[cfg(not(unix))]
    fn hand_off(&self, program: &Path, args: &[String]) -> Result<i32, ExecError> {
        if !program.exists() {
            return Err(ExecError::Missing { path: program.to_path_buf() });
        }
        let program = anchored(program);
        debug!(program = %program.display(), ?args, "spawn");
        let status = Command::new(&program)
            .args(args)
            .status()
            .map_err(|source| ExecError::Spawn { path: program.clone(), source })?;
        Ok(status.code().unwrap_or(1))
    }

    /// Best effort: any failure just means no target options in the help.
    fn describe_options(&self, artifact: &Path) -> Option<Vec<TargetOption>> {
        capture(artifact, DESCRIBE_OPTIONS_FLAG)
            .and_then(|stdout| {
                serde_json::from_slice(&stdout).context("parsing option descriptor")
            })
            .map_err(|e| debug!(error = %format!("{e:#}"), "target options unavailable"))
            .ok()
    }

    fn query_version(&self, artifact: &Path) -> Option<String> {
        capture(artifact, VERSION_FLAG)
            .and_then(|stdout| String::from_utf8(stdout).context("version is not UTF-8"))
            .map_err(|e| debug!(error = %format!("{e:#}"), "target version unavailable"))
            .ok()
    }
}

/// Run `artifact flag` without input and collect what it prints on success.
fn capture(artifact: &Path, flag: &str) -> anyhow::Result<Vec<u8>> {
    let output = Command::new(anchored(artifact))
        .arg(flag)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("running {} {flag}", artifact.display()))?;
    if !output.status.success() {
        anyhow::bail!("{flag} exited with {}", output.status);
    }
    Ok(output.stdout)
}
