//! Structured command descriptors for external tools.
//!
//! A [`Cmd`] names a tool and its argument list without ever going through a
//! shell. Arguments that depend on the contents of another build output (such
//! as an API fingerprint) are kept symbolic until the command runs, so the
//! descriptor stays stable and serializable while it sits in the action graph.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::ApexError;

/// One argument of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Literal(String),
    Path(PathBuf),
    /// `prefix` followed by the trimmed contents of `path`, read at run time.
    FileContents { prefix: String, path: PathBuf },
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Literal(s) => write!(f, "{}", s),
            Arg::Path(p) => write!(f, "{}", p.display()),
            Arg::FileContents { prefix, path } => {
                write!(f, "{}$(cat {})", prefix, path.display())
            }
        }
    }
}

/// Builder for one external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cmd {
    program: String,
    args: Vec<Arg>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout_to: Option<PathBuf>,
    #[serde(skip)]
    error_msg: Option<String>,
    #[serde(skip)]
    allow_fail: bool,
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdResult {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdout_to: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Literal(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| Arg::Literal(a.into())));
        self
    }

    pub fn arg_path(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push(Arg::Path(path.as_ref().to_path_buf()));
        self
    }

    pub fn arg_value(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    /// Append `prefix` + contents of `path` (trimmed), resolved when run.
    pub fn arg_file_contents(mut self, prefix: impl Into<String>, path: impl AsRef<Path>) -> Self {
        self.args.push(Arg::FileContents {
            prefix: prefix.into(),
            path: path.as_ref().to_path_buf(),
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Write captured stdout to a file instead of returning it.
    pub fn stdout_to(mut self, path: impl AsRef<Path>) -> Self {
        self.stdout_to = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result even on nonzero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[Arg] {
        &self.args
    }

    /// Literal view of the arguments, for matching in plans and tests.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_string()).collect()
    }

    /// Files the command reads implicitly through its arguments.
    pub fn implicit_inputs(&self) -> Vec<PathBuf> {
        self.args
            .iter()
            .filter_map(|a| match a {
                Arg::FileContents { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    fn resolve_args(&self) -> Result<Vec<String>> {
        self.args
            .iter()
            .map(|a| match a {
                Arg::Literal(s) => Ok(s.clone()),
                Arg::Path(p) => Ok(p.to_string_lossy().into_owned()),
                Arg::FileContents { prefix, path } => {
                    let contents = fs::read_to_string(path)
                        .with_context(|| format!("reading argument file '{}'", path.display()))?;
                    Ok(format!("{}{}", prefix, contents.trim()))
                }
            })
            .collect()
    }

    /// Run the command to completion, capturing output.
    ///
    /// A nonzero exit becomes [`ApexError::ToolFailure`] unless
    /// [`Cmd::allow_fail`] was set.
    pub fn run(&self) -> Result<CmdResult> {
        let args = self.resolve_args()?;
        tracing::debug!(program = %self.program, ?args, "running tool");

        let output = Command::new(&self.program)
            .args(&args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        let result = CmdResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let status = match result.code {
                Some(code) => format!("exit code {}", code),
                None => "killed by signal".to_string(),
            };
            let failure = ApexError::ToolFailure {
                tool: self.program.clone(),
                status,
                stderr: result.stderr.trim().to_string(),
            };
            return Err(match &self.error_msg {
                Some(msg) => anyhow::Error::new(failure).context(msg.clone()),
                None => failure.into(),
            });
        }

        if let Some(path) = &self.stdout_to {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, &output.stdout)
                .with_context(|| format!("writing output of '{}' to '{}'", self.program, path.display()))?;
        }

        Ok(result)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(path) = &self.stdout_to {
            write!(f, " > {}", path.display())?;
        }
        Ok(())
    }
}

/// Check whether a tool is on PATH.
pub fn exists(tool: &str) -> bool {
    which::which(tool).is_ok()
}
