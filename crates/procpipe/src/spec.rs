//! Process specification builder.
//!
//! A [`ProcessSpec`] is an intent-based description of the child to run:
//! what to execute, with which arguments and environment, and how each
//! standard stream should be wired. It is consumed by
//! [`ProcessExecutor::new`].
//!
//! The child's environment is EMPTY by default. Inheriting the parent's
//! environment is an explicit choice via [`ProcessSpec::inherit_env`].
//!
//! [`ProcessExecutor::new`]: crate::executor::ProcessExecutor::new

use std::ffi::OsString;
use std::path::PathBuf;

use crate::stdin::InputSource;
use crate::teardown::TeardownSequence;
use crate::types::OutputPolicy;

/// Description of a child process to spawn.
#[derive(Debug)]
pub struct ProcessSpec {
    pub(crate) executable: PathBuf,
    pub(crate) args: Vec<OsString>,
    pub(crate) env: Vec<(OsString, OsString)>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) stdin: InputSource,
    pub(crate) stdout: OutputPolicy,
    pub(crate) stderr: OutputPolicy,
    pub(crate) teardown: TeardownSequence,
}

impl ProcessSpec {
    /// Start describing a child running `executable`.
    ///
    /// Defaults: no arguments, empty environment, empty stdin (immediate
    /// EOF, no pipe allocated), both outputs streamed, and a teardown plan
    /// of "kill outright".
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: InputSource::Empty,
            stdout: OutputPolicy::Stream,
            stderr: OutputPolicy::Stream,
            teardown: TeardownSequence::default(),
        }
    }

    /// Append one argument (argv[0] is derived from the executable).
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the child.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Merge the parent's environment underneath any variables already
    /// set on this spec (explicit settings win over inherited ones).
    #[must_use]
    pub fn inherit_env(mut self) -> Self {
        let overrides = std::mem::take(&mut self.env);
        let mut combined: Vec<(OsString, OsString)> = std::env::vars_os().collect();

        for (key, value) in overrides {
            if let Some((_, existing)) = combined.iter_mut().find(|(k, _)| *k == key) {
                *existing = value;
            } else {
                combined.push((key, value));
            }
        }

        self.env = combined;
        self
    }

    /// Run the child in this working directory.
    #[must_use]
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Feed this input to the child's stdin.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<InputSource>) -> Self {
        self.stdin = stdin.into();
        self
    }

    /// How to wire the child's stdout.
    #[must_use]
    pub fn with_stdout(mut self, policy: OutputPolicy) -> Self {
        self.stdout = policy;
        self
    }

    /// How to wire the child's stderr.
    #[must_use]
    pub fn with_stderr(mut self, policy: OutputPolicy) -> Self {
        self.stderr = policy;
        self
    }

    /// The escalation plan to run when the run is cancelled.
    #[must_use]
    pub fn with_teardown(mut self, teardown: TeardownSequence) -> Self {
        self.teardown = teardown;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_empty_env_and_streamed_outputs() {
        let spec = ProcessSpec::new("/bin/true");
        assert!(spec.env.is_empty());
        assert!(spec.stdout.is_streamed());
        assert!(spec.stderr.is_streamed());
        assert!(spec.stdin.is_empty_source());
    }

    #[test]
    fn explicit_env_wins_over_inherited() {
        let spec = ProcessSpec::new("/bin/true")
            .with_env("PATH", "/overridden")
            .inherit_env();

        let path = spec
            .env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone());
        assert_eq!(path, Some("/overridden".into()));
        // Inherited variables came along too (vars_os is never this small).
        assert!(spec.env.len() > 1 || std::env::vars_os().count() <= 1);
    }

    #[test]
    fn args_accumulate_in_order() {
        let spec = ProcessSpec::new("/bin/echo")
            .with_arg("-n")
            .with_args(["a", "b"]);
        assert_eq!(spec.args, ["-n", "a", "b"]);
    }
}
