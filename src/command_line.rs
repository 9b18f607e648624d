//! The identity of a managed process: what to run, with which environment.

use std::collections::BTreeMap;
use std::fmt;

/// An ordered sequence of arguments, the first one being the program to run.
///
/// Arguments are kept verbatim. Parsing a `&str` splits on whitespace only and never interprets
/// quotes, so pass a `Vec` when an argument must contain spaces or be empty.
///
/// ```
/// use queue_harness::CommandLine;
///
/// let cmd = CommandLine::from(vec!["redis-server", "--save", ""]);
/// assert_eq!(cmd.program(), Some("redis-server"));
/// assert_eq!(cmd.to_string(), "redis-server --save \"\"");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CommandLine {
    args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits `line` on whitespace.
    pub fn parse(line: &str) -> Self {
        Self::new(line.split_whitespace())
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// All arguments following the program.
    pub fn args(&self) -> &[String] {
        self.args.get(1..).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Appends `args` after the existing arguments.
    pub fn extend<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Creates a tokio command for this command line, or `None` if there is no program.
    pub(crate) fn to_command(&self) -> Option<tokio::process::Command> {
        let program = self.program()?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(self.args());
        Some(cmd)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arg in &self.args {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, "\"{arg}\"")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        Self::parse(line)
    }
}

impl From<String> for CommandLine {
    fn from(line: String) -> Self {
        Self::parse(&line)
    }
}

impl<S: Into<String>> From<Vec<S>> for CommandLine {
    fn from(args: Vec<S>) -> Self {
        Self::new(args)
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for CommandLine {
    fn from(args: [S; N]) -> Self {
        Self::new(args)
    }
}

/// How environment overrides relate to the environment of the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvMode {
    /// The child inherits the parent environment, overrides win on conflict.
    #[default]
    Inherit,

    /// The child sees the overrides and nothing else.
    Replace,
}

/// Environment overrides for a managed process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    mode: EnvMode,
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// An inheriting environment without overrides.
    pub fn inherit() -> Self {
        Self::default()
    }

    /// An empty environment. Add variables with [Environment::var].
    pub fn replace() -> Self {
        Self {
            mode: EnvMode::Replace,
            vars: BTreeMap::new(),
        }
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn mode(&self) -> EnvMode {
        self.mode
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn apply(&self, cmd: &mut tokio::process::Command) {
        if self.mode == EnvMode::Replace {
            cmd.env_clear();
        }
        cmd.envs(&self.vars);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            mode: EnvMode::Inherit,
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
