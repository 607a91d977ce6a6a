use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

use crate::report::OutputMode;

pub const DEFAULT_INVENTORY: &str = "inventory.yaml";
pub const DEFAULT_FORKS: usize = 5;
pub const DEFAULT_COMMAND: &str = "uptime";
pub const DEFAULT_TIMEOUT: &str = "30s";

/// Single-dash long flags accepted for compatibility with Go-style CLIs.
const GO_STYLE_LONG_FLAGS: &[&str] = &["src", "dst", "copy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ModeKind {
    #[default]
    Exec,
    Copy,
}

/// One local path and where it lands on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPair {
    pub src: PathBuf,
    pub dst: String,
}

impl CopyPair {
    /// Parse the `local:remote` form. The first `:` splits the two halves.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidCopyPair(spec.to_string());
        let (src, dst) = spec.split_once(':').ok_or_else(invalid)?;
        if src.trim().is_empty() || dst.trim().is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            src: PathBuf::from(src),
            dst: dst.to_string(),
        })
    }
}

/// What every target runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Exec { command: String },
    /// Copied in order over one session per host.
    Copy { pairs: Vec<CopyPair> },
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Exec { .. } => "exec",
            Mode::Copy { .. } => "copy",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("forks must be >= 1")]
    ZeroForks,

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("copy mode requires -src and -dst")]
    MissingCopyPaths,

    #[error("got {src} -src but {dst} -dst values; they pair up in order")]
    UnpairedCopyPaths { src: usize, dst: usize },

    #[error("invalid copy pair '{0}': expected local:remote")]
    InvalidCopyPair(String),

    #[error("copy source '{0}' does not exist")]
    MissingSource(PathBuf),

    #[error("exec mode requires a non-empty command")]
    EmptyCommand,

    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub forks: usize,
    pub timeout: Duration,
    pub mode: Mode,
    pub output: OutputMode,
    pub filter: Option<String>,
}

/// Raw knobs as they arrive from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub forks: usize,
    pub timeout: Duration,
    pub mode: ModeKind,
    pub command: String,
    pub src: Vec<PathBuf>,
    pub dst: Vec<String>,
    /// `local:remote` pairs, copied after the `src`/`dst` pairs.
    pub copy: Vec<String>,
    pub output: OutputMode,
    pub filter: Option<String>,
}

impl RunConfig {
    pub fn from_options(opts: RunOptions) -> Result<Self, ConfigError> {
        if opts.forks == 0 {
            return Err(ConfigError::ZeroForks);
        }
        if opts.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        let mode = match opts.mode {
            ModeKind::Exec => {
                if opts.command.trim().is_empty() {
                    return Err(ConfigError::EmptyCommand);
                }
                Mode::Exec {
                    command: opts.command,
                }
            }
            ModeKind::Copy => {
                if opts.src.len() != opts.dst.len() {
                    return Err(ConfigError::UnpairedCopyPaths {
                        src: opts.src.len(),
                        dst: opts.dst.len(),
                    });
                }
                let mut pairs: Vec<CopyPair> = opts
                    .src
                    .into_iter()
                    .zip(opts.dst)
                    .map(|(src, dst)| CopyPair { src, dst })
                    .collect();
                for spec in &opts.copy {
                    pairs.push(CopyPair::parse(spec)?);
                }

                if pairs.is_empty() || pairs.iter().any(|p| p.dst.trim().is_empty()) {
                    return Err(ConfigError::MissingCopyPaths);
                }
                if let Some(missing) = pairs.iter().find(|p| !p.src.exists()) {
                    return Err(ConfigError::MissingSource(missing.src.clone()));
                }
                Mode::Copy { pairs }
            }
        };

        Ok(Self {
            forks: opts.forks,
            timeout: opts.timeout,
            mode,
            output: opts.output,
            filter: opts.filter.filter(|f| !f.trim().is_empty()),
        })
    }
}

/// Parse a Go-style duration: `30s`, `1m30s`, `1.5s`, `250ms`, `2h`.
/// A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid("empty"));
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid("out of range"));
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if num_len == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| invalid("bad number"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid("unknown unit")),
        };
        total += value * scale;
        rest = &rest[unit_len..];
    }

    Duration::try_from_secs_f64(total).map_err(|_| invalid("out of range"))
}

/// Rewrite `-src x` / `-dst=x` into the `--src` / `--dst` form clap expects.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(|arg| {
            let arg: OsString = arg.into();
            let Some(s) = arg.to_str() else {
                return arg;
            };
            let Some(flag) = s.strip_prefix('-').filter(|f| !f.starts_with('-')) else {
                return arg;
            };
            let name = flag.split('=').next().unwrap_or(flag);
            if GO_STYLE_LONG_FLAGS.contains(&name) {
                OsString::from(format!("-{s}"))
            } else {
                arg
            }
        })
        .collect()
}
