//! Public API for the interpreter: sessions, errors and the text entry point.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use thiserror::Error;

use crate::eval::eval;
use crate::parse::{parse_statement, Stmt};
use crate::value::Value;

/// Errors raised while evaluating input.
///
/// These never escape [`run`]; they are rendered onto the error stream.
#[derive(Debug, Error)]
pub enum CalcError {
    /// A character outside the language.
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),

    /// A numeric literal that does not parse.
    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    /// A token in a position the grammar does not allow.
    #[error("unexpected {0}")]
    UnexpectedToken(String),

    /// Input ended in the middle of an expression.
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// Reference to a name with no binding in the session.
    #[error("undefined: {0}")]
    UndefinedVariable(String),

    /// Call of a function that is not a builtin.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Builtin called with the wrong number of arguments.
    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        /// Function name.
        name: String,
        /// Expected argument count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// Expression nested deeper than the parser accepts.
    #[error("expression nested too deeply (limit {0})")]
    TooDeep(usize),

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Integer result does not fit in 64 bits.
    #[error("integer overflow")]
    Overflow,

    /// Argument outside the function's domain.
    #[error("{0}")]
    Domain(String),

    /// Unrecognized `)command`.
    #[error("unknown command: ){0}")]
    UnknownCommand(String),

    /// Malformed arguments to a `)command`.
    #[error("usage: {0}")]
    Usage(&'static str),

    /// Command refused because the session is restricted.
    #[error("){0} is disabled in restricted mode")]
    Restricted(&'static str),

    /// Filesystem failure from `)save` / `)load`.
    #[error("{path}: {source}")]
    Io {
        /// File involved.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Malformed bindings file.
    #[error("{path}: {source}")]
    Format {
        /// File involved.
        path: String,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// Session options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Disable commands that touch the filesystem.
    pub restricted: bool,
    /// Fractional digits used when printing floats.
    pub precision: usize,
}

impl SessionConfig {
    /// Default float display precision.
    pub const DEFAULT_PRECISION: usize = 10;

    /// Upper bound accepted by `)prec`.
    pub const MAX_PRECISION: usize = 30;
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            restricted: true,
            precision: Self::DEFAULT_PRECISION,
        }
    }
}

/// Accumulated interpreter state: variable bindings plus display settings.
#[derive(Debug, Clone, Default)]
pub struct Session {
    config: SessionConfig,
    bindings: BTreeMap<String, Value>,
}

impl Session {
    /// Create an empty session.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            bindings: BTreeMap::new(),
        }
    }

    /// Current configuration (including any `)prec` change).
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Look up a binding.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).copied()
    }

    /// All bindings, sorted by name.
    pub fn bindings(&self) -> &BTreeMap<String, Value> {
        &self.bindings
    }

    /// Execute `input`, appending printed values to `stdout`.
    ///
    /// Stops at the first error. Bindings made by earlier statements are kept.
    pub fn exec(&mut self, input: &str, stdout: &mut String) -> Result<(), CalcError> {
        for line in input.lines() {
            let line = strip_comment(line).trim();
            if let Some(command) = line.strip_prefix(')') {
                self.command(command.trim(), stdout)?;
                continue;
            }
            for stmt in line.split(';') {
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                match parse_statement(stmt)? {
                    Stmt::Assign(name, expr) => {
                        let value = eval(&expr, &self.bindings)?;
                        self.bindings.insert(name, value);
                    }
                    Stmt::Expr(expr) => {
                        let value = eval(&expr, &self.bindings)?;
                        let _ = writeln!(stdout, "{}", value.display(self.config.precision));
                    }
                }
            }
        }
        Ok(())
    }

    fn command(&mut self, command: &str, stdout: &mut String) -> Result<(), CalcError> {
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match name {
            "vars" => {
                for (name, value) in &self.bindings {
                    let _ = writeln!(stdout, "{name} = {}", value.display(self.config.precision));
                }
                Ok(())
            }
            "clear" => {
                self.bindings.clear();
                Ok(())
            }
            "prec" => {
                let precision: usize = arg.parse().map_err(|_| CalcError::Usage(")prec N"))?;
                if precision > SessionConfig::MAX_PRECISION {
                    return Err(CalcError::Usage(")prec N (N <= 30)"));
                }
                self.config.precision = precision;
                Ok(())
            }
            "save" => {
                if self.config.restricted {
                    return Err(CalcError::Restricted("save"));
                }
                if arg.is_empty() {
                    return Err(CalcError::Usage(")save PATH"));
                }
                self.save(Path::new(arg))
            }
            "load" => {
                if self.config.restricted {
                    return Err(CalcError::Restricted("load"));
                }
                if arg.is_empty() {
                    return Err(CalcError::Usage(")load PATH"));
                }
                self.load(Path::new(arg))
            }
            other => Err(CalcError::UnknownCommand(other.to_string())),
        }
    }

    fn save(&self, path: &Path) -> Result<(), CalcError> {
        // JSON has no representation for inf/NaN; they would load back as null.
        if let Some((name, _)) = self
            .bindings
            .iter()
            .find(|(_, value)| matches!(value, Value::Float(v) if !v.is_finite()))
        {
            return Err(CalcError::Domain(format!(
                "cannot save {name}: value is not finite"
            )));
        }
        let json = serde_json::to_string_pretty(&self.bindings).map_err(|source| {
            CalcError::Format {
                path: path.display().to_string(),
                source,
            }
        })?;
        std::fs::write(path, json).map_err(|source| CalcError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn load(&mut self, path: &Path) -> Result<(), CalcError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CalcError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let loaded: BTreeMap<String, Value> =
            serde_json::from_str(&raw).map_err(|source| CalcError::Format {
                path: path.display().to_string(),
                source,
            })?;
        self.bindings.extend(loaded);
        Ok(())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Evaluate `input` against `session`, writing results to `stdout` and the
/// first error (if any) to `stderr` as `error: <message>`.
pub fn run(session: &mut Session, input: &str, stdout: &mut String, stderr: &mut String) {
    if let Err(err) = session.exec(input, stdout) {
        let _ = writeln!(stderr, "error: {err}");
    }
}
