//! Loop script parsing.
//!
//! A loop script is a sequence of directive lines. Text after `#` is a
//! comment and blank lines are ignored. The first token of a line selects the
//! directive:
//!
//! ```text
//! FFLD read mm3.fld
//! PARM params.txt
//! RDAT -d ref -r reference.txt
//! CDAT -d ref -me a.mae -mb a.mae
//! COMP -o start.txt
//! LOOP 0.01
//!   GRAD
//! END
//! FFLD write mm3.fld
//! ```
//!
//! The whole script is parsed into [`Directive`]s before anything runs, so a
//! `LOOP` without its `END` is reported before any side effect. Lines with an
//! unknown first token are skipped.

use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors in loop scripts.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// I/O error when reading the script
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// `LOOP` without a matching `END`
    #[error("Line {line}: LOOP has no matching END")]
    UnmatchedLoop {
        /// 1-based line of the `LOOP`
        line: usize,
    },
    /// Threshold is not a non-negative number
    #[error("Line {line}: invalid convergence threshold '{value}'")]
    InvalidThreshold {
        /// 1-based line
        line: usize,
        /// Offending token
        value: String,
    },
    /// A directive lacks an argument
    #[error("Line {line}: {directive} requires {what}")]
    MissingArgument {
        /// 1-based line
        line: usize,
        /// Directive name
        directive: String,
        /// Description of the argument
        what: String,
    },
}

type Result<T> = std::result::Result<T, ScriptError>;

/// One parsed script directive.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `FFLD read <path>`
    LoadFF(PathBuf),
    /// `FFLD write <path>`
    WriteFF(PathBuf),
    /// `PARM <path>`
    FilterParams(PathBuf),
    /// `LOOP <threshold>` … `END`
    Loop {
        /// Fractional score change at or below which the loop stops
        threshold: f64,
        /// Directives repeated every cycle
        body: Vec<Directive>,
    },
    /// `RDAT <args>`
    ReadReferenceData(Vec<String>),
    /// `CDAT <args>`
    ReadComputedData(Vec<String>),
    /// `COMP [-o <path>]`
    Compare {
        /// Report file
        output: Option<PathBuf>,
    },
    /// `GRAD`
    GradientStep,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::LoadFF(path) => write!(f, "FFLD read {}", path.display()),
            Directive::WriteFF(path) => write!(f, "FFLD write {}", path.display()),
            Directive::FilterParams(path) => write!(f, "PARM {}", path.display()),
            Directive::Loop { threshold, body } => {
                write!(f, "LOOP {} ({} directives)", threshold, body.len())
            }
            Directive::ReadReferenceData(args) => write!(f, "RDAT {}", args.join(" ")),
            Directive::ReadComputedData(args) => write!(f, "CDAT {}", args.join(" ")),
            Directive::Compare { output: Some(path) } => write!(f, "COMP -o {}", path.display()),
            Directive::Compare { output: None } => write!(f, "COMP"),
            Directive::GradientStep => write!(f, "GRAD"),
        }
    }
}

/// Reads and parses a loop script file.
pub fn read_loop_input(path: &Path) -> Result<Vec<Directive>> {
    let content = fs::read_to_string(path)?;
    info!("{:=^79}", " qmff ");
    info!("Commands:");
    for (_, line) in script_lines(&content) {
        info!("> {}", line);
    }
    info!("{}", "=".repeat(79));
    parse_script(&content)
}

/// Non-empty, comment-stripped lines with their 1-based line numbers.
pub fn script_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.split('#').next().unwrap_or("").trim()))
        .filter(|(_, line)| !line.is_empty())
        .collect()
}

/// Parses script content into directives.
pub fn parse_script(content: &str) -> Result<Vec<Directive>> {
    let lines = script_lines(content);
    let mut pos = 0;
    parse_block(&lines, &mut pos, None)
}

/// Parses lines until the `END` closing the loop opened on `opened_at`, or
/// until the end of the script at top level.
fn parse_block(
    lines: &[(usize, &str)],
    pos: &mut usize,
    opened_at: Option<usize>,
) -> Result<Vec<Directive>> {
    let mut directives = Vec::new();

    while let Some(&(number, line)) = lines.get(*pos) {
        *pos += 1;
        let cols: Vec<&str> = line.split_whitespace().collect();

        match cols[0] {
            "END" => match opened_at {
                Some(_) => return Ok(directives),
                None => warn!("Line {}: END without LOOP ignored", number),
            },
            "LOOP" => {
                let value = cols.get(1).ok_or_else(|| missing(number, "LOOP", "a threshold"))?;
                let threshold = value
                    .parse::<f64>()
                    .ok()
                    .filter(|t| t.is_finite() && *t >= 0.0)
                    .ok_or_else(|| ScriptError::InvalidThreshold {
                        line: number,
                        value: value.to_string(),
                    })?;
                let body = parse_block(lines, pos, Some(number))?;
                directives.push(Directive::Loop { threshold, body });
            }
            "FFLD" => {
                let path = cols
                    .get(2)
                    .map(PathBuf::from)
                    .ok_or_else(|| missing(number, "FFLD", "a mode and a path"))?;
                match cols[1] {
                    "read" => directives.push(Directive::LoadFF(path)),
                    "write" => directives.push(Directive::WriteFF(path)),
                    other => debug!("Line {}: unknown FFLD mode '{}' skipped", number, other),
                }
            }
            "PARM" => {
                let path = cols.get(1).ok_or_else(|| missing(number, "PARM", "a path"))?;
                directives.push(Directive::FilterParams(PathBuf::from(path)));
            }
            "RDAT" => directives.push(Directive::ReadReferenceData(arguments(&cols))),
            "CDAT" => directives.push(Directive::ReadComputedData(arguments(&cols))),
            "COMP" => {
                let output = match cols.iter().position(|c| *c == "-o") {
                    Some(i) => Some(
                        cols.get(i + 1)
                            .map(PathBuf::from)
                            .ok_or_else(|| missing(number, "COMP -o", "a path"))?,
                    ),
                    None => None,
                };
                directives.push(Directive::Compare { output });
            }
            "GRAD" => directives.push(Directive::GradientStep),
            other => debug!("Line {}: unknown directive '{}' skipped", number, other),
        }
    }

    match opened_at {
        Some(line) => Err(ScriptError::UnmatchedLoop { line }),
        None => Ok(directives),
    }
}

fn arguments(cols: &[&str]) -> Vec<String> {
    cols[1..].iter().map(|s| s.to_string()).collect()
}

fn missing(line: usize, directive: &str, what: &str) -> ScriptError {
    ScriptError::MissingArgument {
        line,
        directive: directive.to_string(),
        what: what.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_script() {
        let script = "\
# calibrate
FFLD read mm3.fld
RDAT -d ref -r ref.txt   # reference
CDAT -d ref -me a.mae

COMP -o start.txt
LOOP 0.01
  GRAD
  LOOP 0.1
    CDAT -me a.mae
    COMP
  END
END
FFLD write mm3.fld
";
        let directives = parse_script(script).unwrap();
        assert_eq!(directives.len(), 6);
        assert_eq!(directives[0], Directive::LoadFF(PathBuf::from("mm3.fld")));
        assert_eq!(
            directives[1],
            Directive::ReadReferenceData(vec!["-d".into(), "ref".into(), "-r".into(), "ref.txt".into()])
        );
        assert_eq!(
            directives[3],
            Directive::Compare {
                output: Some(PathBuf::from("start.txt"))
            }
        );
        match &directives[4] {
            Directive::Loop { threshold, body } => {
                assert_eq!(*threshold, 0.01);
                assert_eq!(body.len(), 2);
                assert_eq!(body[0], Directive::GradientStep);
                assert!(matches!(&body[1], Directive::Loop { body, .. } if body.len() == 2));
            }
            other => panic!("expected loop, got {:?}", other),
        }
        assert_eq!(directives[5], Directive::WriteFF(PathBuf::from("mm3.fld")));
    }

    #[test]
    fn test_unmatched_loop() {
        let err = parse_script("FFLD read a.fld\nLOOP 0.1\nGRAD\nLOOP 0.2\nEND\n").unwrap_err();
        assert!(matches!(err, ScriptError::UnmatchedLoop { line: 2 }));
    }

    #[test]
    fn test_unknown_and_stray_lines_are_skipped() {
        let directives = parse_script("SIMP\nEND\nGRAD\n").unwrap();
        assert_eq!(directives, vec![Directive::GradientStep]);
    }

    #[test]
    fn test_argument_errors() {
        assert!(matches!(
            parse_script("LOOP fast\nEND\n"),
            Err(ScriptError::InvalidThreshold { line: 1, .. })
        ));
        assert!(matches!(
            parse_script("LOOP -0.1\nEND\n"),
            Err(ScriptError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            parse_script("FFLD read\n"),
            Err(ScriptError::MissingArgument { line: 1, .. })
        ));
        assert!(parse_script("COMP -o\n").is_err());
    }
}
