//! MacroModel jobs.
//!
//! Force-field data is obtained by running MacroModel on the input `.mae`
//! structures. For every input file a [`MacroModelJob`] records:
//!
//! - the derived file names (`<stem>.qmff.com`, `.qmff.mae`, `.qmff.mmo`,
//!   `.qmff.log`)
//! - the snapshot index: which output structure is the unminimized (`pre`)
//!   or minimized (`opt`) version of which input structure
//!
//! The run-control file processes every input structure between `BGIN` and
//! `END`, writing a `pre` snapshot when any command needs energies, charges or
//! geometry of the structure as given, followed by an `opt` snapshot when any
//! command needs minimized data.
//!
//! Execution goes through the [`SimulationRunner`] trait so it can be skipped
//! or replaced in tests.

use crate::command::{Command, Partition};
use crate::settings::MacroModelSettings;
use crate::structure::Structure;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as Process;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Licence tokens MacroModel needs to start.
const MIN_TOKENS: u32 = 2;

/// Errors from preparing, running or reading MacroModel jobs.
#[derive(Error, Debug)]
pub enum RunError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// MacroModel exited with an error
    #[error("MacroModel calculation failed: {0}")]
    Calculation(String),
    /// No licence tokens became available
    #[error("MacroModel tokens unavailable: {0}")]
    Tokens(String),
    /// Output does not contain the snapshots the job wrote
    #[error("{file}: expected {expected} output structures, found {found}")]
    OutputMismatch {
        /// Output file
        file: String,
        /// Snapshots written by the job
        expected: usize,
        /// Structures found
        found: usize,
    },
    /// No snapshot of the requested partition exists
    #[error("{file}: no '{partition}' structures")]
    NoMatch {
        /// Output file
        file: String,
        /// Requested partition
        partition: Partition,
    },
}

type Result<T> = std::result::Result<T, RunError>;

/// One output structure written by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Whether the structure was minimized
    pub partition: Partition,
    /// 1-based index of the input structure it came from
    pub input_structure: usize,
}

/// Run metadata for one input `.mae` file.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroModelJob {
    /// Directory holding the input and outputs
    pub directory: PathBuf,
    /// Input file name
    pub name: String,
    /// Base name shared by all outputs
    pub name_base: String,
    /// Run-control file
    pub name_com: String,
    /// Output structures
    pub name_mae: String,
    /// Output listing with geometric terms
    pub name_mmo: String,
    /// Output log
    pub name_log: String,
    /// Commands that read this job's output
    pub commands: Vec<Command>,
    /// Output structures in write order
    pub snapshots: Vec<Snapshot>,
}

impl MacroModelJob {
    /// Creates a job for `name` with `structure_count` input structures.
    pub fn new(directory: &Path, name: &str, commands: &[Command], structure_count: usize) -> Self {
        let stem = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let name_base = format!("{}.qmff", stem);

        let wants = |partition: Partition| commands.iter().any(|c| c.partition() == Some(partition));
        let (pre, opt) = (wants(Partition::Pre), wants(Partition::Opt));

        let mut snapshots = Vec::new();
        for input_structure in 1..=structure_count {
            if pre {
                snapshots.push(Snapshot {
                    partition: Partition::Pre,
                    input_structure,
                });
            }
            if opt {
                snapshots.push(Snapshot {
                    partition: Partition::Opt,
                    input_structure,
                });
            }
        }

        Self {
            directory: directory.to_path_buf(),
            name: name.to_string(),
            name_com: format!("{}.com", name_base),
            name_mae: format!("{}.mae", name_base),
            name_mmo: format!("{}.mmo", name_base),
            name_log: format!("{}.log", name_base),
            name_base,
            commands: commands.to_vec(),
            snapshots,
        }
    }

    /// Whether any command reads the Hessian printout.
    pub fn needs_hessian(&self) -> bool {
        self.commands.iter().any(|c| c.needs_hessian())
    }

    /// Renders the run-control file.
    pub fn com_content(&self) -> String {
        let pre = self.snapshots.iter().any(|s| s.partition == Partition::Pre);
        let opt = self.snapshots.iter().any(|s| s.partition == Partition::Opt);

        let mut lines = vec![self.name.clone(), self.name_mae.clone()];
        lines.push(opcode("MMOD", [0, 1, 0, 0], [0.0; 4]));
        if self.needs_hessian() {
            lines.push(opcode("DEBG", [57, 210, 0, 0], [0.0; 4]));
        }
        lines.push(opcode("FFLD", [2, 1, 0, 0], [1.0, 0.0, 0.0, 0.0]));
        lines.push(opcode("BGIN", [0; 4], [0.0; 4]));
        lines.push(opcode("READ", [0; 4], [0.0; 4]));
        if pre {
            lines.push(opcode("ELST", [66, 0, 0, 0], [0.0; 4]));
            lines.push(opcode("WRIT", [0; 4], [0.0; 4]));
        }
        if opt {
            lines.push(opcode("MINI", [9, 0, 500, 0], [0.0; 4]));
            lines.push(opcode("ELST", [66, 0, 0, 0], [0.0; 4]));
            lines.push(opcode("WRIT", [0; 4], [0.0; 4]));
        }
        lines.push(opcode("END", [0; 4], [0.0; 4]));

        let mut content = lines.join("\n");
        content.push('\n');
        content
    }

    /// Writes the run-control file into the job directory.
    pub fn write_com(&self) -> Result<PathBuf> {
        let path = self.directory.join(&self.name_com);
        fs::write(&path, self.com_content())?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }

    /// Copies a force field into the job directory as `mm3.fld`, where
    /// MacroModel picks it up.
    pub fn stage_force_field(&self, ffpath: &Path) -> Result<()> {
        let target = self.directory.join("mm3.fld");
        let same = match (fs::canonicalize(ffpath), fs::canonicalize(&target)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if !same {
            fs::copy(ffpath, &target)?;
        }
        Ok(())
    }

    /// Selects output structures of one partition.
    ///
    /// Returns the matching structures paired with the 1-based index of the
    /// input structure they were generated from.
    pub fn select<'a>(
        &self,
        file: &str,
        structures: &'a [Structure],
        partition: Partition,
    ) -> Result<Vec<(usize, &'a Structure)>> {
        if structures.len() != self.snapshots.len() {
            return Err(RunError::OutputMismatch {
                file: file.to_string(),
                expected: self.snapshots.len(),
                found: structures.len(),
            });
        }
        let selected: Vec<_> = self
            .snapshots
            .iter()
            .zip(structures)
            .filter(|(snapshot, _)| snapshot.partition == partition)
            .map(|(snapshot, structure)| (snapshot.input_structure, structure))
            .collect();
        if selected.is_empty() {
            return Err(RunError::NoMatch {
                file: file.to_string(),
                partition,
            });
        }
        Ok(selected)
    }
}

/// Formats one MacroModel opcode line.
fn opcode(name: &str, ints: [i32; 4], reals: [f64; 4]) -> String {
    let mut line = format!(" {:<4}", name);
    for value in ints {
        line.push_str(&format!("{:>7}", value));
    }
    for value in reals {
        line.push_str(&format!("{:>11.4}", value));
    }
    line
}

/// Executes MacroModel jobs.
pub trait SimulationRunner {
    /// Runs a job whose run-control file has been written and blocks until
    /// its outputs exist.
    fn run(&self, job: &MacroModelJob, check_tokens: bool) -> Result<()>;
}

/// Runs MacroModel through its command-line driver.
#[derive(Debug, Clone)]
pub struct MacroModel {
    /// MacroModel executable (e.g. `bmin`)
    pub command: String,
    /// Licence utility used to query tokens (e.g. `licutil`)
    pub token_command: String,
    /// Seconds between token checks
    pub token_wait: u64,
    /// Number of token checks before giving up
    pub token_attempts: u32,
}

impl Default for MacroModel {
    fn default() -> Self {
        Self {
            command: "bmin".to_string(),
            token_command: "licutil".to_string(),
            token_wait: 30,
            token_attempts: 10,
        }
    }
}

lazy_static! {
    // "Users of MMOD_MACROMODEL: ... 20 of 25 tokens available"
    static ref TOKENS_RE: Regex = Regex::new(r"(\d+)\s+of\s+\d+\s+tokens?\s+available").unwrap();
}

/// Parses the MacroModel token count from licence utility output.
pub fn available_tokens(output: &str) -> Option<u32> {
    output
        .lines()
        .filter(|line| line.contains("MMOD_MACROMODEL"))
        .find_map(|line| TOKENS_RE.captures(line))
        .and_then(|caps| caps[1].parse().ok())
}

impl MacroModel {
    /// Runner configured from the `[macromodel]` settings.
    pub fn from_settings(settings: &MacroModelSettings) -> Self {
        Self {
            command: settings.command.clone(),
            token_command: settings.token_command.clone(),
            token_wait: settings.token_wait,
            token_attempts: settings.token_attempts,
        }
    }

    fn wait_for_tokens(&self) -> Result<()> {
        for attempt in 1..=self.token_attempts {
            let output = Process::new(&self.token_command).arg("-available").output()?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            match available_tokens(&stdout) {
                Some(n) if n >= MIN_TOKENS => return Ok(()),
                Some(n) => warn!(
                    "Only {} MacroModel tokens available (attempt {}/{}), waiting {} s",
                    n, attempt, self.token_attempts, self.token_wait
                ),
                None => warn!(
                    "Could not read MacroModel tokens from {} (attempt {}/{})",
                    self.token_command, attempt, self.token_attempts
                ),
            }
            thread::sleep(Duration::from_secs(self.token_wait));
        }
        Err(RunError::Tokens(format!(
            "fewer than {} tokens after {} attempts",
            MIN_TOKENS, self.token_attempts
        )))
    }
}

impl SimulationRunner for MacroModel {
    fn run(&self, job: &MacroModelJob, check_tokens: bool) -> Result<()> {
        if check_tokens {
            self.wait_for_tokens()?;
        }
        info!("Running MacroModel on {}", job.name);
        let output = Process::new(&self.command)
            .arg("-WAIT")
            .arg(&job.name_base)
            .current_dir(&job.directory)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunError::Calculation(format!(
                "{} on {} exited with {}: {}",
                self.command,
                job.name_com,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshots_follow_commands() {
        let job = MacroModelJob::new(Path::new("."), "a1.mae", &[Command::Me, Command::Mb], 2);
        assert_eq!(job.name_mae, "a1.qmff.mae");
        assert_eq!(job.name_mmo, "a1.qmff.mmo");
        let partitions: Vec<_> = job
            .snapshots
            .iter()
            .map(|s| (s.partition, s.input_structure))
            .collect();
        assert_eq!(
            partitions,
            vec![
                (Partition::Pre, 1),
                (Partition::Opt, 1),
                (Partition::Pre, 2),
                (Partition::Opt, 2)
            ]
        );
    }

    #[test]
    fn test_com_content() {
        let job = MacroModelJob::new(Path::new("."), "a.mae", &[Command::Mq, Command::Mjeig], 1);
        let com = job.com_content();
        let lines: Vec<&str> = com.lines().collect();
        assert_eq!(lines[0], "a.mae");
        assert_eq!(lines[1], "a.qmff.mae");
        assert!(lines[2].starts_with(" MMOD"));
        assert!(com.contains(" DEBG     57    210"));
        assert!(!com.contains("MINI"));
        assert!(lines.last().unwrap().starts_with(" END"));
    }

    #[test]
    fn test_write_com() {
        let dir = TempDir::new().unwrap();
        let job = MacroModelJob::new(dir.path(), "a.mae", &[Command::Meo], 1);
        let path = job.write_com().unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("MINI"));
    }

    #[test]
    fn test_select() {
        let job = MacroModelJob::new(Path::new("."), "a.mae", &[Command::Me, Command::Meo], 2);
        let structures = vec![Structure::default(); 4];

        let opt = job.select("a.qmff.mae", &structures, Partition::Opt).unwrap();
        assert_eq!(opt.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);
        assert!(std::ptr::eq(opt[1].1, &structures[3]));

        assert!(matches!(
            job.select("a.qmff.mae", &structures[..3], Partition::Pre),
            Err(RunError::OutputMismatch { .. })
        ));

        let pre_only = MacroModelJob::new(Path::new("."), "a.mae", &[Command::Me], 1);
        assert!(matches!(
            pre_only.select("a.qmff.mae", &structures[..1], Partition::Opt),
            Err(RunError::NoMatch { .. })
        ));
    }

    #[test]
    fn test_available_tokens() {
        let output = "\
Users of SUITE_22JUN2017: 3 of 10 tokens available
Users of MMOD_MACROMODEL: 7 of 12 tokens available
";
        assert_eq!(available_tokens(output), Some(7));
        assert_eq!(available_tokens("nothing here"), None);
    }

    #[test]
    fn test_stage_force_field() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("custom.fld");
        std::fs::write(&source, "C OPT\n").unwrap();
        let job = MacroModelJob::new(dir.path(), "a.mae", &[Command::Me], 1);
        job.stage_force_field(&source).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("mm3.fld")).unwrap(),
            "C OPT\n"
        );
        // Staging the staged file onto itself is a no-op.
        job.stage_force_field(&dir.path().join("mm3.fld")).unwrap();
    }
}
