//! Datatype commands, the command table and the calculate argument grammar.
//!
//! A datatype command such as `-mb` or `-jq` names one kind of observable and
//! the program that produces it. On the command line (or after `RDAT`/`CDAT`
//! in a loop script) each command is followed by a group of filenames:
//!
//! ```text
//! -d work -me a1.mae a2.mae -me b1.mae -mb a1.mae -geigz2 a.log,a.fchk
//! ```
//!
//! Repeating a command appends a new group. Group order matters: groups with
//! the same position across commands describe the same physical system and
//! drive relative-energy comparison.
//!
//! This module also provides the inverse view, filename to commands, used to
//! decide which files need a MacroModel run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Errors in calculate arguments.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// A `-xx` token that is neither a datatype command nor an option
    #[error("Unknown command or option: {0}")]
    Unknown(String),
    /// A filename that does not follow any datatype command
    #[error("Filename '{0}' does not follow a datatype command")]
    Orphan(String),
    /// A datatype command or option with no argument
    #[error("Missing argument for {0}")]
    MissingArgument(String),
}

type Result<T> = std::result::Result<T, CommandError>;

/// Which snapshot of a MacroModel run a command reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Structure as read, before force-field minimization
    Pre,
    /// Structure after force-field minimization
    Opt,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Pre => write!(f, "pre"),
            Partition::Opt => write!(f, "opt"),
        }
    }
}

/// Program family a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Gaussian output
    Gaussian,
    /// Jaguar output read directly
    Jaguar,
    /// Requires a MacroModel run on the input structures
    MacroModel,
    /// Reference files
    Reference,
}

/// Datatype command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Reference data file
    R,
    /// Gaussian energy
    Ge,
    /// Gaussian energy of optimized structures
    Geo,
    /// Gaussian eigenvalues as a diagonal matrix
    Geigz,
    /// Gaussian Hessian from .fchk projected onto .log normal modes
    Geigz2,
    /// Jaguar energy
    Je,
    /// Jaguar energy of optimized structures
    Jeo,
    /// Jaguar Hessian projected onto its own normal modes
    Jeigz,
    /// Jaguar partial charges
    Jq,
    /// Jaguar partial charges with aliphatic hydrogens folded
    Jqh,
    /// Angles of Jaguar structures measured by MacroModel
    Ja,
    /// Bonds of Jaguar structures measured by MacroModel
    Jb,
    /// Torsions of Jaguar structures measured by MacroModel
    Jt,
    /// MacroModel angles after minimization
    Ma,
    /// MacroModel bonds after minimization
    Mb,
    /// MacroModel torsions after minimization
    Mt,
    /// MacroModel energy
    Me,
    /// MacroModel energy after minimization
    Meo,
    /// MacroModel Hessian projected onto Jaguar normal modes
    Mjeig,
    /// MacroModel Hessian projected onto Gaussian normal modes
    Mgeig,
    /// MacroModel partial charges
    Mq,
    /// MacroModel partial charges without aliphatic hydrogens
    Mqh,
}

impl Command {
    /// All commands, in help order.
    pub const ALL: [Command; 22] = [
        Command::R,
        Command::Ge,
        Command::Geo,
        Command::Geigz,
        Command::Geigz2,
        Command::Je,
        Command::Jeo,
        Command::Jeigz,
        Command::Jq,
        Command::Jqh,
        Command::Ja,
        Command::Jb,
        Command::Jt,
        Command::Ma,
        Command::Mb,
        Command::Mt,
        Command::Me,
        Command::Meo,
        Command::Mjeig,
        Command::Mgeig,
        Command::Mq,
        Command::Mqh,
    ];

    /// Tag as written after the leading dash.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::R => "r",
            Command::Ge => "ge",
            Command::Geo => "geo",
            Command::Geigz => "geigz",
            Command::Geigz2 => "geigz2",
            Command::Je => "je",
            Command::Jeo => "jeo",
            Command::Jeigz => "jeigz",
            Command::Jq => "jq",
            Command::Jqh => "jqh",
            Command::Ja => "ja",
            Command::Jb => "jb",
            Command::Jt => "jt",
            Command::Ma => "ma",
            Command::Mb => "mb",
            Command::Mt => "mt",
            Command::Me => "me",
            Command::Meo => "meo",
            Command::Mjeig => "mjeig",
            Command::Mgeig => "mgeig",
            Command::Mq => "mq",
            Command::Mqh => "mqh",
        }
    }

    /// One-line description for help output.
    pub fn description(&self) -> &'static str {
        match self {
            Command::R => "Reference data file (label weight value)",
            Command::Ge => "Gaussian energies (electronic + zero point) from .log",
            Command::Geo => "Gaussian energies of optimized structures from .log",
            Command::Geigz => "Gaussian eigenvalues from .log as a diagonal matrix",
            Command::Geigz2 => {
                "Gaussian .fchk Hessian in .log normal modes, off-diagonals zeroed (.log,.fchk)"
            }
            Command::Je => "Jaguar energies from .mae",
            Command::Jeo => "Jaguar energies of optimized structures from .mae",
            Command::Jeigz => "Jaguar Hessian in its normal modes, off-diagonals zeroed (.in,.out)",
            Command::Jq => "Jaguar partial charges from .mae",
            Command::Jqh => "Jaguar partial charges, aliphatic hydrogens summed into heavy atoms",
            Command::Ja => "MacroModel angles of unminimized Jaguar structures",
            Command::Jb => "MacroModel bond lengths of unminimized Jaguar structures",
            Command::Jt => "MacroModel torsions of unminimized Jaguar structures",
            Command::Ma => "MacroModel angles after minimization",
            Command::Mb => "MacroModel bond lengths after minimization",
            Command::Mt => "MacroModel torsions after minimization",
            Command::Me => "MacroModel energies",
            Command::Meo => "MacroModel energies after minimization",
            Command::Mjeig => "MacroModel Hessian in Jaguar normal modes (.mae,.out)",
            Command::Mgeig => "MacroModel Hessian in Gaussian normal modes (.mae,.log)",
            Command::Mq => "MacroModel partial charges",
            Command::Mqh => "MacroModel partial charges excluding aliphatic hydrogens",
        }
    }

    /// Program family of the command.
    pub fn family(&self) -> Family {
        match self {
            Command::R => Family::Reference,
            Command::Ge | Command::Geo | Command::Geigz | Command::Geigz2 => Family::Gaussian,
            Command::Je | Command::Jeo | Command::Jeigz | Command::Jq | Command::Jqh => {
                Family::Jaguar
            }
            _ => Family::MacroModel,
        }
    }

    /// Whether the command reads MacroModel output generated from its input.
    pub fn needs_macromodel(&self) -> bool {
        self.family() == Family::MacroModel
    }

    /// Snapshot of the MacroModel run the command reads, if any.
    pub fn partition(&self) -> Option<Partition> {
        match self {
            Command::Me
            | Command::Mq
            | Command::Mqh
            | Command::Ja
            | Command::Jb
            | Command::Jt
            | Command::Mjeig
            | Command::Mgeig => Some(Partition::Pre),
            Command::Meo | Command::Ma | Command::Mb | Command::Mt => Some(Partition::Opt),
            _ => None,
        }
    }

    /// Whether the MacroModel run must print the Hessian.
    pub fn needs_hessian(&self) -> bool {
        matches!(self, Command::Mjeig | Command::Mgeig)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        Command::ALL
            .iter()
            .find(|c| c.tag() == s)
            .copied()
            .ok_or_else(|| CommandError::Unknown(s.to_string()))
    }
}

/// Ordered mapping from command to its filename groups.
///
/// Commands keep the order in which they were first added, groups keep the
/// order in which they were appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandTable {
    entries: Vec<(Command, Vec<Vec<String>>)>,
}

impl CommandTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a group of filenames to a command.
    pub fn push_group(&mut self, command: Command, files: Vec<String>) {
        match self.entries.iter_mut().find(|(c, _)| *c == command) {
            Some((_, groups)) => groups.push(files),
            None => self.entries.push((command, vec![files])),
        }
    }

    /// Groups of a command, if present.
    pub fn groups(&self, command: Command) -> Option<&[Vec<String>]> {
        self.entries
            .iter()
            .find(|(c, _)| *c == command)
            .map(|(_, groups)| groups.as_slice())
    }

    /// Iterates over commands and their groups in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Command, &[Vec<String>])> {
        self.entries.iter().map(|(c, g)| (*c, g.as_slice()))
    }

    /// Commands in insertion order.
    pub fn commands(&self) -> Vec<Command> {
        self.entries.iter().map(|(c, _)| *c).collect()
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no commands.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log lines describing the table.
    pub fn pretty(&self) -> Vec<String> {
        let mut lines = vec![format!("{:-^50}", " COMMANDS ")];
        for (command, groups) in self.iter() {
            for (i, group) in groups.iter().enumerate() {
                lines.push(format!("{:>6} {:>3}: {}", command.tag(), i + 1, group.join(" ")));
            }
        }
        lines.push("-".repeat(50));
        lines
    }
}

/// Ordered mapping from filename to the commands that reference it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileCommands {
    entries: Vec<(String, Vec<Command>)>,
    index: HashMap<String, usize>,
}

impl FileCommands {
    fn add(&mut self, filename: &str, command: Command) {
        let i = match self.index.get(filename) {
            Some(&i) => i,
            None => {
                self.entries.push((filename.to_string(), Vec::new()));
                self.index.insert(filename.to_string(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        let commands = &mut self.entries[i].1;
        if !commands.contains(&command) {
            commands.push(command);
        }
    }

    /// Commands for a filename.
    pub fn get(&self, filename: &str) -> Option<&[Command]> {
        self.index.get(filename).map(|&i| self.entries[i].1.as_slice())
    }

    /// Iterates over filenames in first-appearance order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Command])> {
        self.entries.iter().map(|(f, c)| (f.as_str(), c.as_slice()))
    }

    /// Number of distinct filenames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no filenames are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log lines describing the mapping.
    pub fn pretty(&self) -> Vec<String> {
        let mut lines = vec![format!("{:-^50}", " FILES ")];
        for (filename, commands) in self.iter() {
            let tags: Vec<&str> = commands.iter().map(|c| c.tag()).collect();
            lines.push(format!("{:>30}: {}", filename, tags.join(" ")));
        }
        lines.push("-".repeat(50));
        lines
    }
}

/// Inverts a command table into filename to commands.
///
/// Comma-joined tokens are split and every constituent file receives the
/// command of the token it appeared in. A command is listed once per file.
pub fn commands_for_filenames(table: &CommandTable) -> FileCommands {
    let mut files = FileCommands::default();
    for (command, groups) in table.iter() {
        for token in groups.iter().flatten() {
            for filename in token.split(',').filter(|f| !f.is_empty()) {
                files.add(filename, command);
            }
        }
    }
    files
}

/// Parsed calculate arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CalcArgs {
    /// Datatype commands and their file groups
    pub commands: CommandTable,
    /// Directory searched for files and where MacroModel runs
    pub directory: PathBuf,
    /// Log the extracted data table
    pub doprint: bool,
    /// Force field file staged for MacroModel runs
    pub ffpath: Option<PathBuf>,
    /// Skip the licence token check
    pub nocheck: bool,
    /// Do not run MacroModel; outputs must already exist
    pub norun: bool,
    /// Substructure names used to filter geometric terms
    pub subnames: Option<Vec<String>>,
    /// Assign default weights to the extracted records
    pub weight: bool,
}

impl Default for CalcArgs {
    fn default() -> Self {
        Self {
            commands: CommandTable::new(),
            directory: PathBuf::from("."),
            doprint: false,
            ffpath: None,
            nocheck: false,
            norun: false,
            subnames: None,
            weight: false,
        }
    }
}

impl CalcArgs {
    /// Parses calculate arguments.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut parsed = CalcArgs::default();
        let mut i = 0;

        while i < args.len() {
            let token = args[i].as_ref();
            i += 1;

            match token {
                "-d" | "--directory" => {
                    parsed.directory = PathBuf::from(take_value(args, &mut i, token)?);
                }
                "-f" | "--ffpath" => {
                    parsed.ffpath = Some(PathBuf::from(take_value(args, &mut i, token)?));
                }
                "-p" | "--doprint" => parsed.doprint = true,
                "-nc" | "--nocheck" => parsed.nocheck = true,
                "-n" | "--norun" => parsed.norun = true,
                "-w" | "--weight" => parsed.weight = true,
                "-s" | "--subnames" => {
                    let names = take_values(args, &mut i);
                    if names.is_empty() {
                        return Err(CommandError::MissingArgument(token.to_string()));
                    }
                    parsed.subnames = Some(names);
                }
                _ if token.starts_with('-') => {
                    let command: Command = token.trim_start_matches('-').parse()?;
                    let files = take_values(args, &mut i);
                    if files.is_empty() {
                        return Err(CommandError::MissingArgument(token.to_string()));
                    }
                    parsed.commands.push_group(command, files);
                }
                _ => return Err(CommandError::Orphan(token.to_string())),
            }
        }

        Ok(parsed)
    }
}

fn take_value<S: AsRef<str>>(args: &[S], i: &mut usize, flag: &str) -> Result<String> {
    match args.get(*i) {
        Some(value) if !value.as_ref().starts_with('-') => {
            *i += 1;
            Ok(value.as_ref().to_string())
        }
        _ => Err(CommandError::MissingArgument(flag.to_string())),
    }
}

fn take_values<S: AsRef<str>>(args: &[S], i: &mut usize) -> Vec<String> {
    let mut values = Vec::new();
    while let Some(value) = args.get(*i) {
        if value.as_ref().starts_with('-') {
            break;
        }
        values.push(value.as_ref().to_string());
        *i += 1;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_tags_round_trip() {
        for command in Command::ALL {
            assert_eq!(command.tag().parse::<Command>().unwrap(), command);
        }
        assert!("mcs".parse::<Command>().is_err());
    }

    #[test]
    fn test_parse_groups_and_options() {
        let parsed = CalcArgs::parse(&args(
            "-d work -me a1.mae a2.mae -mb a1.mae -me b1.mae -n -s OPT OTHER -w -p",
        ))
        .unwrap();

        assert_eq!(parsed.directory, PathBuf::from("work"));
        assert!(parsed.norun && parsed.weight && parsed.doprint && !parsed.nocheck);
        assert_eq!(
            parsed.subnames,
            Some(vec!["OPT".to_string(), "OTHER".to_string()])
        );
        assert_eq!(parsed.commands.commands(), vec![Command::Me, Command::Mb]);
        let me = parsed.commands.groups(Command::Me).unwrap();
        assert_eq!(me.len(), 2);
        assert_eq!(me[0], vec!["a1.mae", "a2.mae"]);
        assert_eq!(me[1], vec!["b1.mae"]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            CalcArgs::parse(&args("-zz a.mae")),
            Err(CommandError::Unknown("zz".to_string()))
        );
        assert_eq!(
            CalcArgs::parse(&args("a.mae -me b.mae")),
            Err(CommandError::Orphan("a.mae".to_string()))
        );
        assert_eq!(
            CalcArgs::parse(&args("-me -n")),
            Err(CommandError::MissingArgument("-me".to_string()))
        );
        assert!(CalcArgs::parse(&args("-d")).is_err());
    }

    #[test]
    fn test_router_splits_comma_pairs() {
        let parsed =
            CalcArgs::parse(&args("-me a1.mae b1.mae -mb a1.mae -jeigz a1.in,a1.out")).unwrap();
        let files = commands_for_filenames(&parsed.commands);

        let order: Vec<&str> = files.iter().map(|(f, _)| f).collect();
        assert_eq!(order, vec!["a1.mae", "b1.mae", "a1.in", "a1.out"]);
        assert_eq!(files.get("a1.mae").unwrap(), &[Command::Me, Command::Mb]);
        assert_eq!(files.get("a1.out").unwrap(), &[Command::Jeigz]);
        assert_eq!(files.get("b1.mae").unwrap(), &[Command::Me]);
    }

    #[test]
    fn test_router_membership_round_trip() {
        let parsed = CalcArgs::parse(&args(
            "-me a.mae b.mae -me c.mae -mq a.mae -geigz2 x.log,x.fchk -r ref.txt",
        ))
        .unwrap();
        let files = commands_for_filenames(&parsed.commands);

        for (command, groups) in parsed.commands.iter() {
            let original: BTreeSet<&str> = groups
                .iter()
                .flatten()
                .flat_map(|token| token.split(','))
                .collect();
            let regrouped: BTreeSet<&str> = files
                .iter()
                .filter(|(_, commands)| commands.contains(&command))
                .map(|(f, _)| f)
                .collect();
            assert_eq!(original, regrouped, "membership differs for {}", command);
        }
    }
}
