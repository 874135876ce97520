//! Readers for external program files.
//!
//! The dispatch engine never touches file contents directly. It asks a
//! [`FileLoader`] for a [`FormatAdapter`] and reads structures, energies,
//! charges, geometric terms and Hessian data through that interface.
//!
//! # Supported Files
//!
//! | Kind | Program | Provides |
//! |------|---------|----------|
//! | [`FileKind::Mae`] | Maestro | structures, properties, atoms, charges, bonds |
//! | [`FileKind::MacroModelListing`] | MacroModel `.mmo` | bonds, angles, torsions per structure |
//! | [`FileKind::MacroModelLog`] | MacroModel `.log` | force matrix |
//! | [`FileKind::JaguarIn`] | Jaguar `.in` | atoms, force matrix |
//! | [`FileKind::JaguarOut`] | Jaguar `.out` | atoms, normal modes |
//! | [`FileKind::GaussLog`] | Gaussian `.log` | archive energies, frequencies, normal modes |
//! | [`FileKind::GaussFchk`] | Gaussian `.fchk` | atoms, masses, force matrix |
//!
//! Only the sections needed for force-field calibration are read. Force
//! matrices are converted to kJ/(mol·Å²) on reading; energies keep the
//! program's units.

use crate::hessian::{from_lower_triangle, HESSIAN_CONVERSION};
use crate::structure::{symbol_to_atomic_number, Atom, GeometricTerm, Structure, TermKind};
use lazy_static::lazy_static;
use log::debug;
use nalgebra::{DMatrix, DVector};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Converts a harmonic frequency in cm⁻¹ to a force constant in
/// Hartree/(Bohr²·amu) via `k = (ν / 5140.487)²`.
pub const FREQUENCY_CONVERSION: f64 = 5140.487;

/// Errors raised while reading program files.
#[derive(Error, Debug)]
pub enum FormatError {
    /// File could not be read
    #[error("IO error reading {path}: {source}")]
    Io {
        /// File being read
        path: String,
        /// Underlying error
        source: std::io::Error,
    },
    /// File content does not follow the expected layout
    #[error("Parse error in {path}: {message}")]
    Parse {
        /// File being read
        path: String,
        /// Description of the problem
        message: String,
    },
}

type Result<T> = std::result::Result<T, FormatError>;

/// Kinds of files the loader can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Maestro structure file
    Mae,
    /// MacroModel listing with geometric terms
    MacroModelListing,
    /// MacroModel log with Hessian printout
    MacroModelLog,
    /// Jaguar input with Hessian section
    JaguarIn,
    /// Jaguar output with normal modes
    JaguarOut,
    /// Gaussian log
    GaussLog,
    /// Gaussian formatted checkpoint
    GaussFchk,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileKind::Mae => "Maestro",
            FileKind::MacroModelListing => "MacroModel listing",
            FileKind::MacroModelLog => "MacroModel log",
            FileKind::JaguarIn => "Jaguar input",
            FileKind::JaguarOut => "Jaguar output",
            FileKind::GaussLog => "Gaussian log",
            FileKind::GaussFchk => "Gaussian fchk",
        };
        f.write_str(name)
    }
}

/// Read access to one parsed file.
pub trait FormatAdapter {
    /// Path the file was read from.
    fn path(&self) -> &Path;

    /// Kind of file.
    fn kind(&self) -> FileKind;

    /// Structures in file order.
    fn structures(&self) -> &[Structure];

    /// Cartesian force matrix in kJ/(mol·Å²).
    fn force_matrix(&self) -> Option<&DMatrix<f64>> {
        None
    }

    /// Normal-mode eigenvectors, one per row.
    fn eigenvectors(&self) -> Option<&DMatrix<f64>> {
        None
    }

    /// Mass-weighted eigenvalues in kJ/(mol·Å²·amu).
    fn eigenvalues(&self) -> Option<&DVector<f64>> {
        None
    }

    /// Atomic masses in atom order.
    fn masses(&self) -> Option<Vec<f64>> {
        self.structures()
            .first()
            .filter(|s| !s.atoms.is_empty())
            .map(|s| s.atoms.iter().map(|a| a.mass()).collect())
    }
}

/// Creates adapters for files.
pub trait FileLoader {
    /// Reads and parses `path` as `kind`.
    fn load(&self, path: &Path, kind: FileKind) -> Result<Box<dyn FormatAdapter>>;
}

/// Loader that parses files from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskLoader;

impl FileLoader for DiskLoader {
    fn load(&self, path: &Path, kind: FileKind) -> Result<Box<dyn FormatAdapter>> {
        let content = fs::read_to_string(path).map_err(|source| FormatError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!("Parsing {} as {}", path.display(), kind);
        Ok(Box::new(ParsedFile::parse(path, kind, &content)?))
    }
}

/// Contents of a parsed file.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    path: PathBuf,
    kind: FileKind,
    structures: Vec<Structure>,
    force_matrix: Option<DMatrix<f64>>,
    eigenvectors: Option<DMatrix<f64>>,
    eigenvalues: Option<DVector<f64>>,
    masses: Option<Vec<f64>>,
}

impl ParsedFile {
    fn empty(path: &Path, kind: FileKind) -> Self {
        Self {
            path: path.to_path_buf(),
            kind,
            structures: Vec::new(),
            force_matrix: None,
            eigenvectors: None,
            eigenvalues: None,
            masses: None,
        }
    }

    /// Parses file content as the given kind.
    pub fn parse(path: &Path, kind: FileKind, content: &str) -> Result<Self> {
        let mut file = Self::empty(path, kind);
        let err = |message: String| FormatError::Parse {
            path: path.display().to_string(),
            message,
        };

        match kind {
            FileKind::Mae => {
                file.structures = parse_mae(content).map_err(err)?;
            }
            FileKind::MacroModelListing => {
                file.structures = parse_mmo(content).map_err(err)?;
            }
            FileKind::MacroModelLog => {
                let values = numeric_block_after(content, |l| l.contains("Hessian"));
                file.force_matrix = Some(
                    from_lower_triangle(&values)
                        .filter(|m| m.nrows() > 0)
                        .ok_or_else(|| err("no lower-triangular Hessian block".to_string()))?,
                );
            }
            FileKind::JaguarIn => {
                let (structure, hessian) = parse_jaguar_in(content).map_err(err)?;
                file.structures = vec![structure];
                file.force_matrix = Some(hessian * HESSIAN_CONVERSION);
            }
            FileKind::JaguarOut => {
                let (structure, evecs) = parse_jaguar_out(content).map_err(err)?;
                file.structures = vec![structure];
                file.eigenvectors = Some(evecs);
            }
            FileKind::GaussLog => {
                let log = parse_gauss_log(content).map_err(err)?;
                file.structures = log.structures;
                file.eigenvalues = log.eigenvalues;
                file.eigenvectors = log.eigenvectors;
            }
            FileKind::GaussFchk => {
                let fchk = parse_fchk(content).map_err(err)?;
                file.structures = vec![fchk.structure];
                file.masses = fchk.masses;
                file.force_matrix = fchk.hessian.map(|h| h * HESSIAN_CONVERSION);
            }
        }

        Ok(file)
    }
}

impl FormatAdapter for ParsedFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> FileKind {
        self.kind
    }

    fn structures(&self) -> &[Structure] {
        &self.structures
    }

    fn force_matrix(&self) -> Option<&DMatrix<f64>> {
        self.force_matrix.as_ref()
    }

    fn eigenvectors(&self) -> Option<&DMatrix<f64>> {
        self.eigenvectors.as_ref()
    }

    fn eigenvalues(&self) -> Option<&DVector<f64>> {
        self.eigenvalues.as_ref()
    }

    fn masses(&self) -> Option<Vec<f64>> {
        self.masses.clone().or_else(|| {
            self.structures
                .first()
                .filter(|s| !s.atoms.is_empty())
                .map(|s| s.atoms.iter().map(|a| a.mass()).collect())
        })
    }
}

lazy_static! {
    // Robust floating-point regex: handles 1.23, -0.032, 1.2e-4, .123, etc.
    static ref FLOAT_RE: String = r"[-+]?(?:\d+\.\d*|\.\d+)(?:[eE][-+]?\d+)?".to_string();

    // Listing term: " Bond     1    2      1.5340  OPT Sub"
    static ref TERM_RE: Regex = Regex::new(&format!(
        r"^\s*(Bond|Angle|Torsion)\s+((?:\d+\s+)+?)({0})\s*(.*)$",
        *FLOAT_RE
    )).unwrap();

    // Mode row, Gaussian HP format: "   1   1   6   0.00012  -0.11000 ..."
    static ref GAUSS_MODE_RE: Regex = Regex::new(r"^\s*\d+\s+\d+\s+\d+((?:\s+\S+)+)\s*$").unwrap();

    // Mode row, Jaguar: "  C1   X   0.00012  -0.11000 ..."
    static ref JAGUAR_MODE_RE: Regex = Regex::new(r"^\s*\S+\s+[XYZ]((?:\s+\S+)+)\s*$").unwrap();

    // fchk array header: "Real atomic weights     R   N=   3"
    static ref FCHK_HEADER_RE: Regex = Regex::new(r"^(\S.*?)\s+([IR])\s+N=\s+(\d+)\s*$").unwrap();
}

fn parse_float(token: &str) -> Option<f64> {
    token.replace(&['D', 'd'][..], "E").parse().ok()
}

/// Parses every whitespace-separated token of a line as a number.
fn numbers(line: &str) -> Option<Vec<f64>> {
    let values: Option<Vec<f64>> = line.split_whitespace().map(parse_float).collect();
    values.filter(|v| !v.is_empty())
}

/// Collects numbers from the lines following the first line matching
/// `header`, stopping at the first line that is not purely numeric.
fn numeric_block_after(content: &str, header: impl Fn(&str) -> bool) -> Vec<f64> {
    content
        .lines()
        .skip_while(|line| !header(line))
        .skip(1)
        .map_while(numbers)
        .flatten()
        .collect()
}

/// Splits Maestro text into tokens, keeping quoted strings whole and
/// dropping `# ... #` comments.
fn mae_tokens(content: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '#' => {
                for c in chars.by_ref() {
                    if c == '#' {
                        break;
                    }
                }
            }
            '"' => {
                let mut token = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                token.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => token.push(c),
                    }
                }
                tokens.push(token);
            }
            _ => {
                let mut token = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() {
                        break;
                    }
                    token.push(next);
                    chars.next();
                }
                tokens.push(token);
            }
        }
    }
    tokens
}

struct MaeTable {
    name: String,
    keys: Vec<String>,
    rows: Vec<Vec<String>>,
}

struct MaeBlock {
    props: Vec<(String, String)>,
    tables: Vec<MaeTable>,
}

struct MaeReader {
    tokens: Vec<String>,
    pos: usize,
}

impl MaeReader {
    fn next(&mut self) -> std::result::Result<String, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of file".to_string())?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &str) -> std::result::Result<(), String> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(format!("expected '{}', found '{}'", expected, token))
        }
    }

    fn keys(&mut self) -> std::result::Result<Vec<String>, String> {
        let mut keys = Vec::new();
        loop {
            let token = self.next()?;
            if token == ":::" {
                return Ok(keys);
            }
            keys.push(token);
        }
    }

    /// Reads a block body after its opening brace.
    fn block(&mut self) -> std::result::Result<MaeBlock, String> {
        let keys = self.keys()?;
        let mut props = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self.next()?;
            props.push((key, value));
        }

        let mut tables = Vec::new();
        loop {
            let token = self.next()?;
            if token == "}" {
                return Ok(MaeBlock { props, tables });
            }
            let name = token.split('[').next().unwrap_or("").to_string();
            self.expect("{")?;
            tables.push(self.table(name)?);
        }
    }

    fn table(&mut self, name: String) -> std::result::Result<MaeTable, String> {
        let keys = self.keys()?;
        let mut rows = Vec::new();
        loop {
            let token = self.next()?;
            if token == ":::" {
                break;
            }
            // First column is the row index.
            let mut row = Vec::with_capacity(keys.len());
            for _ in 0..keys.len() {
                row.push(self.next()?);
            }
            rows.push(row);
        }
        self.expect("}")?;
        Ok(MaeTable { name, keys, rows })
    }
}

fn parse_mae(content: &str) -> std::result::Result<Vec<Structure>, String> {
    let mut reader = MaeReader {
        tokens: mae_tokens(content),
        pos: 0,
    };
    let mut structures = Vec::new();

    while reader.pos < reader.tokens.len() {
        let token = reader.next()?;
        if token == "{" {
            reader.block()?;
            continue;
        }
        reader.expect("{")?;
        let block = reader.block()?;
        if token == "f_m_ct" || token == "p_m_ct" {
            structures.push(mae_structure(block)?);
        }
    }

    Ok(structures)
}

fn mae_structure(block: MaeBlock) -> std::result::Result<Structure, String> {
    let mut structure = Structure {
        props: block.props.into_iter().collect(),
        ..Default::default()
    };
    let mut bonds = Vec::new();

    for table in block.tables {
        let column = |key: &str| table.keys.iter().position(|k| k == key);
        match table.name.as_str() {
            "m_atom" => {
                let number_col = column("i_m_atomic_number")
                    .ok_or_else(|| "atom table without i_m_atomic_number".to_string())?;
                let charge_col = column("r_m_charge1");
                for (i, row) in table.rows.iter().enumerate() {
                    let atomic_num = row[number_col]
                        .parse()
                        .map_err(|_| format!("bad atomic number '{}'", row[number_col]))?;
                    let mut atom = Atom::new(i + 1, atomic_num);
                    if let Some(col) = charge_col {
                        atom.partial_charge = row[col]
                            .parse()
                            .map_err(|_| format!("bad partial charge '{}'", row[col]))?;
                    }
                    atom.props = table.keys.iter().cloned().zip(row.iter().cloned()).collect();
                    structure.atoms.push(atom);
                }
            }
            "m_bond" => {
                let from = column("i_m_from");
                let to = column("i_m_to");
                if let (Some(from), Some(to)) = (from, to) {
                    for row in &table.rows {
                        match (row[from].parse::<usize>(), row[to].parse::<usize>()) {
                            (Ok(a), Ok(b)) => bonds.push((a, b)),
                            _ => return Err(format!("bad bond row {:?}", row)),
                        }
                    }
                }
            }
            _ => {}
        }
    }

    structure.connect(&bonds);
    Ok(structure)
}

fn parse_mmo(content: &str) -> std::result::Result<Vec<Structure>, String> {
    let mut structures: Vec<Structure> = Vec::new();

    for line in content.lines() {
        if line.trim_start().starts_with("Structure") {
            structures.push(Structure::default());
            continue;
        }
        let Some(caps) = TERM_RE.captures(line) else {
            continue;
        };
        let kind = match &caps[1] {
            "Bond" => TermKind::Bond,
            "Angle" => TermKind::Angle,
            _ => TermKind::Torsion,
        };
        let atoms: Vec<usize> = caps[2]
            .split_whitespace()
            .map(|t| t.parse().map_err(|_| format!("bad atom index '{}'", t)))
            .collect::<std::result::Result<_, _>>()?;
        if atoms.len() != kind.atom_count() {
            return Err(format!("{:?} with {} atoms: {}", kind, atoms.len(), line.trim()));
        }
        let value = parse_float(&caps[3]).ok_or_else(|| format!("bad value in '{}'", line))?;

        if structures.is_empty() {
            structures.push(Structure::default());
        }
        if let Some(structure) = structures.last_mut() {
            structure.terms.push(GeometricTerm {
                kind,
                atoms,
                value,
                comment: caps[4].trim().to_string(),
            });
        }
    }

    Ok(structures)
}

/// Reads labelled Cartesian atom rows (`C1  x  y  z`).
///
/// Lines of another shape give `None`; a row whose label is not an element
/// is an error.
fn labelled_atom(line: &str, index: usize) -> std::result::Result<Option<Atom>, String> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() != 4 || cols[1..].iter().any(|c| parse_float(c).is_none()) {
        return Ok(None);
    }
    symbol_to_atomic_number(cols[0])
        .map(|n| Some(Atom::new(index, n)))
        .ok_or_else(|| format!("unknown element in atom label '{}'", cols[0]))
}

fn parse_jaguar_in(content: &str) -> std::result::Result<(Structure, DMatrix<f64>), String> {
    let mut section = String::new();
    let mut structure = Structure::default();
    let mut values = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix('&') {
            section = name.trim().to_lowercase();
            continue;
        }
        match section.as_str() {
            "zmat" => {
                if let Some(atom) = labelled_atom(trimmed, structure.atoms.len() + 1)? {
                    structure.atoms.push(atom);
                }
            }
            "hess" => {
                if let Some(row) = numbers(trimmed) {
                    values.extend(row);
                }
            }
            _ => {}
        }
    }

    let hessian = from_lower_triangle(&values)
        .filter(|m| m.nrows() > 0)
        .ok_or_else(|| "no lower-triangular &hess section".to_string())?;
    if hessian.nrows() != structure.atoms.len() * 3 {
        return Err(format!(
            "&hess has {} coordinates for {} atoms",
            hessian.nrows(),
            structure.atoms.len()
        ));
    }
    Ok((structure, hessian))
}

/// Accumulates normal modes printed in column blocks.
#[derive(Default)]
struct ModeCollector {
    modes: Vec<Vec<f64>>,
    block_start: usize,
}

impl ModeCollector {
    fn begin_block(&mut self, count: usize) {
        self.block_start = self.modes.len();
        self.modes.extend(std::iter::repeat_with(Vec::new).take(count));
    }

    fn push_row(&mut self, values: &[f64]) -> bool {
        let width = self.modes.len() - self.block_start;
        if width == 0 || values.len() != width {
            return false;
        }
        for (mode, value) in self.modes[self.block_start..].iter_mut().zip(values) {
            mode.push(*value);
        }
        true
    }

    fn into_matrix(self) -> std::result::Result<Option<DMatrix<f64>>, String> {
        let Some(first) = self.modes.first() else {
            return Ok(None);
        };
        let ncols = first.len();
        if ncols == 0 || self.modes.iter().any(|m| m.len() != ncols) {
            return Err("normal modes have inconsistent lengths".to_string());
        }
        let flat: Vec<f64> = self.modes.iter().flatten().copied().collect();
        Ok(Some(DMatrix::from_row_slice(self.modes.len(), ncols, &flat)))
    }
}

fn parse_jaguar_out(content: &str) -> std::result::Result<(Structure, DMatrix<f64>), String> {
    let mut structure = Structure::default();
    let mut modes = ModeCollector::default();
    let mut in_geometry = false;
    let mut in_modes = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Input geometry:") {
            in_geometry = true;
            structure.atoms.clear();
            continue;
        }
        if in_geometry {
            if let Some(atom) = labelled_atom(trimmed, structure.atoms.len() + 1)? {
                structure.atoms.push(atom);
            } else if trimmed.is_empty() && !structure.atoms.is_empty() {
                in_geometry = false;
            }
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("frequencies") {
            let count = rest.split_whitespace().count();
            modes.begin_block(count);
            in_modes = true;
            continue;
        }
        if in_modes {
            match JAGUAR_MODE_RE.captures(line).and_then(|c| numbers(&c[1])) {
                Some(values) if modes.push_row(&values) => {}
                _ => in_modes = !trimmed.is_empty() && in_modes,
            }
        }
    }

    let evecs = modes
        .into_matrix()?
        .ok_or_else(|| "no normal modes found".to_string())?;
    if evecs.ncols() != structure.atoms.len() * 3 {
        return Err(format!(
            "normal modes have {} coordinates for {} atoms",
            evecs.ncols(),
            structure.atoms.len()
        ));
    }
    Ok((structure, evecs))
}

struct GaussLog {
    structures: Vec<Structure>,
    eigenvalues: Option<DVector<f64>>,
    eigenvectors: Option<DMatrix<f64>>,
}

fn parse_gauss_log(content: &str) -> std::result::Result<GaussLog, String> {
    let mut structures = Vec::new();
    let mut archive: Option<String> = None;
    let mut frequencies = Vec::new();
    let mut modes = ModeCollector::default();
    let mut in_modes = false;

    for line in content.lines() {
        let trimmed = line.trim();

        if archive.is_none() && trimmed.starts_with("1\\1\\") {
            archive = Some(String::new());
        }
        if let Some(text) = archive.as_mut() {
            text.push_str(trimmed);
            if trimmed.ends_with('@') {
                structures.push(archive_structure(text));
                archive = None;
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("Frequencies ---") {
            let values = numbers(rest).ok_or_else(|| format!("bad frequencies: {}", trimmed))?;
            modes.begin_block(values.len());
            frequencies.extend(values);
            in_modes = false;
            continue;
        }
        if trimmed.starts_with("Coord Atom Element:") {
            in_modes = true;
            continue;
        }
        if in_modes {
            let row = GAUSS_MODE_RE.captures(line).and_then(|c| numbers(&c[1]));
            match row {
                Some(values) if modes.push_row(&values) => {}
                _ => in_modes = false,
            }
        }
    }

    let eigenvalues = if frequencies.is_empty() {
        None
    } else {
        Some(DVector::from_iterator(
            frequencies.len(),
            frequencies.iter().map(|&f| {
                f.signum() * (f / FREQUENCY_CONVERSION).powi(2) * HESSIAN_CONVERSION
            }),
        ))
    };

    Ok(GaussLog {
        structures,
        eigenvalues,
        eigenvectors: modes.into_matrix()?,
    })
}

/// Builds a structure from the fields of a Gaussian archive entry.
fn archive_structure(archive: &str) -> Structure {
    let mut structure = Structure::default();
    for field in archive.split('\\') {
        if let Some((key, value)) = field.split_once('=') {
            // Scans list one value per point; the last belongs to this entry.
            let value = value.rsplit(',').next().unwrap_or(value);
            match key {
                "HF" => {
                    structure.props.insert("hf".to_string(), value.to_string());
                }
                "ZeroPoint" => {
                    structure.props.insert("zp".to_string(), value.to_string());
                }
                _ => {}
            }
        }
    }
    structure
}

struct Fchk {
    structure: Structure,
    masses: Option<Vec<f64>>,
    hessian: Option<DMatrix<f64>>,
}

fn parse_fchk(content: &str) -> std::result::Result<Fchk, String> {
    let mut arrays: HashMap<String, Vec<f64>> = HashMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let Some(caps) = FCHK_HEADER_RE.captures(line) else {
            continue;
        };
        let name = caps[1].trim().to_string();
        let count: usize = caps[3].parse().map_err(|_| format!("bad count in '{}'", line))?;
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            let row = lines
                .next()
                .ok_or_else(|| format!("'{}' ends early", name))?;
            values.extend(numbers(row).ok_or_else(|| format!("bad row in '{}'", name))?);
        }
        arrays.insert(name, values);
    }

    let atomic_numbers = arrays
        .get("Atomic numbers")
        .ok_or_else(|| "missing 'Atomic numbers'".to_string())?;
    let structure = Structure {
        atoms: atomic_numbers
            .iter()
            .enumerate()
            .map(|(i, &n)| Atom::new(i + 1, n as u32))
            .collect(),
        ..Default::default()
    };
    let hessian = match arrays.get("Cartesian Force Constants") {
        Some(values) => Some(
            from_lower_triangle(values)
                .ok_or_else(|| "force constants are not a lower triangle".to_string())?,
        ),
        None => None,
    };

    Ok(Fchk {
        structure,
        masses: arrays.get("Real atomic weights").cloned(),
        hessian,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAE: &str = r#"
{
 s_m_m2io_version
 :::
 2.0.0
}

f_m_ct {
 s_m_title
 r_j_Gas_Phase_Energy
 :::
 "methanol conf 1"
 -115.7
 m_atom[6] {
  # First column is atom index #
  i_m_mmod_type
  i_m_atomic_number
  r_m_charge1
  b_q_use_charge
  :::
  1 3 6 -0.30 1
  2 41 1 0.05 1
  3 41 1 0.07 1
  4 41 1 0.06 1
  5 16 8 -0.60 1
  6 21 1 0.40 0
  :::
 }
 m_bond[5] {
  # First column is bond index #
  i_m_from
  i_m_to
  i_m_order
  :::
  1 1 2 1
  2 1 3 1
  3 1 4 1
  4 1 5 1
  5 5 6 1
  :::
 }
}
"#;

    #[test]
    fn test_parse_mae() {
        let file = ParsedFile::parse(Path::new("a.mae"), FileKind::Mae, MAE).unwrap();
        let structures = file.structures();
        assert_eq!(structures.len(), 1);

        let s = &structures[0];
        assert_eq!(s.props["s_m_title"], "methanol conf 1");
        assert_eq!(s.prop_f64("r_j_Gas_Phase_Energy"), Some(-115.7));
        assert_eq!(s.atoms.len(), 6);
        assert_eq!(s.atoms[0].element, "C");
        assert_eq!(s.atoms[0].partial_charge, -0.30);
        assert_eq!(s.atoms[0].bonded_atom_indices, vec![2, 3, 4, 5]);
        assert!(!s.atoms[5].use_for_charge());
        assert_eq!(s.aliphatic_hydrogens(), vec![2, 3, 4]);
    }

    #[test]
    fn test_parse_mae_truncated() {
        let truncated = &MAE[..MAE.len() / 2];
        assert!(ParsedFile::parse(Path::new("a.mae"), FileKind::Mae, truncated).is_err());
    }

    #[test]
    fn test_parse_mae_bad_charge() {
        let bad = MAE.replace("5 16 8 -0.60 1", "5 16 8 garbage 1");
        let result = ParsedFile::parse(Path::new("a.mae"), FileKind::Mae, &bad);
        match result {
            Err(FormatError::Parse { message, .. }) => assert!(message.contains("garbage")),
            other => panic!("expected a parse error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_parse_mmo() {
        let content = "\
 Structure 1
 Bond     1    2      1.0950  OPT Sub C-H
 Angle    2    1    3    108.20  OPT Sub H-C-H
 Torsion  2    1    5    6    -60.0  MM3 general
 Structure 2
 Bond     1    2      1.0970  OPT Sub C-H
";
        let file =
            ParsedFile::parse(Path::new("a.mmo"), FileKind::MacroModelListing, content).unwrap();
        let structures = file.structures();
        assert_eq!(structures.len(), 2);
        assert_eq!(structures[0].terms.len(), 3);
        assert_eq!(structures[0].terms[1].atoms, vec![2, 1, 3]);
        assert_eq!(structures[0].terms[2].value, -60.0);
        assert_eq!(structures[0].terms[2].comment, "MM3 general");
        assert_eq!(structures[1].terms[0].value, 1.097);
    }

    #[test]
    fn test_parse_mmo_wrong_atom_count() {
        let content = " Bond  1  2  3  1.09  OPT\n";
        assert!(ParsedFile::parse(Path::new("a.mmo"), FileKind::MacroModelListing, content).is_err());
    }

    #[test]
    fn test_parse_macromodel_log() {
        let content = "\
 some header
 Hessian (kJ/mol/A**2):
   1.0
   2.0   3.0
   4.0   5.0   6.0
 Normal termination
";
        let file =
            ParsedFile::parse(Path::new("a.log"), FileKind::MacroModelLog, content).unwrap();
        let h = file.force_matrix().unwrap();
        assert_eq!(h.nrows(), 3);
        assert_eq!(h[(0, 2)], 4.0);
        assert!(file.masses().is_none());
    }

    #[test]
    fn test_parse_jaguar_in() {
        let content = "\
&gen
&
&zmat
H1   0.0  0.0  0.0
&
&hess
1.0
0.0 1.0
0.0 0.0 1.0
&
";
        let file = ParsedFile::parse(Path::new("a.in"), FileKind::JaguarIn, content).unwrap();
        let h = file.force_matrix().unwrap();
        assert!((h[(1, 1)] - HESSIAN_CONVERSION).abs() < 1e-9);
        assert_eq!(file.masses().unwrap().len(), 1);
    }

    #[test]
    fn test_jaguar_heavy_element_labels() {
        let content = "&zmat\nPd1   0.0  0.0  0.0\n&\n&hess\n1.0\n0.0 1.0\n0.0 0.0 1.0\n&\n";
        let file = ParsedFile::parse(Path::new("a.in"), FileKind::JaguarIn, content).unwrap();
        assert_eq!(file.structures()[0].atoms[0].atomic_num, 46);
        assert!((file.masses().unwrap()[0] - 106.42).abs() < 1e-6);

        let unknown = content.replace("Pd1", "Hx1");
        let result = ParsedFile::parse(Path::new("a.in"), FileKind::JaguarIn, &unknown);
        assert!(matches!(result, Err(FormatError::Parse { .. })));
    }

    #[test]
    fn test_parse_jaguar_out() {
        let content = "\
  Input geometry:
                 angstroms
  atom               x                 y                 z
  H1          0.000000          0.000000          0.000000

  frequencies    100.0    200.0
  H1   X    1.0    0.0
  H1   Y    0.0    1.0
  H1   Z    0.0    0.0

";
        let file = ParsedFile::parse(Path::new("a.out"), FileKind::JaguarOut, content).unwrap();
        let evecs = file.eigenvectors().unwrap();
        assert_eq!((evecs.nrows(), evecs.ncols()), (2, 3));
        assert_eq!(evecs[(1, 1)], 1.0);
    }

    #[test]
    fn test_parse_gauss_log() {
        let content = "\
 Harmonic frequencies (cm**-1), IR intensities (KM/Mole), Raman scattering
                      1                      2
                      A                      A
 Frequencies ---   -514.0487              1028.0974
 Reduced masses ---     1.0                    1.0
 Coord Atom Element:
   1     1     1          1.00000                0.00000
   2     1     1          0.00000                1.00000
   3     1     1          0.00000                0.00000
                      3
 Normal termination of Gaussian
 1\\1\\GINC-NODE\\Freq\\RB3LYP\\6-31G(d)\\H2\\USER\\01-Jan-2024\\0\\\\#
  freq\\\\title\\\\0,1\\H\\H,1,0.74\\\\Version=ES64L-G16RevC.01\\HF=-1.17
 54\\ZeroPoint=0.0100\\RMSD=1.0e-09\\PG=D*H [C*(H1.H1)]\\\\@
";
        let file = ParsedFile::parse(Path::new("a.log"), FileKind::GaussLog, content).unwrap();

        let s = &file.structures()[0];
        assert_eq!(s.prop_f64("hf"), Some(-1.1754));
        assert_eq!(s.prop_f64("zp"), Some(0.01));

        let evals = file.eigenvalues().unwrap();
        assert!((evals[0] + 0.01 * HESSIAN_CONVERSION).abs() < 1e-6);
        assert!((evals[1] - 0.04 * HESSIAN_CONVERSION).abs() < 1e-6);

        let evecs = file.eigenvectors().unwrap();
        assert_eq!((evecs.nrows(), evecs.ncols()), (2, 3));
    }

    #[test]
    fn test_parse_fchk() {
        let content = "\
Title
Freq      RB3LYP                                                      6-31G(d)
Number of atoms                            I                2
Atomic numbers                             I   N=           2
           1           1
Real atomic weights                        R   N=           2
  1.00782504E+00  1.00782504E+00
Cartesian Force Constants                  R   N=          21
  1.0E+00  0.0E+00  1.0E+00  0.0E+00  0.0E+00
  1.0E+00  0.0E+00  0.0E+00  0.0E+00  1.0E+00
  0.0E+00  0.0E+00  0.0E+00  0.0E+00  1.0E+00
  0.0E+00  0.0E+00  0.0E+00  0.0E+00  0.0E+00
  1.0E+00
";
        let file = ParsedFile::parse(Path::new("a.fchk"), FileKind::GaussFchk, content).unwrap();
        let h = file.force_matrix().unwrap();
        assert_eq!(h.nrows(), 6);
        assert!((h[(5, 5)] - HESSIAN_CONVERSION).abs() < 1e-9);
        assert_eq!(file.masses().unwrap(), vec![1.00782504, 1.00782504]);
        assert_eq!(file.structures()[0].atoms.len(), 2);
    }

    #[test]
    fn test_disk_loader_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = DiskLoader.load(&dir.path().join("missing.mae"), FileKind::Mae);
        assert!(matches!(result, Err(FormatError::Io { .. })));
    }
}
