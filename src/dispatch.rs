//! Data dispatch engine.
//!
//! Turns a [`CommandTable`] into the canonical record sequence. Each datatype
//! command is mapped once to an [`Extraction`] strategy; the strategy reads
//! its files through a [`ParseCache`] shared by all commands of one
//! invocation, so every physical file is parsed at most once no matter how
//! many commands or groups reference it.
//!
//! # Provenance
//!
//! | Extraction | group | structure | atoms |
//! |------------|-------|-----------|-------|
//! | energies | group position | structure in file (QM) or input structure (FF) | none |
//! | charges | group position | as for energies | charged atom |
//! | bonds, angles, torsions | group position | input structure | defining atoms |
//! | eigen data | group position | none | matrix row and column |
//!
//! Any unreadable file, missing property or empty structure selection is an
//! error: a silently dropped record would shift the positional pairing of
//! reference and computed data.

use crate::command::{Command, CommandTable, Partition};
use crate::datum::{DataKind, Datum};
use crate::formats::{FileKind, FileLoader, FormatAdapter, FormatError};
use crate::hessian::{lower_triangle, Hessian, HessianError};
use crate::macromodel::{MacroModelJob, RunError};
use crate::reference::{read_reference, ReferenceError};
use crate::structure::{Structure, TermKind};
use log::{debug, warn};
use nalgebra::DMatrix;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

/// Converts Hartree to kJ/mol.
pub const HARTREE_TO_KJMOL: f64 = 2625.5;

/// Structure property holding the Jaguar gas-phase energy (Hartree).
pub const JAGUAR_ENERGY: &str = "r_j_Gas_Phase_Energy";

/// Structure property holding the MacroModel MM3* potential energy (kJ/mol).
pub const MACROMODEL_ENERGY: &str = "r_mmod_Potential_Energy-MM3*";

/// Errors raised while collecting data.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A file could not be read or parsed
    #[error(transparent)]
    Format(#[from] FormatError),
    /// A reference file could not be read
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    /// Hessian transform failed
    #[error("Hessian error: {0}")]
    Hessian(#[from] HessianError),
    /// MacroModel output does not match the job
    #[error(transparent)]
    Run(#[from] RunError),
    /// A MacroModel command references a file with no prepared job
    #[error("No MacroModel job for '{file}' (command -{command})")]
    MissingJob {
        /// Command tag
        command: Command,
        /// Input file
        file: String,
    },
    /// File has no structures
    #[error("No structures in {0}")]
    NoStructures(String),
    /// Structure lacks a required property
    #[error("Structure {structure} of {file} has no property '{property}'")]
    MissingProperty {
        /// Source file
        file: String,
        /// 1-based structure index
        structure: usize,
        /// Property name
        property: String,
    },
    /// File lacks required data
    #[error("{file} provides no {what}")]
    MissingData {
        /// Source file
        file: String,
        /// What is missing
        what: String,
    },
    /// Token is not of the form `first,second`
    #[error("Command -{command} expects a comma-joined file pair, found '{token}'")]
    BadFilePair {
        /// Command tag
        command: Command,
        /// Offending token
        token: String,
    },
    /// The same file is requested as two different kinds
    #[error("{file} was read as {cached} and is now requested as {requested}")]
    KindConflict {
        /// File path
        file: String,
        /// Kind it was parsed as
        cached: FileKind,
        /// Kind now requested
        requested: FileKind,
    },
}

type Result<T> = std::result::Result<T, DispatchError>;

/// Parsed files of one invocation, keyed by path.
pub struct ParseCache<'a> {
    loader: &'a dyn FileLoader,
    files: HashMap<PathBuf, Rc<dyn FormatAdapter>>,
}

impl<'a> ParseCache<'a> {
    /// Creates an empty cache backed by `loader`.
    pub fn new(loader: &'a dyn FileLoader) -> Self {
        Self {
            loader,
            files: HashMap::new(),
        }
    }

    /// Returns the parsed file, loading it on first request.
    pub fn get(&mut self, path: &Path, kind: FileKind) -> Result<Rc<dyn FormatAdapter>> {
        if let Some(file) = self.files.get(path) {
            if file.kind() != kind {
                return Err(DispatchError::KindConflict {
                    file: path.display().to_string(),
                    cached: file.kind(),
                    requested: kind,
                });
            }
            return Ok(Rc::clone(file));
        }
        let file: Rc<dyn FormatAdapter> = Rc::from(self.loader.load(path, kind)?);
        self.files.insert(path.to_path_buf(), Rc::clone(&file));
        Ok(file)
    }

    /// Number of distinct files parsed.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether nothing has been parsed.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Where an energy comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergySource {
    /// Jaguar energy stored in a `.mae` (Hartree)
    Jaguar,
    /// Gaussian archive electronic plus zero-point energy (Hartree)
    Gaussian,
    /// MacroModel output `.mae` (kJ/mol)
    MacroModel(Partition),
}

/// Where charges come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeSource {
    /// Charges in the input `.mae`
    Input,
    /// Charges in the MacroModel output `.mae`
    MacroModel(Partition),
}

/// Which member of a comma-joined pair provides a matrix, and how to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairFile {
    /// First file, read as the given kind
    First(FileKind),
    /// Second file, read as the given kind
    Second(FileKind),
    /// MacroModel log of the job run on the first file
    FirstJobLog,
}

/// How an eigenmatrix is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EigenRecipe {
    /// Diagonal matrix of the eigenvalues in a Gaussian log
    Eigenvalues,
    /// Force matrix projected onto normal modes
    Projected {
        /// Source of the force matrix
        force: PairFile,
        /// Source of the eigenvectors
        modes: PairFile,
        /// Mass-weight the force matrix before projecting
        mass_weight_hessian: bool,
        /// Mass-weight the eigenvectors before projecting
        mass_weight_vectors: bool,
        /// Keep only the diagonal of the projected matrix
        zero_off_diagonal: bool,
    },
}

/// Extraction strategy of a datatype command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// Reference data files
    Reference,
    /// One energy per structure
    Energy {
        /// Energy or post-optimization energy
        optimized: bool,
        /// Where the energy is read
        source: EnergySource,
    },
    /// One charge per used atom
    Charge {
        /// Where the charges are read
        source: ChargeSource,
        /// Fold aliphatic hydrogens into their heavy atom
        fold: bool,
    },
    /// Bonds, angles or torsions from a MacroModel listing
    Geometry {
        /// Term kind
        term: TermKind,
        /// Snapshot to read
        partition: Partition,
    },
    /// Lower triangle of an eigenmatrix
    Eigen(EigenRecipe),
}

impl Extraction {
    /// Strategy for a command.
    pub fn for_command(command: Command) -> Self {
        use Command::*;
        match command {
            R => Extraction::Reference,
            Ge | Geo => Extraction::Energy {
                optimized: command == Geo,
                source: EnergySource::Gaussian,
            },
            Je | Jeo => Extraction::Energy {
                optimized: command == Jeo,
                source: EnergySource::Jaguar,
            },
            Me => Extraction::Energy {
                optimized: false,
                source: EnergySource::MacroModel(Partition::Pre),
            },
            Meo => Extraction::Energy {
                optimized: true,
                source: EnergySource::MacroModel(Partition::Opt),
            },
            Jq | Jqh => Extraction::Charge {
                source: ChargeSource::Input,
                fold: command == Jqh,
            },
            Mq | Mqh => Extraction::Charge {
                source: ChargeSource::MacroModel(Partition::Pre),
                fold: command == Mqh,
            },
            Ja | Jb | Jt | Ma | Mb | Mt => Extraction::Geometry {
                term: match command {
                    Ja | Ma => TermKind::Angle,
                    Jb | Mb => TermKind::Bond,
                    _ => TermKind::Torsion,
                },
                partition: command.partition().unwrap_or(Partition::Pre),
            },
            Geigz => Extraction::Eigen(EigenRecipe::Eigenvalues),
            Geigz2 => Extraction::Eigen(EigenRecipe::Projected {
                force: PairFile::Second(FileKind::GaussFchk),
                modes: PairFile::First(FileKind::GaussLog),
                mass_weight_hessian: true,
                mass_weight_vectors: false,
                zero_off_diagonal: true,
            }),
            Jeigz => Extraction::Eigen(EigenRecipe::Projected {
                force: PairFile::First(FileKind::JaguarIn),
                modes: PairFile::Second(FileKind::JaguarOut),
                mass_weight_hessian: true,
                mass_weight_vectors: true,
                zero_off_diagonal: true,
            }),
            Mjeig => Extraction::Eigen(EigenRecipe::Projected {
                force: PairFile::FirstJobLog,
                modes: PairFile::Second(FileKind::JaguarOut),
                mass_weight_hessian: false,
                mass_weight_vectors: true,
                zero_off_diagonal: false,
            }),
            Mgeig => Extraction::Eigen(EigenRecipe::Projected {
                force: PairFile::FirstJobLog,
                modes: PairFile::Second(FileKind::GaussLog),
                mass_weight_hessian: false,
                mass_weight_vectors: false,
                zero_off_diagonal: false,
            }),
        }
    }
}

/// Collects the records of every command in `table`.
///
/// `jobs` maps MacroModel input files to their run metadata; `directory` is
/// where all other files are looked up.
pub fn collect_data(
    table: &CommandTable,
    jobs: &HashMap<String, MacroModelJob>,
    directory: &Path,
    sub_names: &[String],
    cache: &mut ParseCache<'_>,
) -> Result<Vec<Datum>> {
    let mut dispatcher = Dispatcher {
        jobs,
        directory,
        sub_names,
        cache,
    };
    let mut data = Vec::new();

    for (command, groups) in table.iter() {
        let extraction = Extraction::for_command(command);
        debug!("-{}: {:?}", command, extraction);
        for (g, group) in groups.iter().enumerate() {
            for token in group {
                dispatcher.extract(command, extraction, g + 1, token, &mut data)?;
            }
        }
    }

    debug!("Total data points: {}", data.len());
    Ok(data)
}

struct Dispatcher<'c, 'l> {
    jobs: &'c HashMap<String, MacroModelJob>,
    directory: &'c Path,
    sub_names: &'c [String],
    cache: &'c mut ParseCache<'l>,
}

impl<'c> Dispatcher<'c, '_> {
    fn extract(
        &mut self,
        command: Command,
        extraction: Extraction,
        group: usize,
        token: &str,
        data: &mut Vec<Datum>,
    ) -> Result<()> {
        match extraction {
            Extraction::Reference => {
                data.extend(read_reference(&self.directory.join(token))?);
            }
            Extraction::Energy { optimized, source } => {
                let kind = if optimized {
                    DataKind::EnergyOpt
                } else {
                    DataKind::Energy
                };
                for (source_name, structure_index, value) in self.energies(command, source, token)? {
                    data.push(
                        Datum::new(value, kind.clone())
                            .with_command(command)
                            .with_source(source_name)
                            .with_indices(Some(group), Some(structure_index)),
                    );
                }
            }
            Extraction::Charge { source, fold } => {
                let (file, selected) = match source {
                    ChargeSource::Input => {
                        let file = self.direct(token, FileKind::Mae)?;
                        (file, None)
                    }
                    ChargeSource::MacroModel(partition) => {
                        let job = self.job(command, token)?;
                        let file = self.job_file(job, &job.name_mae, FileKind::Mae)?;
                        (file, Some((job, partition)))
                    }
                };
                for (structure_index, structure) in select(&file, selected)? {
                    for (atom, charge) in charges(structure, fold) {
                        data.push(
                            Datum::new(charge, DataKind::Charge)
                                .with_command(command)
                                .with_source(token)
                                .with_indices(Some(group), Some(structure_index))
                                .with_atoms(vec![atom]),
                        );
                    }
                }
            }
            Extraction::Geometry { term, partition } => {
                let job = self.job(command, token)?;
                let file = self.job_file(job, &job.name_mmo, FileKind::MacroModelListing)?;
                let kind = match term {
                    TermKind::Bond => DataKind::Bond,
                    TermKind::Angle => DataKind::Angle,
                    TermKind::Torsion => DataKind::Torsion,
                };
                for (structure_index, structure) in select(&file, Some((job, partition)))? {
                    for t in structure.select_terms(term, self.sub_names) {
                        data.push(
                            Datum::new(t.value, kind.clone())
                                .with_command(command)
                                .with_source(job.name_mmo.as_str())
                                .with_indices(Some(group), Some(structure_index))
                                .with_atoms(t.atoms.clone()),
                        );
                    }
                }
            }
            Extraction::Eigen(recipe) => {
                let (matrix, source_1, source_2) = self.eigenmatrix(command, recipe, token)?;
                for (i, j, value) in lower_triangle(&matrix) {
                    let mut datum = Datum::new(value, DataKind::Eigen)
                        .with_command(command)
                        .with_source(source_1.as_str())
                        .with_indices(Some(group), None)
                        .with_atoms(vec![i + 1, j + 1]);
                    datum.source_2 = source_2.clone();
                    data.push(datum);
                }
            }
        }
        Ok(())
    }

    fn direct(&mut self, name: &str, kind: FileKind) -> Result<Rc<dyn FormatAdapter>> {
        self.cache.get(&self.directory.join(name), kind)
    }

    fn job(&self, command: Command, name: &str) -> Result<&'c MacroModelJob> {
        self.jobs.get(name).ok_or_else(|| DispatchError::MissingJob {
            command,
            file: name.to_string(),
        })
    }

    fn job_file(
        &mut self,
        job: &MacroModelJob,
        name: &str,
        kind: FileKind,
    ) -> Result<Rc<dyn FormatAdapter>> {
        self.cache.get(&job.directory.join(name), kind)
    }

    /// Returns `(source, structure index, energy in kJ/mol)` per structure.
    fn energies(
        &mut self,
        command: Command,
        source: EnergySource,
        token: &str,
    ) -> Result<Vec<(String, usize, f64)>> {
        let mut energies = Vec::new();
        match source {
            EnergySource::Jaguar => {
                let file = self.direct(token, FileKind::Mae)?;
                for (i, structure) in select(&file, None)? {
                    let e = property(&file, i, structure, JAGUAR_ENERGY)?;
                    energies.push((token.to_string(), i, e * HARTREE_TO_KJMOL));
                }
            }
            EnergySource::Gaussian => {
                let file = self.direct(token, FileKind::GaussLog)?;
                // Only the first archive entry of a log counts.
                if let Some((i, structure)) = select(&file, None)?.into_iter().next() {
                    let hf = property(&file, i, structure, "hf")?;
                    let zp = structure.prop_f64("zp").unwrap_or_else(|| {
                        warn!(
                            "No ZeroPoint in {}; using the electronic energy alone",
                            file.path().display()
                        );
                        0.0
                    });
                    energies.push((token.to_string(), i, (hf + zp) * HARTREE_TO_KJMOL));
                }
            }
            EnergySource::MacroModel(partition) => {
                let job = self.job(command, token)?;
                let file = self.job_file(job, &job.name_mae, FileKind::Mae)?;
                for (i, structure) in select(&file, Some((job, partition)))? {
                    let e = property(&file, i, structure, MACROMODEL_ENERGY)?;
                    energies.push((job.name_mae.clone(), i, e));
                }
            }
        }
        Ok(energies)
    }

    fn pair_file(
        &mut self,
        command: Command,
        which: PairFile,
        first: &str,
        second: &str,
    ) -> Result<(Rc<dyn FormatAdapter>, String)> {
        match which {
            PairFile::First(kind) => Ok((self.direct(first, kind)?, first.to_string())),
            PairFile::Second(kind) => Ok((self.direct(second, kind)?, second.to_string())),
            PairFile::FirstJobLog => {
                let job = self.job(command, first)?;
                let file = self.job_file(job, &job.name_log, FileKind::MacroModelLog)?;
                Ok((file, job.name_log.clone()))
            }
        }
    }

    /// Builds the eigenmatrix and returns it with its source names.
    fn eigenmatrix(
        &mut self,
        command: Command,
        recipe: EigenRecipe,
        token: &str,
    ) -> Result<(DMatrix<f64>, String, Option<String>)> {
        let EigenRecipe::Projected {
            force,
            modes,
            mass_weight_hessian,
            mass_weight_vectors,
            zero_off_diagonal,
        } = recipe
        else {
            let file = self.direct(token, FileKind::GaussLog)?;
            let evals = file.eigenvalues().ok_or_else(|| missing(&file, "eigenvalues"))?;
            return Ok((DMatrix::from_diagonal(evals), token.to_string(), None));
        };

        let (first, second) = match token.split_once(',') {
            Some((a, b)) if !a.is_empty() && !b.is_empty() && !b.contains(',') => (a, b),
            _ => {
                return Err(DispatchError::BadFilePair {
                    command,
                    token: token.to_string(),
                })
            }
        };

        let (force_file, force_name) = self.pair_file(command, force, first, second)?;
        let (modes_file, modes_name) = self.pair_file(command, modes, first, second)?;
        let matrix = force_file
            .force_matrix()
            .ok_or_else(|| missing(&force_file, "force matrix"))?
            .clone();
        let evecs = modes_file
            .eigenvectors()
            .ok_or_else(|| missing(&modes_file, "eigenvectors"))?
            .clone();
        let masses = force_file
            .masses()
            .or_else(|| modes_file.masses())
            .unwrap_or_default();

        let mut hessian = Hessian::new(matrix, Some(evecs), masses)?;
        if mass_weight_hessian {
            hessian.mass_weight_hessian()?;
        }
        if mass_weight_vectors {
            hessian.mass_weight_eigenvectors()?;
        }
        hessian.diagonalize()?;
        if zero_off_diagonal {
            hessian.zero_off_diagonal();
        }

        // Sources keep the order of the pair.
        let (source_1, source_2) = match force {
            PairFile::Second(_) => (modes_name, force_name),
            _ => (force_name, modes_name),
        };
        Ok((hessian.hess, source_1, Some(source_2)))
    }
}

/// Structures of a file, optionally restricted to one partition of a
/// MacroModel job, paired with their 1-based structure index.
fn select<'f>(
    file: &'f Rc<dyn FormatAdapter>,
    job: Option<(&MacroModelJob, Partition)>,
) -> Result<Vec<(usize, &'f Structure)>> {
    let structures = file.structures();
    if structures.is_empty() {
        return Err(DispatchError::NoStructures(file.path().display().to_string()));
    }
    match job {
        Some((job, partition)) => {
            let name = file.path().display().to_string();
            Ok(job.select(&name, structures, partition)?)
        }
        None => Ok(structures.iter().enumerate().map(|(i, s)| (i + 1, s)).collect()),
    }
}

fn property(
    file: &Rc<dyn FormatAdapter>,
    structure_index: usize,
    structure: &Structure,
    name: &str,
) -> Result<f64> {
    structure
        .prop_f64(name)
        .ok_or_else(|| DispatchError::MissingProperty {
            file: file.path().display().to_string(),
            structure: structure_index,
            property: name.to_string(),
        })
}

fn missing(file: &Rc<dyn FormatAdapter>, what: &str) -> DispatchError {
    DispatchError::MissingData {
        file: file.path().display().to_string(),
        what: what.to_string(),
    }
}

/// Charges of the atoms used for comparison, as `(atom index, charge)`.
///
/// With `fold`, aliphatic hydrogens are omitted and their charges are added
/// to the atom they are bonded to.
pub fn charges(structure: &Structure, fold: bool) -> Vec<(usize, f64)> {
    let aliphatic = if fold {
        structure.aliphatic_hydrogens()
    } else {
        Vec::new()
    };

    structure
        .atoms
        .iter()
        .filter(|atom| atom.use_for_charge() && !aliphatic.contains(&atom.index))
        .map(|atom| {
            let folded: f64 = atom
                .bonded_atom_indices
                .iter()
                .filter(|i| aliphatic.contains(i))
                .filter_map(|&i| structure.atom(i))
                .map(|h| h.partial_charge)
                .sum();
            (atom.index, atom.partial_charge + folded)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Atom;

    fn carbon_with_two_hydrogens() -> Structure {
        // C1 is sp3: H2, H3 and two chlorines flagged out of the comparison.
        let mut atoms = vec![Atom::new(1, 6), Atom::new(2, 1), Atom::new(3, 1)];
        atoms[0].partial_charge = -0.30;
        atoms[1].partial_charge = 0.05;
        atoms[2].partial_charge = 0.07;
        for index in [4, 5] {
            let mut cl = Atom::new(index, 17);
            cl.partial_charge = 0.09;
            cl.props.insert("b_q_use_charge".to_string(), "0".to_string());
            atoms.push(cl);
        }
        let mut structure = Structure {
            atoms,
            ..Default::default()
        };
        structure.connect(&[(1, 2), (1, 3), (1, 4), (1, 5)]);
        structure
    }

    #[test]
    fn test_fold_aliphatic_hydrogens() {
        let structure = carbon_with_two_hydrogens();

        let folded = charges(&structure, true);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].0, 1);
        assert!((folded[0].1 + 0.18).abs() < 1e-12);

        let plain = charges(&structure, false);
        assert_eq!(plain.len(), 3);
        assert_eq!(
            plain.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!((plain[0].1 + 0.30).abs() < 1e-12);
    }

    #[test]
    fn test_registry() {
        assert_eq!(Extraction::for_command(Command::R), Extraction::Reference);
        assert_eq!(
            Extraction::for_command(Command::Mb),
            Extraction::Geometry {
                term: TermKind::Bond,
                partition: Partition::Opt
            }
        );
        assert_eq!(
            Extraction::for_command(Command::Jt),
            Extraction::Geometry {
                term: TermKind::Torsion,
                partition: Partition::Pre
            }
        );
        assert_eq!(
            Extraction::for_command(Command::Mqh),
            Extraction::Charge {
                source: ChargeSource::MacroModel(Partition::Pre),
                fold: true
            }
        );
        for command in Command::ALL {
            // Every command has a strategy.
            let _ = Extraction::for_command(command);
        }
    }
}
