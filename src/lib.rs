#![warn(missing_docs)]

//! qmff - Force field calibration against quantum mechanical reference data
//!
//! qmff fits molecular mechanics force field parameters so that properties
//! computed with the force field (geometries, relative energies, partial
//! charges, Hessian eigenvalues) reproduce reference values from quantum
//! mechanical calculations.
//!
//! # Overview
//!
//! The crate has two halves:
//!
//! 1. **Data dispatch**: a calculate invocation such as
//!    `-d work -me a.mae -jeigz a.in,a.out` names datatype commands and the
//!    files they read. Every file is parsed once, MacroModel is run where a
//!    command needs force field results, and each command's extraction
//!    produces canonical [`datum::Datum`] records.
//!
//! 2. **Optimization loop**: a script of directives (`FFLD`, `PARM`, `RDAT`,
//!    `CDAT`, `COMP`, `GRAD`, `LOOP ... END`) reads the force field, collects
//!    reference and force field data, scores them and steps the parameters
//!    until the score stops improving.
//!
//! # Quick Start
//!
//! ```no_run
//! use qmff::calculate::Calculator;
//! use qmff::compare::WeightedComparator;
//! use qmff::opt_loop::Interpreter;
//! use qmff::optimizer::Gradient;
//! use qmff::parser::read_loop_input;
//! use qmff::settings::Settings;
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let directives = read_loop_input(Path::new("calibrate.in"))?;
//!     let settings = Settings::default();
//!     let sub_names = settings.general.substructures.clone();
//!
//!     let mut calculator = Calculator::new(settings);
//!     let mut optimizer = Gradient::default();
//!     let session = Interpreter::new(&mut calculator, &WeightedComparator, &mut optimizer, sub_names)
//!         .run(&directives)?;
//!     println!("final score {:?}", session.score);
//!     Ok(())
//! }
//! ```
//!
//! # Scoring
//!
//! ```text
//! score = Σ (w_i · (r_i − c_i))²
//! ```
//!
//! over reference records `r` and calculated records `c` paired by datatype,
//! group, structure and atoms. Energies are compared relative to the lowest
//! reference energy of their group.
//!
//! # Modules
//!
//! - [`command`](command/index.html) - Datatype commands and calculate arguments
//! - [`datum`](datum/index.html) - Canonical data records
//! - [`formats`](formats/index.html) - Structure and output file adapters
//! - [`dispatch`](dispatch/index.html) - Parse cache and per-command extraction
//! - [`macromodel`](macromodel/index.html) - MacroModel jobs and runner
//! - [`calculate`](calculate/index.html) - The calculate pipeline
//! - [`compare`](compare/index.html) - Scoring and default weights
//! - [`forcefield`](forcefield/index.html) - Force field files and parameters
//! - [`optimizer`](optimizer/index.html) - Gradient parameter optimizer
//! - [`parser`](parser/index.html) - Loop script parsing
//! - [`opt_loop`](opt_loop/index.html) - Loop script interpreter
//! - [`settings`](settings/index.html) - Configuration management
//! - [`help`](help/index.html) - Built-in help system

/// Loop checkpoints
pub mod checkpoint;
pub mod calculate;
/// Datatype commands and calculate argument parsing
pub mod command;
pub mod compare;
pub mod datum;
pub mod dispatch;
pub mod forcefield;
pub mod formats;
/// Built-in help system
pub mod help;
/// Hessian handling for eigen data
pub mod hessian;
pub mod macromodel;
pub mod opt_loop;
pub mod optimizer;
pub mod parser;
/// Reference data files
pub mod reference;
/// Configuration management system
pub mod settings;
pub mod structure;

pub use datum::{DataKind, Datum};
pub use forcefield::ForceField;
