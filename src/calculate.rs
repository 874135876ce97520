//! The calculate pipeline behind `RDAT`, `CDAT` and `qmff calc`.
//!
//! One invocation:
//!
//! 1. parses the arguments into a command table
//! 2. inverts it into filename → commands and prepares a [`MacroModelJob`]
//!    for every `.mae` file a MacroModel command reads
//! 3. runs the jobs unless `--norun` is given
//! 4. collects the records through one [`ParseCache`]
//! 5. optionally assigns default weights and logs the data table

use crate::command::{commands_for_filenames, CalcArgs, Command, CommandError};
use crate::compare::apply_default_weights;
use crate::datum::Datum;
use crate::dispatch::{collect_data, DispatchError, ParseCache};
use crate::formats::{DiskLoader, FileKind, FileLoader};
use crate::macromodel::{MacroModel, MacroModelJob, RunError, SimulationRunner};
use crate::settings::Settings;
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Errors from one calculate invocation.
#[derive(Error, Debug)]
pub enum CalcError {
    /// Arguments could not be parsed
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Data extraction failed
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Preparing or running MacroModel failed
    #[error(transparent)]
    Run(#[from] RunError),
    /// No datatype command was given
    #[error("No datatype commands given")]
    NoCommands,
}

type Result<T> = std::result::Result<T, CalcError>;

/// Produces records from calculate arguments.
pub trait DataSource {
    /// Runs one calculate invocation.
    fn collect(&mut self, args: &[String]) -> Result<Vec<Datum>>;
}

/// Default [`DataSource`]: MacroModel runner and on-disk file adapters.
pub struct Calculator {
    settings: Settings,
    runner: Box<dyn SimulationRunner>,
    loader: Box<dyn FileLoader>,
}

impl Calculator {
    /// Creates a calculator that runs MacroModel as configured.
    pub fn new(settings: Settings) -> Self {
        let runner = MacroModel::from_settings(&settings.macromodel);
        Self::with_parts(settings, Box::new(runner), Box::new(DiskLoader))
    }

    /// Creates a calculator with a custom runner and file loader.
    pub fn with_parts(
        settings: Settings,
        runner: Box<dyn SimulationRunner>,
        loader: Box<dyn FileLoader>,
    ) -> Self {
        Self {
            settings,
            runner,
            loader,
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs the pipeline for one argument list.
    pub fn calculate<S: AsRef<str>>(&self, args: &[S]) -> Result<Vec<Datum>> {
        let args = CalcArgs::parse(args)?;
        if args.commands.is_empty() {
            return Err(CalcError::NoCommands);
        }
        for line in args.commands.pretty() {
            debug!("{}", line);
        }

        let mut cache = ParseCache::new(self.loader.as_ref());
        let jobs = self.prepare_jobs(&args, &mut cache)?;

        if args.norun {
            debug!("Skipping MacroModel runs");
        } else {
            let check_tokens = !args.nocheck && self.settings.macromodel.check_tokens;
            for job in &jobs {
                self.runner.run(job, check_tokens)?;
            }
        }

        let sub_names = args
            .subnames
            .clone()
            .unwrap_or_else(|| self.settings.general.substructures.clone());
        let jobs: HashMap<String, MacroModelJob> =
            jobs.into_iter().map(|job| (job.name.clone(), job)).collect();
        let mut data = collect_data(&args.commands, &jobs, &args.directory, &sub_names, &mut cache)?;

        if args.weight {
            apply_default_weights(&mut data, &self.settings.weights);
        }
        if args.doprint {
            for line in pretty_data(&data) {
                info!("{}", line);
            }
        }
        Ok(data)
    }

    /// Builds and writes a job for every `.mae` file read by a MacroModel
    /// command, in first-appearance order.
    fn prepare_jobs(&self, args: &CalcArgs, cache: &mut ParseCache<'_>) -> Result<Vec<MacroModelJob>> {
        let files = commands_for_filenames(&args.commands);
        for line in files.pretty() {
            debug!("{}", line);
        }

        let mut jobs = Vec::new();
        for (filename, commands) in files.iter() {
            let commands: Vec<Command> = commands
                .iter()
                .copied()
                .filter(|c| c.needs_macromodel())
                .collect();
            let is_mae = Path::new(filename).extension().map_or(false, |e| e == "mae");
            if commands.is_empty() || !is_mae {
                continue;
            }

            let input = cache.get(&args.directory.join(filename), FileKind::Mae)?;
            let job = MacroModelJob::new(
                &args.directory,
                filename,
                &commands,
                input.structures().len(),
            );
            job.write_com()?;
            if let Some(ffpath) = &args.ffpath {
                job.stage_force_field(ffpath)?;
            }
            jobs.push(job);
        }
        Ok(jobs)
    }
}

impl DataSource for Calculator {
    fn collect(&mut self, args: &[String]) -> Result<Vec<Datum>> {
        self.calculate(args)
    }
}

/// Log lines listing every record.
pub fn pretty_data(data: &[Datum]) -> Vec<String> {
    let mut lines = vec![format!("{:-^79}", " DATA ")];
    lines.push(format!("{:<40} {:>10} {:>16} {:>10}", "Label", "Weight", "Value", "Source"));
    for datum in data {
        lines.push(format!(
            "{:<40} {:>10} {:>16.6} {:>10}",
            datum.label(),
            datum
                .weight
                .map(|w| format!("{:.4}", w))
                .unwrap_or_else(|| "-".to_string()),
            datum.value,
            datum.source_1.as_deref().unwrap_or("-")
        ));
    }
    lines.push(format!("Total: {}", data.len()));
    lines.push("-".repeat(79));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::DataKind;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    const INPUT_MAE: &str = r#"
f_m_ct {
 s_m_title
 :::
 "conf 1"
 m_atom[2] {
  i_m_atomic_number
  r_m_charge1
  :::
  1 6 -0.10
  2 8 -0.20
  :::
 }
}
f_m_ct {
 s_m_title
 :::
 "conf 2"
 m_atom[2] {
  i_m_atomic_number
  r_m_charge1
  :::
  1 6 -0.11
  2 8 -0.21
  :::
 }
}
"#;

    fn output_ct(energy: f64) -> String {
        format!(
            "f_m_ct {{\n r_mmod_Potential_Energy-MM3*\n :::\n {}\n m_atom[1] {{\n  i_m_atomic_number\n  :::\n  1 6\n  :::\n }}\n}}\n",
            energy
        )
    }

    /// Writes MacroModel-like output instead of running MacroModel.
    struct FakeRunner {
        runs: Rc<RefCell<Vec<(String, bool)>>>,
    }

    impl SimulationRunner for FakeRunner {
        fn run(&self, job: &MacroModelJob, check_tokens: bool) -> std::result::Result<(), RunError> {
            self.runs.borrow_mut().push((job.name.clone(), check_tokens));
            let content: String = job
                .snapshots
                .iter()
                .map(|s| output_ct(10.0 * s.input_structure as f64))
                .collect();
            fs::write(job.directory.join(&job.name_mae), content)?;
            Ok(())
        }
    }

    fn calculator(runs: Rc<RefCell<Vec<(String, bool)>>>) -> Calculator {
        Calculator::with_parts(
            Settings::default(),
            Box::new(FakeRunner { runs }),
            Box::new(DiskLoader),
        )
    }

    fn args(dir: &Path, rest: &str) -> Vec<String> {
        let mut args = vec!["-d".to_string(), dir.display().to_string()];
        args.extend(rest.split_whitespace().map(String::from));
        args
    }

    #[test]
    fn test_runs_macromodel_and_reads_energies() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mae"), INPUT_MAE).unwrap();
        let runs = Rc::new(RefCell::new(Vec::new()));

        let data = calculator(runs.clone())
            .calculate(&args(dir.path(), "-me a.mae -jq a.mae -nc -w"))
            .unwrap();

        assert_eq!(runs.borrow().as_slice(), &[("a.mae".to_string(), false)]);
        assert!(dir.path().join("a.qmff.com").exists());

        let energies: Vec<&Datum> = data.iter().filter(|d| d.kind == DataKind::Energy).collect();
        assert_eq!(energies.len(), 2);
        assert_eq!(energies[1].value, 20.0);
        assert_eq!(energies[1].structure_index, Some(2));
        assert_eq!(energies[0].source_1.as_deref(), Some("a.qmff.mae"));

        let charges: Vec<&Datum> = data.iter().filter(|d| d.kind == DataKind::Charge).collect();
        assert_eq!(charges.len(), 4);
        assert_eq!(charges[3].atoms, vec![2]);
        assert_eq!(charges[3].value, -0.21);
        assert_eq!(charges[0].weight, Some(Settings::default().weights.q));
    }

    #[test]
    fn test_norun_requires_existing_output() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mae"), INPUT_MAE).unwrap();
        let runs = Rc::new(RefCell::new(Vec::new()));

        let result = calculator(runs.clone()).calculate(&args(dir.path(), "-me a.mae -n"));
        assert!(runs.borrow().is_empty());
        assert!(matches!(result, Err(CalcError::Dispatch(_))));
    }

    #[test]
    fn test_argument_errors() {
        let runs = Rc::new(RefCell::new(Vec::new()));
        let calc = calculator(runs);
        assert!(matches!(calc.calculate(&["-d", "."]), Err(CalcError::NoCommands)));
        assert!(matches!(
            calc.calculate(&["-zz", "a.mae"]),
            Err(CalcError::Command(_))
        ));
    }

    #[test]
    fn test_pretty_data() {
        let data = vec![Datum::from_label("b_1_3-5", 1.0, 1.534).unwrap()];
        let lines = pretty_data(&data);
        assert!(lines[2].starts_with("b_1_3-5"));
        assert_eq!(lines[3], "Total: 1");
    }
}
