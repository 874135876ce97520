//! Loop script interpreter.
//!
//! Directives run in order against one [`Session`], which holds the force
//! field, both data sets and the running score. A `LOOP` directive repeats
//! its body until the fractional score change of a cycle,
//!
//! ```text
//! change = (previous_score − score) / previous_score
//! ```
//!
//! is at or below its threshold. The previous score of the first cycle is the
//! score the session had when the loop started, so a loop entered without a
//! score always runs at least two cycles. Nested loops work on the same
//! session: the force field and score they leave behind are what the
//! enclosing loop continues with.
//!
//! A cycle whose score rises gives a negative change and therefore stops the
//! loop.

use crate::calculate::{CalcError, DataSource};
use crate::checkpoint::LoopCheckpoint;
use crate::compare::{CompareError, Comparator};
use crate::datum::Datum;
use crate::forcefield::{export_ff, trim_params_by_file, ForceField, ForceFieldError};
use crate::optimizer::{ForceFieldEvaluator, OptimizerError, ParameterOptimizer};
use crate::parser::{Directive, ScriptError};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while interpreting a script.
#[derive(Error, Debug)]
pub enum LoopError {
    /// Script could not be read or parsed
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// `RDAT` or `CDAT` failed
    #[error(transparent)]
    Calc(#[from] CalcError),
    /// `COMP` failed
    #[error(transparent)]
    Compare(#[from] CompareError),
    /// Force field could not be read, written or filtered
    #[error(transparent)]
    ForceField(#[from] ForceFieldError),
    /// `GRAD` failed
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
    /// Comparison report could not be written
    #[error("Cannot write {path}: {source}")]
    Io {
        /// Report path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// Directive needs a force field but none was read
    #[error("{0} requires a force field; use FFLD read first")]
    NoForceField(&'static str),
    /// Directive needs reference data but none was read
    #[error("{0} requires reference data; use RDAT first")]
    NoReferenceData(&'static str),
    /// Directive needs computed data but none was read
    #[error("{0} requires force field data; use CDAT first")]
    NoComputedData(&'static str),
    /// Loop body finished a cycle without producing a score
    #[error("Loop at depth {0} produced no score; its body needs COMP or GRAD")]
    NoScore(usize),
    /// Checkpoint could not be written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

type Result<T> = std::result::Result<T, LoopError>;

/// State shared by all directives of one script run.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Current force field
    pub ff: Option<ForceField>,
    /// Raw lines of the force field file
    pub ff_lines: Vec<String>,
    /// Reference data from the last `RDAT`
    pub reference: Option<Vec<Datum>>,
    /// Force field data from the last `CDAT`
    pub calculated: Option<Vec<Datum>>,
    /// Arguments of the last `CDAT`, reused to evaluate trial force fields
    pub cdat_args: Option<Vec<String>>,
    /// Running score
    pub score: Option<f64>,
}

/// Convergence state of one `LOOP`.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    /// Nesting depth, 1 for a top-level loop
    pub depth: usize,
    /// Fractional change at or below which the loop stops
    pub threshold: f64,
    /// Completed cycles
    pub cycle: usize,
    /// Score after the last cycle
    pub score: Option<f64>,
    /// Score before the last cycle
    pub previous_score: Option<f64>,
}

impl Loop {
    /// Creates a loop that has not run yet.
    pub fn new(threshold: f64, depth: usize) -> Self {
        Self {
            depth,
            threshold,
            cycle: 0,
            score: None,
            previous_score: None,
        }
    }

    /// Fractional score change of the last cycle.
    pub fn change(&self) -> Option<f64> {
        match (self.previous_score, self.score) {
            (Some(prev), Some(score)) if prev != 0.0 => Some((prev - score) / prev),
            _ => None,
        }
    }

    /// Whether the loop should stop. A previous score of zero cannot improve
    /// and counts as converged.
    pub fn converged(&self) -> bool {
        match (self.previous_score, self.score) {
            (Some(prev), Some(_)) if prev == 0.0 => true,
            _ => self.change().map_or(false, |change| change <= self.threshold),
        }
    }

    /// Cycle summary box.
    pub fn summary(&self) -> Vec<String> {
        let score = self
            .score
            .map(|s| format!("{:36.15}", s))
            .unwrap_or_else(|| format!("{:>36}", "-"));
        let change = self
            .change()
            .map(|c| format!("{:36.15}", c))
            .unwrap_or_else(|| format!("{:>36}", "-"));
        vec![
            format!("{:-^50}", format!(" Cycle {} Summary ", self.cycle)),
            format!("| PF Score: {} |", score),
            format!("| % change: {} |", change),
            "-".repeat(50),
        ]
    }
}

/// Runs directives against a data source, comparator and optimizer.
pub struct Interpreter<'a> {
    source: &'a mut dyn DataSource,
    comparator: &'a dyn Comparator,
    optimizer: &'a mut dyn ParameterOptimizer,
    sub_names: Vec<String>,
    checkpoint: Option<PathBuf>,
}

impl<'a> Interpreter<'a> {
    /// Creates an interpreter. `sub_names` select the force field
    /// substructures `FFLD read` loads.
    pub fn new(
        source: &'a mut dyn DataSource,
        comparator: &'a dyn Comparator,
        optimizer: &'a mut dyn ParameterOptimizer,
        sub_names: Vec<String>,
    ) -> Self {
        Self {
            source,
            comparator,
            optimizer,
            sub_names,
            checkpoint: None,
        }
    }

    /// Saves a checkpoint to `path` after every loop cycle.
    pub fn with_checkpoint(mut self, path: PathBuf) -> Self {
        self.checkpoint = Some(path);
        self
    }

    /// Runs a script in a fresh session and returns the final session.
    pub fn run(&mut self, directives: &[Directive]) -> Result<Session> {
        let mut session = Session::default();
        self.run_directives(directives, &mut session, 0)?;
        Ok(session)
    }

    /// Runs directives once, in order.
    pub fn run_directives(
        &mut self,
        directives: &[Directive],
        session: &mut Session,
        depth: usize,
    ) -> Result<()> {
        for directive in directives {
            debug!("> {}", directive);
            match directive {
                Directive::LoadFF(path) => {
                    let (ff, lines) = ForceField::read(path, &self.sub_names)?;
                    info!("Read {} parameters from {}", ff.params.len(), path.display());
                    session.ff = Some(ff);
                    session.ff_lines = lines;
                }
                Directive::WriteFF(path) => {
                    let ff = session.ff.as_ref().ok_or(LoopError::NoForceField("FFLD write"))?;
                    export_ff(path, &ff.params, &session.ff_lines)?;
                    info!("Wrote force field to {}", path.display());
                }
                Directive::FilterParams(path) => {
                    let ff = session.ff.as_mut().ok_or(LoopError::NoForceField("PARM"))?;
                    ff.params = trim_params_by_file(std::mem::take(&mut ff.params), path)?;
                    info!("{} active parameters after {}", ff.params.len(), path.display());
                }
                Directive::Loop { threshold, body } => {
                    self.opt_loop(*threshold, body, session, depth + 1)?;
                }
                Directive::ReadReferenceData(args) => {
                    info!("Calculating reference data...");
                    session.reference = Some(self.source.collect(args)?);
                }
                Directive::ReadComputedData(args) => {
                    info!("Calculating force field data...");
                    session.calculated = Some(self.source.collect(args)?);
                    session.cdat_args = Some(args.clone());
                }
                Directive::Compare { output } => {
                    session.score = Some(self.compare(session, output.as_deref())?);
                }
                Directive::GradientStep => self.gradient(session)?,
            }
        }
        Ok(())
    }

    /// Repeats `body` until the score converges and returns the final loop
    /// state.
    pub fn opt_loop(
        &mut self,
        threshold: f64,
        body: &[Directive],
        session: &mut Session,
        depth: usize,
    ) -> Result<Loop> {
        info!("{:=^50}", " Optimization Loop ");
        info!("Commands:");
        for directive in body {
            info!("> {}", directive);
        }
        match session.score {
            Some(score) => info!("Initial PF Score: {}", score),
            None => info!("Initial PF Score: -"),
        }
        info!("{}", "=".repeat(50));

        let mut state = Loop::new(threshold, depth);
        loop {
            state.cycle += 1;
            state.previous_score = session.score;
            self.run_directives(body, session, depth)?;
            state.score = Some(session.score.ok_or(LoopError::NoScore(depth))?);

            for line in state.summary() {
                info!("{}", line);
            }
            if let Some(path) = &self.checkpoint {
                save_checkpoint(path, &state, session)?;
            }
            if state.converged() {
                break;
            }
        }
        Ok(state)
    }

    fn compare(&self, session: &Session, output: Option<&Path>) -> Result<f64> {
        let reference = session
            .reference
            .as_deref()
            .ok_or(LoopError::NoReferenceData("COMP"))?;
        let calculated = session
            .calculated
            .as_deref()
            .ok_or(LoopError::NoComputedData("COMP"))?;

        let score = self.comparator.compare(reference, calculated)?;
        if let Some(path) = output {
            let mut report = self.comparator.report(reference, calculated)?.join("\n");
            report.push('\n');
            fs::write(path, report).map_err(|source| LoopError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            debug!("Wrote comparison to {}", path.display());
        }
        info!("Score: {}", score);
        Ok(score)
    }

    fn gradient(&mut self, session: &mut Session) -> Result<()> {
        let ff = session.ff.as_ref().ok_or(LoopError::NoForceField("GRAD"))?;
        let reference = session
            .reference
            .as_deref()
            .ok_or(LoopError::NoReferenceData("GRAD"))?;
        let args = session
            .cdat_args
            .as_deref()
            .ok_or(LoopError::NoComputedData("GRAD"))?;

        let mut evaluator = LoopEvaluator {
            source: &mut *self.source,
            comparator: self.comparator,
            args,
        };
        let best = self
            .optimizer
            .optimize(ff, &session.ff_lines, reference, &mut evaluator)?;

        // Trial force fields were written over the file; restore the winner.
        if let Some(path) = &best.path {
            export_ff(path, &best.params, &session.ff_lines)?;
        }
        session.score = best.score;
        session.ff = Some(best);
        Ok(())
    }
}

fn save_checkpoint(path: &Path, state: &Loop, session: &Session) -> Result<()> {
    LoopCheckpoint {
        depth: state.depth,
        cycle: state.cycle,
        threshold: state.threshold,
        score: state.score,
        previous_score: state.previous_score,
        force_field: session.ff.clone(),
    }
    .save(path)
    .map_err(|e| LoopError::Checkpoint(e.to_string()))
}

/// Evaluates trial force fields by writing them to their file and repeating
/// the last `CDAT`.
struct LoopEvaluator<'s, 'a> {
    source: &'s mut (dyn DataSource + 'a),
    comparator: &'s dyn Comparator,
    args: &'s [String],
}

impl ForceFieldEvaluator for LoopEvaluator<'_, '_> {
    fn residuals(
        &mut self,
        ff: &ForceField,
        ff_lines: &[String],
        reference: &[Datum],
    ) -> std::result::Result<Vec<f64>, OptimizerError> {
        let path = ff
            .path
            .as_ref()
            .ok_or_else(|| OptimizerError::Evaluation("force field has no file to write".into()))?;
        export_ff(path, &ff.params, ff_lines).map_err(|e| OptimizerError::Evaluation(Box::new(e)))?;
        let calculated = self
            .source
            .collect(self.args)
            .map_err(|e| OptimizerError::Evaluation(Box::new(e)))?;
        self.comparator
            .residuals(reference, &calculated)
            .map_err(|e| OptimizerError::Evaluation(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::DataKind;
    use crate::parser::parse_script;
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    /// Returns one record per call.
    struct StubSource {
        calls: usize,
    }

    impl DataSource for StubSource {
        fn collect(&mut self, _: &[String]) -> std::result::Result<Vec<Datum>, CalcError> {
            self.calls += 1;
            Ok(vec![Datum::new(1.0, DataKind::Bond)])
        }
    }

    /// Returns scores from a fixed sequence.
    struct ScoreSequence {
        scores: Vec<f64>,
        next: Cell<usize>,
    }

    impl ScoreSequence {
        fn new(scores: &[f64]) -> Self {
            Self {
                scores: scores.to_vec(),
                next: Cell::new(0),
            }
        }
    }

    impl Comparator for ScoreSequence {
        fn residuals(&self, _: &[Datum], _: &[Datum]) -> std::result::Result<Vec<f64>, CompareError> {
            let i = self.next.get();
            self.next.set(i + 1);
            Ok(vec![self.scores[i].sqrt()])
        }

        fn report(&self, _: &[Datum], _: &[Datum]) -> std::result::Result<Vec<String>, CompareError> {
            Ok(vec!["report".to_string()])
        }
    }

    /// Shifts every parameter by one and reports a fixed score.
    struct Shift {
        calls: RefCell<usize>,
    }

    impl ParameterOptimizer for Shift {
        fn optimize(
            &mut self,
            ff: &ForceField,
            _: &[String],
            _: &[Datum],
            _: &mut dyn ForceFieldEvaluator,
        ) -> std::result::Result<ForceField, OptimizerError> {
            *self.calls.borrow_mut() += 1;
            let values: Vec<f64> = ff.values().iter().map(|v| v + 1.0).collect();
            let mut best = ff.with_values(&values);
            best.score = Some(1.0);
            Ok(best)
        }
    }

    fn run(script: &str, scores: &[f64]) -> (Result<Session>, usize, usize) {
        let mut source = StubSource { calls: 0 };
        let comparator = ScoreSequence::new(scores);
        let mut optimizer = Shift {
            calls: RefCell::new(0),
        };
        let directives = parse_script(script).unwrap();
        let result = Interpreter::new(&mut source, &comparator, &mut optimizer, vec!["OPT".into()])
            .run(&directives);
        (result, source.calls, comparator.next.get())
    }

    #[test]
    fn test_stops_when_change_falls_below_threshold() {
        let script = "RDAT -r ref.txt\nLOOP 0.02\nCDAT -mb a.mae\nCOMP\nEND\n";
        let (session, _, compares) = run(script, &[10.0, 9.0, 8.91, 8.90]);

        assert_eq!(compares, 3);
        let score = session.unwrap().score.unwrap();
        assert!((score - 8.91).abs() < 1e-9);
    }

    #[test]
    fn test_rising_score_stops_loop() {
        let script = "RDAT -r ref.txt\nLOOP 0.02\nCDAT -mb a.mae\nCOMP\nEND\n";
        let (session, _, compares) = run(script, &[10.0, 12.0, 1.0]);

        assert_eq!(compares, 2);
        assert!((session.unwrap().score.unwrap() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_previous_score_is_converged() {
        let script = "RDAT -r ref.txt\nLOOP 0.0\nCDAT -mb a.mae\nCOMP\nEND\n";
        let (_, _, compares) = run(script, &[0.0, 0.0, 5.0]);
        assert_eq!(compares, 2);
    }

    #[test]
    fn test_nested_loop_hands_score_to_parent() {
        let script = "\
RDAT -r ref.txt
CDAT -mb a.mae
COMP
LOOP 0.5
  LOOP 0.2
    CDAT -mb a.mae
    COMP
  END
END
";
        // Inner cycle 1 continues from 10: change 0.1 stops both loops.
        let (session, sources, compares) = run(script, &[10.0, 9.0, 1.0]);
        assert_eq!(compares, 2);
        assert_eq!(sources, 3);
        assert!((session.unwrap().score.unwrap() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_loop_summary() {
        let mut state = Loop::new(0.01, 1);
        state.cycle = 2;
        state.previous_score = Some(10.0);
        state.score = Some(9.0);
        let lines = state.summary();
        assert_eq!(lines[0], format!("{:-^50}", " Cycle 2 Summary "));
        assert!(lines.iter().all(|l| l.len() == 50));
        assert!(lines[2].contains("0.100000000000000"));
        assert!(!state.converged());
    }

    #[test]
    fn test_missing_prerequisites() {
        let (result, _, _) = run("GRAD\n", &[]);
        assert!(matches!(result, Err(LoopError::NoForceField("GRAD"))));

        let (result, _, _) = run("RDAT -r ref.txt\nCOMP\n", &[]);
        assert!(matches!(result, Err(LoopError::NoComputedData("COMP"))));

        let (result, _, _) = run("LOOP 0.1\nRDAT -r ref.txt\nEND\n", &[]);
        assert!(matches!(result, Err(LoopError::NoScore(1))));
    }

    #[test]
    fn test_gradient_updates_and_writes_force_field() {
        let dir = TempDir::new().unwrap();
        let fld = dir.path().join("mm3.fld");
        fs::write(&fld, "C OPT\n 1  C1  C2                 1.5000    4.4000\n-3\n").unwrap();
        let report = dir.path().join("comp.txt");

        let script = format!(
            "FFLD read {}\nRDAT -r ref.txt\nCDAT -mb a.mae\nCOMP -o {}\nGRAD\n",
            fld.display(),
            report.display()
        );
        let (session, _, _) = run(&script, &[4.0]);
        let session = session.unwrap();

        assert_eq!(session.score, Some(1.0));
        assert_eq!(session.ff.as_ref().unwrap().values(), vec![2.5, 5.4]);
        assert_eq!(fs::read_to_string(&report).unwrap(), "report\n");
        let written = fs::read_to_string(&fld).unwrap();
        assert!(written.contains("    2.5000    5.4000"));
    }
}
