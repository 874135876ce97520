//! Loop checkpoints.
//!
//! When `[general] checkpoint = true`, the loop interpreter saves a JSON
//! checkpoint after every cycle. It records:
//!
//! - **Cycle**: cycle number of the loop that wrote it
//! - **Threshold**: convergence threshold of that loop
//! - **Scores**: current and previous score
//! - **Force field**: active parameters with their file rows, so a run can
//!   be inspected or the parameters written back with `export_ff`
//!
//! # Usage
//!
//! ```no_run
//! use qmff::checkpoint::LoopCheckpoint;
//! use std::path::Path;
//!
//! let checkpoint = LoopCheckpoint::load(Path::new("qmff_checkpoint.json")).unwrap();
//! println!("cycle {} score {:?}", checkpoint.cycle, checkpoint.score);
//! ```

use crate::forcefield::ForceField;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// State of a convergence loop after one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopCheckpoint {
    /// Nesting depth of the loop, 1 for the outermost
    pub depth: usize,
    /// Completed cycles
    pub cycle: usize,
    /// Convergence threshold
    pub threshold: f64,
    /// Score after the cycle
    pub score: Option<f64>,
    /// Score before the cycle
    pub previous_score: Option<f64>,
    /// Force field after the cycle
    pub force_field: Option<ForceField>,
}

impl LoopCheckpoint {
    /// Save checkpoint to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load checkpoint from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The content is not a loop checkpoint
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forcefield::{Param, ParamType};
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qmff_checkpoint.json");
        let checkpoint = LoopCheckpoint {
            depth: 1,
            cycle: 3,
            threshold: 0.01,
            score: Some(8.91),
            previous_score: Some(9.0),
            force_field: Some(ForceField {
                path: Some("mm3.fld".into()),
                params: vec![Param {
                    ptype: ParamType::AngleEq,
                    value: 109.5,
                    row: 4,
                    column: 0,
                    step: 1.0,
                }],
                score: Some(8.91),
            }),
        };

        checkpoint.save(&path).unwrap();
        assert_eq!(LoopCheckpoint::load(&path).unwrap(), checkpoint);
    }

    #[test]
    fn test_load_rejects_other_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.json");
        fs::write(&path, "{\"step\": 5}").unwrap();
        assert!(LoopCheckpoint::load(&path).is_err());
    }
}
