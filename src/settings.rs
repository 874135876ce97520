//! Configuration management for qmff.
//!
//! Settings are read from INI-format files with the following precedence:
//!
//! 1. Local configuration (`./qmff_config.cfg`)
//! 2. User configuration (`~/.config/qmff/qmff_config.cfg`)
//! 3. System configuration (`/etc/qmff/qmff_config.cfg`)
//! 4. Built-in defaults
//!
//! # Configuration File Format
//!
//! ```ini
//! [general]
//! substructures = OPT
//! checkpoint = false
//!
//! [macromodel]
//! command = bmin
//! token_command = licutil
//! check_tokens = true
//! token_wait = 30
//! token_attempts = 10
//!
//! [logging]
//! level = info
//! file_logging = false
//!
//! [weights]
//! b = 100.0
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use qmff::settings::SettingsManager;
//!
//! let manager = SettingsManager::load().unwrap();
//! println!("Substructures: {:?}", manager.general().substructures);
//! ```

use crate::datum::DataKind;
use configparser::ini::Ini;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Main configuration structure containing all program settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// General program settings
    pub general: GeneralSettings,
    /// MacroModel runner settings
    pub macromodel: MacroModelSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
    /// Default weights per datatype
    pub weights: WeightSettings,
}

/// General program settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralSettings {
    /// Force-field substructure names whose terms and parameters are used
    /// (default: `OPT`)
    pub substructures: Vec<String>,
    /// Write a JSON checkpoint after every loop cycle (default: false)
    pub checkpoint: bool,
    /// Checkpoint file (default: `qmff_checkpoint.json`)
    pub checkpoint_file: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            substructures: vec!["OPT".to_string()],
            checkpoint: false,
            checkpoint_file: "qmff_checkpoint.json".to_string(),
        }
    }
}

/// MacroModel runner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MacroModelSettings {
    /// MacroModel executable (default: `bmin`)
    pub command: String,
    /// Licence utility used to count tokens (default: `licutil`)
    pub token_command: String,
    /// Wait for licence tokens before running (default: true)
    pub check_tokens: bool,
    /// Seconds between token checks (default: 30)
    pub token_wait: u64,
    /// Token checks before giving up (default: 10)
    pub token_attempts: u32,
}

impl Default for MacroModelSettings {
    fn default() -> Self {
        Self {
            command: "bmin".to_string(),
            token_command: "licutil".to_string(),
            check_tokens: true,
            token_wait: 30,
            token_attempts: 10,
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level (default: "info")
    pub level: String,
    /// Also write the log to `qmff.log` (default: false)
    pub file_logging: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: false,
        }
    }
}

/// Default weight of each datatype, applied by `-w`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightSettings {
    /// Angles
    pub a: f64,
    /// Bonds
    pub b: f64,
    /// Torsions
    pub t: f64,
    /// Energies
    pub e: f64,
    /// Energies after minimization
    pub eo: f64,
    /// Charges
    pub q: f64,
    /// Diagonal eigenmatrix elements
    pub eig_d: f64,
    /// Off-diagonal eigenmatrix elements
    pub eig_o: f64,
}

impl Default for WeightSettings {
    fn default() -> Self {
        Self {
            a: 2.0,
            b: 100.0,
            t: 1.0,
            e: 20.0,
            eo: 20.0,
            q: 10.0,
            eig_d: 0.1,
            eig_o: 0.05,
        }
    }
}

impl WeightSettings {
    /// Default weight for a datatype; `diagonal` distinguishes eigenmatrix
    /// elements. Unknown kinds weigh 1.
    pub fn for_kind(&self, kind: &DataKind, diagonal: bool) -> f64 {
        match kind {
            DataKind::Angle => self.a,
            DataKind::Bond => self.b,
            DataKind::Torsion => self.t,
            DataKind::Energy => self.e,
            DataKind::EnergyOpt => self.eo,
            DataKind::Charge => self.q,
            DataKind::Eigen if diagonal => self.eig_d,
            DataKind::Eigen => self.eig_o,
            DataKind::Other(_) => 1.0,
        }
    }
}

/// Configuration manager that handles loading and accessing program settings.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads configuration from available configuration files.
    ///
    /// A file that fails to load is reported and skipped.
    pub fn load() -> Result<Self, ConfigError> {
        let (settings, source) = Self::load_from_files()?;
        info!("Configuration loaded from: {}", source);
        Ok(Self {
            settings,
            config_source: source,
        })
    }

    /// Wraps already built settings.
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings,
            config_source: "provided settings".to_string(),
        }
    }

    /// Returns the source of the loaded configuration.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Consumes the manager, returning the settings.
    pub fn into_settings(self) -> Settings {
        self.settings
    }

    /// Gets the general settings.
    pub fn general(&self) -> &GeneralSettings {
        &self.settings.general
    }

    /// Gets the MacroModel settings.
    pub fn macromodel(&self) -> &MacroModelSettings {
        &self.settings.macromodel
    }

    /// Gets the logging settings.
    pub fn logging(&self) -> &LoggingSettings {
        &self.settings.logging
    }

    /// Gets the weight settings.
    pub fn weights(&self) -> &WeightSettings {
        &self.settings.weights
    }

    /// Loads configuration from files with hierarchical precedence.
    fn load_from_files() -> Result<(Settings, String), ConfigError> {
        let candidates = [
            ("system", Self::get_system_config_path()),
            ("user", Self::get_user_config_path()),
            ("local", Some(PathBuf::from("qmff_config.cfg"))),
        ];
        Ok(Self::load_layered(&candidates))
    }

    /// Merges the existing files of `candidates` onto the defaults in order,
    /// so that a later file only overrides the keys it sets.
    ///
    /// Unreadable or invalid files are skipped with a warning.
    fn load_layered(candidates: &[(&str, Option<PathBuf>)]) -> (Settings, String) {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();

        for (scope, path) in candidates {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            match Self::read_values(path) {
                Ok(values) => {
                    settings.merge(&values);
                    config_source = format!("{} config ({})", scope, path.display());
                    debug!("Loaded {} configuration from: {}", scope, path.display());
                }
                Err(e) => {
                    warn!(
                        "Failed to load {} config from {}: {}",
                        scope,
                        path.display(),
                        e
                    );
                }
            }
        }

        (settings, config_source)
    }

    /// Loads configuration from a single INI file on top of the defaults.
    pub fn load_config(path: &Path) -> Result<Settings, ConfigError> {
        let mut settings = Settings::default();
        settings.merge(&Self::read_values(path)?);
        Ok(settings)
    }

    fn read_values(path: &Path) -> Result<IniValues, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_ini(&content)
    }

    /// Parses INI content into the values it sets.
    fn parse_ini(content: &str) -> Result<IniValues, ConfigError> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;

        let mut values = IniValues::default();
        let map = ini.get_map_ref();

        if let Some(general) = map.get("general") {
            if let Some(Some(names)) = general.get("substructures") {
                let names: Vec<String> = names
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if names.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "substructures must name at least one substructure".to_string(),
                    ));
                }
                values.substructures = Some(names);
            }
            values.checkpoint = parse_value(general, "checkpoint")?;
            if let Some(Some(file)) = general.get("checkpoint_file") {
                values.checkpoint_file = Some(file.clone());
            }
        }

        if let Some(macromodel) = map.get("macromodel") {
            if let Some(Some(command)) = macromodel.get("command") {
                values.command = Some(command.clone());
            }
            if let Some(Some(command)) = macromodel.get("token_command") {
                values.token_command = Some(command.clone());
            }
            values.check_tokens = parse_value(macromodel, "check_tokens")?;
            values.token_wait = parse_value(macromodel, "token_wait")?;
            values.token_attempts = parse_value(macromodel, "token_attempts")?;
        }

        if let Some(logging) = map.get("logging") {
            if let Some(Some(level)) = logging.get("level") {
                values.level = Some(level.clone());
            }
            values.file_logging = parse_value(logging, "file_logging")?;
        }

        if let Some(weights) = map.get("weights") {
            for key in ["a", "b", "t", "e", "eo", "q", "eig_d", "eig_o"] {
                if let Some(weight) = parse_value::<f64>(weights, key)? {
                    if weight < 0.0 {
                        return Err(ConfigError::InvalidValue(format!(
                            "Negative weight for {}: {}",
                            key, weight
                        )));
                    }
                    values.weights.insert(key.to_string(), weight);
                }
            }
        }

        Ok(values)
    }

    /// Gets the system configuration file path.
    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/qmff/qmff_config.cfg"))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("qmff").join("qmff_config.cfg"))
        }
    }

    /// Gets the user configuration file path.
    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("qmff")
                    .join("qmff_config.cfg")
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("qmff").join("qmff_config.cfg"))
        }
    }
}

fn parse_value<T: std::str::FromStr>(
    section: &HashMap<String, Option<String>>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match section.get(key) {
        Some(Some(raw)) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("Invalid {}: {}", key, raw))),
        _ => Ok(None),
    }
}

/// Values explicitly set by one configuration file.
#[derive(Debug, Default)]
struct IniValues {
    substructures: Option<Vec<String>>,
    checkpoint: Option<bool>,
    checkpoint_file: Option<String>,
    command: Option<String>,
    token_command: Option<String>,
    check_tokens: Option<bool>,
    token_wait: Option<u64>,
    token_attempts: Option<u32>,
    level: Option<String>,
    file_logging: Option<bool>,
    weights: HashMap<String, f64>,
}

impl Settings {
    /// Overrides the values a configuration file sets explicitly.
    fn merge(&mut self, other: &IniValues) {
        if let Some(names) = &other.substructures {
            self.general.substructures = names.clone();
        }
        if let Some(checkpoint) = other.checkpoint {
            self.general.checkpoint = checkpoint;
        }
        if let Some(file) = &other.checkpoint_file {
            self.general.checkpoint_file = file.clone();
        }

        if let Some(command) = &other.command {
            self.macromodel.command = command.clone();
        }
        if let Some(command) = &other.token_command {
            self.macromodel.token_command = command.clone();
        }
        if let Some(check) = other.check_tokens {
            self.macromodel.check_tokens = check;
        }
        if let Some(wait) = other.token_wait {
            self.macromodel.token_wait = wait;
        }
        if let Some(attempts) = other.token_attempts {
            self.macromodel.token_attempts = attempts;
        }

        if let Some(level) = &other.level {
            self.logging.level = level.clone();
        }
        if let Some(file_logging) = other.file_logging {
            self.logging.file_logging = file_logging;
        }

        for (key, &weight) in &other.weights {
            let slot = match key.as_str() {
                "a" => &mut self.weights.a,
                "b" => &mut self.weights.b,
                "t" => &mut self.weights.t,
                "e" => &mut self.weights.e,
                "eo" => &mut self.weights.eo,
                "q" => &mut self.weights.q,
                "eig_d" => &mut self.weights.eig_d,
                "eig_o" => &mut self.weights.eig_o,
                _ => continue,
            };
            *slot = weight;
        }
    }
}

impl SettingsManager {
    /// Creates a commented qmff_config.cfg template with every option at its
    /// default value.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    /// Generates the content of a qmff_config.cfg template.
    pub fn generate_template_content() -> String {
        let general = GeneralSettings::default();
        let macromodel = MacroModelSettings::default();
        let logging = LoggingSettings::default();
        let weights = WeightSettings::default();
        format!(
            r#"# qmff Configuration File
#
# Configuration files are loaded in hierarchical order with local settings
# taking precedence:
#
# 1. Current working directory (./qmff_config.cfg) - highest priority
# 2. User config directory (~/.config/qmff/qmff_config.cfg)
# 3. System config directory (/etc/qmff/qmff_config.cfg)
# 4. Built-in defaults (fallback)
#
# Missing sections or values use the built-in defaults shown below.

[general]
# Force-field substructures to optimize, comma separated (default: OPT)
# Geometric terms and parameters are only read from substructures whose
# name contains one of these.
substructures = {}

# Write a JSON checkpoint after every loop cycle (default: false)
checkpoint = {}

# Checkpoint file name (default: qmff_checkpoint.json)
checkpoint_file = {}

[macromodel]
# MacroModel executable (default: bmin)
command = {}

# Licence utility queried before each run (default: licutil)
token_command = {}

# Wait for licence tokens before running MacroModel (default: true)
# The -nc calculate option disables the check for a single invocation.
check_tokens = {}

# Seconds between token checks (default: 30)
token_wait = {}

# Number of token checks before giving up (default: 10)
token_attempts = {}

[logging]
# Log level: debug, info, warn, error (default: info)
level = {}

# Also write log messages to qmff.log (default: false)
file_logging = {}

[weights]
# Default weights applied by the -w calculate option
# a = angles, b = bonds, t = torsions, e = energies,
# eo = energies after minimization, q = charges,
# eig_d / eig_o = diagonal / off-diagonal eigenmatrix elements
a = {}
b = {}
t = {}
e = {}
eo = {}
q = {}
eig_d = {}
eig_o = {}
"#,
            general.substructures.join(","),
            general.checkpoint,
            general.checkpoint_file,
            macromodel.command,
            macromodel.token_command,
            macromodel.check_tokens,
            macromodel.token_wait,
            macromodel.token_attempts,
            logging.level,
            logging.file_logging,
            weights.a,
            weights.b,
            weights.t,
            weights.e,
            weights.eo,
            weights.q,
            weights.eig_d,
            weights.eig_o,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_template_parses_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qmff_config.cfg");
        SettingsManager::create_template(&path).unwrap();

        let settings = SettingsManager::load_config(&path).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_file_overrides_only_given_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qmff_config.cfg");
        fs::write(
            &path,
            "[general]\nsubstructures = OPT, Amide\n\n[macromodel]\ntoken_wait = 5\n\n[weights]\nb = 50\n",
        )
        .unwrap();

        let settings = SettingsManager::load_config(&path).unwrap();
        assert_eq!(settings.general.substructures, vec!["OPT", "Amide"]);
        assert_eq!(settings.macromodel.token_wait, 5);
        assert_eq!(settings.macromodel.command, "bmin");
        assert_eq!(settings.weights.b, 50.0);
        assert_eq!(settings.weights.a, WeightSettings::default().a);
    }

    #[test]
    fn test_layered_files_merge_in_order() {
        let dir = TempDir::new().unwrap();
        let system = dir.path().join("system.cfg");
        let user = dir.path().join("user.cfg");
        let local = dir.path().join("local.cfg");
        fs::write(&system, "[macromodel]\ntoken_wait = 5\ntoken_attempts = 3\n").unwrap();
        fs::write(&user, "[macromodel]\ntoken_attempts = many\n").unwrap();
        fs::write(&local, "[general]\ncheckpoint = true\n\n[macromodel]\ntoken_attempts = 7\n").unwrap();

        let candidates = [
            ("system", Some(system)),
            ("user", Some(user)),
            ("local", Some(local.clone())),
            ("missing", Some(dir.path().join("missing.cfg"))),
        ];
        let (settings, source) = SettingsManager::load_layered(&candidates);

        // The system value survives a local file that does not set it.
        assert_eq!(settings.macromodel.token_wait, 5);
        assert_eq!(settings.macromodel.token_attempts, 7);
        assert!(settings.general.checkpoint);
        assert_eq!(settings.macromodel.command, "bmin");
        assert_eq!(source, format!("local config ({})", local.display()));

        let (settings, source) = SettingsManager::load_layered(&[("user", None)]);
        assert_eq!(settings, Settings::default());
        assert_eq!(source, "built-in defaults");
    }

    #[test]
    fn test_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.cfg");

        fs::write(&path, "[macromodel]\ntoken_attempts = many\n").unwrap();
        assert!(matches!(
            SettingsManager::load_config(&path),
            Err(ConfigError::InvalidValue(_))
        ));

        fs::write(&path, "[weights]\nq = -1\n").unwrap();
        assert!(SettingsManager::load_config(&path).is_err());
    }

    #[test]
    fn test_weight_lookup() {
        let weights = WeightSettings::default();
        assert_eq!(weights.for_kind(&DataKind::Bond, false), weights.b);
        assert_eq!(weights.for_kind(&DataKind::Eigen, true), weights.eig_d);
        assert_eq!(weights.for_kind(&DataKind::Eigen, false), weights.eig_o);
        assert_eq!(weights.for_kind(&DataKind::Other("x".into()), false), 1.0);
    }
}
