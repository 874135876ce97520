//! qmff command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a loop script
//! qmff calibrate.in > calibrate.log
//!
//! # Run one calculate invocation and print the data
//! qmff calc -d work -me a.mae -mb a.mae
//!
//! # Create a configuration template
//! qmff ci qmff_config.cfg
//! ```
//!
//! Built-in help is available through `--help` or `-h`, optionally followed by
//! a topic: `commands`, `directives` or `examples`.

use log::{info, warn, LevelFilter};
use qmff::calculate::{pretty_data, Calculator};
use qmff::compare::WeightedComparator;
use qmff::opt_loop::Interpreter;
use qmff::optimizer::Gradient;
use qmff::parser::read_loop_input;
use qmff::settings::{LoggingSettings, Settings, SettingsManager};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

const LOG_FILE: &str = "qmff.log";
const CONFIG_FILE: &str = "qmff_config.cfg";

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("qmff");
    if args.len() < 2 {
        print_usage(program);
        process::exit(1);
    }

    check_help_flags(&args);

    let manager = match SettingsManager::load() {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };
    init_logging(manager.logging());
    info!("Configuration: {}", manager.config_source());

    let command = args[1].as_str();
    let result = match command {
        "ci" => run_create_settings_template(args.get(2).map(String::as_str)),
        "calc" => run_calc(manager.into_settings(), &args[2..]),
        _ if command.starts_with('-') => {
            eprintln!("Error: Unknown option: {}", command);
            print_usage(program);
            process::exit(1);
        }
        _ => run_script(Path::new(command), manager.into_settings()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Initializes the console logger, optionally teeing into `qmff.log`.
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(logging: &LoggingSettings) {
    let mut builder = env_logger::Builder::from_default_env();
    let level = logging.level.parse::<LevelFilter>();
    if env::var_os("RUST_LOG").is_none() {
        builder.filter_level(*level.as_ref().unwrap_or(&LevelFilter::Info));
    }
    builder.format_timestamp_millis();

    let mut file_error = None;
    if logging.file_logging {
        match fs::File::create(LOG_FILE) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
            }
            Err(e) => {
                file_error = Some(e);
                builder.target(env_logger::Target::Stdout);
            }
        }
    } else {
        builder.target(env_logger::Target::Stdout);
    }
    builder.init();

    if level.is_err() {
        warn!("Unknown log level '{}', using info", logging.level);
    }
    if let Some(e) = file_error {
        warn!("Cannot create {}: {}; logging to stdout only", LOG_FILE, e);
    }
}

/// Writes log records to stdout and a file.
struct Tee {
    file: fs::File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}

/// Check for help flags and print appropriate help
fn check_help_flags(args: &[String]) {
    use qmff::help::*;

    if args[1] != "--help" && args[1] != "-h" {
        return;
    }
    match args.get(2).map(String::as_str) {
        Some("commands") => print_commands_help(),
        Some("directives") => print_directives_help(),
        Some("examples") => print_examples(),
        _ => print_global_help(),
    }
    process::exit(0);
}

fn print_usage(program_name: &str) {
    eprintln!("qmff - Force field calibration against quantum mechanical data");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} <script_file>", program_name);
    eprintln!("                    Run a loop script");
    eprintln!();
    eprintln!("  {} calc <args>", program_name);
    eprintln!("                    Collect and print data for calculate arguments");
    eprintln!();
    eprintln!("  {} ci {}", program_name, CONFIG_FILE);
    eprintln!("                    Create a settings template file");
    eprintln!();
    eprintln!("  {} --help [commands|directives|examples]", program_name);
}

fn run_create_settings_template(path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(path.unwrap_or(CONFIG_FILE));
    if path.exists() {
        return Err(format!("{} already exists; remove it first", path.display()).into());
    }
    SettingsManager::create_template(path)?;
    println!("Settings template created: {}", path.display());
    Ok(())
}

fn run_calc(settings: Settings, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let data = Calculator::new(settings).calculate(args)?;
    for line in pretty_data(&data) {
        info!("{}", line);
    }
    Ok(())
}

/// Runs a loop script with the MacroModel calculator, the weighted
/// comparator and the gradient optimizer.
fn run_script(path: &Path, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let directives = read_loop_input(path)?;

    let checkpoint = settings
        .general
        .checkpoint
        .then(|| PathBuf::from(&settings.general.checkpoint_file));
    let sub_names = settings.general.substructures.clone();

    let mut calculator = Calculator::new(settings);
    let comparator = WeightedComparator;
    let mut optimizer = Gradient::default();
    let mut interpreter = Interpreter::new(&mut calculator, &comparator, &mut optimizer, sub_names);
    if let Some(path) = checkpoint {
        info!("Checkpoints: {}", path.display());
        interpreter = interpreter.with_checkpoint(path);
    }

    let session = interpreter.run(&directives)?;
    match session.score {
        Some(score) => info!("Final score: {}", score),
        None => info!("Script finished without a score"),
    }
    Ok(())
}
