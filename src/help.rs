//! Built-in help system
//!
//! Prints usage, the datatype commands understood by `RDAT`, `CDAT` and
//! `qmff calc`, and the loop script directives.

use crate::command::{Command, Family};

/// Documentation entry for a loop script directive.
#[derive(Debug, Clone)]
pub struct DirectiveInfo {
    /// Directive syntax
    pub syntax: &'static str,
    /// What the directive does
    pub description: &'static str,
}

/// All loop script directives.
pub const DIRECTIVES: &[DirectiveInfo] = &[
    DirectiveInfo {
        syntax: "FFLD read <path>",
        description: "Read the force field parameters of the selected substructures",
    },
    DirectiveInfo {
        syntax: "FFLD write <path>",
        description: "Write the current parameter values into a copy of the force field file",
    },
    DirectiveInfo {
        syntax: "PARM <path>",
        description: "Keep only the parameters listed by line number (and optional types)",
    },
    DirectiveInfo {
        syntax: "RDAT <args>",
        description: "Collect reference data with calculate arguments",
    },
    DirectiveInfo {
        syntax: "CDAT <args>",
        description: "Collect force field data with calculate arguments",
    },
    DirectiveInfo {
        syntax: "COMP [-o <path>]",
        description: "Score force field data against reference data, optionally writing a report",
    },
    DirectiveInfo {
        syntax: "GRAD",
        description: "Take one gradient optimization step, re-running the last CDAT per trial",
    },
    DirectiveInfo {
        syntax: "LOOP <threshold> ... END",
        description: "Repeat the enclosed directives until the fractional score change is at \
                      or below the threshold",
    },
];

/// Print global help
pub fn print_global_help() {
    println!("qmff - Force field calibration against quantum mechanical reference data");
    println!();
    println!("USAGE:");
    println!("    qmff [OPTIONS] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    <script_file>");
    println!("                        Run a loop script");
    println!();
    println!("    calc <args>");
    println!("                        Run one calculate invocation and print the data");
    println!();
    println!("    ci qmff_config.cfg");
    println!("                        Create a configuration template file");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help [topic]   Show help. Topics: commands, directives, examples");
    println!();
    println!("CONFIGURATION FILE:");
    println!("    qmff uses 'qmff_config.cfg' for program configuration.");
    println!("    Supported locations:");
    println!("      - ./qmff_config.cfg (local, highest priority)");
    println!("      - ~/.config/qmff/qmff_config.cfg (user)");
    println!("      - /etc/qmff/qmff_config.cfg (system)");
    println!("    Sections: general, macromodel, logging, weights");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG             Overrides the configured log level");
    println!();
}

/// Print the calculate arguments and datatype commands.
pub fn print_commands_help() {
    println!("CALCULATE ARGUMENTS");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    println!("    -d, --directory <dir>    Directory the data files are in (default .)");
    println!("    -f, --ffpath <path>      Force field copied next to MacroModel inputs");
    println!("    -n, --norun              Read existing MacroModel output instead of running");
    println!("    -nc, --nocheck           Do not wait for MacroModel licence tokens");
    println!("    -s, --subnames <names>   Force field substructures to use");
    println!("    -w, --weight             Assign default weights");
    println!("    -p, --doprint            Log the collected data");
    println!();

    for (title, family) in [
        ("REFERENCE", Family::Reference),
        ("GAUSSIAN", Family::Gaussian),
        ("JAGUAR", Family::Jaguar),
        ("MACROMODEL", Family::MacroModel),
    ] {
        println!("{}", title);
        println!("{}", "─".repeat(76));
        for command in Command::ALL.iter().filter(|c| c.family() == family) {
            println!("    -{:<10} {}", command.tag(), command.description());
        }
        println!();
    }
    println!("Commands taking file pairs join them with a comma: -jeigz a.in,a.out");
    println!();
}

/// Print the loop script directives.
pub fn print_directives_help() {
    println!("LOOP SCRIPT DIRECTIVES");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    for directive in DIRECTIVES {
        println!("{}", directive.syntax);
        println!("    {}", directive.description);
        println!();
    }
    println!("Text after '#' is a comment. Lines with unknown directives are skipped.");
    println!();
}

/// Print usage examples
pub fn print_examples() {
    println!("EXAMPLES");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    println!("Collect MacroModel bond lengths and energies and print them:");
    println!("    qmff calc -d work -mb a.mae -me a.mae -p");
    println!();
    println!("Calibrate a force field:");
    println!("    FFLD read work/mm3.fld");
    println!("    PARM params.txt");
    println!("    RDAT -d work -je a.mae -jb a.mae -jeigz a.in,a.out");
    println!("    CDAT -d work -f work/mm3.fld -me a.mae -mb a.mae -mjeig a.mae,a.out");
    println!("    COMP -o start.txt");
    println!("    LOOP 0.01");
    println!("      GRAD");
    println!("    END");
    println!("    FFLD write work/mm3.fld");
    println!();
    println!("    qmff calibrate.in > calibrate.log");
    println!();
}
