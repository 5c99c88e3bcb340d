use clap::{ArgAction, CommandFactory, Parser};

use crate::cap::{build_info, config, supervisor};

/// Command line surface. Everything here is raw user input; normalization and
/// validation live in `config`.
#[derive(Debug, Parser)]
#[command(
    name = "cpucap",
    about = "Throttle the CPU share of a command or of running processes by \
             alternating STOP and CONT signals on a duty cycle",
    disable_version_flag = true
)]
pub struct Args {
    /// Emit progress to stderr
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Print the command (launch mode) or the resolved target set (attach
    /// mode) and exit without signalling anything
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// CPU share in percent, 1..=99; a fraction in (0,1] is scaled by 100
    #[arg(short = 'l', long = "limit", value_name = "PERCENT")]
    pub limit: Option<f64>,

    /// Seconds the targets run per cycle
    #[arg(short = 'r', long = "run", value_name = "SECONDS")]
    pub run: Option<f64>,

    /// Seconds the targets stay stopped per cycle
    #[arg(short = 's', long = "stop", value_name = "SECONDS")]
    pub stop: Option<f64>,

    /// Attach to running processes (comma-separated or repeated); a negative
    /// value names a whole process group
    #[arg(
        short = 'p',
        long = "pid",
        value_name = "PIDS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        action = ArgAction::Append
    )]
    pub pids: Vec<i64>,

    /// Widen each PID to its whole process group
    #[arg(short = 'g', long = "group", conflicts_with = "no_group")]
    pub group: bool,

    /// Never widen a PID to its process group
    #[arg(short = 'G', long = "no-group")]
    pub no_group: bool,

    /// Also throttle descendants of the targets
    #[arg(short = 'c', long = "children")]
    pub children: bool,

    /// Give the launched command a pty of its own; repeat to force one even
    /// when no standard stream is a terminal
    #[arg(short = 't', long = "tty", action = ArgAction::Count, conflicts_with = "no_tty")]
    pub tty: u8,

    /// Never allocate a pty
    #[arg(short = 'T', long = "no-tty")]
    pub no_tty: bool,

    /// Print version information
    #[arg(short = 'V', long = "version")]
    pub version: bool,

    /// Command to launch and throttle
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    pub command: Vec<String>,
}

pub fn run() -> i32 {
    let args = Args::parse();
    if args.version {
        println!("{}", build_info::banner());
        return 0;
    }
    let cfg = match config::Config::from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // One-line reason plus usage; same exit code clap uses for its own
            // parse errors.
            eprintln!("cpucap: {e:#}");
            eprintln!("{}", Args::command().render_usage());
            return 2;
        }
    };
    match supervisor::run(cfg) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("cpucap: {e:#}");
            1
        }
    }
}
