use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod attach;
mod config;
mod consts;
mod create;
mod daemon;
mod detach;
mod error;
mod kill;
mod list;
mod protocol;
mod registry;
mod tty;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    #[clap(short, long, global = true, help = "The file to write logs to")]
    log_file: Option<String>,

    #[clap(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    verbose: u8,

    #[clap(long, global = true, help = "A toml file containing configuration")]
    config_file: Option<String>,

    #[clap(long, global = true, help = "Override the session storage directory")]
    sess_dir: Option<PathBuf>,

    #[clap(short = 'x', action, help = "Detach the active attachment and exit")]
    detach: bool,

    #[clap(long, action, help = "Let Ctrl-X pass through to the shell for this attachment")]
    no_ctrl_x: bool,

    #[clap(subcommand)]
    command: Option<Commands>,
}

/// With no subcommand at all, sess creates a new session and attaches
/// the invoking terminal to it.
#[derive(Subcommand, Debug)]
enum Commands {
    #[clap(about = "List the live sessions", alias = "list")]
    Ls,

    #[clap(about = "Attach to an existing session", alias = "a")]
    Attach {
        #[clap(long, action, help = "Let Ctrl-X pass through to the shell")]
        no_ctrl_x: bool,
        #[clap(help = "The session to attach to, e.g. 7 or 007")]
        id: String,
    },

    #[clap(about = "Attach to the session if it exists, otherwise create a new one")]
    Ac {
        #[clap(long, action, help = "Let Ctrl-X pass through to the shell")]
        no_ctrl_x: bool,
        #[clap(help = "The session to attach to")]
        id: String,
    },

    #[clap(about = "Detach the currently attached client", alias = "x")]
    Detach,

    #[clap(about = "Kill a session (the current one if no id is given)", alias = "k")]
    Kill {
        #[clap(help = "The session to kill")]
        id: Option<String>,
    },

    #[clap(about = "Kill every live session")]
    Killall,

    // The internal supervisor entry point; the launcher spawns this.
    #[clap(hide = true)]
    Daemon {
        id: String,
        socket: PathBuf,
        meta: PathBuf,
        shell: String,
        rows: u16,
        cols: u16,
    },
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    if let Err(err) = run(args) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        // The supervisor derives its storage root from the metadata
        // path it was handed; none of the foreground setup applies.
        Some(Commands::Daemon { id, socket, meta, shell, rows, cols }) => {
            daemon::run(id, socket, meta, shell, rows, cols)
        }
        command => {
            let config = config::Config::load(args.config_file.as_deref())?;
            let reg = registry::Registry::new(args.sess_dir)?;
            let disable_ctrl_x = args.no_ctrl_x || config.disable_ctrl_x.unwrap_or(false);

            if args.detach {
                return detach::run(&reg);
            }

            match command {
                None => create::run(&reg, &config, disable_ctrl_x),
                Some(Commands::Ls) => list::run(&reg),
                Some(Commands::Attach { no_ctrl_x, id }) => {
                    attach::run(&reg, &id, disable_ctrl_x || no_ctrl_x)
                }
                Some(Commands::Ac { no_ctrl_x, id }) => {
                    let disable = disable_ctrl_x || no_ctrl_x;
                    match reg.lookup(&id) {
                        Ok(_) => attach::run(&reg, &id, disable),
                        Err(e) => match e.downcast_ref::<error::SessError>() {
                            Some(
                                error::SessError::NotFound(_)
                                | error::SessError::SessionDead(_),
                            ) => create::run(&reg, &config, disable),
                            _ => Err(e),
                        },
                    }
                }
                Some(Commands::Detach) => detach::run(&reg),
                Some(Commands::Kill { id }) => kill::run(&reg, id),
                Some(Commands::Killall) => kill::run_all(&reg),
                Some(Commands::Daemon { .. }) => unreachable!("handled above"),
            }
        }
    }
}

fn init_logging(args: &Args) {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    if let Some(log_file) = args.log_file.clone() {
        match std::fs::File::create(&log_file) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_max_level(trace_level)
                    .with_thread_ids(true)
                    .with_target(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
            }
            Err(e) => eprintln!("could not open log file {log_file}: {e}"),
        }
    } else if std::env::var(consts::DEBUG_ENV_VAR).as_deref() == Ok("1") {
        // terse diagnostics for the foreground commands
        let level = if args.verbose == 0 { tracing::Level::DEBUG } else { trace_level };
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
