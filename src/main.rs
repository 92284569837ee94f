use std::{env, io::Write, process};

use log::LevelFilter;
use pman::{
    cli::{self, Args, Command},
    config::Config,
    control::Client,
    error::{Error, Result},
    Supervisor,
};

fn main() {
    let args = cli::get_args();
    init_logger(args.debug);

    if let Err(err) = run(args) {
        eprintln!("pman: {}", err);
        process::exit(1);
    }
}

fn init_logger(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut log_builder = env_logger::Builder::new();
    log_builder
        .format(|buf, r| writeln!(buf, "[{}] {} {}", buf.timestamp(), r.level(), r.args()))
        .filter(None, level);
    if let Ok(filters) = env::var("RUST_LOG") {
        log_builder.parse_filters(&filters);
    }
    log_builder.init();
}

fn run(args: Args) -> Result<()> {
    let mut config = Config::load(&args.config)?;

    match args.command {
        Command::Daemon { foreground } => {
            if foreground {
                config.daemonize = false;
            }
            Supervisor::new(config).run()
        }
        Command::Client { op, name } => {
            let socket = config
                .socket
                .ok_or_else(|| Error::Config("no control socket configured".into()))?;
            let programs = Client::new(socket).request(op, &name)?;
            if programs.is_empty() {
                log::warn!("no program named {:?}", name);
            }

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for entry in programs {
                writeln!(out, "{}\t{}", entry.name, entry.status)?;
            }
            Ok(())
        }
    }
}
