use std::{ffi::OsString, path::PathBuf};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use crate::{
    config::{ALL, DEFAULT_PATH},
    control::RequestOp,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the supervisor itself.
    Daemon { foreground: bool },
    /// Ask a running supervisor to do something.
    Client { op: RequestOp, name: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Args {
    pub config: PathBuf,
    pub debug: bool,
    pub command: Command,
}

fn app() -> App<'static, 'static> {
    let program = || {
        Arg::with_name("program")
            .help("Program name, or 'all'")
            .required(true)
    };

    App::new("pman")
        .version(crate_version!())
        .about("Keep a set of programs running in the background")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(Arg::with_name("conf")
            .help("Config file to use")
            .short("c")
            .long("conf")
            .takes_value(true)
            .value_name("path")
            .global(true))
        .arg(Arg::with_name("debug")
            .help("Print debugging messages")
            .short("d")
            .long("debug")
            .global(true))
        .arg(Arg::with_name("foreground")
            .help("Stay attached to the terminal instead of daemonizing")
            .short("f")
            .long("foreground"))
        .subcommand(SubCommand::with_name("status")
            .about("Show whether programs are running")
            .arg(Arg::with_name("program").help("Program name [default: all]")))
        .subcommand(SubCommand::with_name("start")
            .about("Start a program")
            .arg(program()))
        .subcommand(SubCommand::with_name("stop")
            .about("Stop a program")
            .arg(program()))
}

pub fn get_args() -> Args {
    get_args_from(std::env::args_os())
}

/// Parses `from`, exiting with usage on errors the way clap does.
pub fn get_args_from<I, T>(from: I) -> Args
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    parse(&app().get_matches_from(from))
}

fn parse(args: &ArgMatches) -> Args {
    let client = |op, sub: &ArgMatches| Command::Client {
        op,
        name: sub.value_of("program").unwrap_or(ALL).to_string(),
    };

    let command = match args.subcommand() {
        ("status", Some(sub)) => client(RequestOp::Status, sub),
        ("start", Some(sub)) => client(RequestOp::Start, sub),
        ("stop", Some(sub)) => client(RequestOp::Stop, sub),
        _ => Command::Daemon {
            foreground: args.is_present("foreground"),
        },
    };

    // globals propagate down to the subcommand, so check both levels
    let sub = args.subcommand().1;
    let conf = args
        .value_of("conf")
        .or_else(|| sub.and_then(|s| s.value_of("conf")))
        .unwrap_or(DEFAULT_PATH);
    let debug = args.is_present("debug") || sub.map_or(false, |s| s.is_present("debug"));

    Args {
        config: PathBuf::from(conf),
        debug,
        command,
    }
}
