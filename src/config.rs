//! Configuration for pman.
//!
//! [`Config`] and [`ProgramConfig`] are not constructable directly, use
//! [`ConfigBuilder`] and [`ProgramConfigBuilder`], or load a TOML file with
//! [`Config::load`].
//!
//! # Examples
//!
//! ```
//! # use pman::config::{ConfigBuilder, ProgramConfigBuilder};
//! let web = ProgramConfigBuilder::default()
//!     .name("web")
//!     .command(vec!["/usr/bin/python3".into(), "-m".into(), "http.server".into()])
//!     .logfile("/var/log/web.log")
//!     .autorestart(true)
//!     .build()
//!     .expect("mission failed");
//!
//! ConfigBuilder::default()
//!     .pidfile("/var/run/pman.pid")
//!     .logfile("/var/log/pman.log")
//!     .program(web)
//!     .build()
//!     .expect("mission failed");
//! ```

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Name that addresses every configured program at once.
pub const ALL: &str = "all";

/// Where the binary looks for its config when `--conf` isn't given.
pub const DEFAULT_PATH: &str = "/etc/pman.toml";

/// One supervised executable.
#[derive(Builder, Clone, Debug, PartialEq, Eq)]
#[builder(setter(into))]
#[builder(build_fn(validate = "Self::validate"))]
pub struct ProgramConfig {
    /// Unique key, used by the control surface.
    pub name: String,
    /// argv-style command: the first element is the executable path.
    pub command: Vec<String>,
    /// File receiving the program's stdout and stderr, appended to.
    pub logfile: PathBuf,
    /// Relaunch the program when it exits on its own.
    #[builder(default)]
    pub autorestart: bool,
}

impl ProgramConfigBuilder {
    fn validate(&self) -> ::std::result::Result<(), String> {
        match self.name.as_deref() {
            Some("") => return Err("program name must not be empty".into()),
            Some(ALL) => return Err(format!("'{}' is reserved and can't name a program", ALL)),
            _ => {}
        }

        if self.command.as_ref().map_or(false, Vec::is_empty) {
            return Err(format!(
                "command of program '{}' must not be empty",
                self.name.as_deref().unwrap_or_default()
            ));
        }

        Ok(())
    }
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MIN_RUNTIME: Duration = Duration::from_secs(1);

/// Arguments to the supervisor.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into, strip_option))]
#[builder(build_fn(validate = "Self::validate"))]
#[non_exhaustive]
pub struct Config {
    /// Singleton marker holding the running supervisor's pid.
    pub pidfile: PathBuf,
    /// Supervisor's own log once detached.
    pub logfile: PathBuf,
    /// Working directory after detaching.
    #[builder(default = "PathBuf::from(\"/\")")]
    pub dir: PathBuf,
    /// Control socket. No remote control when unset.
    #[builder(default)]
    pub socket: Option<PathBuf>,
    /// Upper bound on how long the loop sleeps between iterations.
    #[builder(default = "DEFAULT_POLL_INTERVAL")]
    pub poll_interval: Duration,
    /// Programs exiting sooner than this after launch are not restarted.
    #[builder(default = "DEFAULT_MIN_RUNTIME")]
    pub min_runtime: Duration,
    /// How long a stopped program gets between SIGTERM and SIGKILL.
    #[builder(default = "Duration::from_secs(3)")]
    pub stop_grace: Duration,
    /// Detach from the controlling terminal on startup.
    #[builder(default = "true")]
    pub daemonize: bool,
    /// Supervised programs, in configuration order.
    #[builder(default)]
    pub programs: Vec<ProgramConfig>,
}

impl ConfigBuilder {
    fn validate(&self) -> ::std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for program in self.programs.iter().flatten() {
            if !seen.insert(program.name.as_str()) {
                return Err(format!("program '{}' is configured twice", program.name));
            }
        }

        let poll = self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll == Duration::from_secs(0) {
            return Err("poll interval must be positive".into());
        }

        // Exit runtimes are judged when the loop wakes; it must wake well inside min_runtime.
        let min_runtime = self.min_runtime.unwrap_or(DEFAULT_MIN_RUNTIME);
        if poll >= min_runtime {
            return Err(format!(
                "poll interval ({:?}) must be shorter than min_runtime ({:?})",
                poll, min_runtime
            ));
        }

        Ok(())
    }

    /// Appends one program to the configuration.
    pub fn program(&mut self, program: ProgramConfig) -> &mut Self {
        self.programs.get_or_insert_with(Vec::new).push(program);
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    pidfile: PathBuf,
    logfile: PathBuf,
    dir: Option<PathBuf>,
    socket: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
    min_runtime_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
    #[serde(default, rename = "program")]
    programs: Vec<ProgramEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramEntry {
    name: String,
    command: Vec<String>,
    logfile: PathBuf,
    #[serde(default)]
    autorestart: bool,
}

impl Config {
    /// Reads and validates a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| Error::ConfigRead {
            path: path.to_owned(),
            err,
        })?;

        debug!("Loaded config from {:?}", path);
        let mut config = Self::from_toml(&contents)?;
        let absolute = fs::canonicalize(path)?;
        if let Some(base) = absolute.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Anchors relative paths at `base`, so they survive the working
    /// directory change on detach.
    fn resolve_relative_to(&mut self, base: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        anchor(&mut self.pidfile);
        anchor(&mut self.logfile);
        anchor(&mut self.dir);
        if let Some(socket) = self.socket.as_mut() {
            anchor(socket);
        }
        for program in &mut self.programs {
            anchor(&mut program.logfile);
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)?;

        let mut builder = ConfigBuilder::default();
        builder.pidfile(file.pidfile).logfile(file.logfile);

        if let Some(dir) = file.dir {
            builder.dir(dir);
        }
        if let Some(socket) = file.socket {
            builder.socket(socket);
        }
        if let Some(ms) = file.poll_interval_ms {
            builder.poll_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = file.min_runtime_ms {
            builder.min_runtime(Duration::from_millis(ms));
        }
        if let Some(ms) = file.stop_grace_ms {
            builder.stop_grace(Duration::from_millis(ms));
        }

        for entry in file.programs {
            let program = ProgramConfigBuilder::default()
                .name(entry.name)
                .command(entry.command)
                .logfile(entry.logfile)
                .autorestart(entry.autorestart)
                .build()
                .map_err(Error::Config)?;
            builder.program(program);
        }

        builder.build().map_err(Error::Config)
    }
}
