//! pman: a small process supervisor
//!
//! Keeps a configured set of programs running in the background, restarts the
//! ones marked for it when they exit, and answers status, start and stop
//! requests over a Unix socket. The `pman` binary is built on this library;
//! the library API follows the binary's needs and may change between
//! releases.
//!
//! The pieces, bottom up:
//!
//! - [`config`]: the TOML file and its builders
//! - [`pidfile`]: the singleton marker
//! - [`signal`]: async-signal-safe flags for SIGCHLD and termination
//! - [`process`]: spawning, reaping and stopping children
//! - [`bridge`]: the queue carrying control requests to the loop
//! - [`supervisor`]: startup, the supervision loop, shutdown
//! - [`service`] and [`control`]: the control surface and its socket transport

#![deny(deprecated)]
#![deny(unsafe_code, clippy::missing_const_for_fn)]
#![allow(clippy::default_trait_access, clippy::cognitive_complexity)]

#[macro_use]
extern crate clap;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate log;

pub mod bridge;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod pidfile;
pub mod process;
pub mod program;
pub mod service;
pub mod signal;
pub mod supervisor;

pub use supervisor::Supervisor;
