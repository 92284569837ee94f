//! The remote control surface.
//!
//! Status is read straight from shared state under the lock. Start and stop
//! are queued for the supervision loop; the caller blocks until the loop has
//! applied them, then gets the resulting status back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    bridge::{Operation, Outcome},
    config::ALL,
    error::{Error, Result},
    program::Status,
    supervisor::Shared,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub name: String,
    pub status: Status,
}

/// Cloneable handle used by remote-call threads.
#[derive(Clone, Debug)]
pub struct Control {
    shared: Arc<Shared>,
}

impl Control {
    pub(crate) const fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Status of `name`, or of every program in configuration order when
    /// `name` is empty or `all`. Unknown names give an empty list.
    pub fn program_status(&self, name: &str) -> Vec<StatusEntry> {
        self.shared.lock().status(name)
    }

    /// Starts `name` (or every program for `all`) and reports the status
    /// afterwards. Starting a running program changes nothing.
    pub fn start_program(&self, name: &str) -> Result<Vec<StatusEntry>> {
        self.submit(Operation::Start, name)
    }

    /// Stops `name` (or every program for `all`) and reports the status
    /// afterwards. A stopped program is not restarted.
    pub fn stop_program(&self, name: &str) -> Result<Vec<StatusEntry>> {
        self.submit(Operation::Stop, name)
    }

    fn submit(&self, op: Operation, name: &str) -> Result<Vec<StatusEntry>> {
        let target = if name.is_empty() { ALL } else { name };
        match self.shared.submit(op, target) {
            Outcome::Applied => Ok(self.program_status(target)),
            Outcome::ShuttingDown => Err(Error::ShuttingDown),
        }
    }
}
