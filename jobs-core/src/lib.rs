/*
 * This file is part of Job Broker.
 *
 * Copyright © 2019 Riley Trautman
 *
 * Job Broker is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Job Broker is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Job Broker.  If not, see <http://www.gnu.org/licenses/>.
 */

use failure::Fail;

mod broker;
mod clock;
mod job;
mod memory;
mod task;

pub use crate::{
    broker::{
        generate_idempotency_token, Broker, Event, TokenSource,
        DEFAULT_BROKER_DEAD_THRESHOLD_SECONDS, WAIT_FOR_EVENT_MAX_SECONDS,
    },
    clock::{Clock, ManualClock, SystemClock},
    job::{Job, JobStatus},
    memory::MemoryBroker,
    task::Task,
};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Fail)]
/// The error type surfaced by every broker backend
pub enum BrokerError {
    /// The shared store is unreachable or answered with a protocol error
    #[fail(display = "Error communicating with the shared store: {}", _0)]
    Transport(#[cause] failure::Error),

    /// A stored value does not parse, indicating corruption or version skew
    #[fail(display = "Could not decode a stored value: {}", _0)]
    Serialization(#[cause] serde_json::Error),

    /// A structural invariant of the broker state no longer holds
    #[fail(display = "Broker invariant violated: {}", _0)]
    InvariantViolation(String),

    /// The operation was interrupted by `stop`, the caller should exit its loop
    #[fail(display = "Broker is shutting down")]
    Shutdown,
}

impl BrokerError {
    pub fn transport<E>(err: E) -> Self
    where
        E: Into<failure::Error>,
    {
        BrokerError::Transport(err.into())
    }

    pub fn is_shutdown(&self) -> bool {
        match *self {
            BrokerError::Shutdown => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e)
    }
}
