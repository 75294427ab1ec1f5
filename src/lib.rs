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

//! # Job Broker
//!
//! This crate provides the coordination layer of a distributed background
//! job system: the piece sitting between job producers and worker
//! processes. A broker accepts job submissions, schedules them immediately
//! or in the future, dispenses them to workers in a crash-safe manner,
//! tracks which broker instance owns each running job, re-dispenses jobs
//! abandoned by dead peers and manages the registry of periodic tasks.
//!
//! Two interchangeable backends implement the same [`Broker`] contract:
//!
//! * [`MemoryBroker`] keeps everything in process. It is the right choice
//!   for tests and for applications embedding their own single-process
//!   worker.
//! * [`redis::RedisBroker`] shares state between processes through a redis
//!   server. All compound transitions run as server-side scripts, so
//!   concurrent brokers only ever observe them as indivisible units.
//!
//! Delivery is at-least-once for idempotent jobs (jobs allowed at least one
//! retry) and at-most-once for non-idempotent ones.
//!
//! ### Submitting jobs
//! ```rust,ignore
//! use job_broker::{Broker, Job};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! fn submit(broker: &dyn Broker) -> Result<(), job_broker::BrokerError> {
//!     // an immediate job, retried up to 10 times
//!     broker.enqueue_job(
//!         Job::new("send_confirmation", "email", Utc::now(), 10)
//!             .with_kwargs(json!({ "user_id": 42 })),
//!     )?;
//!
//!     // a job that only becomes eligible in an hour
//!     broker.enqueue_job(Job::new(
//!         "cleanup_session",
//!         "maintenance",
//!         Utc::now() + chrono::Duration::hours(1),
//!         0,
//!     ))
//! }
//! ```
//!
//! ### Serving jobs
//! A worker process runs maintenance, drains its queues and sleeps until
//! something happens:
//!
//! ```rust,ignore
//! use job_broker::{Broker, BrokerError};
//!
//! fn serve(broker: &dyn Broker) -> Result<(), BrokerError> {
//!     broker.start()?;
//!
//!     loop {
//!         match broker.move_future_jobs() {
//!             Ok(_) => (),
//!             Err(e) if e.is_shutdown() => break,
//!             Err(e) => return Err(e),
//!         }
//!
//!         for job in broker.get_jobs_from_queue("email", 4)? {
//!             // hand the job to an executor; on success:
//!             broker.remove_job_from_running(&job)?;
//!             // on a retryable failure, re-submit with an incremented
//!             // retry counter instead
//!         }
//!
//!         broker.wait_for_event();
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Going multi-process
//! ```rust,ignore
//! use job_broker::redis::RedisBrokerConfig;
//!
//! let broker = RedisBrokerConfig::new("redis://127.0.0.1/")
//!     .namespace("my-app")
//!     .connect()?;
//! broker.start()?;
//! ```
//!
//! Brokers heartbeat through the shared registry on every maintenance pass.
//! When a peer misses its heartbeats for longer than the configured
//! threshold, one surviving broker drains the peer's running set and puts
//! every idempotent job back on its queue with an incremented retry
//! counter. A broker that shuts down cleanly removes itself from the
//! registry instead.
//!
//! ### Periodic tasks
//! ```rust,ignore
//! use job_broker::Task;
//! use std::time::Duration;
//!
//! broker.register_periodic_tasks(vec![
//!     Task::new("refresh_cache", "maintenance", 3, Duration::from_secs(300)),
//! ])?;
//! ```
//!
//! Registration is declarative: names absent from the latest call are
//! removed, names already known keep their schedule. Due occurrences are
//! enqueued by whichever broker runs maintenance first.

pub use job_broker_core::{
    generate_idempotency_token, Broker, BrokerError, Clock, Event, Job, JobStatus, ManualClock,
    MemoryBroker, Result, SystemClock, Task, TokenSource, DEFAULT_BROKER_DEAD_THRESHOLD_SECONDS,
    WAIT_FOR_EVENT_MAX_SECONDS,
};

#[cfg(feature = "job-broker-redis")]
pub mod redis {
    pub use job_broker_redis::{RedisBroker, RedisBrokerConfig};
}
