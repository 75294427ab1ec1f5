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

use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::{Job, Result, Task};

/// Upper bound in seconds on a single `wait_for_event` call
pub const WAIT_FOR_EVENT_MAX_SECONDS: u64 = 120;

/// Seconds without a heartbeat after which a peer is considered dead
pub const DEFAULT_BROKER_DEAD_THRESHOLD_SECONDS: u64 = 1800;

/// Produces idempotency tokens for submitted jobs
///
/// Tokens make submission replays collapsible: a broker retrying a transport
/// error re-submits the same tokens, and the store drops jobs whose token it
/// already observed. Swappable so tests can pin the generated tokens.
pub type TokenSource = Arc<dyn Fn() -> String + Send + Sync>;

/// The default token source, a fresh v4 UUID per submission
pub fn generate_idempotency_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Define a broker coordinating producers and workers
///
/// A broker accepts job submissions, schedules them, dispenses them to
/// workers, tracks which broker instance owns each running idempotent job,
/// re-dispenses jobs abandoned by dead peers and keeps the registry of
/// periodic tasks. This crate provides a single-process implementation in
/// [`MemoryBroker`](crate::MemoryBroker); the `job-broker-redis` crate
/// provides the shared implementation used by multi-process deployments.
/// Both give at-least-once delivery for idempotent jobs and at-most-once
/// delivery for non-idempotent ones.
pub trait Broker: Send + Sync {
    /// Acquire resources and start background maintenance. Idempotent.
    fn start(&self) -> Result<()>;

    /// Signal shutdown, deregister from the peer registry and release
    /// resources. Idempotent, and causes in-progress `wait_for_event` calls
    /// to return promptly.
    fn stop(&self) -> Result<()>;

    /// The identifier of this broker instance, fresh per instance
    fn id(&self) -> Uuid;

    /// Place a batch of jobs on their queues, or in the future set for jobs
    /// not yet ready. Jobs whose idempotency token was already observed are
    /// dropped silently. Re-submitting a previously dispensed job clears its
    /// running-set entry. The whole batch is placed atomically.
    fn enqueue_jobs(&self, jobs: Vec<Job>) -> Result<()>;

    /// Remove up to `max_jobs` jobs from the head of `queue` in FIFO order.
    ///
    /// Returned jobs carry the `Running` status. Each idempotent job is
    /// recorded in this broker's running set; non-idempotent jobs are
    /// dispensed without a trace.
    fn get_jobs_from_queue(&self, queue: &str, max_jobs: usize) -> Result<Vec<Job>>;

    /// Forget a finished job. Succeeds silently when the job is absent, and
    /// has no effect for non-idempotent jobs.
    fn remove_job_from_running(&self, job: &Job) -> Result<()>;

    /// Run one maintenance pass: promote every ripe future job onto its
    /// queue, enqueue due periodic occurrences, refresh this broker's
    /// heartbeat and recover the running sets of dead peers.
    ///
    /// Returns the number of jobs promoted out of the future set, not
    /// counting periodic occurrences or recovered jobs.
    fn move_future_jobs(&self) -> Result<usize>;

    /// Drain the running set of a dead peer, re-enqueueing every entry with
    /// an incremented retry counter. Idempotent: once a peer's running set
    /// is gone, subsequent calls return 0.
    fn enqueue_jobs_from_dead_broker(&self, dead_broker_id: Uuid) -> Result<usize>;

    /// Replace the periodic-task registrations with exactly `tasks`. Known
    /// names are upserted and keep their schedule, unknown names are
    /// scheduled one period out, absent names are removed.
    fn register_periodic_tasks(&self, tasks: Vec<Task>) -> Result<()>;

    /// Seconds until the earliest future job becomes ready: `None` when the
    /// future set is empty, 0 when the head is already ripe. Does not mutate
    /// state.
    fn next_future_job_delta(&self) -> Result<Option<u64>>;

    /// Block until something worth waking for happened: jobs were enqueued,
    /// the next future job came due, `stop` was called, or the ceiling of
    /// `min(next_future_job_delta, WAIT_FOR_EVENT_MAX_SECONDS)` elapsed.
    fn wait_for_event(&self);

    /// Place a single job
    fn enqueue_job(&self, job: Job) -> Result<()> {
        self.enqueue_jobs(vec![job])
    }

    /// Remove the job at the head of `queue`, if any
    fn get_job_from_queue(&self, queue: &str) -> Result<Option<Job>> {
        Ok(self.get_jobs_from_queue(queue, 1)?.pop())
    }
}

/// A set-and-wake signal shared between worker threads
///
/// `wait_timeout` consumes the signal: it returns once the event was
/// notified or the timeout elapsed, reports which of the two happened, and
/// leaves the event cleared.
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Event {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.flag.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let (guard, _) = self.cond.wait_timeout(flag, deadline - now).unwrap();
            flag = guard;
        }

        let was_set = *flag;
        *flag = false;
        was_set
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_false_on_timeout() {
        let event = Event::new();

        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wait_observes_prior_notification() {
        let event = Event::new();
        event.notify();

        assert!(event.wait_timeout(Duration::from_millis(10)));
        // consumed by the first wait
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wait_wakes_on_notification() {
        let event = Arc::new(Event::new());

        let notifier = Arc::clone(&event);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            notifier.notify();
        });

        assert!(event.wait_timeout(Duration::from_secs(30)));
        handle.join().unwrap();
    }
}
