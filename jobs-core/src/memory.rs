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
    cmp::{self, Ordering, Reverse},
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{offset::Utc, DateTime, Duration as OldDuration};
use log::debug;
use uuid::Uuid;

use crate::{
    broker::{generate_idempotency_token, Event, TokenSource, WAIT_FOR_EVENT_MAX_SECONDS},
    Broker, BrokerError, Clock, Job, JobStatus, Result, SystemClock, Task,
};

#[derive(Clone)]
/// Single-process broker backed by in-process data structures
///
/// Queues are FIFO sequences, the future set is a heap ordered by ready
/// time, and every operation runs under one mutex. Dead-broker detection is
/// a no-op since no other process shares the state. Intended for tests and
/// embedded use; multi-process deployments use the redis broker instead.
pub struct MemoryBroker {
    id: Uuid,
    inner: Arc<Mutex<Inner>>,
    something_happened: Arc<Event>,
    clock: Arc<dyn Clock>,
    token_source: TokenSource,
}

struct Inner {
    queues: HashMap<String, VecDeque<Job>>,
    future_jobs: BinaryHeap<Reverse<FutureEntry>>,
    future_seq: u64,
    running_jobs: HashMap<Uuid, Job>,
    periodic_tasks: Vec<PeriodicEntry>,
    idempotency_tokens: HashSet<String>,
    stopped: bool,
}

struct PeriodicEntry {
    task: Task,
    next_due: DateTime<Utc>,
}

/// Future-set entry ordered by ready time, ties resolved by insertion order
struct FutureEntry {
    at: DateTime<Utc>,
    seq: u64,
    job: Job,
}

impl PartialEq for FutureEntry {
    fn eq(&self, other: &FutureEntry) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for FutureEntry {}

impl PartialOrd for FutureEntry {
    fn partial_cmp(&self, other: &FutureEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FutureEntry {
    fn cmp(&self, other: &FutureEntry) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            id: Uuid::new_v4(),
            inner: Arc::new(Mutex::new(Inner {
                queues: HashMap::new(),
                future_jobs: BinaryHeap::new(),
                future_seq: 0,
                running_jobs: HashMap::new(),
                periodic_tasks: Vec::new(),
                idempotency_tokens: HashSet::new(),
                stopped: false,
            })),
            something_happened: Arc::new(Event::new()),
            clock: Arc::new(SystemClock),
            token_source: Arc::new(generate_idempotency_token),
        }
    }

    /// Replace the clock the broker reads time from
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the idempotency-token source
    pub fn token_source(mut self, token_source: TokenSource) -> Self {
        self.token_source = token_source;
        self
    }

    fn ensure_running(inner: &Inner) -> Result<()> {
        if inner.stopped {
            Err(BrokerError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl Broker for MemoryBroker {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.inner.lock().unwrap().stopped = true;
        self.something_happened.notify();
        Ok(())
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn enqueue_jobs(&self, jobs: Vec<Job>) -> Result<()> {
        let now = self.clock.now();

        let mut inner = self.inner.lock().unwrap();
        Self::ensure_running(&inner)?;

        for mut job in jobs {
            let token = (self.token_source)();
            if !inner.idempotency_tokens.insert(token) {
                debug!("Dropping duplicate submission of job {}", job.id);
                continue;
            }

            // re-enqueue after a failed attempt
            inner.running_jobs.remove(&job.id);

            job.status = JobStatus::Queued;
            if job.is_ready(now) {
                inner
                    .queues
                    .entry(job.queue.clone())
                    .or_insert_with(VecDeque::new)
                    .push_back(job);
            } else {
                let seq = inner.future_seq;
                inner.future_seq += 1;
                inner
                    .future_jobs
                    .push(Reverse(FutureEntry { at: job.at, seq, job }));
            }
        }
        drop(inner);

        self.something_happened.notify();
        Ok(())
    }

    fn get_jobs_from_queue(&self, queue: &str, max_jobs: usize) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock().unwrap();
        Self::ensure_running(&inner)?;

        let mut jobs = Vec::new();
        while jobs.len() < max_jobs {
            let mut job = match inner.queues.get_mut(queue).and_then(|q| q.pop_front()) {
                Some(job) => job,
                None => break,
            };

            job.status = JobStatus::Running;
            if job.is_idempotent() {
                inner.running_jobs.insert(job.id, job.clone());
            }
            jobs.push(job);
        }

        Ok(jobs)
    }

    fn remove_job_from_running(&self, job: &Job) -> Result<()> {
        if !job.is_idempotent() {
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap();
        Self::ensure_running(&inner)?;

        inner.running_jobs.remove(&job.id);
        Ok(())
    }

    fn move_future_jobs(&self) -> Result<usize> {
        let now = self.clock.now();

        let mut inner = self.inner.lock().unwrap();
        Self::ensure_running(&inner)?;

        let mut moved = 0;
        while inner
            .future_jobs
            .peek()
            .map(|entry| entry.0.at <= now)
            .unwrap_or(false)
        {
            if let Some(Reverse(entry)) = inner.future_jobs.pop() {
                inner
                    .queues
                    .entry(entry.job.queue.clone())
                    .or_insert_with(VecDeque::new)
                    .push_back(entry.job);
                moved += 1;
            }
        }

        let mut due_jobs = Vec::new();
        for entry in inner.periodic_tasks.iter_mut() {
            if entry.next_due <= now {
                due_jobs.push(Job::new(
                    &entry.task.name,
                    &entry.task.queue,
                    now,
                    entry.task.max_retries,
                ));
                entry.next_due = now + OldDuration::seconds(entry.task.periodicity as i64);
            }
        }
        let enqueued_periodic = !due_jobs.is_empty();
        for mut job in due_jobs {
            job.status = JobStatus::Queued;
            inner
                .queues
                .entry(job.queue.clone())
                .or_insert_with(VecDeque::new)
                .push_back(job);
        }
        drop(inner);

        if moved > 0 || enqueued_periodic {
            self.something_happened.notify();
        }
        Ok(moved)
    }

    fn enqueue_jobs_from_dead_broker(&self, dead_broker_id: Uuid) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        Self::ensure_running(&inner)?;

        // single process: the only running set that exists is our own
        if dead_broker_id != self.id {
            return Ok(0);
        }

        let drained: Vec<Job> = inner.running_jobs.drain().map(|(_, job)| job).collect();
        let mut count = 0;
        for mut job in drained {
            if !job.is_idempotent() {
                return Err(BrokerError::InvariantViolation(format!(
                    "non-idempotent job {} found in a running set",
                    job.id
                )));
            }

            job.retries += 1;
            job.status = JobStatus::Queued;
            inner
                .queues
                .entry(job.queue.clone())
                .or_insert_with(VecDeque::new)
                .push_back(job);
            count += 1;
        }
        drop(inner);

        if count > 0 {
            self.something_happened.notify();
        }
        Ok(count)
    }

    fn register_periodic_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        let now = self.clock.now();

        let mut inner = self.inner.lock().unwrap();
        Self::ensure_running(&inner)?;

        let previous = std::mem::replace(&mut inner.periodic_tasks, Vec::new());
        inner.periodic_tasks = tasks
            .into_iter()
            .map(|task| {
                let next_due = previous
                    .iter()
                    .find(|entry| entry.task.name == task.name)
                    .map(|entry| entry.next_due)
                    .unwrap_or_else(|| now + OldDuration::seconds(task.periodicity as i64));

                PeriodicEntry { task, next_due }
            })
            .collect();

        Ok(())
    }

    fn next_future_job_delta(&self) -> Result<Option<u64>> {
        let now = self.clock.now();

        let inner = self.inner.lock().unwrap();
        Self::ensure_running(&inner)?;

        Ok(inner
            .future_jobs
            .peek()
            .map(|entry| delta_seconds(entry.0.at, now)))
    }

    fn wait_for_event(&self) {
        let delta = match self.next_future_job_delta() {
            Ok(Some(seconds)) => seconds,
            Ok(None) => WAIT_FOR_EVENT_MAX_SECONDS,
            Err(_) => return,
        };

        let timeout = Duration::from_secs(cmp::min(delta, WAIT_FOR_EVENT_MAX_SECONDS));
        self.something_happened.wait_timeout(timeout);
    }
}

/// Seconds from `now` until `at`, rounded up, saturating at 0
fn delta_seconds(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (at - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        ((millis + 999) / 1000) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use serde_json::json;
    use std::{thread, time::Instant};

    fn t0() -> DateTime<Utc> {
        "2017-09-02T08:50:56.482169Z".parse().unwrap()
    }

    fn broker_at(start: DateTime<Utc>) -> (MemoryBroker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let broker = MemoryBroker::new().clock(clock.clone());
        broker.start().unwrap();
        (broker, clock)
    }

    fn foo_job(clock: &ManualClock, max_retries: u32) -> Job {
        Job::new("foo_task", "foo_queue", clock.now(), max_retries)
            .with_args(json!([1, 2]))
            .with_kwargs(json!({ "foo": "bar" }))
    }

    fn running(job: &Job) -> Job {
        let mut job = job.clone();
        job.status = JobStatus::Running;
        job
    }

    #[test]
    fn normal_job_is_dispensed_once() {
        let (broker, clock) = broker_at(t0());
        let job = foo_job(&clock, 0);

        broker.enqueue_job(job.clone()).unwrap();

        assert_eq!(
            broker.get_job_from_queue("foo_queue").unwrap(),
            Some(running(&job))
        );
        assert_eq!(broker.get_job_from_queue("foo_queue").unwrap(), None);
    }

    #[test]
    fn future_job_is_promoted_when_ripe() {
        let (broker, clock) = broker_at(t0());

        assert_eq!(broker.next_future_job_delta().unwrap(), None);
        assert_eq!(broker.move_future_jobs().unwrap(), 0);

        let job = Job::new(
            "foo_task",
            "foo_queue",
            t0() + OldDuration::minutes(10),
            0,
        )
        .with_args(json!([1, 2]))
        .with_kwargs(json!({ "foo": "bar" }));
        broker.enqueue_job(job.clone()).unwrap();

        assert_eq!(broker.get_job_from_queue("foo_queue").unwrap(), None);
        assert_eq!(broker.next_future_job_delta().unwrap(), Some(600));
        assert_eq!(broker.move_future_jobs().unwrap(), 0);

        clock.set("2017-09-02T09:00:56.482169Z".parse().unwrap());

        assert_eq!(broker.next_future_job_delta().unwrap(), Some(0));
        assert_eq!(broker.move_future_jobs().unwrap(), 1);
        assert_eq!(
            broker.get_job_from_queue("foo_queue").unwrap(),
            Some(running(&job))
        );
        assert_eq!(broker.next_future_job_delta().unwrap(), None);
    }

    #[test]
    fn future_jobs_with_equal_ready_time_keep_insertion_order() {
        let (broker, clock) = broker_at(t0());
        let at = t0() + OldDuration::seconds(5);

        let first = Job::new("foo_task", "foo_queue", at, 0);
        let second = Job::new("foo_task", "foo_queue", at, 0);
        broker
            .enqueue_jobs(vec![first.clone(), second.clone()])
            .unwrap();

        clock.advance(OldDuration::seconds(6));
        assert_eq!(broker.move_future_jobs().unwrap(), 2);

        let jobs = broker.get_jobs_from_queue("foo_queue", 10).unwrap();
        assert_eq!(jobs, vec![running(&first), running(&second)]);
    }

    #[test]
    fn idempotent_jobs_are_tracked_while_running() {
        let (broker, clock) = broker_at(t0());
        let job = foo_job(&clock, 10);

        broker.enqueue_job(job.clone()).unwrap();
        assert!(broker.inner.lock().unwrap().running_jobs.is_empty());

        broker.get_jobs_from_queue("foo_queue", 1).unwrap();
        assert_eq!(
            broker.inner.lock().unwrap().running_jobs.get(&job.id),
            Some(&running(&job))
        );

        broker.remove_job_from_running(&job).unwrap();
        assert!(broker.inner.lock().unwrap().running_jobs.is_empty());
    }

    #[test]
    fn non_idempotent_jobs_are_never_tracked() {
        let (broker, clock) = broker_at(t0());
        let job = foo_job(&clock, 0);

        broker.enqueue_job(job.clone()).unwrap();
        broker.get_jobs_from_queue("foo_queue", 1).unwrap();
        assert!(broker.inner.lock().unwrap().running_jobs.is_empty());

        // removing a job that was never tracked is fine
        broker.remove_job_from_running(&job).unwrap();
    }

    #[test]
    fn re_enqueue_clears_the_running_entry() {
        let (broker, clock) = broker_at(t0());
        let job = foo_job(&clock, 10);

        broker.enqueue_job(job.clone()).unwrap();
        broker.get_jobs_from_queue("foo_queue", 1).unwrap();
        assert!(!broker.inner.lock().unwrap().running_jobs.is_empty());

        let mut retried = job.clone();
        retried.retries += 1;
        broker.enqueue_job(retried.clone()).unwrap();
        assert!(broker.inner.lock().unwrap().running_jobs.is_empty());

        assert_eq!(
            broker.get_job_from_queue("foo_queue").unwrap(),
            Some(running(&retried))
        );
    }

    #[test]
    fn dead_broker_drain_requeues_only_idempotent_jobs() {
        let (broker, clock) = broker_at(t0());
        let fragile = foo_job(&clock, 0);
        let durable = foo_job(&clock, 10);

        broker
            .enqueue_jobs(vec![fragile.clone(), durable.clone()])
            .unwrap();
        broker.get_jobs_from_queue("foo_queue", 100).unwrap();

        assert_eq!(
            broker.enqueue_jobs_from_dead_broker(broker.id()).unwrap(),
            1
        );

        let mut expected = running(&durable);
        expected.retries = 1;
        assert_eq!(
            broker.get_jobs_from_queue("foo_queue", 100).unwrap(),
            vec![expected]
        );

        // draining twice must not duplicate jobs
        assert_eq!(
            broker.enqueue_jobs_from_dead_broker(broker.id()).unwrap(),
            0
        );
        assert_eq!(broker.get_job_from_queue("foo_queue").unwrap(), None);

        // unknown peers have no running set here
        assert_eq!(
            broker.enqueue_jobs_from_dead_broker(Uuid::new_v4()).unwrap(),
            0
        );
    }

    #[test]
    fn periodic_registration_replaces_the_registry() {
        let (broker, _clock) = broker_at(t0());
        let foo = Task::new("foo", "q1", 0, Duration::from_secs(5));
        let bar = Task::new("bar", "q1", 0, Duration::from_secs(10));

        broker
            .register_periodic_tasks(vec![foo.clone(), bar.clone()])
            .unwrap();
        {
            let inner = broker.inner.lock().unwrap();
            let mut names: Vec<&str> = inner
                .periodic_tasks
                .iter()
                .map(|entry| entry.task.name.as_str())
                .collect();
            names.sort_unstable();
            assert_eq!(names, vec!["bar", "foo"]);
        }

        broker.register_periodic_tasks(vec![bar.clone()]).unwrap();
        {
            let inner = broker.inner.lock().unwrap();
            let names: Vec<&str> = inner
                .periodic_tasks
                .iter()
                .map(|entry| entry.task.name.as_str())
                .collect();
            assert_eq!(names, vec!["bar"]);
        }
    }

    #[test]
    fn due_periodic_tasks_enqueue_an_occurrence() {
        let (broker, clock) = broker_at(t0());
        let task = Task::new("foo", "q1", 3, Duration::from_secs(5));

        broker.register_periodic_tasks(vec![task]).unwrap();

        // nothing is due one period before the first occurrence
        assert_eq!(broker.move_future_jobs().unwrap(), 0);
        assert_eq!(broker.get_job_from_queue("q1").unwrap(), None);

        clock.advance(OldDuration::seconds(6));
        broker.move_future_jobs().unwrap();

        let job = broker.get_job_from_queue("q1").unwrap().unwrap();
        assert_eq!(job.task_name, "foo");
        assert_eq!(job.queue, "q1");
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.at, clock.now());
        assert!(job.status.is_running());

        // the next occurrence is one period out
        broker.move_future_jobs().unwrap();
        assert_eq!(broker.get_job_from_queue("q1").unwrap(), None);
    }

    #[test]
    fn duplicate_idempotency_tokens_collapse_submissions() {
        let clock = Arc::new(ManualClock::new(t0()));
        let broker = MemoryBroker::new()
            .clock(clock.clone())
            .token_source(Arc::new(|| "42".to_owned()));
        broker.start().unwrap();

        let job_1 = foo_job(&clock, 0);
        let job_2 = foo_job(&clock, 0);
        broker.enqueue_job(job_1.clone()).unwrap();
        broker.enqueue_job(job_2).unwrap();

        assert_eq!(
            broker.get_jobs_from_queue("foo_queue", 10).unwrap(),
            vec![running(&job_1)]
        );
    }

    #[test]
    fn wait_for_event_wakes_on_enqueue() {
        let clock = Arc::new(ManualClock::new(t0()));
        let broker = Arc::new(MemoryBroker::new().clock(clock.clone()));
        broker.start().unwrap();

        let producer = Arc::clone(&broker);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            producer
                .enqueue_job(Job::new("foo_task", "foo_queue", t0(), 0))
                .unwrap();
        });

        let started = Instant::now();
        broker.wait_for_event();
        assert!(started.elapsed() < Duration::from_secs(30));
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_event_is_bounded_by_the_next_future_job() {
        let broker = MemoryBroker::new();
        broker.start().unwrap();

        broker
            .enqueue_job(Job::new(
                "foo_task",
                "foo_queue",
                Utc::now() + OldDuration::seconds(1),
                0,
            ))
            .unwrap();

        // consume the enqueue notification, then wait out the future delta
        broker.wait_for_event();
        let started = Instant::now();
        broker.wait_for_event();
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn stop_is_idempotent_and_rejects_further_work() {
        let (broker, clock) = broker_at(t0());

        broker.stop().unwrap();
        broker.stop().unwrap();

        let started = Instant::now();
        broker.wait_for_event();
        assert!(started.elapsed() < Duration::from_secs(30));

        let err = broker.enqueue_job(foo_job(&clock, 0)).unwrap_err();
        assert!(err.is_shutdown());
    }
}
