//! Redis-backed broker for multi-process deployments
//!
//! Every broker instance talks to the same redis server. The compound state
//! transitions run as server-side scripts so they are atomic with respect to
//! every other broker operation, the notification channel wakes sleeping
//! workers across processes, and a per-broker heartbeat in the shared
//! registry lets surviving brokers recover the running jobs of crashed
//! peers.

use std::{
    cmp,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{offset::Utc, SecondsFormat};
use job_broker_core::{
    generate_idempotency_token, Broker, BrokerError, Event, Job, JobStatus, Result, Task,
    TokenSource, DEFAULT_BROKER_DEAD_THRESHOLD_SECONDS, WAIT_FOR_EVENT_MAX_SECONDS,
};
use log::{debug, error, info, warn};
use redis::{Commands, Connection};
use uuid::Uuid;

mod scripts;

use crate::scripts::Scripts;

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "jobs";

/// Relative key of the future jobs sorted set
pub const FUTURE_JOBS_KEY: &str = "future_jobs";

/// Relative key of the broker registry sorted set
pub const BROKERS_KEY: &str = "brokers";

/// Relative key of the periodic task registry hash
pub const PERIODIC_TASKS_KEY: &str = "periodic_tasks";

/// Relative key of the sorted set tracking when periodic tasks come due
pub const PERIODIC_TASKS_DUE_KEY: &str = "periodic_tasks_due";

/// Relative key of the idempotency token set
pub const IDEMPOTENCY_TOKENS_KEY: &str = "idempotency_tokens";

/// Relative key of the notification pub/sub channel
pub const NOTIFICATIONS_KEY: &str = "notifications";

const DEFAULT_MUST_STOP_PERIODICITY: Duration = Duration::from_secs(10);

/// How often a failed store call is retried before surfacing the error.
/// Replays are safe: submissions carry idempotency tokens.
const MAX_ATTEMPTS: usize = 3;

/// Configuration for a [`RedisBroker`]
pub struct RedisBrokerConfig {
    url: String,
    namespace: String,
    broker_dead_threshold: Duration,
    must_stop_periodicity: Duration,
    token_source: TokenSource,
}

impl RedisBrokerConfig {
    /// Create a new config pointing at the given redis URL
    pub fn new(url: &str) -> Self {
        RedisBrokerConfig {
            url: url.to_owned(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            broker_dead_threshold: Duration::from_secs(DEFAULT_BROKER_DEAD_THRESHOLD_SECONDS),
            must_stop_periodicity: DEFAULT_MUST_STOP_PERIODICITY,
            token_source: Arc::new(generate_idempotency_token),
        }
    }

    /// Set the prefix namespacing every key this broker touches
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_owned();
        self
    }

    /// Set how long a peer may go without a heartbeat before it is
    /// considered dead
    pub fn broker_dead_threshold(mut self, threshold: Duration) -> Self {
        self.broker_dead_threshold = threshold;
        self
    }

    /// Set how often background maintenance rechecks the shutdown flag.
    /// Bounds the worst-case latency of `stop`.
    pub fn must_stop_periodicity(mut self, periodicity: Duration) -> Self {
        self.must_stop_periodicity = periodicity;
        self
    }

    /// Replace the idempotency-token source
    pub fn token_source(mut self, token_source: TokenSource) -> Self {
        self.token_source = token_source;
        self
    }

    /// Open the client and build the broker
    pub fn connect(self) -> Result<RedisBroker> {
        let client = redis::Client::open(self.url.as_str()).map_err(BrokerError::transport)?;

        Ok(RedisBroker {
            client,
            conn: Mutex::new(None),
            id: Uuid::new_v4(),
            namespace: self.namespace,
            broker_dead_threshold: self.broker_dead_threshold,
            must_stop_periodicity: self.must_stop_periodicity,
            token_source: self.token_source,
            scripts: Scripts::new(),
            periodic_tasks: Mutex::new(Vec::new()),
            something_happened: Arc::new(Event::new()),
            must_stop: Arc::new(AtomicBool::new(false)),
            subscriber: Mutex::new(None),
        })
    }
}

/// Broker backed by a shared redis server
pub struct RedisBroker {
    client: redis::Client,
    conn: Mutex<Option<Connection>>,
    id: Uuid,
    namespace: String,
    broker_dead_threshold: Duration,
    must_stop_periodicity: Duration,
    token_source: TokenSource,
    scripts: Scripts,
    periodic_tasks: Mutex<Vec<Task>>,
    something_happened: Arc<Event>,
    must_stop: Arc<AtomicBool>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl RedisBroker {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Delete every key under this broker's namespace
    ///
    /// Intended for tests and tooling; usable even after `stop`.
    pub fn flush(&self) -> Result<()> {
        let pattern = format!("{}/*", self.namespace);

        let keys: Vec<String> = self.with_conn(|conn| {
            let found = conn.scan_match::<_, String>(pattern.as_str())?.collect();
            Ok(found)
        })?;

        if keys.is_empty() {
            return Ok(());
        }

        let _deleted: i64 = self.with_conn(|conn| conn.del(&keys))?;
        Ok(())
    }

    /// Run a store call on the shared connection, reconnecting and retrying
    /// a bounded number of times on connection-level failures
    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&mut Connection) -> redis::RedisResult<T>,
    {
        let mut guard = self.conn.lock().unwrap();
        let mut attempts = 0;

        loop {
            let mut conn = match guard.take() {
                Some(conn) => conn,
                None => self.client.get_connection().map_err(BrokerError::transport)?,
            };

            match f(&mut conn) {
                Ok(value) => {
                    *guard = Some(conn);
                    return Ok(value);
                }
                Err(err) => {
                    let broken = err.is_io_error() || err.is_connection_dropped();
                    if !broken {
                        *guard = Some(conn);
                        return Err(BrokerError::transport(err));
                    }

                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(BrokerError::transport(err));
                    }
                    debug!("Retrying store call after connection error: {}", err);
                }
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.must_stop.load(Ordering::SeqCst) {
            Err(BrokerError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Broker for RedisBroker {
    fn start(&self) -> Result<()> {
        self.ensure_running()?;

        let mut subscriber = self.subscriber.lock().unwrap();
        if subscriber.is_some() {
            return Ok(());
        }

        let client = self.client.clone();
        let channel = namespaced(&self.namespace, NOTIFICATIONS_KEY);
        let something_happened = Arc::clone(&self.something_happened);
        let must_stop = Arc::clone(&self.must_stop);
        let periodicity = self.must_stop_periodicity;

        let handle = thread::Builder::new()
            .name("job-broker-notifications".to_owned())
            .spawn(move || {
                subscriber_loop(client, channel, something_happened, must_stop, periodicity)
            })
            .map_err(BrokerError::transport)?;
        *subscriber = Some(handle);
        drop(subscriber);

        // enter the registry right away: peers can only recover brokers
        // they can see
        let brokers_key = namespaced(&self.namespace, BROKERS_KEY);
        let broker_id = self.id.simple().to_string();
        let _added: i64 = self.with_conn(|conn| {
            let now_ms = server_now_ms(conn)?;
            conn.zadd(&brokers_key, &broker_id, now_ms)
        })?;

        debug!("Broker {} started", broker_id);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.must_stop.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.something_happened.notify();

        // wake the subscriber so it notices the flag without waiting out
        // its read timeout
        let channel = namespaced(&self.namespace, NOTIFICATIONS_KEY);
        if let Err(e) = self.with_conn(|conn| conn.publish::<_, _, i64>(&channel, 1)) {
            warn!("Could not publish shutdown wake-up: {}", e);
        }

        if let Some(handle) = self.subscriber.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("Notification subscriber panicked");
            }
        }

        let brokers_key = namespaced(&self.namespace, BROKERS_KEY);
        let broker_id = self.id.simple().to_string();
        let _removed: i64 = self.with_conn(|conn| conn.zrem(&brokers_key, &broker_id))?;

        debug!("Broker {} deregistered", broker_id);
        Ok(())
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn enqueue_jobs(&self, jobs: Vec<Job>) -> Result<()> {
        self.ensure_running()?;
        if jobs.is_empty() {
            return Ok(());
        }

        // tokens are generated once per call so a retried script invocation
        // replays the same submission
        let mut args = Vec::with_capacity(jobs.len() * 4);
        for mut job in jobs {
            job.status = JobStatus::Queued;
            let payload = job.serialize()?;
            args.push((self.token_source)());
            args.push(job.id.simple().to_string());
            args.push(job.at.timestamp_millis().to_string());
            args.push(payload);
        }

        let notifications = namespaced(&self.namespace, NOTIFICATIONS_KEY);
        let future_jobs = namespaced(&self.namespace, FUTURE_JOBS_KEY);
        let tokens = namespaced(&self.namespace, IDEMPOTENCY_TOKENS_KEY);
        let running = running_jobs_key(&self.namespace, self.id);

        self.with_conn(|conn| {
            let mut invocation = self.scripts.enqueue_jobs.prepare_invoke();
            invocation
                .key(&notifications)
                .key(&future_jobs)
                .key(&tokens)
                .key(&running)
                .arg(&self.namespace);
            for arg in &args {
                invocation.arg(arg.as_str());
            }
            invocation.invoke(conn)
        })
    }

    fn get_jobs_from_queue(&self, queue: &str, max_jobs: usize) -> Result<Vec<Job>> {
        self.ensure_running()?;

        let queue_key = queue_key(&self.namespace, queue);
        let running = running_jobs_key(&self.namespace, self.id);

        let payloads: Vec<String> = self.with_conn(|conn| {
            self.scripts
                .get_jobs_from_queue
                .key(&queue_key)
                .key(&running)
                .arg(max_jobs)
                .arg(u8::from(JobStatus::Running))
                .invoke(conn)
        })?;

        payloads.iter().map(|raw| Job::deserialize(raw)).collect()
    }

    fn remove_job_from_running(&self, job: &Job) -> Result<()> {
        self.ensure_running()?;
        if !job.is_idempotent() {
            return Ok(());
        }

        let running = running_jobs_key(&self.namespace, self.id);
        let field = job.id.simple().to_string();
        let _removed: i64 = self.with_conn(|conn| conn.hdel(&running, &field))?;
        Ok(())
    }

    fn move_future_jobs(&self) -> Result<usize> {
        self.ensure_running()?;

        let brokers_key = namespaced(&self.namespace, BROKERS_KEY);
        let future_jobs = namespaced(&self.namespace, FUTURE_JOBS_KEY);
        let notifications = namespaced(&self.namespace, NOTIFICATIONS_KEY);
        let periodic_due = namespaced(&self.namespace, PERIODIC_TASKS_DUE_KEY);
        let broker_id = self.id.simple().to_string();
        let now_iso = Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true);

        // snapshot of the registered tasks, with one pre-generated id per
        // potential occurrence so script retries replay identically
        let mut task_args = Vec::new();
        for task in self.periodic_tasks.lock().unwrap().iter() {
            task_args.push(task.name.clone());
            task_args.push(task.queue.clone());
            task_args.push(task.max_retries.to_string());
            task_args.push(task.periodicity.to_string());
            task_args.push(Uuid::new_v4().simple().to_string());
        }

        let (moved, dead): (usize, Vec<String>) = self.with_conn(|conn| {
            let mut invocation = self.scripts.move_future_jobs.prepare_invoke();
            invocation
                .key(&brokers_key)
                .key(&future_jobs)
                .key(&notifications)
                .key(&periodic_due)
                .arg(&self.namespace)
                .arg(&broker_id)
                .arg(self.broker_dead_threshold.as_millis() as u64)
                .arg(u8::from(JobStatus::Queued))
                .arg(&now_iso);
            for arg in &task_args {
                invocation.arg(arg.as_str());
            }
            invocation.invoke(conn)
        })?;

        for dead_id in dead {
            let dead_id = Uuid::parse_str(&dead_id).map_err(|_| {
                BrokerError::InvariantViolation(format!(
                    "broker registry contains a malformed id {}",
                    dead_id
                ))
            })?;

            let recovered = self.enqueue_jobs_from_dead_broker(dead_id)?;
            info!("Recovered {} jobs from dead broker {}", recovered, dead_id);
        }

        Ok(moved)
    }

    fn enqueue_jobs_from_dead_broker(&self, dead_broker_id: Uuid) -> Result<usize> {
        self.ensure_running()?;

        let running = running_jobs_key(&self.namespace, dead_broker_id);
        let notifications = namespaced(&self.namespace, NOTIFICATIONS_KEY);

        self.with_conn(|conn| {
            self.scripts
                .enqueue_jobs_from_dead_broker
                .key(&running)
                .key(&notifications)
                .arg(&self.namespace)
                .arg(u8::from(JobStatus::Queued))
                .invoke(conn)
        })
    }

    fn register_periodic_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        self.ensure_running()?;

        let periodic = namespaced(&self.namespace, PERIODIC_TASKS_KEY);
        let periodic_due = namespaced(&self.namespace, PERIODIC_TASKS_DUE_KEY);

        let mut args = Vec::with_capacity(tasks.len() * 3);
        for task in &tasks {
            args.push(task.name.clone());
            args.push(task.periodicity.to_string());
            args.push(task.serialize()?);
        }

        self.with_conn::<(), _>(|conn| {
            let mut invocation = self.scripts.register_periodic_tasks.prepare_invoke();
            invocation.key(&periodic).key(&periodic_due);
            for arg in &args {
                invocation.arg(arg.as_str());
            }
            invocation.invoke(conn)
        })?;

        *self.periodic_tasks.lock().unwrap() = tasks;
        Ok(())
    }

    fn next_future_job_delta(&self) -> Result<Option<u64>> {
        self.ensure_running()?;

        let future_jobs = namespaced(&self.namespace, FUTURE_JOBS_KEY);

        let (head, now_ms): (Vec<(String, i64)>, i64) = self.with_conn(|conn| {
            let head = conn.zrange_withscores(&future_jobs, 0, 0)?;
            let now_ms = server_now_ms(conn)? as i64;
            Ok((head, now_ms))
        })?;

        Ok(head.first().map(|(_, at_ms)| {
            let millis = at_ms - now_ms;
            if millis <= 0 {
                0
            } else {
                ((millis + 999) / 1000) as u64
            }
        }))
    }

    fn wait_for_event(&self) {
        let delta = match self.next_future_job_delta() {
            Ok(Some(seconds)) => seconds,
            Ok(None) => WAIT_FOR_EVENT_MAX_SECONDS,
            Err(BrokerError::Shutdown) => return,
            Err(e) => {
                warn!("Could not read the next future job delta: {}", e);
                WAIT_FOR_EVENT_MAX_SECONDS
            }
        };

        let timeout = Duration::from_secs(cmp::min(delta, WAIT_FOR_EVENT_MAX_SECONDS));
        self.something_happened.wait_timeout(timeout);
    }
}

/// Receive notifications published by any broker in the namespace and relay
/// them onto the local something-happened event
fn subscriber_loop(
    client: redis::Client,
    channel: String,
    something_happened: Arc<Event>,
    must_stop: Arc<AtomicBool>,
    periodicity: Duration,
) {
    while !must_stop.load(Ordering::SeqCst) {
        let mut conn = match client.get_connection() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Notification subscriber could not connect: {}", e);
                thread::sleep(periodicity);
                continue;
            }
        };

        let mut pubsub = conn.as_pubsub();
        if let Err(e) = pubsub.subscribe(&channel) {
            warn!("Could not subscribe to {}: {}", channel, e);
            thread::sleep(periodicity);
            continue;
        }
        if let Err(e) = pubsub.set_read_timeout(Some(periodicity)) {
            warn!("Could not set the subscription read timeout: {}", e);
            continue;
        }

        loop {
            if must_stop.load(Ordering::SeqCst) {
                return;
            }

            match pubsub.get_message() {
                Ok(_) => something_happened.notify(),
                Err(ref e) if e.is_timeout() => {}
                Err(e) => {
                    warn!("Notification subscription lost: {}", e);
                    break;
                }
            }
        }
    }
}

fn server_now_ms(conn: &mut Connection) -> redis::RedisResult<u64> {
    let (seconds, micros): (u64, u64) = redis::cmd("TIME").query(conn)?;
    Ok(seconds * 1000 + micros / 1000)
}

fn namespaced(namespace: &str, key: &str) -> String {
    format!("{}/{}", namespace, key)
}

fn queue_key(namespace: &str, queue: &str) -> String {
    format!("{}/queue/{}", namespace, queue)
}

/// Key of the running jobs hash owned by `broker_id`
pub fn running_jobs_key(namespace: &str, broker_id: Uuid) -> String {
    format!("{}/running/{}", namespace, broker_id.simple())
}
