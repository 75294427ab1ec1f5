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

use std::convert::TryFrom;

use chrono::{offset::Utc, DateTime};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::Result;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(into = "u8", try_from = "u8")]
/// The lifecycle state of a job
///
/// `Queued` and `Running` are the states observable through a broker.
/// `Succeeded` and `Failed` are terminal, the broker no longer tracks such
/// jobs.
pub enum JobStatus {
    /// Job was created but not yet handed to a broker
    NotSet,

    /// Job sits on a queue or in the future set
    Queued,

    /// Job was dispensed to a worker
    Running,

    /// Job completed successfully
    Succeeded,

    /// Job failed permanently
    Failed,
}

impl JobStatus {
    pub fn is_queued(&self) -> bool {
        *self == JobStatus::Queued
    }

    pub fn is_running(&self) -> bool {
        *self == JobStatus::Running
    }
}

impl From<JobStatus> for u8 {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::NotSet => 0,
            JobStatus::Queued => 1,
            JobStatus::Running => 2,
            JobStatus::Succeeded => 3,
            JobStatus::Failed => 4,
        }
    }
}

impl TryFrom<u8> for JobStatus {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(JobStatus::NotSet),
            1 => Ok(JobStatus::Queued),
            2 => Ok(JobStatus::Running),
            3 => Ok(JobStatus::Succeeded),
            4 => Ok(JobStatus::Failed),
            other => Err(format!("{} is not a job status", other)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
/// A single unit of work tracked by a broker
///
/// Jobs serialize to JSON with the fields in the declared (sorted) order, so
/// the encoded form is byte-stable. The scripted store operations depend on
/// the job's own `retries` and `status` fields preceding the opaque
/// `task_kwargs` payload.
pub struct Job {
    /// The instant at which the job becomes eligible to run
    pub at: DateTime<Utc>,

    /// Stable unique identifier, generated at creation
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,

    /// Maximum number of retries, 0 marks the job as non-idempotent
    pub max_retries: u32,

    /// Name of the queue the job belongs to
    pub queue: String,

    /// Number of times the job was already retried
    pub retries: u32,

    /// Current lifecycle state
    pub status: JobStatus,

    /// Opaque positional arguments for the task
    pub task_args: Value,

    /// Opaque keyword arguments for the task
    pub task_kwargs: Value,

    /// Name of the task to execute
    pub task_name: String,
}

impl Job {
    pub fn new(task_name: &str, queue: &str, at: DateTime<Utc>, max_retries: u32) -> Self {
        Job {
            at,
            id: Uuid::new_v4(),
            max_retries,
            queue: queue.to_owned(),
            retries: 0,
            status: JobStatus::NotSet,
            task_args: Value::Array(Vec::new()),
            task_kwargs: Value::Object(Map::new()),
            task_name: task_name.to_owned(),
        }
    }

    /// Set the positional arguments passed to the task
    pub fn with_args(mut self, args: Value) -> Self {
        self.task_args = args;
        self
    }

    /// Set the keyword arguments passed to the task
    pub fn with_kwargs(mut self, kwargs: Value) -> Self {
        self.task_kwargs = kwargs;
        self
    }

    /// A job is idempotent when it may be retried, meaning it is safe to
    /// execute more than once. Only idempotent jobs are tracked in a
    /// broker's running set.
    pub fn is_idempotent(&self) -> bool {
        self.max_retries >= 1
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.at <= now
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(raw: &str) -> Result<Job> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed_job() -> Job {
        let mut job = Job::new(
            "foo_task",
            "foo_queue",
            "2017-09-02T08:50:56.482169Z".parse().unwrap(),
            10,
        )
        .with_args(json!([1, 2]))
        .with_kwargs(json!({ "foo": "bar" }));
        job.id = Uuid::parse_str("77fd8a2519274f3e9d48a2f26bbc2dcb").unwrap();
        job
    }

    #[test]
    fn serialized_form_is_stable() {
        let raw = fixed_job().serialize().unwrap();

        assert_eq!(
            raw,
            "{\"at\":\"2017-09-02T08:50:56.482169Z\",\
             \"id\":\"77fd8a2519274f3e9d48a2f26bbc2dcb\",\
             \"max_retries\":10,\
             \"queue\":\"foo_queue\",\
             \"retries\":0,\
             \"status\":0,\
             \"task_args\":[1,2],\
             \"task_kwargs\":{\"foo\":\"bar\"},\
             \"task_name\":\"foo_task\"}"
        );
    }

    #[test]
    fn round_trip_is_identity() {
        let job = fixed_job();

        let restored = Job::deserialize(&job.serialize().unwrap()).unwrap();

        assert_eq!(restored, job);
        assert_eq!(restored.serialize().unwrap(), job.serialize().unwrap());
    }

    #[test]
    fn status_integers() {
        for (status, expected) in &[
            (JobStatus::NotSet, 0u8),
            (JobStatus::Queued, 1),
            (JobStatus::Running, 2),
            (JobStatus::Succeeded, 3),
            (JobStatus::Failed, 4),
        ] {
            assert_eq!(u8::from(*status), *expected);
            assert_eq!(JobStatus::try_from(*expected).unwrap(), *status);
        }

        assert!(JobStatus::try_from(5).is_err());
    }

    #[test]
    fn jobs_allowing_retries_are_idempotent() {
        let now = Utc::now();

        assert!(!Job::new("t", "q", now, 0).is_idempotent());
        assert!(Job::new("t", "q", now, 1).is_idempotent());
        assert!(Job::new("t", "q", now, 10).is_idempotent());
    }
}
