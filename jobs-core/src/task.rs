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

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::Result;

#[derive(Clone, Debug, Deserialize, Serialize)]
/// Registration record for a periodic task
///
/// Fields are declared in their serialized (sorted) order so the encoded
/// record can be compared byte for byte.
pub struct Task {
    /// Maximum number of retries for jobs spawned from this task
    pub max_retries: u32,

    /// Name of the task, the key of the periodic registry
    pub name: String,

    /// Seconds between two occurrences
    pub periodicity: u64,

    /// Queue the spawned jobs are placed on
    pub queue: String,
}

impl Task {
    pub fn new(name: &str, queue: &str, max_retries: u32, periodicity: Duration) -> Self {
        Task {
            max_retries,
            name: name.to_owned(),
            periodicity: periodicity.as_secs(),
            queue: queue.to_owned(),
        }
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(raw: &str) -> Result<Task> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Task records compare by name, the registry key
impl PartialEq for Task {
    fn eq(&self, other: &Task) -> bool {
        self.name == other.name
    }
}

impl Eq for Task {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_form_is_stable() {
        let task = Task::new("foo", "q1", 0, Duration::from_secs(5));

        assert_eq!(
            task.serialize().unwrap(),
            "{\"max_retries\":0,\"name\":\"foo\",\"periodicity\":5,\"queue\":\"q1\"}"
        );
    }

    #[test]
    fn round_trip_is_identity() {
        let task = Task::new("bar", "q1", 3, Duration::from_secs(10));
        let restored = Task::deserialize(&task.serialize().unwrap()).unwrap();

        assert_eq!(restored.serialize().unwrap(), task.serialize().unwrap());
    }

    #[test]
    fn tasks_compare_by_name() {
        let long = Task::new("foo", "q1", 0, Duration::from_secs(5));
        let short = Task::new("foo", "q2", 9, Duration::from_secs(50));
        let other = Task::new("bar", "q1", 0, Duration::from_secs(5));

        assert_eq!(long, short);
        assert_ne!(long, other);
    }
}
