use redis::Script;

/// The server-side scripts implementing the compound broker transitions
///
/// Each operation executes as a single indivisible unit against the store,
/// so concurrent brokers only ever observe pre- or post-states.
pub(crate) struct Scripts {
    pub(crate) enqueue_jobs: Script,
    pub(crate) get_jobs_from_queue: Script,
    pub(crate) move_future_jobs: Script,
    pub(crate) enqueue_jobs_from_dead_broker: Script,
    pub(crate) register_periodic_tasks: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Scripts {
            enqueue_jobs: Script::new(include_str!("scripts/enqueue_jobs.lua")),
            get_jobs_from_queue: Script::new(include_str!("scripts/get_jobs_from_queue.lua")),
            move_future_jobs: Script::new(include_str!("scripts/move_future_jobs.lua")),
            enqueue_jobs_from_dead_broker: Script::new(include_str!(
                "scripts/enqueue_jobs_from_dead_broker.lua"
            )),
            register_periodic_tasks: Script::new(include_str!(
                "scripts/register_periodic_tasks.lua"
            )),
        }
    }
}
