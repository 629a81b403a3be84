pub mod core;
pub mod gate;
pub mod job;
pub mod queue;
pub mod registry;
pub mod running;
pub mod trigger;

pub use self::core::{
    validate_definitions, Collaborators, FireDecision, JobStats, Scheduler, SchedulerStatus,
};
pub use job::{Job, JobDefinition, JobStatus, JobUpdate, Priority, ScheduledJob};
pub use queue::{DispatchQueue, QueueEntry};
pub use registry::JobRegistry;
pub use running::RunningSet;
pub use trigger::CronTriggerSource;
