pub mod config;
pub mod dmclock;
pub mod scheduler;
pub mod service;
pub mod slo;
pub mod strict_queue;
pub mod token_bucket;

// Re-export the main entry points.
pub use config::SchedulerConfig;
pub use scheduler::PrioritizedQueue;
pub use service::SchedulerService;
pub use slo::Slo;
