// Infrastructure module - Core background services and utilities
pub mod clock;
pub mod task_manager;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use task_manager::TaskManager;
pub use timer::{Backoff, ReconnectPolicy};
