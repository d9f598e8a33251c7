// Module declarations
mod builder;
mod core;
mod state;

// Public API exports
pub use self::core::ChatCoordinator;
pub use builder::{CoordinatorBuilder, CoordinatorOptions};
pub use state::CoordinatorState;
