use crate::channel::Subscription;
use crate::infrastructure::TaskManager;

/// Lifecycle state of a ChatCoordinator, behind one lock
pub struct CoordinatorState {
    /// Whether `start` has run since the last shutdown
    pub started: bool,

    /// Set by `shutdown`; the coordinator cannot start again
    pub closed: bool,

    /// Internal subscriptions (messages, presence, typing)
    pub subscriptions: Vec<Subscription>,

    /// Background task manager
    pub task_manager: TaskManager,

    /// A delayed flush retry is pending
    pub flush_retry_scheduled: bool,
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self {
            started: false,
            closed: false,
            subscriptions: Vec::new(),
            task_manager: TaskManager::new(),
            flush_retry_scheduled: false,
        }
    }

    /// Stop background work and release internal subscriptions
    pub fn reset(&mut self) {
        self.task_manager.abort_all();
        // Dropping a Subscription unsubscribes it
        self.subscriptions.clear();
        self.flush_retry_scheduled = false;
        self.started = false;
    }
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self::new()
    }
}
