use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Called with a query key whenever a coalesced "something changed" signal fires.
pub type InvalidationHook = Arc<dyn Fn(&str) + Send + Sync + 'static>;

#[derive(Default)]
struct CoalescerState {
    /// Open windows: key -> number of signals absorbed so far
    pending: HashMap<String, usize>,
    hook: Option<InvalidationHook>,
}

/// Merges invalidation signals per key over a fixed window.
///
/// The first signal for a key opens a window; signals arriving before it
/// closes are absorbed, and exactly one invalidation fires when it closes.
#[derive(Clone)]
pub struct Coalescer {
    window: Duration,
    state: Arc<Mutex<CoalescerState>>,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(CoalescerState::default())),
        }
    }

    pub fn set_hook(&self, hook: InvalidationHook) {
        self.lock().hook = Some(hook);
    }

    pub fn signal(&self, key: &str) {
        {
            let mut state = self.lock();
            if let Some(absorbed) = state.pending.get_mut(key) {
                *absorbed += 1;
                return;
            }
            state.pending.insert(key.to_string(), 1);
        }

        let state = Arc::downgrade(&self.state);
        let window = self.window;
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            Self::close_window(state, &key);
        });
    }

    /// Number of keys with an open window
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    fn close_window(state: Weak<Mutex<CoalescerState>>, key: &str) {
        let Some(state) = state.upgrade() else {
            return;
        };
        let (hook, absorbed) = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let absorbed = state.pending.remove(key).unwrap_or(0);
            (state.hook.clone(), absorbed)
        };

        tracing::debug!(key, absorbed, "Emitting coalesced invalidation");
        if let Some(hook) = hook
            && catch_unwind(AssertUnwindSafe(|| hook(key))).is_err()
        {
            tracing::error!(key, "Invalidation hook panicked");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoalescerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(coalescer: &Coalescer) -> Arc<Mutex<HashMap<String, usize>>> {
        let counts = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
        let sink = Arc::clone(&counts);
        coalescer.set_hook(Arc::new(move |key: &str| {
            *sink.lock().unwrap().entry(key.to_string()).or_default() += 1;
        }));
        counts
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_window_produces_one_signal() {
        let coalescer = Coalescer::new(Duration::from_millis(500));
        let counts = counting(&coalescer);

        for _ in 0..50 {
            coalescer.signal("invoices");
        }
        assert_eq!(coalescer.pending(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(counts.lock().unwrap().get("invoices"), Some(&1));
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_signals_each_fire() {
        let coalescer = Coalescer::new(Duration::from_millis(500));
        let counts = counting(&coalescer);

        for _ in 0..50 {
            coalescer.signal("invoices");
            tokio::time::sleep(Duration::from_millis(600)).await;
        }
        assert_eq!(counts.lock().unwrap().get("invoices"), Some(&50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_coalesce_independently() {
        let coalescer = Coalescer::new(Duration::from_millis(500));
        let counts = counting(&coalescer);

        for _ in 0..10 {
            coalescer.signal("messages");
            coalescer.signal("conversations");
        }
        tokio::time::sleep(Duration::from_millis(501)).await;

        let counts = counts.lock().unwrap();
        assert_eq!(counts.get("messages"), Some(&1));
        assert_eq!(counts.get("conversations"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_hook_does_not_poison_later_windows() {
        let coalescer = Coalescer::new(Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        coalescer.set_hook(Arc::new(move |_key: &str| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("refetch blew up");
            }
        }));

        coalescer.signal("posts");
        tokio::time::sleep(Duration::from_millis(150)).await;
        coalescer.signal("posts");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
