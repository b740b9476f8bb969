use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

struct ScheduledTask {
    token: u64,
    task: JoinHandle<()>,
}

struct SchedulerInner {
    debounce: Duration,
    timers: Mutex<HashMap<String, ScheduledTask>>,
    next_token: AtomicU64,
}

impl SchedulerInner {
    fn timers(&self) -> MutexGuard<'_, HashMap<String, ScheduledTask>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget the timer of a room, unless it has been replaced by a newer one.
    fn clear(&self, room_id: &str, token: u64) {
        let mut timers = self.timers();
        if timers.get(room_id).is_some_and(|t| t.token == token) {
            timers.remove(room_id);
        }
    }
}

/// Per-room delayed tasks, at most one pending per room.
///
/// Used to debounce document saves: each change resets the room's timer, so a
/// burst of edits produces a single save once the room has been quiet for the
/// debounce interval.
#[derive(Clone)]
pub struct PersistenceScheduler {
    inner: Arc<SchedulerInner>,
}

impl PersistenceScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                debounce,
                timers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// A room changed: restart its timer at the debounce interval.
    pub fn on_change<F, Fut>(&self, room_id: &str, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(room_id, self.inner.debounce, task);
    }

    /// Run `task` after `delay`, replacing any task still pending for the room.
    ///
    /// The timer entry is cleared before `task` starts, so a task that is
    /// already running is never aborted by a later `schedule` or `cancel`.
    pub fn schedule<F, Fut>(&self, room_id: &str, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let room = room_id.to_string();

        let mut timers = self.inner.timers();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.clear(&room, token);
            }
            task().await;
        });

        if let Some(previous) = timers.insert(room_id.to_string(), ScheduledTask { token, task: handle }) {
            previous.task.abort();
            debug!("Reset pending save timer for room {}", room_id);
        }
    }

    /// Drop the pending task of a room. Returns whether one was pending.
    pub fn cancel(&self, room_id: &str) -> bool {
        match self.inner.timers().remove(room_id) {
            Some(scheduled) => {
                scheduled.task.abort();
                debug!("Cancelled pending save timer for room {}", room_id);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, room_id: &str) -> bool {
        self.inner.timers().contains_key(room_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.timers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::sleep;

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    fn bump(count: &Arc<AtomicU32>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_runs_once() {
        let scheduler = PersistenceScheduler::new(Duration::from_millis(2500));
        let fired = counter();

        for _ in 0..10 {
            scheduler.on_change("r1", bump(&fired));
            sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_pending("r1"));

        sleep(Duration::from_millis(2600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn rooms_are_debounced_independently() {
        let scheduler = PersistenceScheduler::new(Duration::from_millis(500));
        let a = counter();
        let b = counter();

        scheduler.on_change("a", bump(&a));
        scheduler.on_change("b", bump(&b));
        assert_eq!(scheduler.pending_count(), 2);

        sleep(Duration::from_millis(600)).await;
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_the_task() {
        let scheduler = PersistenceScheduler::new(Duration::from_millis(500));
        let fired = counter();

        scheduler.on_change("r1", bump(&fired));
        assert!(scheduler.cancel("r1"));
        assert!(!scheduler.cancel("r1"));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn running_task_survives_a_new_schedule() {
        let scheduler = PersistenceScheduler::new(Duration::from_millis(100));
        let finished = counter();

        let done = finished.clone();
        scheduler.on_change("r1", move || async move {
            sleep(Duration::from_secs(1)).await;
            done.fetch_add(1, Ordering::SeqCst);
        });

        // First task is now inside its body
        sleep(Duration::from_millis(150)).await;
        assert!(!scheduler.is_pending("r1"));

        scheduler.on_change("r1", bump(&finished));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }
}
