//! Single-Flight Module
//!
//! Coalesces concurrent work for the same key: the first caller runs it,
//! everyone who arrives while it is running awaits the same outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

type Slots<O> = HashMap<String, Arc<OnceCell<O>>>;

// == Single Flight ==
/// Per-key in-flight slots.
///
/// The slot map is only locked for map edits, never across an await.
#[derive(Debug)]
pub struct SingleFlight<O> {
    calls: Mutex<Slots<O>>,
}

impl<O> Default for SingleFlight<O> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<O> SingleFlight<O> {
    fn slots(&self) -> MutexGuard<'_, Slots<O>> {
        // A panic while editing the map cannot leave it inconsistent.
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<O: Clone> SingleFlight<O> {
    pub fn new() -> Self {
        Self::default()
    }

    // == Run ==
    /// Runs `work` for `key` unless a run is already in progress, in which
    /// case its outcome is awaited instead.
    ///
    /// Returns the outcome and whether this caller was the one that ran
    /// `work`. If the running caller is dropped mid-flight, one of the
    /// waiters runs its own `work` in its place.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (O, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = O>,
    {
        let cell = self
            .slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let _release = SlotRelease {
            flight: self,
            key,
            cell: &cell,
        };

        let mut led = false;
        let outcome = cell
            .get_or_init(|| {
                led = true;
                work()
            })
            .await
            .clone();

        (outcome, led)
    }

    /// Number of keys with a run in progress.
    pub fn in_flight(&self) -> usize {
        self.slots().len()
    }

    /// Forgets every slot. Runs already in progress still complete for the
    /// callers awaiting them.
    pub fn clear(&self) {
        self.slots().clear();
    }
}

/// Drops a key's slot when its caller finishes or is cancelled.
///
/// The slot stays while another caller still waits on it unfinished, so
/// that waiter can take the run over.
struct SlotRelease<'a, O> {
    flight: &'a SingleFlight<O>,
    key: &'a str,
    cell: &'a Arc<OnceCell<O>>,
}

impl<O> Drop for SlotRelease<'_, O> {
    fn drop(&mut self) {
        let mut calls = self.flight.slots();
        let ours = calls
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, self.cell));
        // Two references: the map's and this caller's.
        let unwatched = Arc::strong_count(self.cell) <= 2;
        if ours && (self.cell.initialized() || unwatched) {
            calls.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flight: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("hotel:SYD", || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (value, led) = handle.await.unwrap();
            assert_eq!(value, 7);
            if led {
                leaders += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flight: SingleFlight<usize> = SingleFlight::new();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let (_, led) = flight
                .run("k", || async { runs.fetch_add(1, Ordering::SeqCst) })
                .await;
            assert!(led);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_slot() {
        let flight: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("flight:SYD:MEL", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(flight.in_flight(), 1);

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waiter_takes_over_when_leader_is_dropped() {
        let flight: Arc<SingleFlight<&'static str>> = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        "never"
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("k", || async { "waiter" }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let (value, led) = waiter.await.unwrap();
        assert_eq!(value, "waiter");
        assert!(led);
    }
}
