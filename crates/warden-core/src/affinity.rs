//! Affinity reservations: pin a logical task to one worker.
//!
//! The first execution under a reservation binds it to the worker that
//! serves it; every later execution under the same task id, including ones
//! issued from inside that first execution's callback, reuses the binding.
//! Concurrent first executions serialize on the binding instead of racing to
//! create two.

use std::future::Future;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;

use crate::error::ProtocolFault;
use crate::sync::lock;

/// One reservation. `B` is the backend's binding (e.g. a worker session).
pub struct Reservation<B> {
    task_id: String,
    binding: OnceCell<B>,
}

impl<B> Reservation<B> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_bound(&self) -> bool {
        self.binding.initialized()
    }

    /// Return the binding, establishing it with `bind` if this is the first use.
    ///
    /// Callers arriving while another caller is binding wait for that result.
    /// A failed `bind` leaves the reservation unbound for the next caller.
    pub async fn bind_with<F, Fut, E>(&self, bind: F) -> Result<&B, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<B, E>>,
    {
        self.binding.get_or_try_init(bind).await
    }
}

/// Reservations owned by one pool.
pub struct ReservationTable<B> {
    entries: Mutex<FxHashMap<String, Arc<Reservation<B>>>>,
}

impl<B> Default for ReservationTable<B> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<B> ReservationTable<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, task_id: &str) -> Result<(), ProtocolFault> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(task_id) {
            return Err(ProtocolFault::AlreadyReserved(task_id.to_string()));
        }
        entries.insert(
            task_id.to_string(),
            Arc::new(Reservation {
                task_id: task_id.to_string(),
                binding: OnceCell::new(),
            }),
        );
        tracing::debug!("Reserved task {}", task_id);
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<Reservation<B>>> {
        lock(&self.entries).get(task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        lock(&self.entries).contains_key(task_id)
    }

    /// Drop the reservation. The binding is torn down once executions still
    /// running under it let go of it.
    ///
    /// Releasing a reservation that never bound still removes it, but is
    /// reported as [`ProtocolFault::ReservationUnbound`].
    pub fn release(&self, task_id: &str) -> Result<(), ProtocolFault> {
        let Some(reservation) = lock(&self.entries).remove(task_id) else {
            return Err(ProtocolFault::ReservationNotFound(task_id.to_string()));
        };
        tracing::debug!("Released task {}", task_id);
        if reservation.is_bound() {
            Ok(())
        } else {
            Err(ProtocolFault::ReservationUnbound(task_id.to_string()))
        }
    }

    /// Drop every reservation.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_double_reserve_fails() {
        let table = ReservationTable::<u32>::new();
        table.reserve("a").unwrap();
        assert_eq!(
            table.reserve("a"),
            Err(ProtocolFault::AlreadyReserved("a".to_string()))
        );
    }

    #[test]
    fn test_release_unknown_fails() {
        let table = ReservationTable::<u32>::new();
        assert_eq!(
            table.release("ghost"),
            Err(ProtocolFault::ReservationNotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_release_bound_then_again() {
        let table = ReservationTable::<u32>::new();
        table.reserve("a").unwrap();
        let reservation = table.get("a").unwrap();
        reservation.bind_with(|| async { Ok::<_, ()>(7) }).await.unwrap();

        assert_eq!(table.release("a"), Ok(()));
        assert!(table.release("a").is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_unbound_is_reported_but_removed() {
        let table = ReservationTable::<u32>::new();
        table.reserve("a").unwrap();
        assert_eq!(
            table.release("a"),
            Err(ProtocolFault::ReservationUnbound("a".to_string()))
        );
        assert!(!table.contains("a"));
        // The id can be reserved again.
        table.reserve("a").unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_binders_share_one_binding() {
        let table = ReservationTable::<usize>::new();
        table.reserve("t").unwrap();
        let reservation = table.get("t").unwrap();
        let binds = Arc::new(AtomicUsize::new(0));

        let bind = |binds: Arc<AtomicUsize>| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, ()>(binds.fetch_add(1, Ordering::SeqCst))
        };

        let (a, b) = tokio::join!(
            reservation.bind_with(|| bind(Arc::clone(&binds))),
            reservation.bind_with(|| bind(Arc::clone(&binds))),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_unbound() {
        let table = ReservationTable::<u32>::new();
        table.reserve("t").unwrap();
        let reservation = table.get("t").unwrap();

        let failed = reservation.bind_with(|| async { Err::<u32, _>("no worker") }).await;
        assert!(failed.is_err());
        assert!(!reservation.is_bound());

        let bound = reservation.bind_with(|| async { Ok::<_, &str>(3) }).await;
        assert_eq!(bound, Ok(&3));
    }
}
