use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::RuntimeError;

/// Grants exclusive access to the engine, one [`GenerationSlot`] at a time.
///
/// Backed by a single-permit `tokio` semaphore, whose wait queue is FIFO:
/// sessions are served in the order they started waiting. An optional
/// `max_queue_depth` bounds how many sessions may wait at once; beyond it
/// [`acquire`](Self::acquire) fails immediately with
/// [`RuntimeError::QueueFull`]. The bound is an admission check only:
/// follow-up steps of a request that already got in use
/// [`acquire_admitted`](Self::acquire_admitted), which queues the same way
/// but is never refused.
#[derive(Debug, Clone)]
pub struct GenerationSerializer {
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    granted: Arc<AtomicU64>,
    max_queue_depth: Option<usize>,
}

/// RAII lease on the engine.
///
/// Dropping the slot (on success, error, cancellation or panic unwind)
/// hands the engine to the next waiter.
pub struct GenerationSlot {
    _permit: OwnedSemaphorePermit,
    seq: u64,
    acquired_at: Instant,
}

impl std::fmt::Debug for GenerationSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSlot")
            .field("seq", &self.seq)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl GenerationSlot {
    /// Monotonic grant number, useful to correlate log lines.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Give the engine back. Equivalent to dropping the slot.
    pub fn release(self) {
        trace!(seq = self.seq, held_ms = self.held_for().as_millis() as u64, "slot released");
    }
}

/// Counts one waiting session for as long as it lives.
struct WaitTicket {
    waiting: Arc<AtomicUsize>,
}

impl Drop for WaitTicket {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GenerationSerializer {
    pub fn new(max_queue_depth: Option<usize>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            waiting: Arc::new(AtomicUsize::new(0)),
            granted: Arc::new(AtomicU64::new(0)),
            max_queue_depth,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Wait for exclusive access to the engine.
    ///
    /// Cancel-safe: dropping the returned future removes the caller from the
    /// queue without disturbing anyone else.
    pub async fn acquire(&self) -> Result<GenerationSlot, RuntimeError> {
        self.wait(true).await
    }

    /// Like [`acquire`](Self::acquire), for a request that was already
    /// admitted. Counts as waiting but ignores `max_queue_depth`.
    pub async fn acquire_admitted(&self) -> Result<GenerationSlot, RuntimeError> {
        self.wait(false).await
    }

    async fn wait(&self, bounded: bool) -> Result<GenerationSlot, RuntimeError> {
        if let Some(slot) = self.try_acquire() {
            return Ok(slot);
        }

        let ticket = self.enter_queue(bounded)?;
        debug!(queued = self.queued(), "waiting for generation slot");
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RuntimeError::Closed)?;
        drop(ticket);

        Ok(self.grant(permit))
    }

    /// Take the slot only if nobody holds it and nobody is waiting for it.
    pub fn try_acquire(&self) -> Option<GenerationSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.grant(permit))
    }

    /// Number of sessions currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Whether a slot is currently held.
    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Refuse all future and pending `acquire` calls. Slots already held
    /// remain valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn enter_queue(&self, bounded: bool) -> Result<WaitTicket, RuntimeError> {
        let limit = self.max_queue_depth.filter(|_| bounded);
        self.waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match limit {
                Some(depth) if n >= depth => None,
                _ => Some(n + 1),
            })
            .map_err(|depth| RuntimeError::QueueFull { depth })?;
        Ok(WaitTicket {
            waiting: Arc::clone(&self.waiting),
        })
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> GenerationSlot {
        let seq = self.granted.fetch_add(1, Ordering::SeqCst);
        trace!(seq, "slot granted");
        GenerationSlot {
            _permit: permit,
            seq,
            acquired_at: Instant::now(),
        }
    }
}

impl Default for GenerationSerializer {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    async fn wait_for_queue(serializer: &GenerationSerializer, n: usize) {
        while serializer.queued() != n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn only_one_slot_at_a_time() {
        let serializer = GenerationSerializer::unbounded();
        let slot = serializer.acquire().await.unwrap();
        assert!(serializer.is_busy());
        assert!(serializer.try_acquire().is_none());

        slot.release();
        assert!(!serializer.is_busy());
        assert!(serializer.try_acquire().is_some());
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let serializer = GenerationSerializer::unbounded();
        let held = serializer.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let s = serializer.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _slot = s.acquire().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            wait_for_queue(&serializer, i + 1).await;
        }

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(serializer.queued(), 0);
    }

    #[tokio::test]
    async fn full_queue_is_rejected() {
        let serializer = GenerationSerializer::new(Some(1));
        let held = serializer.acquire().await.unwrap();

        let s = serializer.clone();
        let waiter = tokio::spawn(async move { s.acquire().await.map(|_| ()) });
        wait_for_queue(&serializer, 1).await;

        let err = serializer.acquire().await.unwrap_err();
        assert!(matches!(err, RuntimeError::QueueFull { depth: 1 }));

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn admitted_requests_wait_past_the_bound() {
        let serializer = GenerationSerializer::new(Some(0));
        let held = serializer.acquire().await.unwrap();
        assert!(matches!(
            serializer.acquire().await,
            Err(RuntimeError::QueueFull { depth: 0 })
        ));

        let s = serializer.clone();
        let follow_up = tokio::spawn(async move { s.acquire_admitted().await.map(|slot| slot.seq()) });
        wait_for_queue(&serializer, 1).await;

        drop(held);
        assert_eq!(follow_up.await.unwrap().unwrap(), 1);
        assert_eq!(serializer.queued(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_leaves_the_queue() {
        let serializer = GenerationSerializer::new(Some(1));
        let held = serializer.acquire().await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(10), serializer.acquire()).await;
        assert!(res.is_err());
        assert_eq!(serializer.queued(), 0);

        drop(held);
        assert!(serializer.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn panic_while_holding_releases_the_slot() {
        let serializer = GenerationSerializer::unbounded();
        let s = serializer.clone();
        let res = tokio::spawn(async move {
            let _slot = s.acquire().await.unwrap();
            panic!("boom");
        })
        .await;
        assert!(res.unwrap_err().is_panic());
        assert!(serializer.try_acquire().is_some());
    }

    #[tokio::test]
    async fn closed_serializer_rejects_waiters() {
        let serializer = GenerationSerializer::unbounded();
        let held = serializer.acquire().await.unwrap();
        let s = serializer.clone();
        let waiter = tokio::spawn(async move { s.acquire().await.map(|_| ()) });
        wait_for_queue(&serializer, 1).await;

        serializer.close();
        assert!(matches!(waiter.await.unwrap(), Err(RuntimeError::Closed)));
        drop(held);
    }

    #[tokio::test]
    #[traced_test]
    async fn waiting_is_logged() {
        let serializer = GenerationSerializer::unbounded();
        let _held = serializer.acquire().await.unwrap();
        let res = tokio::time::timeout(Duration::from_millis(10), serializer.acquire()).await;
        assert!(res.is_err());
        assert!(logs_contain("waiting for generation slot"));
    }

    #[tokio::test]
    async fn grants_are_numbered() {
        let serializer = GenerationSerializer::unbounded();
        let a = serializer.acquire().await.unwrap();
        assert_eq!(a.seq(), 0);
        drop(a);
        let b = serializer.acquire().await.unwrap();
        assert_eq!(b.seq(), 1);
    }
}
