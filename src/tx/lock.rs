//! Pessimistic per-key lock queues with wound-wait ordering.
//!
//! Waiters for a key are kept in a queue ordered from oldest to youngest
//! transaction id. A new request is validated against the already granted
//! waiters: if a younger transaction holds a conflicting lock the request is
//! rejected immediately instead of waiting, which keeps the wait-for graph
//! acyclic. A read lock can be upgraded to a write lock, but only the oldest
//! read holder of a queue can win an upgrade race; a younger upgrade is
//! invalidated when the older exclusive holder releases.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::types::{Key, TxId};

/// Errors surfaced by lock acquisition and release.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Wound-wait rejected the request, or a pending waiter was invalidated.
    /// `conflicting` names the transaction that won.
    #[error("lock conflict with transaction {conflicting}")]
    Conflict { conflicting: TxId },
    /// A release was issued by a transaction with no record on the key.
    #[error("transaction {tx_id} holds no lock on the key")]
    NotHeld { tx_id: TxId },
}

/// Introspection view of a single waiter, used by tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterView {
    pub tx_id: TxId,
    pub for_read: bool,
    pub upgraded: bool,
    pub locked: bool,
}

struct Waiter {
    for_read: bool,
    upgraded: bool,
    locked: bool,
    /// Present while the waiter is pending; taken when the grant or failure
    /// is signalled.
    signal: Option<oneshot::Sender<Result<(), LockError>>>,
}

impl Waiter {
    fn new(for_read: bool) -> Self {
        Self {
            for_read,
            upgraded: false,
            locked: false,
            signal: None,
        }
    }
}

#[derive(Default)]
struct Queue {
    waiters: BTreeMap<TxId, Waiter>,
    marked_for_remove: bool,
}

/// Completion signals collected under the queue mutex and fired after it is
/// released, so waking a task never runs user code inside the lock.
#[derive(Default)]
struct Notifications {
    granted: Vec<oneshot::Sender<Result<(), LockError>>>,
    failed: Vec<(oneshot::Sender<Result<(), LockError>>, TxId)>,
}

impl Notifications {
    fn fire(self) {
        for sender in self.granted {
            let _ = sender.send(Ok(()));
        }
        for (sender, conflicting) in self.failed {
            let _ = sender.send(Err(LockError::Conflict { conflicting }));
        }
    }
}

enum TryAcquire {
    /// The state was concurrently emptied and removed; retry on a fresh one.
    Obsolete,
    Granted,
    Rejected(TxId),
    Pending(oneshot::Receiver<Result<(), LockError>>),
}

/// Completion handle for a lock request. Resolves when the lock is granted
/// or the request is rejected.
pub struct LockWait {
    tx_id: TxId,
    state: WaitState,
}

enum WaitState {
    Ready(Option<Result<(), LockError>>),
    Pending(oneshot::Receiver<Result<(), LockError>>),
}

impl LockWait {
    fn ready(tx_id: TxId, outcome: Result<(), LockError>) -> Self {
        Self {
            tx_id,
            state: WaitState::Ready(Some(outcome)),
        }
    }

    fn pending(tx_id: TxId, receiver: oneshot::Receiver<Result<(), LockError>>) -> Self {
        Self {
            tx_id,
            state: WaitState::Pending(receiver),
        }
    }
}

impl Future for LockWait {
    type Output = Result<(), LockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let cancelled = Err(LockError::Conflict {
            conflicting: this.tx_id,
        });
        match &mut this.state {
            WaitState::Ready(slot) => Poll::Ready(slot.take().unwrap_or(cancelled)),
            WaitState::Pending(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|received| received.unwrap_or(cancelled)),
        }
    }
}

struct LockState {
    queue: Mutex<Queue>,
}

impl LockState {
    fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
        }
    }

    fn try_acquire_exclusive(&self, tx_id: TxId) -> TryAcquire {
        let mut q = self.queue.lock().expect("lock queue poisoned");
        if q.marked_for_remove {
            return TryAcquire::Obsolete;
        }

        // A restored waiter reinstates a read lock relinquished by an
        // upgrade attempt that wound-wait then rejected.
        let mut restore = None;
        match q.waiters.get_mut(&tx_id) {
            Some(waiter) if waiter.locked => {
                if !waiter.for_read {
                    return TryAcquire::Granted; // reenter
                }
                restore = Some(Waiter {
                    for_read: true,
                    upgraded: false,
                    locked: true,
                    signal: None,
                });
                waiter.for_read = false;
                waiter.upgraded = true;
                waiter.locked = false;
            }
            Some(_) => {
                // Operations within one transaction are serialised by the
                // caller; a second request while the first is still pending
                // conflicts with itself.
                return TryAcquire::Rejected(tx_id);
            }
            None => {
                q.waiters.insert(tx_id, Waiter::new(false));
            }
        }

        // Wound-wait: any younger waiter that already holds the key wins.
        let younger_holder = q
            .waiters
            .range((Bound::Excluded(tx_id), Bound::Unbounded))
            .find(|(_, waiter)| waiter.locked)
            .map(|(id, _)| *id);
        if let Some(conflicting) = younger_holder {
            match restore {
                Some(previous) => {
                    q.waiters.insert(tx_id, previous);
                }
                None => {
                    q.waiters.remove(&tx_id);
                }
            }
            return TryAcquire::Rejected(conflicting);
        }

        if q.waiters.keys().next() == Some(&tx_id) {
            let waiter = q.waiters.get_mut(&tx_id).expect("head waiter present");
            waiter.locked = true;
            waiter.upgraded = false;
            return TryAcquire::Granted;
        }

        let (sender, receiver) = oneshot::channel();
        q.waiters
            .get_mut(&tx_id)
            .expect("inserted waiter present")
            .signal = Some(sender);
        TryAcquire::Pending(receiver)
    }

    fn try_acquire_shared(&self, tx_id: TxId) -> TryAcquire {
        let mut q = self.queue.lock().expect("lock queue poisoned");
        if q.marked_for_remove {
            return TryAcquire::Obsolete;
        }

        match q.waiters.get(&tx_id) {
            // Reenter; a write lock implies a read lock.
            Some(waiter) if waiter.locked => return TryAcquire::Granted,
            Some(_) => return TryAcquire::Rejected(tx_id),
            None => {
                q.waiters.insert(tx_id, Waiter::new(true));
            }
        }

        let younger_writer = q
            .waiters
            .range((Bound::Excluded(tx_id), Bound::Unbounded))
            .find(|(_, waiter)| waiter.locked && !waiter.for_read)
            .map(|(id, _)| *id);
        if let Some(conflicting) = younger_writer {
            q.waiters.remove(&tx_id);
            return TryAcquire::Rejected(conflicting);
        }

        // Granted when there is no older waiter or the immediately older one
        // is a granted reader; the contiguous read prefix follows by
        // induction.
        let granted = match q.waiters.range(..tx_id).next_back() {
            None => true,
            Some((_, previous)) => previous.for_read && previous.locked,
        };
        if granted {
            q.waiters
                .get_mut(&tx_id)
                .expect("inserted waiter present")
                .locked = true;
            return TryAcquire::Granted;
        }

        let (sender, receiver) = oneshot::channel();
        q.waiters
            .get_mut(&tx_id)
            .expect("inserted waiter present")
            .signal = Some(sender);
        TryAcquire::Pending(receiver)
    }

    /// Removes the record for `tx_id`. Returns whether the queue emptied.
    ///
    /// The happy paths are the two holder releases; everything else is a
    /// cancellation: the record disappears, a pending waiter is failed, and
    /// the queue is re-evaluated so anything it blocked can proceed.
    fn release(&self, tx_id: TxId, exclusive: bool) -> Result<(bool, Notifications), LockError> {
        let mut q = self.queue.lock().expect("lock queue poisoned");
        let mut out = Notifications::default();

        let holds_exclusive = q.waiters.keys().next() == Some(&tx_id)
            && q.waiters
                .get(&tx_id)
                .is_some_and(|w| w.locked && !w.for_read);
        let holds_shared = q
            .waiters
            .get(&tx_id)
            .is_some_and(|w| w.locked && w.for_read);

        if exclusive && holds_exclusive {
            q.waiters.remove(&tx_id);
            if q.waiters.is_empty() {
                q.marked_for_remove = true;
                return Ok((true, out));
            }
            Self::promote_after_exclusive(&mut q, tx_id, &mut out);
            return Ok((false, out));
        }

        if !exclusive && holds_shared {
            q.waiters.remove(&tx_id);
            if q.waiters.is_empty() {
                q.marked_for_remove = true;
                return Ok((true, out));
            }
            Self::reevaluate(&mut q, &mut out);
            return Ok((false, out));
        }

        match q.waiters.remove(&tx_id) {
            None => return Err(LockError::NotHeld { tx_id }),
            Some(mut waiter) => {
                if let Some(sender) = waiter.signal.take() {
                    out.failed.push((sender, tx_id));
                }
            }
        }
        if q.waiters.is_empty() {
            q.marked_for_remove = true;
            return Ok((true, out));
        }
        Self::reevaluate(&mut q, &mut out);
        Ok((false, out))
    }

    /// Successor walk after an exclusive holder leaves: a plain exclusive
    /// head takes over; otherwise the contiguous read prefix is granted and
    /// any upgrade in it is invalidated (downgraded back to its read lock).
    fn promote_after_exclusive(q: &mut Queue, released: TxId, out: &mut Notifications) {
        let head_plain_exclusive = q
            .waiters
            .values()
            .next()
            .is_some_and(|w| !w.for_read && !w.upgraded);

        if head_plain_exclusive {
            if let Some(waiter) = q.waiters.values_mut().next() {
                waiter.locked = true;
                if let Some(sender) = waiter.signal.take() {
                    out.granted.push(sender);
                }
            }
            return;
        }

        for waiter in q.waiters.values_mut() {
            if waiter.upgraded {
                waiter.upgraded = false;
                waiter.for_read = true;
                waiter.locked = true;
                if let Some(sender) = waiter.signal.take() {
                    out.failed.push((sender, released));
                }
            } else if !waiter.for_read {
                break;
            } else if !waiter.locked {
                waiter.locked = true;
                if let Some(sender) = waiter.signal.take() {
                    out.granted.push(sender);
                }
            }
        }
    }

    /// Applies the grant rules to the queue after an arbitrary removal.
    fn reevaluate(q: &mut Queue, out: &mut Notifications) {
        let any_locked = q.waiters.values().any(|w| w.locked);
        let mut prefix_read = true;
        for (position, waiter) in q.waiters.values_mut().enumerate() {
            if waiter.locked {
                prefix_read = waiter.for_read;
                if !prefix_read {
                    break;
                }
                continue;
            }
            if waiter.for_read && !waiter.upgraded {
                if !prefix_read {
                    break;
                }
                waiter.locked = true;
                if let Some(sender) = waiter.signal.take() {
                    out.granted.push(sender);
                }
            } else {
                // Exclusive (or pending upgrade): only a sole head proceeds.
                if position == 0 && !any_locked {
                    waiter.locked = true;
                    waiter.upgraded = false;
                    waiter.for_read = false;
                    if let Some(sender) = waiter.signal.take() {
                        out.granted.push(sender);
                    }
                }
                break;
            }
        }
    }

    fn queue_snapshot(&self) -> Vec<TxId> {
        let q = self.queue.lock().expect("lock queue poisoned");
        q.waiters.keys().copied().collect()
    }

    fn waiter_view(&self, tx_id: TxId) -> Option<WaiterView> {
        let q = self.queue.lock().expect("lock queue poisoned");
        q.waiters.get(&tx_id).map(|w| WaiterView {
            tx_id,
            for_read: w.for_read,
            upgraded: w.upgraded,
            locked: w.locked,
        })
    }
}

/// Lock manager holding the global key → queue mapping.
#[derive(Default)]
pub struct LockManager {
    locks: RwLock<HashMap<Key, Arc<LockState>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_of(&self, key: &Key) -> Arc<LockState> {
        if let Some(state) = self.locks.read().expect("lock table poisoned").get(key) {
            return state.clone();
        }
        self.locks
            .write()
            .expect("lock table poisoned")
            .entry(key.clone())
            .or_insert_with(|| Arc::new(LockState::new()))
            .clone()
    }

    fn remove_if_same(&self, key: &Key, state: &Arc<LockState>) {
        let mut table = self.locks.write().expect("lock table poisoned");
        if let Some(current) = table.get(key) {
            if Arc::ptr_eq(current, state) {
                table.remove(key);
            }
        }
    }

    /// Enqueues an exclusive request. The waiter is in the queue when this
    /// returns; the returned handle resolves on grant or rejection.
    pub fn enqueue_exclusive(&self, key: &Key, tx_id: TxId) -> LockWait {
        loop {
            let state = self.state_of(key);
            match state.try_acquire_exclusive(tx_id) {
                TryAcquire::Obsolete => {
                    self.remove_if_same(key, &state);
                    continue;
                }
                TryAcquire::Granted => return LockWait::ready(tx_id, Ok(())),
                TryAcquire::Rejected(conflicting) => {
                    return LockWait::ready(tx_id, Err(LockError::Conflict { conflicting }));
                }
                TryAcquire::Pending(receiver) => return LockWait::pending(tx_id, receiver),
            }
        }
    }

    /// Enqueues a shared request; see [`LockManager::enqueue_exclusive`].
    pub fn enqueue_shared(&self, key: &Key, tx_id: TxId) -> LockWait {
        loop {
            let state = self.state_of(key);
            match state.try_acquire_shared(tx_id) {
                TryAcquire::Obsolete => {
                    self.remove_if_same(key, &state);
                    continue;
                }
                TryAcquire::Granted => return LockWait::ready(tx_id, Ok(())),
                TryAcquire::Rejected(conflicting) => {
                    return LockWait::ready(tx_id, Err(LockError::Conflict { conflicting }));
                }
                TryAcquire::Pending(receiver) => return LockWait::pending(tx_id, receiver),
            }
        }
    }

    pub async fn acquire_exclusive(&self, key: &Key, tx_id: TxId) -> Result<(), LockError> {
        self.enqueue_exclusive(key, tx_id).await
    }

    pub async fn acquire_shared(&self, key: &Key, tx_id: TxId) -> Result<(), LockError> {
        self.enqueue_shared(key, tx_id).await
    }

    pub fn release_exclusive(&self, key: &Key, tx_id: TxId) -> Result<(), LockError> {
        self.release(key, tx_id, true)
    }

    pub fn release_shared(&self, key: &Key, tx_id: TxId) -> Result<(), LockError> {
        self.release(key, tx_id, false)
    }

    fn release(&self, key: &Key, tx_id: TxId, exclusive: bool) -> Result<(), LockError> {
        let state = {
            let table = self.locks.read().expect("lock table poisoned");
            match table.get(key) {
                Some(state) => state.clone(),
                None => return Err(LockError::NotHeld { tx_id }),
            }
        };
        let (emptied, notifications) = state.release(tx_id, exclusive)?;
        if emptied {
            self.remove_if_same(key, &state);
        }
        notifications.fire();
        Ok(())
    }

    /// Transaction ids queued on the key, oldest first.
    pub fn queue(&self, key: &Key) -> Vec<TxId> {
        let table = self.locks.read().expect("lock table poisoned");
        table
            .get(key)
            .map(|state| state.queue_snapshot())
            .unwrap_or_default()
    }

    pub fn waiter(&self, key: &Key, tx_id: TxId) -> Option<WaiterView> {
        let table = self.locks.read().expect("lock table poisoned");
        table.get(key).and_then(|state| state.waiter_view(tx_id))
    }

    /// True when no key has any waiter.
    pub fn is_empty(&self) -> bool {
        self.locks.read().expect("lock table poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn tx(ts: u64) -> TxId {
        TxId::new(ts, 0)
    }

    fn key() -> Key {
        b"k".to_vec()
    }

    async fn assert_pending(wait: &mut LockWait) {
        let outcome = timeout(Duration::from_millis(20), wait).await;
        assert!(outcome.is_err(), "expected the waiter to stay pending");
    }

    #[tokio::test]
    async fn exclusive_grant_and_reenter() {
        let locks = LockManager::new();
        locks.acquire_exclusive(&key(), tx(1)).await.unwrap();
        locks.acquire_exclusive(&key(), tx(1)).await.unwrap();
        locks.acquire_shared(&key(), tx(1)).await.unwrap();

        locks.release_exclusive(&key(), tx(1)).unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn shared_prefix_grants_together() {
        let locks = LockManager::new();
        locks.acquire_shared(&key(), tx(1)).await.unwrap();
        locks.acquire_shared(&key(), tx(2)).await.unwrap();
        locks.acquire_shared(&key(), tx(3)).await.unwrap();
        assert_eq!(locks.queue(&key()), vec![tx(1), tx(2), tx(3)]);

        locks.release_shared(&key(), tx(2)).unwrap();
        locks.release_shared(&key(), tx(1)).unwrap();
        locks.release_shared(&key(), tx(3)).unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn wound_wait_rejects_older_writer() {
        let locks = LockManager::new();
        locks.acquire_exclusive(&key(), tx(5)).await.unwrap();

        let err = locks.acquire_exclusive(&key(), tx(1)).await.unwrap_err();
        assert_eq!(err, LockError::Conflict { conflicting: tx(5) });
        // The rejected request leaves no residue.
        assert_eq!(locks.queue(&key()), vec![tx(5)]);
    }

    #[tokio::test]
    async fn wound_wait_rejects_older_reader_behind_writer() {
        let locks = LockManager::new();
        locks.acquire_exclusive(&key(), tx(5)).await.unwrap();

        let err = locks.acquire_shared(&key(), tx(1)).await.unwrap_err();
        assert_eq!(err, LockError::Conflict { conflicting: tx(5) });
    }

    #[tokio::test]
    async fn younger_writer_waits_for_older_holder() {
        let locks = LockManager::new();
        locks.acquire_exclusive(&key(), tx(1)).await.unwrap();

        let mut wait = locks.enqueue_exclusive(&key(), tx(2));
        assert_pending(&mut wait).await;

        locks.release_exclusive(&key(), tx(1)).unwrap();
        wait.await.unwrap();
        locks.release_exclusive(&key(), tx(2)).unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn readers_grant_after_writer_releases() {
        let locks = LockManager::new();
        locks.acquire_exclusive(&key(), tx(1)).await.unwrap();

        let mut first = locks.enqueue_shared(&key(), tx(2));
        let mut second = locks.enqueue_shared(&key(), tx(3));
        assert_pending(&mut first).await;
        assert_pending(&mut second).await;

        locks.release_exclusive(&key(), tx(1)).unwrap();
        first.await.unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn sole_reader_upgrades_in_place() {
        let locks = LockManager::new();
        locks.acquire_shared(&key(), tx(1)).await.unwrap();
        locks.acquire_exclusive(&key(), tx(1)).await.unwrap();

        let view = locks.waiter(&key(), tx(1)).unwrap();
        assert!(view.locked && !view.for_read && !view.upgraded);
        locks.release_exclusive(&key(), tx(1)).unwrap();
    }

    #[tokio::test]
    async fn upgrade_rejected_while_younger_reader_holds() {
        let locks = LockManager::new();
        locks.acquire_shared(&key(), tx(1)).await.unwrap();
        locks.acquire_shared(&key(), tx(2)).await.unwrap();

        let err = locks.acquire_exclusive(&key(), tx(1)).await.unwrap_err();
        assert_eq!(err, LockError::Conflict { conflicting: tx(2) });

        // The read lock held before the upgrade attempt is restored.
        let view = locks.waiter(&key(), tx(1)).unwrap();
        assert!(view.locked && view.for_read);
    }

    #[tokio::test]
    async fn older_upgrade_invalidates_younger_upgrade_on_release() {
        let locks = LockManager::new();
        locks.acquire_shared(&key(), tx(1)).await.unwrap();
        locks.acquire_shared(&key(), tx(2)).await.unwrap();

        // The younger reader upgrades first and waits.
        let mut younger = locks.enqueue_exclusive(&key(), tx(2));
        assert_pending(&mut younger).await;

        // The older reader upgrades and wins immediately.
        locks.acquire_exclusive(&key(), tx(1)).await.unwrap();

        // Releasing the won exclusive invalidates the younger upgrade and
        // downgrades it back to a granted read lock.
        locks.release_exclusive(&key(), tx(1)).unwrap();
        let err = younger.await.unwrap_err();
        assert_eq!(err, LockError::Conflict { conflicting: tx(1) });

        let view = locks.waiter(&key(), tx(2)).unwrap();
        assert!(view.locked && view.for_read && !view.upgraded);
        locks.release_shared(&key(), tx(2)).unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn younger_upgrade_grants_when_older_reader_leaves() {
        let locks = LockManager::new();
        locks.acquire_shared(&key(), tx(1)).await.unwrap();
        locks.acquire_shared(&key(), tx(2)).await.unwrap();

        let mut upgrade = locks.enqueue_exclusive(&key(), tx(2));
        assert_pending(&mut upgrade).await;

        locks.release_shared(&key(), tx(1)).unwrap();
        upgrade.await.unwrap();

        let view = locks.waiter(&key(), tx(2)).unwrap();
        assert!(view.locked && !view.for_read);
        locks.release_exclusive(&key(), tx(2)).unwrap();
    }

    #[tokio::test]
    async fn cancelling_pending_waiter_unblocks_successors() {
        let locks = LockManager::new();
        locks.acquire_shared(&key(), tx(1)).await.unwrap();

        let mut writer = locks.enqueue_exclusive(&key(), tx(2));
        assert_pending(&mut writer).await;
        let mut reader = locks.enqueue_shared(&key(), tx(3));
        assert_pending(&mut reader).await;

        // Rolling back the pending writer fails its wait and lets the
        // reader join the granted prefix.
        locks.release_exclusive(&key(), tx(2)).unwrap();
        assert!(writer.await.is_err());
        reader.await.unwrap();

        locks.release_shared(&key(), tx(1)).unwrap();
        locks.release_shared(&key(), tx(3)).unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn release_without_record_is_an_error() {
        let locks = LockManager::new();
        let err = locks.release_shared(&key(), tx(7)).unwrap_err();
        assert_eq!(err, LockError::NotHeld { tx_id: tx(7) });
    }

    #[tokio::test]
    async fn queue_state_removed_after_last_release() {
        let locks = LockManager::new();
        locks.acquire_exclusive(&key(), tx(1)).await.unwrap();
        locks.release_exclusive(&key(), tx(1)).unwrap();
        assert!(locks.queue(&key()).is_empty());
        assert!(locks.is_empty());

        // A fresh acquisition after removal starts a new queue.
        locks.acquire_shared(&key(), tx(2)).await.unwrap();
        assert_eq!(locks.queue(&key()), vec![tx(2)]);
    }
}
