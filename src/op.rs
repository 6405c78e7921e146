//! Operation IDs and the completion queue.
//!
//! An [`OpId`] is a caller-owned, reusable token representing one in-flight
//! asynchronous request. The caller allocates it once through
//! [`Class::op_create`](crate::Class::op_create) and reuses it across
//! submissions, which keeps allocation off the hot path. The token is
//! reference counted: plugins hold their own reference while an operation is
//! in flight, so dropping an `OpId` never frees state a racing completion
//! still needs.
//!
//! Completion is a single-assignment slot under a mutex, guarded by a
//! per-submission generation: the first of {natural completion, cancellation}
//! claims the callback and enqueues it on the context's completion queue; the
//! loser observes an already-resolved slot and does nothing. Exactly one
//! callback fires per submission, never two, never zero.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::addr::Addr;
use crate::config::Tag;
use crate::error::{Error, Result};

/// Callback operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbType {
    /// Unexpected send completed.
    SendUnexpected,
    /// Unexpected receive completed.
    RecvUnexpected,
    /// Expected send completed.
    SendExpected,
    /// Expected receive completed.
    RecvExpected,
    /// Put completed.
    Put,
    /// Get completed.
    Get,
}

/// Type-specific completion payload.
#[derive(Debug, Clone)]
pub enum CbPayload {
    /// No additional payload (sends, put, get).
    None,
    /// Unexpected receive: actual size, source peer and tag.
    RecvUnexpected {
        actual_buf_size: usize,
        source: Addr,
        tag: Tag,
    },
    /// Expected receive: actual size.
    RecvExpected { actual_buf_size: usize },
}

/// Immutable result record delivered once per completed operation.
#[derive(Debug, Clone)]
pub struct CbInfo {
    /// Which operation kind completed.
    pub cb_type: CbType,
    /// Completion status. `Err(Error::Canceled)` marks a canceled operation.
    pub ret: Result<()>,
    /// Type-specific payload.
    pub info: CbPayload,
}

/// User callback invoked by [`Context::trigger`](crate::Context::trigger).
///
/// The integer return value is advisory only (reserved for future chaining)
/// and is reported back through the trigger return array.
pub type Callback = Box<dyn FnOnce(&CbInfo) -> i32 + Send + 'static>;

/// The completion slot. `gen` counts submissions; a resolution only acts
/// when its generation matches and the callback is still present.
struct OpSlot {
    gen: u64,
    inflight: Option<(CbType, Callback)>,
}

pub(crate) struct OpCore {
    slot: Mutex<OpSlot>,
}

/// Reusable token for one outstanding asynchronous operation.
///
/// Must not be submitted to two operations simultaneously; a second
/// submission while in flight fails with [`Error::Busy`].
pub struct OpId {
    pub(crate) core: Arc<OpCore>,
}

impl OpId {
    pub(crate) fn new() -> Self {
        OpId {
            core: Arc::new(OpCore {
                slot: Mutex::new(OpSlot {
                    gen: 0,
                    inflight: None,
                }),
            }),
        }
    }

    /// True while a submission has not yet completed or been canceled.
    pub fn is_in_flight(&self) -> bool {
        self.core.slot.lock().inflight.is_some()
    }
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpId")
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

/// Live submission handle passed to plugins.
///
/// Holds a reference on the operation core and the destination completion
/// queue. Plugins stash this in their pending tables and resolve it exactly
/// once through [`Submission::complete`]; the completion-slot protocol makes
/// a second resolution (e.g. a cancel racing a natural completion) a no-op.
///
/// A plugin that fails a submit call must return the error without
/// completing; the dispatch layer reverts the operation to idle.
pub struct Submission {
    pub(crate) op: Arc<OpCore>,
    pub(crate) queue: Arc<CompletionQueue>,
    pub(crate) gen: u64,
}

impl Submission {
    /// Claim the in-flight callback and enqueue it on the completion queue.
    ///
    /// Returns true if this call won the completion slot, false if the
    /// submission had already been resolved. Safe to call from any thread;
    /// a second call (or a cancel racing this one) is a no-op.
    pub fn complete(&self, ret: Result<()>, info: CbPayload) -> bool {
        let claimed = {
            let mut slot = self.op.slot.lock();
            if slot.gen == self.gen {
                slot.inflight.take()
            } else {
                None
            }
        };
        match claimed {
            Some((cb_type, cb)) => {
                self.queue.push(Ready {
                    cb,
                    info: CbInfo { cb_type, ret, info },
                });
                true
            }
            None => false,
        }
    }

    /// True if this submission refers to the given operation ID. Backends
    /// use this to locate the pending entry named by a cancel request.
    pub fn matches(&self, op: &OpId) -> bool {
        Arc::ptr_eq(&self.op, &op.core)
    }
}

/// Move an idle operation into the in-flight state.
///
/// Fails with [`Error::Busy`] if the operation is already submitted.
pub(crate) fn submit(
    op: &OpId,
    queue: Arc<CompletionQueue>,
    cb_type: CbType,
    cb: Callback,
) -> Result<Submission> {
    let mut slot = op.core.slot.lock();
    if slot.inflight.is_some() {
        return Err(Error::Busy);
    }
    slot.gen = slot.gen.wrapping_add(1);
    slot.inflight = Some((cb_type, cb));
    Ok(Submission {
        op: Arc::clone(&op.core),
        queue,
        gen: slot.gen,
    })
}

/// Revert a submission whose plugin call failed synchronously. The callback
/// is dropped; the caller sees the submit error instead of a completion.
pub(crate) fn revert(op: &OpId, gen: u64) {
    let mut slot = op.core.slot.lock();
    if slot.gen == gen {
        slot.inflight = None;
    }
}

/// One ready callback invocation.
pub(crate) struct Ready {
    pub(crate) cb: Callback,
    pub(crate) info: CbInfo,
}

/// Per-context queue of ready callbacks.
///
/// Produced by progress (and by submissions that complete inline), drained
/// by trigger. FIFO within the queue; no ordering is guaranteed across
/// operation kinds beyond exactly-once execution.
pub struct CompletionQueue {
    inner: Mutex<VecDeque<Ready>>,
    cond: Condvar,
}

impl CompletionQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(CompletionQueue {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn push(&self, ready: Ready) {
        let mut q = self.inner.lock();
        q.push_back(ready);
        self.cond.notify_one();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Pop one entry, waiting up to `timeout` when the queue is empty.
    pub(crate) fn pop_wait(&self, timeout: Duration) -> Option<Ready> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inner.lock();
        loop {
            if let Some(ready) = q.pop_front() {
                return Some(ready);
            }
            if timeout.is_zero() {
                return None;
            }
            if self.cond.wait_until(&mut q, deadline).timed_out() {
                return q.pop_front();
            }
        }
    }

    /// Pop one entry without waiting.
    pub(crate) fn try_pop(&self) -> Option<Ready> {
        self.inner.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_cb() -> Callback {
        Box::new(|_info| 0)
    }

    #[test]
    fn submit_then_complete_delivers_once() {
        let queue = CompletionQueue::new();
        let op = OpId::new();

        let sub = submit(&op, queue.clone(), CbType::SendExpected, noop_cb()).unwrap();
        assert!(op.is_in_flight());

        assert!(sub.complete(Ok(()), CbPayload::None));
        assert!(!op.is_in_flight());
        assert_eq!(queue.len(), 1);

        // Second resolution loses the race and enqueues nothing.
        assert!(!sub.complete(Err(Error::Canceled), CbPayload::None));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn double_submit_is_busy() {
        let queue = CompletionQueue::new();
        let op = OpId::new();

        let _sub = submit(&op, queue.clone(), CbType::Put, noop_cb()).unwrap();
        assert!(matches!(
            submit(&op, queue.clone(), CbType::Put, noop_cb()),
            Err(Error::Busy)
        ));
    }

    #[test]
    fn op_is_reusable_after_completion() {
        let queue = CompletionQueue::new();
        let op = OpId::new();

        for _ in 0..3 {
            let sub = submit(&op, queue.clone(), CbType::Get, noop_cb()).unwrap();
            assert!(sub.complete(Ok(()), CbPayload::None));
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn reverted_submission_is_idle_again() {
        let queue = CompletionQueue::new();
        let op = OpId::new();

        let sub = submit(&op, queue.clone(), CbType::SendUnexpected, noop_cb()).unwrap();
        let gen = sub.gen;
        drop(sub);
        revert(&op, gen);
        assert!(!op.is_in_flight());
        assert_eq!(queue.len(), 0);

        // Resubmission works after a revert.
        let sub = submit(&op, queue.clone(), CbType::SendUnexpected, noop_cb()).unwrap();
        assert!(sub.complete(Ok(()), CbPayload::None));
    }

    #[test]
    fn stale_submission_cannot_touch_a_resubmitted_op() {
        let queue = CompletionQueue::new();
        let op = OpId::new();

        let stale = submit(&op, queue.clone(), CbType::Put, noop_cb()).unwrap();
        assert!(stale.complete(Ok(()), CbPayload::None));

        // Reuse the op; the retained stale handle must not resolve it.
        let fresh = submit(&op, queue.clone(), CbType::Get, noop_cb()).unwrap();
        assert!(!stale.complete(Err(Error::Canceled), CbPayload::None));
        assert!(op.is_in_flight());
        assert!(fresh.complete(Ok(()), CbPayload::None));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn concurrent_complete_cancel_single_delivery() {
        use std::thread;

        for _ in 0..64 {
            let queue = CompletionQueue::new();
            let op = OpId::new();
            let sub = submit(&op, queue.clone(), CbType::RecvExpected, noop_cb()).unwrap();
            let sub = Arc::new(sub);

            let s1 = Arc::clone(&sub);
            let s2 = Arc::clone(&sub);
            let t1 = thread::spawn(move || s1.complete(Ok(()), CbPayload::None));
            let t2 = thread::spawn(move || s2.complete(Err(Error::Canceled), CbPayload::None));
            let won1 = t1.join().unwrap();
            let won2 = t2.join().unwrap();

            assert!(won1 ^ won2, "exactly one resolution must win");
            assert_eq!(queue.len(), 1);
        }
    }

    #[test]
    fn pop_wait_times_out_on_empty_queue() {
        let queue = CompletionQueue::new();
        assert!(queue.pop_wait(Duration::from_millis(10)).is_none());
        assert!(queue.try_pop().is_none());
    }
}
