//! Progress, trigger and cancellation.
//!
//! The completion engine is split in two so callers control where their
//! callbacks run: [`Class::progress`] drives the transport and detects
//! completions without ever invoking user code, and [`Context::trigger`]
//! drains detected completions and runs the callbacks on the calling
//! thread. Cancellation is asynchronous; a successfully canceled operation
//! still completes through the normal trigger path, with
//! [`Error::Canceled`] as its status.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::class::Class;
use crate::config::{MAX_IDLE_TIME, NO_BLOCK};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::op::OpId;

impl Class {
    /// Drive the transport for up to `timeout_ms` milliseconds.
    ///
    /// Returns `Ok(())` once at least one completion is ready to trigger,
    /// `Err(Timeout)` when the timeout elapses with nothing to do. With the
    /// `NO_BLOCK` progress mode the timeout is ignored and the call polls
    /// exactly once.
    pub fn progress(&self, context: &Context, timeout_ms: u32) -> Result<()> {
        self.check_context(context)?;

        // Completions already waiting: poke the transport without blocking
        // and report ready either way.
        if !context.queue.is_empty() {
            match self.inner.plugin.progress(context.plugin_ctx()?, 0) {
                Ok(()) | Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        if self.inner.progress_mode & NO_BLOCK != 0 {
            return self.inner.plugin.progress(context.plugin_ctx()?, 0);
        }

        // Wait in bounded slices, re-checking the completion queue between
        // them: another thread's submission may complete inline and enqueue
        // on this context without the transport reporting anything here.
        let timeout = timeout_ms.min(MAX_IDLE_TIME);
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout));
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.as_millis().min(100) as u32;
            match self.inner.plugin.progress(context.plugin_ctx()?, slice) {
                Ok(()) => return Ok(()),
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
            if !context.queue.is_empty() {
                return Ok(());
            }
            if remaining <= Duration::from_millis(u64::from(slice)) {
                return Err(Error::Timeout);
            }
        }
    }

    /// Request early termination of an in-flight operation.
    ///
    /// Best effort: an operation whose completion the transport has already
    /// committed to completes normally. Canceling an idle or already
    /// completed operation is a harmless no-op.
    pub fn cancel(&self, context: &Context, op: &OpId) -> Result<()> {
        self.check_context(context)?;
        if !op.is_in_flight() {
            return Ok(());
        }
        self.inner.plugin.cancel(context.plugin_ctx()?, op)
    }

    /// Waitable file descriptor for integrating progress into an external
    /// event loop, when the plugin supports one.
    pub fn poll_get_fd(&self, context: &Context) -> Result<Option<RawFd>> {
        self.check_context(context)?;
        Ok(self.inner.plugin.poll_get_fd(context.plugin_ctx()?))
    }

    /// True when blocking on the poll descriptor is safe. False means work
    /// is already actionable and progress should run first.
    pub fn poll_try_wait(&self, context: &Context) -> Result<bool> {
        self.check_context(context)?;
        if !context.queue.is_empty() {
            return Ok(false);
        }
        Ok(self.inner.plugin.poll_try_wait(context.plugin_ctx()?))
    }
}

impl Context {
    /// Run ready completion callbacks on the calling thread.
    ///
    /// Waits up to `timeout_ms` for the first completion, then drains
    /// without waiting until the queue is empty or `rets` is full. Each
    /// callback's return value lands in the corresponding `rets` slot; the
    /// number of callbacks run is returned. `Err(Timeout)` means no
    /// completion became ready in time.
    pub fn trigger(&self, timeout_ms: u32, rets: &mut [i32]) -> Result<usize> {
        if rets.is_empty() {
            return Ok(0);
        }

        let first = self
            .queue
            .pop_wait(Duration::from_millis(u64::from(timeout_ms)))
            .ok_or(Error::Timeout)?;
        rets[0] = (first.cb)(&first.info);
        let mut count = 1;

        while count < rets.len() {
            match self.queue.try_pop() {
                Some(ready) => {
                    rets[count] = (ready.cb)(&ready.info);
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}
