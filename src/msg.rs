//! Message buffers and the expected/unexpected message channels.
//!
//! [`MsgBuf`] owns an aligned allocation suitable for transport use and may
//! carry plugin-private per-buffer state. Buffers handed to an asynchronous
//! send or receive stay internally referenced until the operation resolves,
//! so an early free by the caller can never tear memory out from under an
//! in-flight transfer; the caller contract remains "do not touch the buffer
//! until the completion fires".

use std::alloc::{alloc, dealloc, Layout};
use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::addr::Addr;
use crate::class::Class;
use crate::config::Tag;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::op::{self, CbInfo, CbType, OpId};

/// Alignment for message buffers (cache line aligned).
pub const MSG_BUF_ALIGN: usize = 64;

/// Raw aligned allocation shared between a buffer and in-flight operations.
struct RawBuf {
    ptr: NonNull<u8>,
    capacity: usize,
}

// The allocation is plain bytes; all mutation goes through raw-pointer
// copies whose exclusivity is the documented caller contract.
unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

impl RawBuf {
    fn layout(capacity: usize) -> Result<Layout> {
        Layout::from_size_align(capacity, MSG_BUF_ALIGN)
            .map_err(|_| Error::InvalidArg("invalid buffer layout".into()))
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        // Layout was validated at allocation time.
        if let Ok(layout) = RawBuf::layout(self.capacity) {
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// Shared view of a buffer captured by an in-flight operation.
#[derive(Clone)]
pub struct BufShare {
    data: Arc<RawBuf>,
}

impl BufShare {
    /// Capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.data.capacity
    }

    /// Copy `src` into the buffer at `offset`. Bounds are the caller's
    /// responsibility within the plugin.
    pub fn copy_in(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.data.capacity);
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.data.ptr.as_ptr().add(offset),
                src.len(),
            );
        }
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn copy_out(&self, offset: usize, len: usize, dst: &mut Vec<u8>) {
        debug_assert!(offset + len <= self.data.capacity);
        let start = dst.len();
        dst.resize(start + len, 0);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.ptr.as_ptr().add(offset),
                dst.as_mut_ptr().add(start),
                len,
            );
        }
    }
}

/// A message buffer obtained from [`Class::msg_buf_alloc`].
///
/// The usable payload begins after the plugin's header prefix (see
/// [`Class::msg_get_unexpected_header_size`]); `msg_init_unexpected` /
/// `msg_init_expected` must run once per buffer before its first use so the
/// plugin can stamp that prefix.
pub struct MsgBuf {
    data: Arc<RawBuf>,
    plugin_data: Option<Box<dyn Any + Send + Sync>>,
}

impl MsgBuf {
    /// Allocate an unregistered, cache-aligned buffer.
    pub(crate) fn alloc(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArg("buffer capacity cannot be 0".into()));
        }
        let layout = RawBuf::layout(capacity)?;
        let ptr = unsafe {
            let ptr = alloc(layout);
            match NonNull::new(ptr) {
                Some(p) => p,
                None => return Err(Error::NoMem),
            }
        };
        Ok(MsgBuf {
            data: Arc::new(RawBuf { ptr, capacity }),
            plugin_data: None,
        })
    }

    /// Total capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity
    }

    /// The buffer contents as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.ptr.as_ptr(), self.data.capacity) }
    }

    /// The buffer contents as a mutable byte slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.ptr.as_ptr(), self.data.capacity) }
    }

    /// Buffer base address (for diagnostics and plugin use).
    #[inline]
    pub fn addr(&self) -> u64 {
        self.data.ptr.as_ptr() as u64
    }

    /// Plugin-private per-buffer state, if any.
    pub fn plugin_data(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.plugin_data.as_deref()
    }

    /// Attach plugin-private per-buffer state.
    pub fn set_plugin_data(&mut self, data: Box<dyn Any + Send + Sync>) {
        self.plugin_data = Some(data);
    }

    /// Shared view handed to in-flight operations.
    pub(crate) fn share(&self) -> BufShare {
        BufShare {
            data: Arc::clone(&self.data),
        }
    }
}

impl Class {
    /// Maximum unexpected-message buffer size.
    pub fn msg_get_max_unexpected_size(&self) -> usize {
        self.inner.plugin.msg_max_unexpected_size()
    }

    /// Maximum expected-message buffer size.
    pub fn msg_get_max_expected_size(&self) -> usize {
        self.inner.plugin.msg_max_expected_size()
    }

    /// Plugin header prefix length in unexpected-message buffers; the user
    /// payload begins immediately after it.
    pub fn msg_get_unexpected_header_size(&self) -> usize {
        self.inner.plugin.msg_unexpected_header_size()
    }

    /// Plugin header prefix length in expected-message buffers.
    pub fn msg_get_expected_header_size(&self) -> usize {
        self.inner.plugin.msg_expected_header_size()
    }

    /// Maximum tag value usable by send/recv.
    pub fn msg_get_max_tag(&self) -> Tag {
        self.inner.plugin.msg_max_tag()
    }

    /// Allocate a transport-appropriate message buffer.
    pub fn msg_buf_alloc(&self, buf_size: usize) -> Result<MsgBuf> {
        self.inner.plugin.msg_buf_alloc(buf_size)
    }

    /// Release a buffer obtained from [`Class::msg_buf_alloc`].
    pub fn msg_buf_free(&self, buf: MsgBuf) -> Result<()> {
        self.inner.plugin.msg_buf_free(buf)
    }

    /// Prepare a buffer for its first use with unexpected sends.
    pub fn msg_init_unexpected(&self, buf: &mut MsgBuf) -> Result<()> {
        self.inner.plugin.msg_init_unexpected(buf)
    }

    /// Prepare a buffer for its first use with expected sends.
    pub fn msg_init_expected(&self, buf: &mut MsgBuf) -> Result<()> {
        self.inner.plugin.msg_init_expected(buf)
    }

    /// Post an unexpected send.
    ///
    /// Unexpected sends need no matching receive at the destination and the
    /// destination may drop the message without notification; the send still
    /// completes successfully from the sender's perspective. Success of this
    /// call means submitted; completion arrives through progress/trigger.
    #[allow(clippy::too_many_arguments)]
    pub fn msg_send_unexpected<F>(
        &self,
        context: &Context,
        callback: F,
        buf: &MsgBuf,
        buf_size: usize,
        dest_addr: &Addr,
        dest_id: u8,
        tag: Tag,
        op_id: &OpId,
    ) -> Result<()>
    where
        F: FnOnce(&CbInfo) -> i32 + Send + 'static,
    {
        self.check_context(context)?;
        self.check_msg(buf, buf_size, tag, self.msg_get_max_unexpected_size())?;
        let sub = op::submit(op_id, context.queue_arc(), CbType::SendUnexpected, Box::new(callback))?;
        let gen = sub.gen;
        self.inner
            .plugin
            .msg_send_unexpected(context.plugin_ctx()?, sub, buf.share(), buf_size, dest_addr, dest_id, tag)
            .inspect_err(|_| op::revert(op_id, gen))
    }

    /// Post an unexpected receive, matching any source and any tag. The
    /// completion reports the actual size, source address and tag.
    pub fn msg_recv_unexpected<F>(
        &self,
        context: &Context,
        callback: F,
        buf: &MsgBuf,
        op_id: &OpId,
    ) -> Result<()>
    where
        F: FnOnce(&CbInfo) -> i32 + Send + 'static,
    {
        self.check_context(context)?;
        let sub = op::submit(op_id, context.queue_arc(), CbType::RecvUnexpected, Box::new(callback))?;
        let gen = sub.gen;
        self.inner
            .plugin
            .msg_recv_unexpected(context.plugin_ctx()?, sub, buf.share())
            .inspect_err(|_| op::revert(op_id, gen))
    }

    /// Post an expected send. Requires a matching receive already posted at
    /// the destination; without one the message may be dropped silently.
    #[allow(clippy::too_many_arguments)]
    pub fn msg_send_expected<F>(
        &self,
        context: &Context,
        callback: F,
        buf: &MsgBuf,
        buf_size: usize,
        dest_addr: &Addr,
        dest_id: u8,
        tag: Tag,
        op_id: &OpId,
    ) -> Result<()>
    where
        F: FnOnce(&CbInfo) -> i32 + Send + 'static,
    {
        self.check_context(context)?;
        self.check_msg(buf, buf_size, tag, self.msg_get_max_expected_size())?;
        let sub = op::submit(op_id, context.queue_arc(), CbType::SendExpected, Box::new(callback))?;
        let gen = sub.gen;
        self.inner
            .plugin
            .msg_send_expected(context.plugin_ctx()?, sub, buf.share(), buf_size, dest_addr, dest_id, tag)
            .inspect_err(|_| op::revert(op_id, gen))
    }

    /// Post an expected receive matching `source_addr`, `source_id` and
    /// `tag`.
    #[allow(clippy::too_many_arguments)]
    pub fn msg_recv_expected<F>(
        &self,
        context: &Context,
        callback: F,
        buf: &MsgBuf,
        source_addr: &Addr,
        source_id: u8,
        tag: Tag,
        op_id: &OpId,
    ) -> Result<()>
    where
        F: FnOnce(&CbInfo) -> i32 + Send + 'static,
    {
        self.check_context(context)?;
        if tag > self.msg_get_max_tag() {
            return Err(Error::InvalidArg(format!("tag {} out of range", tag)));
        }
        let sub = op::submit(op_id, context.queue_arc(), CbType::RecvExpected, Box::new(callback))?;
        let gen = sub.gen;
        self.inner
            .plugin
            .msg_recv_expected(context.plugin_ctx()?, sub, buf.share(), source_addr, source_id, tag)
            .inspect_err(|_| op::revert(op_id, gen))
    }

    fn check_msg(&self, buf: &MsgBuf, buf_size: usize, tag: Tag, max: usize) -> Result<()> {
        if buf_size > buf.capacity() {
            return Err(Error::InvalidArg(format!(
                "buf_size {} exceeds buffer capacity {}",
                buf_size,
                buf.capacity()
            )));
        }
        if buf_size > max {
            return Err(Error::MsgSize { size: buf_size, max });
        }
        if tag > self.msg_get_max_tag() {
            return Err(Error::InvalidArg(format!("tag {} out of range", tag)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_sized() {
        let buf = MsgBuf::alloc(4096).unwrap();
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.addr() % MSG_BUF_ALIGN as u64, 0);
        assert_eq!(buf.as_slice().len(), 4096);
    }

    #[test]
    fn zero_sized_alloc_is_rejected() {
        assert!(MsgBuf::alloc(0).is_err());
    }

    #[test]
    fn share_keeps_allocation_alive() {
        let mut buf = MsgBuf::alloc(64).unwrap();
        buf.as_mut_slice()[..4].copy_from_slice(b"abcd");
        let share = buf.share();
        drop(buf);

        let mut out = Vec::new();
        share.copy_out(0, 4, &mut out);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn share_copies_round_trip() {
        let buf = MsgBuf::alloc(32).unwrap();
        let share = buf.share();
        share.copy_in(8, b"hello");
        let mut out = Vec::new();
        share.copy_out(8, 5, &mut out);
        assert_eq!(&out, b"hello");
    }
}
