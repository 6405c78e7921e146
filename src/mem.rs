//! Memory handles and one-sided transfers.
//!
//! A [`MemHandle`] describes a local memory region (one or more segments)
//! with access permissions. Registering it makes the region usable as the
//! target of [`Class::put`] / [`Class::get`]; serializing a registered
//! handle produces opaque bytes a peer deserializes to obtain a remote
//! handle naming the same region. Remote handles carry no local memory and
//! can only appear on the remote side of a transfer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::addr::Addr;
use crate::class::Class;
use crate::config::{MemType, Offset};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::op::{self, CbType, OpId};
use crate::plugin::PluginMemHandle;

/// Region is readable by remote peers (valid `get` source, `put` local
/// source).
pub const MEM_READ_ONLY: u32 = 0x01;
/// Region is writable by remote peers (valid `put` target, `get` local
/// destination).
pub const MEM_WRITE_ONLY: u32 = 0x02;
/// Region is both readable and writable.
pub const MEM_READWRITE: u32 = MEM_READ_ONLY | MEM_WRITE_ONLY;

/// One contiguous piece of a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Base address of the segment.
    pub base: u64,
    /// Length in bytes.
    pub len: usize,
}

/// Handle to a (possibly multi-segment) memory region.
///
/// # Region validity
///
/// A local handle describes raw addresses supplied by the caller at
/// creation time; transfers read and write through those addresses with
/// no further checks beyond the handle's bounds and permission flags. The
/// caller must keep every segment allocated, pinned at its original
/// address, and free of conflicting access from creation until the handle
/// is deregistered and the last transfer naming it has completed.
/// Describing memory the caller does not own, or freeing it while the
/// handle is live, corrupts memory. This is the same contract the
/// underlying transports impose on registered buffers.
pub struct MemHandle {
    pub(crate) inner: Arc<dyn PluginMemHandle>,
    flags: u32,
    len: usize,
    remote: bool,
    registered: AtomicBool,
}

impl MemHandle {
    /// Build a local, unregistered handle around plugin state.
    pub(crate) fn new_local(inner: Arc<dyn PluginMemHandle>, flags: u32, len: usize) -> Self {
        MemHandle {
            inner,
            flags,
            len,
            remote: false,
            registered: AtomicBool::new(false),
        }
    }

    /// Build a remote handle from deserialized peer state. Remote handles
    /// are implicitly registered on their owning node.
    pub(crate) fn new_remote(inner: Arc<dyn PluginMemHandle>, flags: u32, len: usize) -> Self {
        MemHandle {
            inner,
            flags,
            len,
            remote: true,
            registered: AtomicBool::new(true),
        }
    }

    /// Total length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access permission flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// True if this handle was deserialized from a peer.
    #[inline]
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// True between register and deregister (always true for remote
    /// handles).
    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn downcast<T: 'static>(&self) -> Result<&T> {
        self.inner
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| Error::InvalidArg("memory handle from another class".into()))
    }

    fn set_registered(&self, value: bool) {
        self.registered.store(value, Ordering::Release);
    }
}

impl fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemHandle")
            .field("len", &self.len)
            .field("flags", &self.flags)
            .field("remote", &self.remote)
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Class {
    /// Build a handle over one contiguous region.
    ///
    /// `base` is a raw address in the caller's address space. The caller
    /// must uphold the region-validity contract documented on
    /// [`MemHandle`]: the memory stays allocated and in place for the
    /// handle's whole lifetime.
    pub fn mem_handle_create(&self, base: u64, len: usize, flags: u32) -> Result<MemHandle> {
        self.mem_handle_create_segments(&[Segment { base, len }], flags)
    }

    /// Build a handle over a segment list. The segment count must not
    /// exceed [`Class::mem_handle_get_max_segments`].
    ///
    /// Every segment base is a raw address; the region-validity contract
    /// documented on [`MemHandle`] applies to each segment.
    pub fn mem_handle_create_segments(
        &self,
        segments: &[Segment],
        flags: u32,
    ) -> Result<MemHandle> {
        if segments.is_empty() {
            return Err(Error::InvalidArg("empty segment list".into()));
        }
        let max = self.inner.plugin.mem_max_segments();
        if segments.len() > max {
            return Err(Error::InvalidArg(format!(
                "{} segments exceed plugin maximum of {}",
                segments.len(),
                max
            )));
        }
        if flags & MEM_READWRITE == 0 {
            return Err(Error::InvalidArg(format!(
                "invalid access flags {:#x}",
                flags
            )));
        }
        self.inner.plugin.mem_handle_create(segments, flags)
    }

    /// Maximum segment count accepted by
    /// [`Class::mem_handle_create_segments`].
    pub fn mem_handle_get_max_segments(&self) -> usize {
        self.inner.plugin.mem_max_segments()
    }

    /// Release a handle. A still-registered local handle is deregistered
    /// first.
    pub fn mem_handle_free(&self, handle: MemHandle) -> Result<()> {
        if !handle.is_remote() && handle.is_registered() {
            log::warn!("freeing a still-registered memory handle");
            self.mem_deregister(&handle)?;
        }
        drop(handle);
        Ok(())
    }

    /// Register a local handle for host memory.
    pub fn mem_register(&self, handle: &MemHandle) -> Result<()> {
        self.mem_register_device(handle, MemType::Host, 0)
    }

    /// Register a local handle for the named memory type and device.
    pub fn mem_register_device(
        &self,
        handle: &MemHandle,
        mem_type: MemType,
        device: u64,
    ) -> Result<()> {
        if handle.is_remote() {
            return Err(Error::InvalidArg(
                "cannot register a remote memory handle".into(),
            ));
        }
        if handle.is_registered() {
            return Err(Error::Exist);
        }
        if mem_type != MemType::Host && !self.inner.request_mem_device {
            return Err(Error::OpNotSupported);
        }
        self.inner.plugin.mem_register(handle, mem_type, device)?;
        handle.set_registered(true);
        Ok(())
    }

    /// Reverse a registration. The handle becomes unusable for transfers
    /// until registered again.
    pub fn mem_deregister(&self, handle: &MemHandle) -> Result<()> {
        if handle.is_remote() {
            return Err(Error::InvalidArg(
                "cannot deregister a remote memory handle".into(),
            ));
        }
        if !handle.is_registered() {
            return Ok(());
        }
        self.inner.plugin.mem_deregister(handle)?;
        handle.set_registered(false);
        Ok(())
    }

    /// Bytes required to serialize the handle.
    pub fn mem_handle_get_serialize_size(&self, handle: &MemHandle) -> usize {
        self.inner.plugin.mem_handle_serialize_size(handle)
    }

    /// Serialize a registered handle for out-of-band exchange.
    ///
    /// Same two-call sizing convention as
    /// [`Class::addr_serialize`](Class::addr_serialize): `None` returns the
    /// required size, a short buffer fails with [`Error::Overflow`].
    pub fn mem_handle_serialize(
        &self,
        buf: Option<&mut [u8]>,
        handle: &MemHandle,
    ) -> Result<usize> {
        if !handle.is_registered() {
            return Err(Error::InvalidArg(
                "cannot serialize an unregistered memory handle".into(),
            ));
        }
        let required = self.inner.plugin.mem_handle_serialize_size(handle);
        match buf {
            None => Ok(required),
            Some(b) if b.len() < required => Err(Error::Overflow { required }),
            Some(b) => {
                self.inner
                    .plugin
                    .mem_handle_serialize(&mut b[..required], handle)?;
                Ok(required)
            }
        }
    }

    /// Reconstruct a remote handle from a peer's serialized bytes.
    pub fn mem_handle_deserialize(&self, buf: &[u8]) -> Result<MemHandle> {
        self.inner.plugin.mem_handle_deserialize(buf)
    }

    /// One-sided write: copy `len` bytes from the local region (at
    /// `local_offset`) into the remote region (at `remote_offset`). The
    /// remote side gets no notification; completion means the data has left
    /// the local region, not that the peer has observed it.
    #[allow(clippy::too_many_arguments)]
    pub fn put<F>(
        &self,
        context: &Context,
        callback: F,
        local: &MemHandle,
        local_offset: Offset,
        remote: &MemHandle,
        remote_offset: Offset,
        len: usize,
        remote_addr: &Addr,
        remote_id: u8,
        op_id: &OpId,
    ) -> Result<()>
    where
        F: FnOnce(&crate::op::CbInfo) -> i32 + Send + 'static,
    {
        self.check_context(context)?;
        Self::check_rma(
            local,
            local_offset,
            remote,
            remote_offset,
            len,
            MEM_READ_ONLY,
            MEM_WRITE_ONLY,
        )?;
        let sub = op::submit(op_id, context.queue_arc(), CbType::Put, Box::new(callback))?;
        let gen = sub.gen;
        self.inner
            .plugin
            .put(
                context.plugin_ctx()?,
                sub,
                local,
                local_offset,
                remote,
                remote_offset,
                len,
                remote_addr,
                remote_id,
            )
            .inspect_err(|_| op::revert(op_id, gen))
    }

    /// One-sided read: copy `len` bytes from the remote region (at
    /// `remote_offset`) into the local region (at `local_offset`).
    #[allow(clippy::too_many_arguments)]
    pub fn get<F>(
        &self,
        context: &Context,
        callback: F,
        local: &MemHandle,
        local_offset: Offset,
        remote: &MemHandle,
        remote_offset: Offset,
        len: usize,
        remote_addr: &Addr,
        remote_id: u8,
        op_id: &OpId,
    ) -> Result<()>
    where
        F: FnOnce(&crate::op::CbInfo) -> i32 + Send + 'static,
    {
        self.check_context(context)?;
        Self::check_rma(
            local,
            local_offset,
            remote,
            remote_offset,
            len,
            MEM_WRITE_ONLY,
            MEM_READ_ONLY,
        )?;
        let sub = op::submit(op_id, context.queue_arc(), CbType::Get, Box::new(callback))?;
        let gen = sub.gen;
        self.inner
            .plugin
            .get(
                context.plugin_ctx()?,
                sub,
                local,
                local_offset,
                remote,
                remote_offset,
                len,
                remote_addr,
                remote_id,
            )
            .inspect_err(|_| op::revert(op_id, gen))
    }

    fn check_rma(
        local: &MemHandle,
        local_offset: Offset,
        remote: &MemHandle,
        remote_offset: Offset,
        len: usize,
        local_need: u32,
        remote_need: u32,
    ) -> Result<()> {
        if local.is_remote() {
            return Err(Error::InvalidArg(
                "local side of a transfer must be a local handle".into(),
            ));
        }
        if !local.is_registered() || !remote.is_registered() {
            return Err(Error::InvalidArg(
                "transfer requires registered memory handles".into(),
            ));
        }
        if local.flags() & local_need == 0 || remote.flags() & remote_need == 0 {
            return Err(Error::Permission);
        }
        let local_end = local_offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::InvalidArg("local range overflows".into()))?;
        let remote_end = remote_offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::InvalidArg("remote range overflows".into()))?;
        if local_end > local.len() as u64 {
            return Err(Error::InvalidArg(format!(
                "local range {}..{} exceeds region of {} bytes",
                local_offset,
                local_end,
                local.len()
            )));
        }
        if remote_end > remote.len() as u64 {
            return Err(Error::InvalidArg(format!(
                "remote range {}..{} exceeds region of {} bytes",
                remote_offset,
                remote_end,
                remote.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct DummyHandle;

    impl PluginMemHandle for DummyHandle {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn local(flags: u32, len: usize, registered: bool) -> MemHandle {
        let h = MemHandle::new_local(Arc::new(DummyHandle), flags, len);
        if registered {
            h.set_registered(true);
        }
        h
    }

    fn remote(flags: u32, len: usize) -> MemHandle {
        MemHandle::new_remote(Arc::new(DummyHandle), flags, len)
    }

    #[test]
    fn rma_checks_enforce_permissions() {
        let src = local(MEM_READ_ONLY, 1024, true);
        let dst = remote(MEM_WRITE_ONLY, 4096);

        // put: local read, remote write.
        assert!(Class::check_rma(&src, 0, &dst, 0, 512, MEM_READ_ONLY, MEM_WRITE_ONLY).is_ok());
        // get through the same pair fails both sides.
        assert!(matches!(
            Class::check_rma(&src, 0, &dst, 0, 512, MEM_WRITE_ONLY, MEM_READ_ONLY),
            Err(Error::Permission)
        ));
    }

    #[test]
    fn rma_checks_enforce_bounds() {
        let src = local(MEM_READWRITE, 1024, true);
        let dst = remote(MEM_READWRITE, 4096);

        assert!(Class::check_rma(&src, 0, &dst, 3072, 1024, MEM_READ_ONLY, MEM_WRITE_ONLY).is_ok());
        assert!(
            Class::check_rma(&src, 1, &dst, 0, 1024, MEM_READ_ONLY, MEM_WRITE_ONLY).is_err()
        );
        assert!(
            Class::check_rma(&src, 0, &dst, 3073, 1024, MEM_READ_ONLY, MEM_WRITE_ONLY).is_err()
        );
    }

    #[test]
    fn rma_requires_registration() {
        let src = local(MEM_READWRITE, 1024, false);
        let dst = remote(MEM_READWRITE, 4096);
        assert!(Class::check_rma(&src, 0, &dst, 0, 16, MEM_READ_ONLY, MEM_WRITE_ONLY).is_err());
    }

    #[test]
    fn local_side_must_be_local() {
        let src = remote(MEM_READWRITE, 1024);
        let dst = remote(MEM_READWRITE, 4096);
        assert!(Class::check_rma(&src, 0, &dst, 0, 16, MEM_READ_ONLY, MEM_WRITE_ONLY).is_err());
    }

    #[test]
    fn remote_handles_cannot_register() {
        // Registration state transitions that never touch a plugin.
        let h = remote(MEM_READWRITE, 64);
        assert!(h.is_registered());
        assert!(h.is_remote());
    }
}
