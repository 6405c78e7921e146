//! Plugin capability interface.
//!
//! Every transport backend implements [`Plugin`]; a [`Class`](crate::Class)
//! dispatches all public calls through it. Backends are selected at
//! initialization time by walking the static [`REGISTRY`] and calling each
//! entry's `check_protocol` predicate against the parsed info string; no
//! dynamic loading is involved.
//!
//! Required trait methods are the mandatory capability-table entries; their
//! absence is a compile error rather than a runtime null check. Capability
//! queries (header sizes, segment count, poll descriptor) are default
//! methods returning the documented defaults, so a backend only overrides
//! what it actually supports.

pub mod tcp;

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::addr::Addr;
use crate::config::{InitInfo, MemType, Offset, Tag};
use crate::error::Result;
use crate::info::Info;
use crate::mem::{MemHandle, Segment};
use crate::msg::MsgBuf;
use crate::op::OpId;
pub use crate::msg::BufShare;
pub use crate::op::{CompletionQueue, Submission};

/// Plugin-private address state.
///
/// Values are shared through `Arc`; cloning the owning [`Addr`] duplicates
/// the reference, and the last drop releases the plugin state exactly once.
pub trait PluginAddr: Any + Send + Sync + fmt::Debug {
    /// Downcast support for the owning plugin.
    fn as_any(&self) -> &dyn Any;
}

/// Plugin-private memory-handle state.
pub trait PluginMemHandle: Any + Send + Sync + fmt::Debug {
    /// Downcast support for the owning plugin.
    fn as_any(&self) -> &dyn Any;
}

/// Plugin-private context state.
pub trait PluginContext: Any + Send + Sync {
    /// Downcast support for the owning plugin.
    fn as_any(&self) -> &dyn Any;
    /// Numeric context ID this state was created under.
    fn id(&self) -> u8;
}

/// The capability table every transport backend must satisfy.
///
/// Submission methods receive a [`Submission`] handle; "success" of such a
/// call means submitted, not complete — the backend resolves the submission
/// exactly once, later, through the completion queue, where
/// [`Context::trigger`](crate::Context::trigger) picks it up.
pub trait Plugin: Send + Sync {
    /// Release all plugin resources. Called once, after every context and
    /// operation ID created against the class has been destroyed.
    fn finalize(&self) -> Result<()>;

    /// Bind plugin-private context state under the given numeric ID.
    /// Completions for operations posted to this context go to `queue`.
    fn context_create(
        &self,
        id: u8,
        queue: Arc<CompletionQueue>,
    ) -> Result<Box<dyn PluginContext>>;

    /// Tear down context state created by [`Plugin::context_create`].
    fn context_destroy(&self, context: Box<dyn PluginContext>) -> Result<()>;

    /// Resolve a peer name to an address. May block; callers must not
    /// assume non-blocking behavior.
    fn addr_lookup(&self, name: &str) -> Result<Addr>;

    /// The local endpoint address. Always succeeds for a correctly
    /// initialized class.
    fn addr_self(&self) -> Result<Addr>;

    /// Hint that a peer address is no longer valid. Default: no-op.
    fn addr_set_remove(&self, addr: &Addr) -> Result<()> {
        let _ = addr;
        Ok(())
    }

    /// Structural equality: two lookups of the same peer compare equal even
    /// when they are distinct values.
    fn addr_cmp(&self, a: &Addr, b: &Addr) -> bool;

    /// True if the address refers to the local endpoint.
    fn addr_is_self(&self, addr: &Addr) -> bool;

    /// Canonical string form of an address.
    fn addr_to_string(&self, addr: &Addr) -> Result<String>;

    /// Bytes required by [`Plugin::addr_serialize`]. Default: 0.
    fn addr_serialize_size(&self, addr: &Addr) -> usize {
        let _ = addr;
        0
    }

    /// Serialize an address into `buf`, whose length is exactly the
    /// reported serialize size.
    fn addr_serialize(&self, buf: &mut [u8], addr: &Addr) -> Result<()>;

    /// Reconstruct an address from bytes produced by a (possibly remote)
    /// peer's serialize.
    fn addr_deserialize(&self, buf: &[u8]) -> Result<Addr>;

    /// Maximum unexpected-message payload size.
    fn msg_max_unexpected_size(&self) -> usize;

    /// Maximum expected-message payload size.
    fn msg_max_expected_size(&self) -> usize;

    /// Plugin header prefix length in unexpected-message buffers.
    /// Default: 0.
    fn msg_unexpected_header_size(&self) -> usize {
        0
    }

    /// Plugin header prefix length in expected-message buffers. Default: 0.
    fn msg_expected_header_size(&self) -> usize {
        0
    }

    /// Maximum usable tag value.
    fn msg_max_tag(&self) -> Tag;

    /// Allocate a transport-appropriate message buffer. The default is a
    /// plain aligned allocation with no plugin data.
    fn msg_buf_alloc(&self, size: usize) -> Result<MsgBuf> {
        MsgBuf::alloc(size)
    }

    /// Release a buffer obtained from [`Plugin::msg_buf_alloc`].
    fn msg_buf_free(&self, buf: MsgBuf) -> Result<()> {
        drop(buf);
        Ok(())
    }

    /// Stamp the plugin's unexpected-message header into the buffer prefix.
    /// Default: no-op for plugins without a header.
    fn msg_init_unexpected(&self, buf: &mut MsgBuf) -> Result<()> {
        let _ = buf;
        Ok(())
    }

    /// Stamp the plugin's expected-message header into the buffer prefix.
    fn msg_init_expected(&self, buf: &mut MsgBuf) -> Result<()> {
        let _ = buf;
        Ok(())
    }

    /// Post an unexpected send. The destination may drop the message
    /// silently when no matching receive is posted.
    #[allow(clippy::too_many_arguments)]
    fn msg_send_unexpected(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
        buf_size: usize,
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
    ) -> Result<()>;

    /// Post an unexpected receive matching any source and tag.
    fn msg_recv_unexpected(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
    ) -> Result<()>;

    /// Post an expected send. Droppable without notification when the
    /// destination has no matching receive posted.
    #[allow(clippy::too_many_arguments)]
    fn msg_send_expected(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
        buf_size: usize,
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
    ) -> Result<()>;

    /// Post an expected receive matching source, source context ID and tag.
    fn msg_recv_expected(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
        source: &Addr,
        source_id: u8,
        tag: Tag,
    ) -> Result<()>;

    /// Build a handle over the given segment list.
    fn mem_handle_create(&self, segments: &[Segment], flags: u32) -> Result<MemHandle>;

    /// Maximum segment count accepted by [`Plugin::mem_handle_create`].
    /// Default: 1, meaning contiguous regions only.
    fn mem_max_segments(&self) -> usize {
        1
    }

    /// Register a handle for the named memory type.
    fn mem_register(&self, handle: &MemHandle, mem_type: MemType, device: u64) -> Result<()>;

    /// Reverse a registration.
    fn mem_deregister(&self, handle: &MemHandle) -> Result<()>;

    /// Bytes required by [`Plugin::mem_handle_serialize`]. Default: 0.
    fn mem_handle_serialize_size(&self, handle: &MemHandle) -> usize {
        let _ = handle;
        0
    }

    /// Serialize a registered handle for out-of-band exchange with a peer.
    fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<()>;

    /// Reconstruct a (foreign) handle from a peer's serialized bytes.
    fn mem_handle_deserialize(&self, buf: &[u8]) -> Result<MemHandle>;

    /// One-sided write of `len` bytes from the local region into the remote
    /// region.
    #[allow(clippy::too_many_arguments)]
    fn put(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        local: &MemHandle,
        local_offset: Offset,
        remote: &MemHandle,
        remote_offset: Offset,
        len: usize,
        remote_addr: &Addr,
        remote_id: u8,
    ) -> Result<()>;

    /// One-sided read of `len` bytes from the remote region into the local
    /// region.
    #[allow(clippy::too_many_arguments)]
    fn get(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        local: &MemHandle,
        local_offset: Offset,
        remote: &MemHandle,
        remote_offset: Offset,
        len: usize,
        remote_addr: &Addr,
        remote_id: u8,
    ) -> Result<()>;

    /// Waitable descriptor for external event loops. Default: unsupported.
    fn poll_get_fd(&self, context: &dyn PluginContext) -> Option<RawFd> {
        let _ = context;
        None
    }

    /// True when it is safe to block on the poll descriptor; false means
    /// something is already actionable and progress should run first.
    fn poll_try_wait(&self, context: &dyn PluginContext) -> bool {
        let _ = context;
        true
    }

    /// Drive the transport for up to `timeout_ms`. Returns `Ok(())` as soon
    /// as at least one completion was enqueued, `Err(Timeout)` otherwise.
    /// Never invokes user callbacks.
    fn progress(&self, context: &dyn PluginContext, timeout_ms: u32) -> Result<()>;

    /// Request early termination of an in-flight operation. Asynchronous:
    /// the canceled completion is delivered through the normal trigger path.
    /// Canceling an operation that already completed is a no-op.
    fn cancel(&self, context: &dyn PluginContext, op: &OpId) -> Result<()>;
}

/// One registered backend.
pub struct PluginEntry {
    /// Backend name reported by [`Class::class_name`](crate::Class::class_name).
    pub class_name: &'static str,
    /// Predicate selecting this backend from a protocol string.
    pub check_protocol: fn(&str) -> bool,
    /// Build the plugin state. Resources allocated before a failure must be
    /// released before returning the error; no partial class escapes.
    pub initialize: fn(&Info, &InitInfo, bool) -> Result<Box<dyn Plugin>>,
    /// Remove temporary on-disk state left by earlier instances, if any.
    pub cleanup: Option<fn()>,
}

/// Statically registered backends, probed in order at initialization.
pub(crate) static REGISTRY: &[PluginEntry] = &[tcp::ENTRY];
