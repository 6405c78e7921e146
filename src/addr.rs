//! Opaque peer addresses.
//!
//! An [`Addr`] is a small value wrapping shared plugin-private state.
//! Cloning duplicates the reference (the `dup` operation); dropping the last
//! value releases the plugin state exactly once. Equality is structural and
//! goes through the owning class, never pointer identity.

use std::fmt;
use std::sync::Arc;

use crate::class::Class;
use crate::error::{Error, Result};
use crate::plugin::PluginAddr;

/// Opaque, serializable peer identity.
#[derive(Clone)]
pub struct Addr {
    pub(crate) inner: Arc<dyn PluginAddr>,
}

impl Addr {
    /// Wrap plugin-private address state.
    pub(crate) fn new(inner: Arc<dyn PluginAddr>) -> Self {
        Addr { inner }
    }

    /// Downcast to the owning plugin's concrete address type.
    pub(crate) fn downcast<T: 'static>(&self) -> Result<&T> {
        self.inner
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| Error::InvalidArg("address from another class".into()))
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({:?})", self.inner)
    }
}

impl Class {
    /// Resolve a peer name to an address.
    ///
    /// Logically asynchronous across plugins but commonly implemented
    /// synchronously; callers must not assume non-blocking behavior.
    pub fn addr_lookup(&self, name: &str) -> Result<Addr> {
        self.inner.plugin.addr_lookup(name)
    }

    /// Release an address. Equivalent to dropping it; provided for callers
    /// mirroring the create/free discipline of the other handle types.
    pub fn addr_free(&self, addr: Addr) -> Result<()> {
        drop(addr);
        Ok(())
    }

    /// Hint that a peer address is no longer valid, allowing the plugin to
    /// drop cached peer state before the address is freed.
    pub fn addr_set_remove(&self, addr: &Addr) -> Result<()> {
        self.inner.plugin.addr_set_remove(addr)
    }

    /// The local endpoint address. Always succeeds for a correctly
    /// initialized class.
    pub fn addr_self(&self) -> Result<Addr> {
        self.inner.plugin.addr_self()
    }

    /// Duplicate an address. The copy is independent and safe to outlive
    /// the original.
    pub fn addr_dup(&self, addr: &Addr) -> Result<Addr> {
        Ok(addr.clone())
    }

    /// Structural equality: two lookups of the same peer compare equal even
    /// when they are distinct values.
    pub fn addr_cmp(&self, a: &Addr, b: &Addr) -> bool {
        self.inner.plugin.addr_cmp(a, b)
    }

    /// True if the address refers to the local endpoint.
    pub fn addr_is_self(&self, addr: &Addr) -> bool {
        self.inner.plugin.addr_is_self(addr)
    }

    /// Canonical string form of the address.
    pub fn addr_to_string(&self, addr: &Addr) -> Result<String> {
        self.inner.plugin.addr_to_string(addr)
    }

    /// Bytes required to serialize the address.
    pub fn addr_get_serialize_size(&self, addr: &Addr) -> usize {
        self.inner.plugin.addr_serialize_size(addr)
    }

    /// Serialize the address for exchange with a peer.
    ///
    /// Two-call sizing convention: with `None`, only the required size is
    /// returned; with a buffer smaller than that size, the call fails with
    /// [`Error::Overflow`] carrying the minimum required. On success the
    /// number of bytes written is returned.
    pub fn addr_serialize(&self, buf: Option<&mut [u8]>, addr: &Addr) -> Result<usize> {
        let required = self.inner.plugin.addr_serialize_size(addr);
        match buf {
            None => Ok(required),
            Some(b) if b.len() < required => Err(Error::Overflow { required }),
            Some(b) => {
                self.inner.plugin.addr_serialize(&mut b[..required], addr)?;
                Ok(required)
            }
        }
    }

    /// Reconstruct an address from bytes produced by a (possibly remote)
    /// peer's [`Class::addr_serialize`]. The result compares equal to an
    /// independently looked-up address of the same peer.
    pub fn addr_deserialize(&self, buf: &[u8]) -> Result<Addr> {
        self.inner.plugin.addr_deserialize(buf)
    }
}
