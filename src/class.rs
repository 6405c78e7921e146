//! Class initialization and lifecycle.
//!
//! A [`Class`] is one initialized transport backend instance, selected from
//! the static plugin registry by the protocol part of an info string.
//! Every other object (contexts, addresses, buffers, memory handles,
//! operation IDs) is created through it and must be released before the
//! class is finalized.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::InitInfo;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::info::Info;
use crate::op::OpId;
use crate::plugin::{Plugin, REGISTRY};

pub(crate) struct ClassInner {
    pub(crate) plugin: Box<dyn Plugin>,
    pub(crate) class_name: &'static str,
    pub(crate) protocol: String,
    pub(crate) progress_mode: u8,
    pub(crate) listen: bool,
    pub(crate) max_contexts: u8,
    pub(crate) request_mem_device: bool,
    pub(crate) contexts: Mutex<HashSet<u8>>,
    finalized: AtomicBool,
}

impl Drop for ClassInner {
    fn drop(&mut self) {
        if !self.finalized.load(Ordering::Acquire) {
            if let Err(e) = self.plugin.finalize() {
                log::warn!("implicit finalize of class {} failed: {}", self.class_name, e);
            }
        }
    }
}

/// An initialized transport backend instance.
///
/// Cheap to clone; all clones refer to the same backend state.
#[derive(Clone)]
pub struct Class {
    pub(crate) inner: Arc<ClassInner>,
}

impl Class {
    /// Initialize a class from an info string with default options.
    ///
    /// `listen` selects a listening endpoint that remote peers can address;
    /// without it the endpoint is outbound-only.
    pub fn initialize(info_string: &str, listen: bool) -> Result<Class> {
        Class::initialize_opt(info_string, listen, &InitInfo::default())
    }

    /// Initialize a class with explicit options.
    ///
    /// The registry is probed in order; the first plugin whose protocol
    /// predicate accepts the parsed protocol wins. An info string no plugin
    /// accepts fails with [`Error::ProtoNoSupport`].
    pub fn initialize_opt(info_string: &str, listen: bool, opts: &InitInfo) -> Result<Class> {
        let info = Info::parse(info_string)?;
        if opts.max_contexts == 0 {
            return Err(Error::InvalidArg("max_contexts cannot be 0".into()));
        }

        for entry in REGISTRY {
            if !(entry.check_protocol)(&info.protocol) {
                continue;
            }
            let plugin = (entry.initialize)(&info, opts, listen)?;
            log::debug!(
                "initialized class {} for {} (listen={})",
                entry.class_name,
                info_string,
                listen
            );
            return Ok(Class {
                inner: Arc::new(ClassInner {
                    plugin,
                    class_name: entry.class_name,
                    protocol: info.protocol,
                    progress_mode: opts.progress_mode,
                    listen,
                    max_contexts: opts.max_contexts,
                    request_mem_device: opts.request_mem_device,
                    contexts: Mutex::new(HashSet::new()),
                    finalized: AtomicBool::new(false),
                }),
            });
        }
        Err(Error::ProtoNoSupport(info.protocol))
    }

    /// Shut the class down.
    ///
    /// Fails with [`Error::Busy`] while contexts created against the class
    /// are still alive. Other clones of the class keep the backend alive
    /// until they drop, but the backend is already finalized.
    pub fn finalize(self) -> Result<()> {
        {
            let contexts = self.inner.contexts.lock();
            if !contexts.is_empty() {
                return Err(Error::Busy);
            }
        }
        if self.inner.finalized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.plugin.finalize()
    }

    /// Name of the backing plugin.
    #[inline]
    pub fn class_name(&self) -> &str {
        self.inner.class_name
    }

    /// Protocol the class was initialized for.
    #[inline]
    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    /// True if the class accepts inbound connections.
    #[inline]
    pub fn is_listening(&self) -> bool {
        self.inner.listen
    }

    /// Create the default context (ID 0).
    pub fn context_create(&self) -> Result<Context> {
        self.context_create_id(0)
    }

    /// Create a context under an explicit ID.
    ///
    /// IDs must be below the `max_contexts` the class was initialized with
    /// and unique among live contexts; a duplicate fails with
    /// [`Error::Exist`].
    pub fn context_create_id(&self, id: u8) -> Result<Context> {
        if id >= self.inner.max_contexts {
            return Err(Error::InvalidArg(format!(
                "context id {} out of range (max_contexts {})",
                id, self.inner.max_contexts
            )));
        }
        {
            let mut contexts = self.inner.contexts.lock();
            if !contexts.insert(id) {
                return Err(Error::Exist);
            }
        }
        match Context::create(Arc::clone(&self.inner), id) {
            Ok(ctx) => Ok(ctx),
            Err(e) => {
                self.inner.contexts.lock().remove(&id);
                Err(e)
            }
        }
    }

    /// Allocate a reusable operation ID.
    pub fn op_create(&self) -> OpId {
        OpId::new()
    }

    /// Release an operation ID.
    ///
    /// Safe while the operation is in flight: the backend holds its own
    /// reference and the pending completion is unaffected.
    pub fn op_destroy(&self, op: OpId) -> Result<()> {
        drop(op);
        Ok(())
    }

    /// Verify a context belongs to this class.
    pub(crate) fn check_context(&self, context: &Context) -> Result<()> {
        if !context.belongs_to(&self.inner) {
            return Err(Error::InvalidArg("context from another class".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("class_name", &self.inner.class_name)
            .field("protocol", &self.inner.protocol)
            .field("listen", &self.inner.listen)
            .finish()
    }
}

/// Library version as (major, minor, patch).
pub fn version() -> (u32, u32, u32) {
    // Set from the package manifest at build time.
    let parse = |s: &str| s.parse::<u32>().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

/// Remove temporary on-disk state left behind by earlier instances of any
/// registered plugin (e.g. after a crash). Independent of any live class.
pub fn cleanup() {
    for entry in REGISTRY {
        if let Some(cleanup) = entry.cleanup {
            cleanup();
        }
    }
}

/// Adjust the global log threshold by name: `none`, `error`, `warning` or
/// `debug`. Unknown names are ignored with a warning.
pub fn set_log_level(level: &str) {
    let filter = match level {
        "none" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "warning" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        other => {
            log::warn!("unknown log level {:?}, leaving threshold unchanged", other);
            return;
        }
    };
    log::set_max_level(filter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_is_rejected() {
        assert!(matches!(
            Class::initialize("nosuch://localhost:0", false),
            Err(Error::ProtoNoSupport(p)) if p == "nosuch"
        ));
    }

    #[test]
    fn zero_max_contexts_is_rejected() {
        let opts = InitInfo::default().with_max_contexts(0);
        assert!(Class::initialize_opt("tcp://", false, &opts).is_err());
    }

    #[test]
    fn version_matches_manifest() {
        let (major, _, _) = version();
        assert_eq!(major.to_string(), env!("CARGO_PKG_VERSION_MAJOR"));
    }
}
