//! Execution contexts.
//!
//! A [`Context`] pairs plugin-private transport state with a completion
//! queue. Operations are posted against a context, progress detects their
//! completion, and [`Context::trigger`] runs the resulting callbacks. With
//! `max_contexts > 1`, independent contexts give independent progress
//! streams over the same class.

use std::sync::Arc;

use crate::class::ClassInner;
use crate::error::{Error, Result};
use crate::op::CompletionQueue;
use crate::plugin::PluginContext;

/// One progress/completion stream over a class.
pub struct Context {
    pub(crate) class: Arc<ClassInner>,
    pub(crate) queue: Arc<CompletionQueue>,
    plugin_ctx: Option<Box<dyn PluginContext>>,
    id: u8,
}

impl Context {
    pub(crate) fn create(class: Arc<ClassInner>, id: u8) -> Result<Context> {
        let queue = CompletionQueue::new();
        let plugin_ctx = class.plugin.context_create(id, Arc::clone(&queue))?;
        Ok(Context {
            class,
            queue,
            plugin_ctx: Some(plugin_ctx),
            id,
        })
    }

    /// Numeric ID the context was created under.
    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Tear the context down.
    ///
    /// Completions still queued but never triggered are dropped with a
    /// warning; their callbacks never run.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let plugin_ctx = match self.plugin_ctx.take() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        let abandoned = self.queue.len();
        if abandoned > 0 {
            log::warn!(
                "destroying context {} with {} untriggered completions",
                self.id,
                abandoned
            );
        }
        let ret = self.class.plugin.context_destroy(plugin_ctx);
        self.class.contexts.lock().remove(&self.id);
        ret
    }

    pub(crate) fn belongs_to(&self, class: &Arc<ClassInner>) -> bool {
        Arc::ptr_eq(&self.class, class)
    }

    pub(crate) fn queue_arc(&self) -> Arc<CompletionQueue> {
        Arc::clone(&self.queue)
    }

    pub(crate) fn plugin_ctx(&self) -> Result<&dyn PluginContext> {
        self.plugin_ctx
            .as_deref()
            .ok_or_else(|| Error::InvalidArg("context already destroyed".into()))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.plugin_ctx.is_some() {
            if let Err(e) = self.teardown() {
                log::warn!("implicit destroy of context {} failed: {}", self.id, e);
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("pending", &self.queue.len())
            .finish()
    }
}
