//! Network abstraction layer for RPC transports.
//!
//! A thin, plugin-based abstraction over message-passing network fabrics.
//! Callers initialize a [`Class`] from an info string such as
//! `tcp://localhost:3344`, create one or more [`Context`]s, and drive
//! asynchronous operations through a two-phase completion engine:
//! [`Class::progress`] detects completions, [`Context::trigger`] runs their
//! callbacks on the calling thread.
//!
//! Three operation families share that engine:
//!
//! - **Messages**: two-sided sends and receives over an *unexpected* channel
//!   (no pre-posted receive required at the destination) and an *expected*
//!   channel (matched by source and tag). Both are best-effort; an
//!   unmatched message may be dropped without notification.
//! - **One-sided transfers**: [`Class::put`] and [`Class::get`] move bytes
//!   between registered memory regions named by serializable
//!   [`MemHandle`]s, with no remote software involvement visible to the
//!   caller.
//! - **Cancellation**: best-effort early termination, delivered as a normal
//!   completion carrying [`Error::Canceled`].
//!
//! Operation IDs ([`OpId`]) are caller-allocated and reusable, keeping
//! allocation out of the data path. Addresses and memory handles serialize
//! to opaque bytes with a two-call sizing convention (size query first, or a
//! short buffer fails with [`Error::Overflow`] carrying the requirement).
//!
//! ```no_run
//! use nal::{Class, CbPayload};
//!
//! # fn main() -> nal::Result<()> {
//! let class = Class::initialize("tcp://localhost:0", true)?;
//! let context = class.context_create()?;
//! let op = class.op_create();
//!
//! let buf = class.msg_buf_alloc(4096)?;
//! class.msg_recv_unexpected(
//!     &context,
//!     |info| {
//!         if let CbPayload::RecvUnexpected { actual_buf_size, tag, .. } = &info.info {
//!             println!("received {} bytes, tag {}", actual_buf_size, tag);
//!         }
//!         0
//!     },
//!     &buf,
//!     &op,
//! )?;
//!
//! let mut rets = [0i32; 8];
//! loop {
//!     if class.progress(&context, 1000).is_ok() {
//!         context.trigger(0, &mut rets)?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod addr;
mod class;
pub mod config;
mod context;
mod error;
mod info;
mod mem;
mod msg;
mod op;
pub mod plugin;
mod progress;

pub use addr::Addr;
pub use class::{cleanup, set_log_level, version, Class};
pub use config::{AddrFormat, InitInfo, MemType, Offset, Tag, MAX_IDLE_TIME};
pub use context::Context;
pub use error::{Error, Result};
pub use info::Info;
pub use mem::{MemHandle, Segment, MEM_READWRITE, MEM_READ_ONLY, MEM_WRITE_ONLY};
pub use msg::{MsgBuf, MSG_BUF_ALIGN};
pub use op::{CbInfo, CbPayload, CbType, OpId};
