//! The looper/handler scheduling runtime.
//!
//! - `looper` owns a worker thread and its deadline-ordered queue.
//! - `handler` defines registered delivery targets and the handles used to
//!   address them without owning them.

mod handler;
mod looper;
mod queue;

pub use handler::{Handler, HandlerId, HandlerIdAllocator, HandlerRef, UNREGISTERED};
pub use looper::{Looper, WeakLooper};
