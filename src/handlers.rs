//! Operation handlers.
//!
//! Each handler implements the replay state machine for one kind of durable
//! operation. [`DurableContext`](crate::DurableContext) allocates the
//! operation id and delegates here.

pub mod callback;
pub mod child;
pub(crate) mod replay;
pub mod step;
pub mod wait;

pub use callback::{callback_handler, wait_for_callback_handler, Callback};
pub use child::child_handler;
pub use step::{step_handler, StepContext};
pub use wait::wait_handler;
