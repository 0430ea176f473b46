//! Compilation from a [`Context`](crate::context::Context) graph down to a
//! flat instruction tape with a slot-allocated work vector
mod alloc;
mod sort;
mod tape;

pub use tape::{Tape, TapeOp};
