//! freshet cqueue
//! single-consumer byte ring buffer with latch-based wakeups, the transport
//! between stream inserts and continuous query workers

// crate-specific lint exceptions:
#![allow(unsafe_code, clippy::missing_errors_doc)]

mod ring;

pub use ring::*;
