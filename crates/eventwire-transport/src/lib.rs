// Copyright (c) 2026 eventwire maintainers
// Licensed under the MIT License. See LICENSE file for details.
// Modifications to this file must be documented with a description of the changes made.

//! Pluggable transport abstraction for bidirectional event protocols.
//!
//! One async [`Transport`] contract hides the wire protocol; a
//! [`TransportManager`] owns the current transport, survives live swaps,
//! validates events on the way out and in, and feeds consumers through a
//! bounded, policy-driven [`BackpressureHandler`] built on a blocking
//! [`RingBuffer`].

mod backpressure;
pub mod error;
mod event;
#[cfg(feature = "loopback")]
mod loopback;
mod manager;
mod ring_buffer;
mod transport;
mod utils;
mod validation;

pub use backpressure::*;
pub use event::*;
#[cfg(feature = "loopback")]
pub use loopback::*;
pub use manager::*;
pub use ring_buffer::*;
pub use transport::*;
pub use validation::*;

pub use error::{
    BackpressureError, ErrorKind, RingBufferError, TransportError, TransportResult,
    ValidationError,
};
pub use utils::{unix_millis, CancellationError, CancellationToken, CancellationTokenSource};

// Type alias for transport identifiers as stamped into event metadata
pub type TransportId = String;
