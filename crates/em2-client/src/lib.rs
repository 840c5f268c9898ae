//! Acquisition client for the ALBA Em2 four-channel electrometer.
//!
//! Three layers, bottom up:
//!
//! - [`scpi`]: the persistent line-based control connection (plus a mock
//!   device for tests);
//! - [`stream`]: the concurrent receiver for the fast-buffer data port,
//!   with frame-gap detection;
//! - [`client`]: the [`Em2`] facade tying both together behind typed
//!   accessors, with firmware quirk compensation and per-channel formulas;
//! - [`controller`]: the scan-level Idle/Busy/Fault state machine built on
//!   the facade.

pub mod client;
pub mod codec;
pub mod controller;
pub mod scpi;
pub mod stream;

pub use client::{Channel, Em2};
pub use codec::ChannelData;
pub use controller::Em2Controller;
pub use scpi::{MockEm2Device, ScpiExchange, ScpiTransport};
pub use stream::{StreamReceiver, StreamSource};
