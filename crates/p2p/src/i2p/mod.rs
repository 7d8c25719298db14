//! I2P transport: SAMv3 session control, dialing and accepting.
//!
//! The bridge speaks a line-oriented control dialog; once a stream is
//! up, the same socket carries opaque peer traffic and is handed to a
//! regular connection.

pub mod controller;
pub mod dialer;
pub mod listener;
pub mod util;
