//! HTTP/2 (RFC 9113) client state machine.
//!
//! `frame` holds the wire codec; [`H2Protocol`] drives streams, flow
//! control and HPACK (via the `hpack` crate) on top of it.

pub mod frame;

mod connection;

pub use connection::H2Protocol;
