//! Cross-connection state.

pub mod alt_svc;

pub use alt_svc::{AltSvcCache, QuicPreemptiveCache};
