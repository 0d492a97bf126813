//! I/O primitives for the RIST protocol engine
//!
//! UDP socket acquisition and timing live here, behind small wrappers so the
//! protocol core stays free of system calls.

pub mod socket;
pub mod time;

pub use socket::{RistSocket, SocketError};
pub use time::{NtpTime, RateLimiter, Timer, Timestamp};
