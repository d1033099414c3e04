//! A small and safe mDNS host responder.
//!
//! This library creates one new thread to run a mDNS responder daemon, and
//! exposes an API that interacts with the daemon via a
//! [`flume`](https://crates.io/crates/flume) channel. The channel supports
//! both `recv()` and `recv_async()`.
//!
//! The daemon claims a unique `.local.` hostname for the running machine and
//! answers A/AAAA queries for that name:
//!
//! 1. It picks a candidate name from the machine name (e.g. `laptop.local.`)
//!    and probes the network for an existing claim.
//! 2. If another host answers with a live address record for that name, the
//!    daemon renames itself (`laptop-2.local.`, `laptop-3.local.`, ...) and
//!    probes again.
//! 3. After a quiet probe window the name is confirmed and the daemon starts
//!    answering address queries, picking the local address on the interface
//!    closest to each querier.
//!
//! All commands in the public API are sent to the daemon using the unblocking
//! `try_send()` so that the caller can use it with both sync and async code,
//! with no dependency on any particular async runtimes.
//!
//! # Usage
//!
//! ```no_run
//! use mdns_host::{HostResponder, ResponderEvent};
//!
//! // Create the responder daemon.
//! let responder = HostResponder::new().expect("Failed to create responder");
//!
//! // Watch for notable events, e.g. the hostname being confirmed or renamed.
//! let events = responder.monitor().expect("Failed to monitor");
//! std::thread::spawn(move || {
//!     while let Ok(event) = events.recv() {
//!         match event {
//!             ResponderEvent::HostnameConfirmed(name) => {
//!                 println!("claimed hostname: {}", name);
//!             }
//!             other => println!("event: {:?}", other),
//!         }
//!     }
//! });
//! ```
//!
//! # Limitations
//!
//! This implementation covers the responder side of
//! [RFC 6762](https://tools.ietf.org/html/rfc6762) for host address records
//! only. It does not resolve other hosts' names, cache foreign records, or
//! do DNS-SD service discovery. Once a hostname is confirmed it is kept for
//! the lifetime of the process, even if a conflicting claim shows up later.

#![forbid(unsafe_code)]

#[cfg(feature = "logging")]
pub(crate) mod log {
    pub(crate) use log::{debug, trace};
}

#[cfg(not(feature = "logging"))]
pub(crate) mod log {
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }
    pub(crate) use {debug, trace};
}

mod dns_parser;
mod error;
mod responder;

pub use error::{Error, Result};
pub use responder::{
    HostResponder, HostnameStatus, IpFamily, ResponderConfig, ResponderEvent, ResponderStatus,
};

/// Re-export from `flume`.
pub use flume::Receiver;
