//! A small DNS forwarding relay over UDP.
//!
//! This library binds one UDP socket, runs one thread to receive DNS queries
//! on it, and hands every query to its own short-lived thread. That thread
//! forwards the query bytes to a single upstream resolver, waits for the
//! reply with a fixed deadline, and sends the reply back to the client:
//!```text
//!  Client          DnsForwarder                          Upstream
//!    |                  | receive thread starts its loop.     |
//!    |  --- query -->   |                                     |
//!    |                  | spawns a query thread               |
//!    |                  |        --- query bytes -->          |
//!    |                  |        <-- reply bytes ---          |
//!    |  <-- reply ---   |                                     |
//!```
//! If the upstream cannot be reached or does not answer in time, the client
//! gets a SERVFAIL response for its query instead of silence.
//!
//! There is no dependency on any async runtime.
//!
//! # Usage
//!
//! ```no_run
//! use dns_relay::DnsForwarder;
//!
//! // Listen on port 5353 of localhost, forward to the default upstream.
//! let forwarder = DnsForwarder::new("127.0.0.1:5353", "");
//! forwarder.start().expect("Failed to start the forwarder");
//!
//! // ... later, from any thread:
//! forwarder.stop().expect("Failed to stop the forwarder");
//! ```
//!
//! The [`dns_parser`] module can also be used on its own to encode and
//! decode DNS messages:
//!
//! ```rust
//! use dns_relay::{DnsMessage, RRType, FLAGS_RD};
//!
//! let mut query = DnsMessage::new(1234, FLAGS_RD);
//! query.add_question("example.com", RRType::A as u16).unwrap();
//!
//! let bytes = query.to_bytes();
//! let parsed = DnsMessage::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.questions[0].name(), "example.com");
//! ```
//!
//! # Limitations
//!
//! This implementation is based on the following RFCs:
//! - DNS:    [RFC 1035](https://tools.ietf.org/html/rfc1035)
//! - EDNS:   [RFC 6891](https://tools.ietf.org/html/rfc6891) (bare OPT record only)
//!
//! It does not resolve recursively, cache, validate DNSSEC or fall back to TCP.
//! Names are never compressed when encoding.

#![forbid(unsafe_code)]

// log for logging (optional).
#[cfg(feature = "logging")]
use log;

#[cfg(not(feature = "logging"))]
#[macro_use]
mod log {
    macro_rules! trace {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*); // avoid warnings about unused variables.
            }
        };
    }

    macro_rules! debug {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*); // avoid warnings about unused variables.
            }
        };
    }

    macro_rules! info {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*); // avoid warnings about unused variables.
            }
        };
    }

    macro_rules! error {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*); // avoid warnings about unused variables.
            }
        };
    }
}

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      Error::Msg(format!($($arg)+))
  };
}

pub mod dns_parser;
mod error;
mod forwarder;

pub use dns_parser::{
    decode_name, encode_name, DnsHeader, DnsMessage, DnsQuestion, DnsRecord, RRType, CLASS_IN,
    EDNS_UDP_PAYLOAD_SIZE, FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, FLAGS_RA, FLAGS_RD,
    FLAGS_TC, MSG_HEADER_LEN, RCODE_NOERROR, RCODE_SERVFAIL, TYPE_OPT,
};
pub use error::{Error, Result};
pub use forwarder::{
    DnsForwarder, Metrics, ServerState, DEFAULT_LISTEN, DEFAULT_UPSTREAM, MAX_IN_FLIGHT_QUERIES,
    MAX_MSG_SIZE, POLL_INTERVAL, UPSTREAM_TIMEOUT,
};
