//! Protocol state machine for tunneling byte streams across a shared
//! filesystem.
//!
//! Two processes that cannot reach each other over the network, but do
//! share a directory, exchange bytes by creating, overwriting, and
//! deleting files inside a common workspace. This crate contains the
//! transport itself: the connect/accept handshake, the per-connection
//! half-duplex request/reply channels with sequencing, checksumming, and
//! FIN drain, and the rate-limited storage substrate underneath.
//!
//! The library performs no blocking on its own. Operations are
//! poll-shaped: they return [`Step::Again`] until the peer's next write
//! becomes visible, and an external driver (see [`Driver`]) owns the
//! sleep/retry loop. The TCP bridge that feeds bytes in and out of a
//! [`Connection`] lives outside this crate.

extern crate bytes;
extern crate crc32fast;
#[macro_use]
extern crate failure;
extern crate fnv;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
extern crate tempfile;

use std::ops;

/// Unwraps a store access, converting a contended zone into a poll retry.
///
/// Contention means another process may be mid-write on the zone; the
/// polling caller backs off and looks again on its next time slice.
macro_rules! try_io {
    ($e:expr) => {
        match $e {
            Ok(x) => x,
            Err(::io::StoreError::Contended(_)) => return Ok(::Step::Again),
            Err(e) => return Err(::Error::from(e)),
        }
    };
}

mod connection;
mod driver;
mod endpoint;
mod io;
mod record;
mod zone;

pub use connection::{BrokenPipe, Connection};
pub use driver::Driver;
pub use endpoint::{Client, Config, ConnectAttempt, Server};
pub use io::{checksum, FsZoneStore, IoGate, StoreError, Zone, ZoneStore};
pub use record::{BacklogRecord, CtrlRecord, FinStage, RequestRecord, SndStage};
pub use zone::{is_request_token, make_request_token, Channel, ZoneId};

/// Connection numbers are assigned from `[0, MAX_CONN_NUMS)`.
pub const MAX_CONN_NUMS: u32 = 1000;

/// Which end of the tunnel a state machine belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Outcome of one poll of a multi-step operation.
///
/// `Again` is the transport's "try again" signal: nothing is wrong, but
/// the operation cannot progress until the peer's next write lands. The
/// driver sleeps one time slice and re-invokes the operation.
#[must_use]
#[derive(Debug, Eq, PartialEq)]
pub enum Step<T> {
    Done(T),
    Again,
}

/// Errors surfaced to the bridge.
///
/// Everything recoverable is handled inside the state machines (absent
/// zones, partial writes, backlog races); what escapes here retires the
/// operation, and for `BrokenPipe` the whole connection.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    /// A protocol invariant was violated mid-stream. The transport does
    /// not resynchronise; the connection is to be discarded.
    #[fail(display = "broken pipe: {}", _0)]
    BrokenPipe(BrokenPipe),
    /// No listen backlog exists at the connect address.
    #[fail(display = "connection refused")]
    Refused,
    /// The driver exceeded its retry budget.
    #[fail(display = "timed out")]
    TimedOut,
    /// The IO substrate failed hard.
    #[fail(display = "{}", _0)]
    Store(StoreError),
}

impl From<BrokenPipe> for Error {
    fn from(x: BrokenPipe) -> Self {
        Error::BrokenPipe(x)
    }
}

impl From<StoreError> for Error {
    fn from(x: StoreError) -> Self {
        Error::Store(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_inverts() {
        assert_eq!(!Side::Client, Side::Server);
        assert_eq!(!Side::Server, Side::Client);
        assert_eq!(!!Side::Client, Side::Client);
    }

    #[test]
    fn broken_pipe_wraps() {
        let err = Error::from(BrokenPipe::SeqMismatch);
        assert_matches!(err, Error::BrokenPipe(BrokenPipe::SeqMismatch));
    }
}
