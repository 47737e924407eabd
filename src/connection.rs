//! The per-connection state machine: a send half and a receive half,
//! each running the request/reply cycle over one control zone and one
//! data zone.
//!
//! From the client's view its sending channel is `c2s` and its receiving
//! channel is `s2c`; the server sees the inverse. The two halves touch
//! disjoint zones, so the bridge may drive them from two threads without
//! racing on a file. A single half, though, must never be polled from
//! two places at once.

use std::cmp;
use std::fmt;
use std::net::Shutdown;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use slog::Logger;

use endpoint::ConnNumLease;
use io::{self, Zone, ZoneStore};
use record::{CtrlRecord, FinStage, SndStage, IDLE_SEQ};
use zone::{Channel, ZoneId};
use {Error, Side, Step};

/// Protocol invariant violations. Any of these retires the connection;
/// there is no resynchronisation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum BrokenPipe {
    /// A payload arrived with a sequence number other than the successor
    /// of the last accepted one.
    #[fail(display = "payload sequence mismatch")]
    SeqMismatch,
    /// The payload blob does not match the checksum in its control
    /// record.
    #[fail(display = "payload checksum mismatch")]
    ChecksumMismatch,
    /// The peer acknowledged a sequence number we never sent.
    #[fail(display = "acknowledged sequence mismatch")]
    AckMismatch,
    /// The send direction has been shut down.
    #[fail(display = "send direction is shut down")]
    SendClosed,
}

pub struct Connection {
    log: Logger,
    store: Arc<dyn ZoneStore>,
    side: Side,
    zone_id: ZoneId,

    //
    // Send half
    //
    send_ctrl: ZoneId,
    send_data: ZoneId,
    /// Last sequence number committed to the control zone.
    send_seq: i64,
    /// FIN has been raised locally; no further payloads may be staged.
    send_eof: bool,
    /// The FIN drain ran to completion and the send zones are gone.
    send_closed: bool,

    //
    // Receive half
    //
    recv_ctrl: ZoneId,
    recv_data: ZoneId,
    /// Last sequence number accepted from the peer.
    recv_seq: i64,
    /// The peer's FIN has been observed and acknowledged.
    recv_eof: bool,
    /// Bytes accepted from the peer but not yet consumed by `recv`.
    recv_buffer: BytesMut,

    /// Server-side conn-num bookkeeping, released once the close drain
    /// completes (or when the connection is dropped).
    lease: Option<ConnNumLease>,
    closed: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("zone_id", &self.zone_id)
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .field("send_eof", &self.send_eof)
            .field("recv_eof", &self.recv_eof)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        log: Logger,
        store: Arc<dyn ZoneStore>,
        side: Side,
        zone_id: ZoneId,
        lease: Option<ConnNumLease>,
    ) -> Self {
        let (send_ctrl, send_data, recv_ctrl, recv_data) = match side {
            Side::Client => (
                zone_id.channel(Channel::C2sCtrl),
                zone_id.channel(Channel::C2sData),
                zone_id.channel(Channel::S2cCtrl),
                zone_id.channel(Channel::S2cData),
            ),
            Side::Server => (
                zone_id.channel(Channel::S2cCtrl),
                zone_id.channel(Channel::S2cData),
                zone_id.channel(Channel::C2sCtrl),
                zone_id.channel(Channel::C2sData),
            ),
        };
        Self {
            log,
            store,
            side,
            zone_id,
            send_ctrl,
            send_data,
            send_seq: 0,
            send_eof: false,
            send_closed: false,
            recv_ctrl,
            recv_data,
            recv_seq: 0,
            recv_eof: false,
            recv_buffer: BytesMut::new(),
            lease,
            closed: false,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The connection zone both endpoints agreed on during accept.
    pub fn zone_id(&self) -> &ZoneId {
        &self.zone_id
    }

    /// The server-assigned connection number, if this is the server side.
    pub fn conn_num(&self) -> Option<u32> {
        self.lease.as_ref().map(|lease| lease.num())
    }

    /// Whether the peer's FIN has been observed.
    pub fn recv_eof(&self) -> bool {
        self.recv_eof
    }

    /// Polls the receiving direction for bytes.
    ///
    /// `Done` carries up to `want` bytes, or the whole buffer when `want`
    /// is 0. Once the peer's FIN has been observed and the buffer is
    /// drained, `Done` carries an empty chunk: end of stream.
    pub fn recv(&mut self, want: usize) -> Result<Step<Bytes>, Error> {
        // Already-buffered bytes satisfy the caller without touching the
        // control zone.
        if self.buffered_enough(want) {
            return Ok(Step::Done(self.cut_buffer(want)));
        }
        if self.recv_eof {
            return Ok(Step::Done(self.cut_buffer(0)));
        }

        let value = match try_io!(self.store.read(&self.recv_ctrl, false)) {
            Some(zone) => zone.into_record(),
            None => return Ok(Step::Again),
        };
        let mut ctrl = match CtrlRecord::from_value(&value) {
            Ok(ctrl) => ctrl,
            Err(_) => return Ok(Step::Again),
        };

        let snd_stage = ctrl.snd_stage();
        let finishing = ctrl.finishing();
        if !finishing && (snd_stage == SndStage::Idle || snd_stage == SndStage::Replying) {
            return Ok(Step::Again);
        }

        if snd_stage == SndStage::Requesting {
            if ctrl.seq != self.recv_seq + 1 {
                debug!(self.log, "bad payload sequence";
                       "seq" => ctrl.seq, "expected" => self.recv_seq + 1);
                return Err(BrokenPipe::SeqMismatch.into());
            }
            let blob = match try_io!(self.store.read(&self.recv_data, false)) {
                Some(zone) => zone.into_blob(),
                None => return Ok(Step::Again),
            };
            let matches = ctrl
                .checksum
                .as_ref()
                .map_or(false, |sum| *sum == io::checksum(&blob));
            if !matches {
                debug!(self.log, "bad payload checksum"; "seq" => ctrl.seq);
                return Err(BrokenPipe::ChecksumMismatch.into());
            }

            self.recv_buffer.extend_from_slice(&blob);
            self.recv_seq += 1;
            ctrl.snd_ack = true;
            ctrl.seq_ack = self.recv_seq;
            try_io!(self.store.write(&self.recv_ctrl, &Zone::Record(ctrl.to_value())));
            // REQUESTING -> REPLYING
            trace!(self.log, "payload accepted"; "seq" => self.recv_seq, "len" => blob.len());
        }

        if finishing {
            ctrl.fin_ack = true;
            try_io!(self.store.write(&self.recv_ctrl, &Zone::Record(ctrl.to_value())));
            self.recv_eof = true;
            trace!(self.log, "peer fin acknowledged");
        }

        if self.buffered_enough(want) {
            return Ok(Step::Done(self.cut_buffer(want)));
        }
        if self.recv_eof {
            return Ok(Step::Done(self.cut_buffer(0)));
        }
        Ok(Step::Again)
    }

    fn buffered_enough(&self, want: usize) -> bool {
        if want == 0 {
            !self.recv_buffer.is_empty()
        } else {
            self.recv_buffer.len() >= want
        }
    }

    /// Cuts up to `want` bytes off the front of the buffer; everything if
    /// `want` is 0.
    fn cut_buffer(&mut self, want: usize) -> Bytes {
        let len = self.recv_buffer.len();
        let n = if want == 0 { len } else { cmp::min(want, len) };
        self.recv_buffer.split_to(n).freeze()
    }

    /// Polls one payload toward the peer.
    ///
    /// The same `data` must be supplied on every poll until `Done`: the
    /// first poll stages it (IDLE -> REQUESTING), later polls wait for
    /// the receiver's ack and clear the cycle (REPLYING -> IDLE).
    pub fn sendall(&mut self, data: &[u8]) -> Result<Step<()>, Error> {
        if self.send_eof {
            return Err(BrokenPipe::SendClosed.into());
        }

        let value = match try_io!(self.store.read(&self.send_ctrl, true)) {
            Some(zone) => zone.into_record(),
            None => return Ok(Step::Again),
        };
        let mut ctrl = match CtrlRecord::from_value(&value) {
            Ok(ctrl) => ctrl,
            Err(_) => return Ok(Step::Again),
        };

        if ctrl.finishing() {
            return Err(BrokenPipe::SendClosed.into());
        }

        match ctrl.snd_stage() {
            SndStage::Idle => {
                let next = self.send_seq + 1;
                try_io!(self
                    .store
                    .write(&self.send_data, &Zone::Blob(Bytes::from(data.to_vec()))));
                ctrl.snd = true;
                ctrl.snd_ack = false;
                ctrl.seq = next;
                ctrl.checksum = Some(io::checksum(data));
                try_io!(self.store.write(&self.send_ctrl, &Zone::Record(ctrl.to_value())));
                self.send_seq = next;
                // IDLE -> REQUESTING
                trace!(self.log, "payload staged"; "seq" => next, "len" => data.len());
                Ok(Step::Again)
            }
            SndStage::Requesting => Ok(Step::Again),
            SndStage::Replying => {
                if ctrl.seq_ack != self.send_seq {
                    debug!(self.log, "bad reply ack";
                           "seq_ack" => ctrl.seq_ack, "expected" => self.send_seq);
                    return Err(BrokenPipe::AckMismatch.into());
                }
                ctrl.snd = false;
                ctrl.snd_ack = false;
                ctrl.seq = IDLE_SEQ;
                ctrl.seq_ack = IDLE_SEQ;
                try_io!(self.store.write(&self.send_ctrl, &Zone::Record(ctrl.to_value())));
                // REPLYING -> IDLE
                trace!(self.log, "payload delivered"; "seq" => self.send_seq);
                Ok(Step::Done(()))
            }
        }
    }

    /// Polls a shutdown of the given direction.
    ///
    /// Shutting down the read side is a no-op. Shutting down the write
    /// side waits for any outstanding payload to drain, raises FIN, and
    /// deletes the send zones once the peer acknowledges. Both halves of
    /// the shutdown must run in the thread that drives `sendall`.
    pub fn shutdown(&mut self, how: Shutdown) -> Result<Step<()>, Error> {
        match how {
            Shutdown::Read => Ok(Step::Done(())),
            Shutdown::Write | Shutdown::Both => self.shutdown_wr(),
        }
    }

    fn shutdown_wr(&mut self) -> Result<Step<()>, Error> {
        if self.send_closed {
            return Ok(Step::Done(()));
        }

        let value = match try_io!(self.store.read(&self.send_ctrl, true)) {
            Some(zone) => zone.into_record(),
            None => return Ok(Step::Again),
        };
        let mut ctrl = match CtrlRecord::from_value(&value) {
            Ok(ctrl) => ctrl,
            Err(_) => return Ok(Step::Again),
        };

        if ctrl.snd_stage() != SndStage::Idle {
            // An outstanding payload drains before FIN may be raised.
            return Ok(Step::Again);
        }

        match ctrl.fin_stage() {
            FinStage::Idle => {
                ctrl.fin = true;
                try_io!(self.store.write(&self.send_ctrl, &Zone::Record(ctrl.to_value())));
                self.send_eof = true;
                // IDLE -> REQUESTING
                trace!(self.log, "fin raised");
                Ok(Step::Again)
            }
            FinStage::Requesting => Ok(Step::Again),
            FinStage::Replying => {
                // FIN acknowledged; the send zones can go away.
                try_io!(self.store.delete(&self.send_ctrl));
                try_io!(self.store.delete(&self.send_data));
                self.send_eof = true;
                self.send_closed = true;
                trace!(self.log, "send channel drained");
                Ok(Step::Done(()))
            }
        }
    }

    /// Polls the connection closed: drains the write direction (unless
    /// that already completed), then releases the server-side conn-num
    /// bookkeeping. Safe to poll repeatedly; later polls return `Done`.
    pub fn close(&mut self) -> Result<Step<()>, Error> {
        if self.closed {
            return Ok(Step::Done(()));
        }
        if !self.send_closed {
            match self.shutdown_wr()? {
                Step::Done(()) => {}
                Step::Again => return Ok(Step::Again),
            }
        }
        // Drained; only now does the conn number go back to the pool.
        self.lease = None;
        self.closed = true;
        debug!(self.log, "connection closed");
        Ok(Step::Done(()))
    }
}
