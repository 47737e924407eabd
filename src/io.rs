//! The IO substrate: zone storage over a shared workspace directory,
//! serialised and rate-limited by a process-wide gate.
//!
//! Every read, write, and delete passes through the [`IoGate`], which
//! enforces mutual exclusion across concurrent zone accesses within the
//! process and throttles the whole process to a configured IOPS budget.
//! Cross-process races are not locked out; the protocol's own
//! seq/checksum/ack discipline absorbs them, and an access that observes
//! a concurrent writer (a file that fails to parse, an OS-level access
//! conflict) surfaces as [`StoreError::Contended`] so the caller retries
//! on its next poll.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crc32fast;
use serde_json;

use record::BacklogRecord;
use zone::{self, Channel, ZoneId};

/// Gate acquisition blocks at most this long before failing hard.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// CRC32 of a payload blob in the agreed textual form: lowercase hex, no
/// `0x` prefix, no zero-padding. Both endpoints must render identically
/// or every transfer fails its checksum comparison.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Content stored in a zone. Control traffic is JSON records; payloads
/// are opaque blobs.
#[derive(Debug, Clone, PartialEq)]
pub enum Zone {
    Record(serde_json::Value),
    Blob(Bytes),
}

impl Zone {
    /// # Panics
    /// Panics if the zone holds a blob; calling this on a data zone is a
    /// programming error.
    pub fn into_record(self) -> serde_json::Value {
        match self {
            Zone::Record(value) => value,
            Zone::Blob(_) => panic!("expected a record zone, found a blob"),
        }
    }

    /// # Panics
    /// Panics if the zone holds a record.
    pub fn into_blob(self) -> Bytes {
        match self {
            Zone::Blob(bytes) => bytes,
            Zone::Record(_) => panic!("expected a blob zone, found a record"),
        }
    }
}

/// Errors out of the storage layer.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum StoreError {
    /// Another process may be mid-write on the zone; poll again.
    #[fail(display = "zone contended: {}", _0)]
    Contended(&'static str),
    /// The IO gate could not be acquired within the liveness timeout.
    #[fail(display = "io gate stalled")]
    GateStalled,
}

/// Storage backend for zones.
///
/// `read` returns `None` only when `create` is false and the zone is
/// absent; with `create` set an absent zone is materialised empty first
/// (an empty record or an empty blob). Deletes are idempotent.
pub trait ZoneStore: Send + Sync {
    fn read(&self, zone_id: &ZoneId, create: bool) -> Result<Option<Zone>, StoreError>;
    fn write(&self, zone_id: &ZoneId, data: &Zone) -> Result<(), StoreError>;
    fn delete(&self, zone_id: &ZoneId) -> Result<(), StoreError>;
}

/// Process-wide serialisation and rate limiting for zone accesses.
///
/// The gate is a binary semaphore plus the timestamp of the last
/// wake-up. A caller acquires the gate, sleeps out the remainder of the
/// IOPS quantum, stamps the wake-up time, performs its filesystem
/// action, and releases. Stamping the wake-up (rather than completion)
/// time keeps the configured interval between wake-ups without counting
/// the action itself against the budget.
pub struct IoGate {
    state: Mutex<GateState>,
    freed: Condvar,
    interval: Duration,
}

struct GateState {
    held: bool,
    last_wake: Option<Instant>,
}

impl IoGate {
    /// A gate budgeting `iops` filesystem operations per second.
    ///
    /// # Panics
    /// Panics if `iops` is zero.
    pub fn new(iops: u32) -> IoGate {
        assert!(iops > 0, "iops must be positive");
        IoGate {
            state: Mutex::new(GateState {
                held: false,
                last_wake: None,
            }),
            freed: Condvar::new(),
            interval: Duration::from_micros(1_000_000 / u64::from(iops)),
        }
    }

    /// Runs one filesystem action under the gate.
    fn run<T, F: FnOnce() -> T>(&self, action: F) -> Result<T, StoreError> {
        let pause = {
            let mut state = self.state.lock().unwrap();
            let deadline = Instant::now() + ACQUIRE_TIMEOUT;
            while state.held {
                let now = Instant::now();
                if now >= deadline {
                    return Err(StoreError::GateStalled);
                }
                let (guard, _) = self.freed.wait_timeout(state, deadline - now).unwrap();
                state = guard;
            }
            state.held = true;
            state.last_wake.and_then(|last| {
                let age = last.elapsed();
                if age < self.interval {
                    Some(self.interval - age)
                } else {
                    None
                }
            })
        };

        if let Some(pause) = pause {
            thread::sleep(pause);
        }
        self.state.lock().unwrap().last_wake = Some(Instant::now());

        let out = action();

        let mut state = self.state.lock().unwrap();
        state.held = false;
        self.freed.notify_one();
        drop(state);
        Ok(out)
    }
}

/// Zone storage over a shared workspace directory.
///
/// Layout under the workspace root:
///
/// ```text
/// addresses/<address>/requests/<token>                  connect requests (JSON)
/// addresses/<address>/connections/<conn_num>/c2s_ctrl   control (JSON)
/// addresses/<address>/connections/<conn_num>/c2s_data   payload (raw bytes)
/// addresses/<address>/connections/<conn_num>/s2c_ctrl
/// addresses/<address>/connections/<conn_num>/s2c_data
/// ```
///
/// Connection numbers are zero-padded to five digits in file paths.
pub struct FsZoneStore {
    workspace: PathBuf,
    gate: IoGate,
}

enum Target {
    /// The backlog aggregate: reading it lists pending request tokens.
    BacklogDir(PathBuf),
    RecordFile { dir: PathBuf, file: PathBuf },
    BlobFile { dir: PathBuf, file: PathBuf },
}

impl FsZoneStore {
    pub fn new<P: Into<PathBuf>>(workspace: P, gate: IoGate) -> FsZoneStore {
        FsZoneStore {
            workspace: workspace.into(),
            gate,
        }
    }

    fn requests_dir(&self, address: &str) -> PathBuf {
        self.workspace.join("addresses").join(address).join("requests")
    }

    /// Maps a zone ID onto the workspace layout.
    ///
    /// # Panics
    /// Panics on an unrecognised zone kind or malformed ID; routing such
    /// an ID is a programming error.
    fn route(&self, zone_id: &ZoneId) -> Target {
        let parts = zone_id.split();
        match (parts[0], parts.len()) {
            (zone::SERVER_LISTEN_BACKLOG, 2) => Target::BacklogDir(self.requests_dir(parts[1])),
            (zone::SERVER_LISTEN_BACKLOG, 3) => {
                let dir = self.requests_dir(parts[1]);
                let file = dir.join(parts[2]);
                Target::RecordFile { dir, file }
            }
            (zone::CONNECTION, 4) => {
                let conn_num: u32 = parts[2]
                    .parse()
                    .unwrap_or_else(|_| panic!("malformed conn_num in zone id: {}", zone_id));
                let channel = Channel::from_id_tag(parts[3])
                    .unwrap_or_else(|| panic!("unknown channel in zone id: {}", zone_id));
                let dir = self
                    .workspace
                    .join("addresses")
                    .join(parts[1])
                    .join("connections")
                    .join(format!("{:05}", conn_num));
                let file = dir.join(channel.file_name());
                if channel.is_ctrl() {
                    Target::RecordFile { dir, file }
                } else {
                    Target::BlobFile { dir, file }
                }
            }
            _ => panic!("unknown zone id: {}", zone_id),
        }
    }

    fn read_target(target: &Target, create: bool) -> Result<Option<Zone>, StoreError> {
        match *target {
            Target::BacklogDir(ref dir) => {
                if !dir.is_dir() {
                    if !create {
                        return Ok(None);
                    }
                    fs::create_dir_all(dir)
                        .map_err(|_| StoreError::Contended("backlog dir not creatable"))?;
                }
                let entries =
                    fs::read_dir(dir).map_err(|_| StoreError::Contended("backlog dir unreadable"))?;
                let mut tokens = Vec::new();
                for entry in entries {
                    let entry =
                        entry.map_err(|_| StoreError::Contended("backlog dir unreadable"))?;
                    if let Ok(name) = entry.file_name().into_string() {
                        if zone::is_request_token(&name) {
                            tokens.push(name);
                        }
                    }
                }
                let listing = BacklogRecord {
                    pending: tokens.len(),
                    request_tokens: tokens,
                };
                Ok(Some(Zone::Record(listing.to_value())))
            }
            Target::RecordFile { ref dir, ref file } => {
                if create {
                    Self::materialise(dir, file, b"{}")?;
                }
                let raw = match Self::read_file(file)? {
                    Some(raw) => raw,
                    None => return Ok(None),
                };
                let value = serde_json::from_slice(&raw)
                    .map_err(|_| StoreError::Contended("someone may be writing this zone"))?;
                Ok(Some(Zone::Record(value)))
            }
            Target::BlobFile { ref dir, ref file } => {
                if create {
                    Self::materialise(dir, file, b"")?;
                }
                match Self::read_file(file)? {
                    Some(raw) => Ok(Some(Zone::Blob(Bytes::from(raw)))),
                    None => Ok(None),
                }
            }
        }
    }

    /// Creates the parent directory and an empty zone file if absent.
    fn materialise(dir: &PathBuf, file: &PathBuf, empty: &[u8]) -> Result<(), StoreError> {
        if !dir.is_dir() {
            fs::create_dir_all(dir).map_err(|_| StoreError::Contended("zone dir not creatable"))?;
        }
        if !file.is_file() {
            fs::write(file, empty).map_err(|_| StoreError::Contended("zone not creatable"))?;
        }
        Ok(())
    }

    fn read_file(file: &PathBuf) -> Result<Option<Vec<u8>>, StoreError> {
        let mut fd = match fs::File::open(file) {
            Ok(fd) => fd,
            Err(ref e) if e.kind() == ::std::io::ErrorKind::NotFound => return Ok(None),
            Err(_) => return Err(StoreError::Contended("zone unreadable")),
        };
        let mut raw = Vec::new();
        fd.read_to_end(&mut raw)
            .map_err(|_| StoreError::Contended("zone unreadable"))?;
        Ok(Some(raw))
    }

    fn write_target(target: &Target, data: &Zone) -> Result<(), StoreError> {
        let (dir, file, raw) = match (target, data) {
            (&Target::RecordFile { ref dir, ref file }, &Zone::Record(ref value)) => {
                (dir, file, serde_json::to_vec(value).unwrap())
            }
            (&Target::BlobFile { ref dir, ref file }, &Zone::Blob(ref bytes)) => {
                (dir, file, bytes.to_vec())
            }
            (&Target::BacklogDir(_), _) => panic!("backlog aggregate is not writable"),
            _ => panic!("zone content does not match the zone kind"),
        };
        if !dir.is_dir() {
            fs::create_dir_all(dir).map_err(|_| StoreError::Contended("zone dir not creatable"))?;
        }
        fs::write(file, &raw).map_err(|_| StoreError::Contended("zone not writable"))?;
        Ok(())
    }

    fn delete_target(target: &Target) -> Result<(), StoreError> {
        let result = match *target {
            Target::BacklogDir(ref dir) => fs::remove_dir_all(dir),
            Target::RecordFile { ref file, .. } | Target::BlobFile { ref file, .. } => {
                fs::remove_file(file)
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == ::std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(StoreError::Contended("zone not deletable")),
        }
    }
}

impl ZoneStore for FsZoneStore {
    fn read(&self, zone_id: &ZoneId, create: bool) -> Result<Option<Zone>, StoreError> {
        let target = self.route(zone_id);
        self.gate.run(|| Self::read_target(&target, create))?
    }

    fn write(&self, zone_id: &ZoneId, data: &Zone) -> Result<(), StoreError> {
        let target = self.route(zone_id);
        self.gate.run(|| Self::write_target(&target, data))?
    }

    fn delete(&self, zone_id: &ZoneId) -> Result<(), StoreError> {
        let target = self.route(zone_id);
        self.gate.run(|| Self::delete_target(&target))?
    }
}
