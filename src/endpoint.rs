//! Client and server endpoints: filing connect requests, scanning the
//! listen backlog, and allocating connection numbers.

use std::cmp;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fnv::FnvHashSet;
use rand::rngs::OsRng;
use slog::Logger;

use connection::Connection;
use io::{Zone, ZoneStore};
use record::{BacklogRecord, RequestRecord};
use zone::{self, ZoneId};
use {Error, Side, Step, MAX_CONN_NUMS};

/// Parameters governing a tunnel-side process.
pub struct Config {
    /// Maximum filesystem operations per second for the whole process.
    pub iops: u32,
    /// Milliseconds the driver sleeps between poll retries. Values below
    /// 1 are raised to 1.
    pub time_slice_interval: u64,
    /// Shared directory used as the transport medium. Must name the same
    /// directory at both tunnel sides.
    pub workspace: PathBuf,
    /// Logical address both sides agree on. Arbitrary string.
    pub proxy_address: Option<String>,
    /// Local TCP endpoint the client-side bridge listens on. Consumed by
    /// the bridge, not by the transport.
    pub listen_address: Option<SocketAddr>,
    /// Downstream TCP endpoint the server-side bridge connects to.
    /// Consumed by the bridge, not by the transport.
    pub target_address: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iops: 10,
            time_slice_interval: 10,
            workspace: PathBuf::from("./_workspace"),
            proxy_address: None,
            listen_address: None,
            target_address: None,
        }
    }
}

impl Config {
    /// The driver sleep between poll retries, with the 1 ms floor
    /// applied.
    pub fn time_slice(&self) -> Duration {
        Duration::from_millis(cmp::max(self.time_slice_interval, 1))
    }
}

/// Initiates tunnel connections by filing request records in a server's
/// listen backlog.
pub struct Client {
    log: Logger,
    store: Arc<dyn ZoneStore>,
    rng: OsRng,
}

impl Client {
    pub fn new(log: Logger, store: Arc<dyn ZoneStore>) -> Self {
        Self {
            log,
            store,
            rng: OsRng::new().unwrap(),
        }
    }

    /// Begins connecting to `address`.
    ///
    /// Mints a request token and returns the pending handshake; the
    /// driver polls it until the server acknowledges and assigns a
    /// connection number.
    pub fn connect(&mut self, address: &str) -> ConnectAttempt {
        let token = zone::make_request_token(&mut self.rng);
        trace!(self.log, "connecting"; "address" => %address, "token" => %token);
        ConnectAttempt {
            log: self.log.clone(),
            store: self.store.clone(),
            request_zone: ZoneId::request(address, &token),
            address: address.to_owned(),
            backlog_seen: false,
        }
    }
}

/// A pending client-side handshake.
///
/// Polling first verifies that a listen backlog exists at the address
/// (failing `Refused` otherwise), then files the request record,
/// re-filing it whenever it is found absent or empty, until the server
/// sets the ack and a connection number.
pub struct ConnectAttempt {
    log: Logger,
    store: Arc<dyn ZoneStore>,
    request_zone: ZoneId,
    address: String,
    backlog_seen: bool,
}

impl ConnectAttempt {
    /// Advances the handshake. `Done` carries the established client-side
    /// connection; the request record is deleted before returning it.
    pub fn poll(&mut self) -> Result<Step<Connection>, Error> {
        if !self.backlog_seen {
            match try_io!(self.store.read(&ZoneId::backlog(&self.address), false)) {
                Some(_) => self.backlog_seen = true,
                None => return Err(Error::Refused),
            }
        }

        let record = match try_io!(self.store.read(&self.request_zone, false)) {
            Some(zone) => RequestRecord::from_value(&zone.into_record()).ok(),
            None => None,
        };
        let record = match record {
            // Our record, acknowledged or still waiting.
            Some(ref rec) if rec.conn => rec.clone(),
            // Absent, empty, or mangled: file it (again) and keep polling.
            _ => {
                try_io!(self
                    .store
                    .write(&self.request_zone, &Zone::Record(RequestRecord::connect().to_value())));
                return Ok(Step::Again);
            }
        };

        if !record.conn_ack {
            return Ok(Step::Again);
        }
        let conn_num = match record.conn_num {
            Some(num) => num,
            None => return Ok(Step::Again),
        };

        try_io!(self.store.delete(&self.request_zone));
        debug!(self.log, "connected"; "address" => %self.address, "conn_num" => conn_num);
        let log = self.log.new(o!("connection" => conn_num));
        let zone_id = ZoneId::connection(&self.address, conn_num);
        Ok(Step::Done(Connection::new(
            log,
            self.store.clone(),
            Side::Client,
            zone_id,
            None,
        )))
    }
}

/// Accepts tunnel connections out of a listen backlog.
pub struct Server {
    log: Logger,
    store: Arc<dyn ZoneStore>,
    address: Option<String>,
    conn_nums: ConnNumPool,
}

impl Server {
    pub fn new(log: Logger, store: Arc<dyn ZoneStore>) -> Self {
        Self {
            log,
            store,
            address: None,
            conn_nums: ConnNumPool::new(),
        }
    }

    /// Binds the server to a logical address. Must precede `accept`.
    pub fn listen(&mut self, address: &str) {
        debug!(self.log, "listening"; "address" => %address);
        self.address = Some(address.to_owned());
    }

    /// Polls the listen backlog for an acceptable request. `Done` carries
    /// the established server-side connection.
    ///
    /// # Panics
    /// Panics when called before `listen`.
    pub fn accept(&mut self) -> Result<Step<Connection>, Error> {
        let address = self
            .address
            .clone()
            .expect("accept called before listen");

        let listing = match try_io!(self.store.read(&ZoneId::backlog(&address), true)) {
            Some(zone) => zone.into_record(),
            None => return Ok(Step::Again),
        };
        let listing = match BacklogRecord::from_value(&listing) {
            Ok(listing) => listing,
            Err(_) => return Ok(Step::Again),
        };

        for token in &listing.request_tokens {
            match self.accept_one(&address, token)? {
                Step::Done(conn) => return Ok(Step::Done(conn)),
                Step::Again => continue,
            }
        }
        Ok(Step::Again)
    }

    fn accept_one(&mut self, address: &str, token: &str) -> Result<Step<Connection>, Error> {
        let request_zone = ZoneId::request(address, token);
        let record = match try_io!(self.store.read(&request_zone, false)) {
            Some(zone) => RequestRecord::from_value(&zone.into_record()).ok(),
            None => None,
        };
        let mut record = match record {
            Some(ref rec) if rec.conn => rec.clone(),
            // Stale or unreadable leftovers are dropped from the backlog.
            _ => {
                debug!(self.log, "dropping stale request"; "token" => %token);
                try_io!(self.store.delete(&request_zone));
                return Ok(Step::Again);
            }
        };
        if record.conn_ack {
            // Another acceptor (or an earlier retry) got here first.
            return Ok(Step::Again);
        }

        let lease = match self.conn_nums.allocate() {
            Some(lease) => lease,
            None => {
                debug!(self.log, "connection numbers exhausted");
                return Ok(Step::Again);
            }
        };
        record.conn_ack = true;
        record.conn_num = Some(lease.num());
        try_io!(self
            .store
            .write(&request_zone, &Zone::Record(record.to_value())));

        let conn_num = lease.num();
        debug!(self.log, "accepted connection"; "conn_num" => conn_num, "token" => %token);
        let log = self.log.new(o!("connection" => conn_num));
        let zone_id = ZoneId::connection(address, conn_num);
        Ok(Step::Done(Connection::new(
            log,
            self.store.clone(),
            Side::Server,
            zone_id,
            Some(lease),
        )))
    }

    /// Connections currently holding a number out of the pool.
    pub fn live_connections(&self) -> usize {
        self.conn_nums.in_use()
    }
}

/// Hands out the smallest unused connection number in
/// `[0, MAX_CONN_NUMS)`.
struct ConnNumPool {
    busy: Arc<Mutex<FnvHashSet<u32>>>,
}

impl ConnNumPool {
    fn new() -> Self {
        ConnNumPool {
            busy: Arc::new(Mutex::new(FnvHashSet::default())),
        }
    }

    fn allocate(&self) -> Option<ConnNumLease> {
        let mut busy = self.busy.lock().unwrap();
        let num = (0..MAX_CONN_NUMS).find(|num| !busy.contains(num))?;
        busy.insert(num);
        Some(ConnNumLease {
            num,
            pool: self.busy.clone(),
        })
    }

    fn in_use(&self) -> usize {
        self.busy.lock().unwrap().len()
    }
}

/// Holds one connection number out of the pool; dropping the lease
/// returns the number.
pub(crate) struct ConnNumLease {
    num: u32,
    pool: Arc<Mutex<FnvHashSet<u32>>>,
}

impl ConnNumLease {
    pub(crate) fn num(&self) -> u32 {
        self.num
    }
}

impl Drop for ConnNumLease {
    fn drop(&mut self) {
        self.pool.lock().unwrap().remove(&self.num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use io::{FsZoneStore, IoGate};
    use slog;
    use tempfile::TempDir;

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn rig() -> (TempDir, Arc<dyn ZoneStore>, Client, Server) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ZoneStore> =
            Arc::new(FsZoneStore::new(dir.path(), IoGate::new(100_000)));
        let client = Client::new(discard(), store.clone());
        let server = Server::new(discard(), store.clone());
        (dir, store, client, server)
    }

    fn drive<T, F: FnMut() -> Result<Step<T>, Error>>(mut op: F) -> T {
        for _ in 0..64 {
            match op().unwrap() {
                Step::Done(value) => return value,
                Step::Again => {}
            }
        }
        panic!("operation did not finish");
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let (_dir, _store, mut client, _server) = rig();
        let mut attempt = client.connect("nowhere");
        assert_matches!(attempt.poll(), Err(Error::Refused));
    }

    #[test]
    fn empty_backlog_accepts_nothing() {
        let (_dir, _store, _client, mut server) = rig();
        server.listen("x");
        assert_matches!(server.accept(), Ok(Step::Again));
    }

    #[test]
    #[should_panic(expected = "accept called before listen")]
    fn accept_before_listen_panics() {
        let (_dir, _store, _client, mut server) = rig();
        let _ = server.accept();
    }

    #[test]
    fn handshake_assigns_conn_num_zero() {
        let (dir, _store, mut client, mut server) = rig();
        server.listen("x");
        // Materialise the backlog, as a serving process constantly does.
        assert_matches!(server.accept(), Ok(Step::Again));

        let mut attempt = client.connect("x");
        assert_matches!(attempt.poll(), Ok(Step::Again));
        let server_conn = drive(|| server.accept());
        assert_eq!(server_conn.conn_num(), Some(0));
        assert_eq!(server_conn.side(), ::Side::Server);

        let client_conn = drive(|| attempt.poll());
        assert_eq!(client_conn.side(), ::Side::Client);
        assert_eq!(client_conn.zone_id(), server_conn.zone_id());

        // The request file is gone once the client took the ack.
        let requests = dir.path().join("addresses").join("x").join("requests");
        assert_eq!(requests.read_dir().unwrap().count(), 0);
    }

    #[test]
    fn second_connection_gets_next_num() {
        let (_dir, _store, mut client, mut server) = rig();
        server.listen("x");
        assert_matches!(server.accept(), Ok(Step::Again));

        let mut first = client.connect("x");
        assert_matches!(first.poll(), Ok(Step::Again));
        let first_conn = drive(|| server.accept());
        drive(|| first.poll());

        let mut second = client.connect("x");
        assert_matches!(second.poll(), Ok(Step::Again));
        let second_conn = drive(|| server.accept());
        drive(|| second.poll());

        let mut nums = vec![
            first_conn.conn_num().unwrap(),
            second_conn.conn_num().unwrap(),
        ];
        nums.sort();
        assert_eq!(nums, vec![0, 1]);
        assert_eq!(server.live_connections(), 2);
    }

    #[test]
    fn stale_request_is_dropped() {
        let (dir, store, _client, mut server) = rig();
        server.listen("x");

        // A request record without F_CONN is a leftover; accept deletes
        // it and keeps scanning.
        store
            .write(
                &ZoneId::request("x", "req-stale"),
                &Zone::Record(RequestRecord::default().to_value()),
            )
            .unwrap();
        assert_matches!(server.accept(), Ok(Step::Again));
        let stale = dir
            .path()
            .join("addresses")
            .join("x")
            .join("requests")
            .join("req-stale");
        assert!(!stale.exists());
    }

    #[test]
    fn acked_request_is_skipped() {
        let (_dir, store, _client, mut server) = rig();
        server.listen("x");

        let mut record = RequestRecord::connect();
        record.conn_ack = true;
        record.conn_num = Some(3);
        store
            .write(&ZoneId::request("x", "req-done"), &Zone::Record(record.to_value()))
            .unwrap();
        assert_matches!(server.accept(), Ok(Step::Again));
        assert_eq!(server.live_connections(), 0);
    }

    #[test]
    fn conn_num_reused_after_close() {
        let (_dir, _store, mut client, mut server) = rig();
        server.listen("x");
        assert_matches!(server.accept(), Ok(Step::Again));

        for _ in 0..3 {
            let mut attempt = client.connect("x");
            assert_matches!(attempt.poll(), Ok(Step::Again));
            let server_conn = drive(|| server.accept());
            let _client_conn = drive(|| attempt.poll());
            assert_eq!(server_conn.conn_num(), Some(0));
            drop(server_conn);
            assert_eq!(server.live_connections(), 0);
        }
    }

    #[test]
    fn pool_allocates_smallest_free() {
        let pool = ConnNumPool::new();
        let zero = pool.allocate().unwrap();
        let one = pool.allocate().unwrap();
        let two = pool.allocate().unwrap();
        assert_eq!((zero.num(), one.num(), two.num()), (0, 1, 2));

        drop(one);
        let again = pool.allocate().unwrap();
        assert_eq!(again.num(), 1);
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn pool_exhausts_at_limit() {
        let pool = ConnNumPool::new();
        let mut leases = Vec::new();
        for num in 0..MAX_CONN_NUMS {
            let lease = pool.allocate().unwrap();
            assert_eq!(lease.num(), num);
            leases.push(lease);
        }
        assert!(pool.allocate().is_none());
        leases.pop();
        assert_eq!(pool.allocate().unwrap().num(), MAX_CONN_NUMS - 1);
    }

    #[test]
    fn config_defaults_and_floor() {
        let config = Config::default();
        assert_eq!(config.iops, 10);
        assert_eq!(config.time_slice(), Duration::from_millis(10));
        let config = Config {
            time_slice_interval: 0,
            ..Config::default()
        };
        assert_eq!(config.time_slice(), Duration::from_millis(1));
    }
}
