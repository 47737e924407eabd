//! End-to-end tunnel scenarios over a shared workspace directory, with
//! each side running behind its own store and IOPS gate the way two
//! separate processes would.

#[macro_use]
extern crate slog;
extern crate kamui_proto;
extern crate slog_term;
extern crate tempfile;

use std::net::Shutdown;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slog::{Drain, Logger};
use tempfile::TempDir;

use kamui_proto::{
    Client, Config, Driver, Error, FsZoneStore, IoGate, Server, Step, ZoneId, ZoneStore,
};

fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

fn process_store(config: &Config) -> Arc<dyn ZoneStore> {
    Arc::new(FsZoneStore::new(
        config.workspace.clone(),
        IoGate::new(config.iops),
    ))
}

fn test_config(workspace: &TempDir) -> Config {
    Config {
        iops: 100_000,
        time_slice_interval: 1,
        workspace: workspace.path().to_path_buf(),
        proxy_address: Some("x".to_owned()),
        ..Config::default()
    }
}

/// Steps `op` until `Done` without sleeping, for single-threaded tests.
fn drive<T, F: FnMut() -> Result<Step<T>, Error>>(mut op: F) -> T {
    for _ in 0..256 {
        match op().unwrap() {
            Step::Done(value) => return value,
            Step::Again => {}
        }
    }
    panic!("operation did not finish");
}

fn assert_again<T>(step: Step<T>) {
    match step {
        Step::Again => {}
        Step::Done(_) => panic!("operation completed unexpectedly"),
    }
}

/// One accept pass with nothing pending; materialises the backlog the
/// way a serving process does on its first poll.
fn prime_backlog(server: &mut Server) {
    assert_again(server.accept().unwrap());
}

#[test]
fn echo_small_payload() {
    let workspace = TempDir::new().unwrap();
    let config = test_config(&workspace);
    let driver = Driver::new(config.time_slice()).with_timeout(Duration::from_secs(10));
    let log = logger();

    let server_store = process_store(&config);
    let server_log = log.new(o!("side" => "server"));
    let server = thread::spawn(move || {
        let mut server = Server::new(server_log, server_store);
        server.listen("x");
        let mut conn = driver.run(|| server.accept()).unwrap();

        let mut inbound = Vec::new();
        loop {
            let chunk = driver.run(|| conn.recv(0)).unwrap();
            if chunk.is_empty() {
                break;
            }
            inbound.extend_from_slice(&chunk);
        }
        driver.run(|| conn.sendall(&inbound)).unwrap();
        driver.run(|| conn.shutdown(Shutdown::Write)).unwrap();
        driver.run(|| conn.close()).unwrap();
        assert_eq!(server.live_connections(), 0);
        inbound
    });

    let client_store = process_store(&config);
    let mut client = Client::new(log.new(o!("side" => "client")), client_store);
    // The server may not have materialised its backlog yet; until it has,
    // connecting reads as refused.
    let mut conn = loop {
        let mut attempt = client.connect("x");
        match driver.run(|| attempt.poll()) {
            Ok(conn) => break conn,
            Err(Error::Refused) => thread::sleep(Duration::from_millis(2)),
            Err(e) => panic!("connect failed: {}", e),
        }
    };

    driver.run(|| conn.sendall(b"hi")).unwrap();
    driver.run(|| conn.shutdown(Shutdown::Write)).unwrap();
    let echoed = driver.run(|| conn.recv(0)).unwrap();
    assert_eq!(&echoed[..], b"hi");
    assert!(driver.run(|| conn.recv(0)).unwrap().is_empty());
    driver.run(|| conn.close()).unwrap();

    assert_eq!(&server.join().unwrap()[..], b"hi");

    // A cleanly closed connection leaves no files behind.
    let conn_dir = workspace
        .path()
        .join("addresses")
        .join("x")
        .join("connections")
        .join("00000");
    let leftovers: Vec<_> = conn_dir.read_dir().unwrap().map(|e| e.unwrap()).collect();
    assert!(
        leftovers.is_empty(),
        "leftover connection files: {:?}",
        leftovers
    );
    let requests = workspace.path().join("addresses").join("x").join("requests");
    assert_eq!(requests.read_dir().unwrap().count(), 0);
}

#[test]
fn two_clients_share_the_backlog() {
    let workspace = TempDir::new().unwrap();
    let config = test_config(&workspace);
    let log = logger();

    let mut server = Server::new(log.new(o!("side" => "server")), process_store(&config));
    server.listen("x");
    prime_backlog(&mut server);

    let mut client = Client::new(log.new(o!("side" => "client")), process_store(&config));
    let mut first = client.connect("x");
    let mut second = client.connect("x");
    assert_again(first.poll().unwrap());
    assert_again(second.poll().unwrap());

    // Whichever token lists first is accepted first and gets conn num 0.
    let conn_a = drive(|| server.accept());
    let conn_b = drive(|| server.accept());
    assert_eq!(conn_a.conn_num(), Some(0));
    assert_eq!(conn_b.conn_num(), Some(1));

    let first_conn = drive(|| first.poll());
    let second_conn = drive(|| second.poll());
    let mut zones = vec![
        first_conn.zone_id().as_str().to_owned(),
        second_conn.zone_id().as_str().to_owned(),
    ];
    zones.sort();
    assert_eq!(
        zones,
        vec![
            ZoneId::connection("x", 0).as_str().to_owned(),
            ZoneId::connection("x", 1).as_str().to_owned(),
        ]
    );

    // Both request files are gone once the acks were consumed.
    let requests = workspace.path().join("addresses").join("x").join("requests");
    assert_eq!(requests.read_dir().unwrap().count(), 0);
}

#[test]
fn conn_nums_recycle_across_many_connections() {
    let workspace = TempDir::new().unwrap();
    let config = test_config(&workspace);
    let log = logger();

    let mut server = Server::new(log.new(o!("side" => "server")), process_store(&config));
    server.listen("x");
    prime_backlog(&mut server);
    let mut client = Client::new(log.new(o!("side" => "client")), process_store(&config));

    for round in 0..1001 {
        let mut attempt = client.connect("x");
        assert_again(attempt.poll().unwrap());
        let mut server_conn = drive(|| server.accept());
        let mut client_conn = drive(|| attempt.poll());
        assert_eq!(server_conn.conn_num(), Some(0), "round {}", round);

        // Close both ends, pumping the peer so each FIN drains.
        let mut steps = 0;
        loop {
            match server_conn.close().unwrap() {
                Step::Done(()) => break,
                Step::Again => {
                    let _ = client_conn.recv(0).unwrap();
                }
            }
            steps += 1;
            assert!(steps < 64);
        }
        let mut steps = 0;
        loop {
            match client_conn.close().unwrap() {
                Step::Done(()) => break,
                Step::Again => {
                    let _ = server_conn.recv(0).unwrap();
                }
            }
            steps += 1;
            assert!(steps < 64);
        }
        assert_eq!(server.live_connections(), 0);
    }
}

#[test]
fn abandoned_peer_times_out() {
    let workspace = TempDir::new().unwrap();
    let config = test_config(&workspace);
    let log = logger();

    let mut server = Server::new(log.new(o!("side" => "server")), process_store(&config));
    server.listen("x");
    prime_backlog(&mut server);

    // The backlog exists but nothing is accepting: the request sits
    // unanswered until the driver's budget runs out.
    let mut client = Client::new(log.new(o!("side" => "client")), process_store(&config));
    let mut attempt = client.connect("x");
    let driver = Driver::new(Duration::from_millis(1)).with_timeout(Duration::from_millis(50));
    match driver.run(|| attempt.poll()) {
        Err(Error::TimedOut) => {}
        Err(e) => panic!("expected a timeout, got {}", e),
        Ok(_) => panic!("expected a timeout, got a connection"),
    }
}
