//! End-to-end scenarios over real loopback UDP sockets: an integration
//! suite that actually exercises the receiver/monitor/updater threads
//! together: lossless transfer, uniform
//! and bursty synthetic loss recovered by FEC and/or KCP retransmission, read
//! deadlines, and close-during-read.
//!
//! Loss is injected with a `Carrier` decorator around a real `UdpCarrier`
//! that silently swallows a deterministic subset of outbound datagrams
//! instead of handing them to the kernel — the natural way to get
//! reproducible drop patterns without faking the transport itself.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rkcp::{Carrier, Config, Listener, PeerAddr, Session, UdpCarrier};

struct DropCarrier {
    inner: UdpCarrier,
    sent: AtomicU64,
    drop_at: Box<dyn Fn(u64) -> bool + Send + Sync>,
}

impl DropCarrier {
    fn new(inner: UdpCarrier, drop_at: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        DropCarrier {
            inner,
            sent: AtomicU64::new(0),
            drop_at: Box::new(drop_at),
        }
    }
}

impl Carrier for DropCarrier {
    fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, PeerAddr)> {
        self.inner.recv_from(buf)
    }

    fn send_to(&self, buf: &[u8], peer: PeerAddr) -> std::io::Result<usize> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed);
        if (self.drop_at)(n) {
            return Ok(buf.len());
        }
        self.inner.send_to(buf, peer)
    }

    fn local_addr(&self) -> std::io::Result<PeerAddr> {
        self.inner.local_addr()
    }

    fn close(&self) -> std::io::Result<()> {
        self.inner.close()
    }
}

fn bind_listener(config: Config) -> Listener {
    Listener::bind("127.0.0.1:0".parse().unwrap(), config, None).unwrap()
}

fn dial_lossy(
    peer: SocketAddr,
    conv: u32,
    config: Config,
    drop_at: impl Fn(u64) -> bool + Send + Sync + 'static,
) -> Session {
    let udp = UdpCarrier::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let carrier: Arc<dyn Carrier> = Arc::new(DropCarrier::new(udp, drop_at));
    Session::dial_with_carrier(carrier, peer.into(), conv, config, None).unwrap()
}

fn sample_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn accept_with_deadline(listener: &Listener, timeout: Duration) -> Session {
    listener.set_accept_deadline(Some(Instant::now() + timeout));
    listener.accept().expect("expected an accepted session")
}

fn read_all(session: &mut Session, want: usize, overall_timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + overall_timeout;
    let mut out = Vec::with_capacity(want);
    let mut buf = vec![0u8; 65536];
    while out.len() < want {
        session.set_read_deadline(Some(deadline));
        let n = session
            .read(&mut buf)
            .expect("read failed before reaching the expected byte count");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn base_config() -> Config {
    Config::new().nodelay(true, 10, 2, true).stream(true)
}

#[test]
fn lossless_stream_round_trips_exactly() {
    let listener = bind_listener(base_config());
    let PeerAddr { ip, port } = listener.local_addr().unwrap();
    let addr = SocketAddr::new(ip, port);

    let payload = sample_payload(256 * 1024);
    let chunks = payload.clone();
    let writer = thread::spawn(move || {
        let mut client = dial_lossy(addr, 1, base_config(), |_| false);
        for chunk in chunks.chunks(64 * 1024) {
            client.write_all(chunk).unwrap();
        }
        thread::sleep(Duration::from_millis(500));
    });

    let mut server = accept_with_deadline(&listener, Duration::from_secs(5));
    let received = read_all(&mut server, payload.len(), Duration::from_secs(15));

    assert_eq!(received, payload);
    let snap = listener.stats().snapshot();
    assert_eq!(snap.in_csum_errors, 0);
    assert_eq!(snap.fec_recovered, 0);

    writer.join().unwrap();
}

#[test]
fn uniform_light_loss_recovers_via_fec() {
    let listener = bind_listener(base_config());
    let PeerAddr { ip, port } = listener.local_addr().unwrap();
    let addr = SocketAddr::new(ip, port);

    let payload = sample_payload(96 * 1024);
    let chunks = payload.clone();
    let writer = thread::spawn(move || {
        // Drop one in every 100 outbound datagrams: far below the FEC
        // group's recovery budget (3 of 13) for any one group.
        let mut client = dial_lossy(addr, 2, base_config(), |n| n % 100 == 0);
        for chunk in chunks.chunks(16 * 1024) {
            client.write_all(chunk).unwrap();
        }
        thread::sleep(Duration::from_millis(500));
    });

    let mut server = accept_with_deadline(&listener, Duration::from_secs(5));
    let received = read_all(&mut server, payload.len(), Duration::from_secs(15));

    assert_eq!(received, payload);
    let snap = listener.stats().snapshot();
    assert_eq!(snap.in_csum_errors, 0);
    assert!(snap.fec_recovered > 0);

    writer.join().unwrap();
}

#[test]
fn burst_loss_within_fec_budget_needs_no_retransmit() {
    let listener = bind_listener(base_config());
    let PeerAddr { ip, port } = listener.local_addr().unwrap();
    let addr = SocketAddr::new(ip, port);

    let payload = sample_payload(96 * 1024);
    let chunks = payload.clone();
    let writer = thread::spawn(move || {
        // Every group of 13 shards (10 data + 3 parity) loses its first 3
        // datagrams, i.e. exactly up to the group's parity budget.
        let mut client = dial_lossy(addr, 3, base_config(), |n| n % 13 < 3);
        for chunk in chunks.chunks(16 * 1024) {
            client.write_all(chunk).unwrap();
        }
        thread::sleep(Duration::from_millis(500));
    });

    let mut server = accept_with_deadline(&listener, Duration::from_secs(5));
    let received = read_all(&mut server, payload.len(), Duration::from_secs(15));

    assert_eq!(received, payload);
    let snap = listener.stats().snapshot();
    assert!(snap.fec_recovered > 0);
    assert_eq!(snap.retrans_segs, 0);

    writer.join().unwrap();
}

#[test]
fn burst_loss_beyond_fec_budget_still_delivers_via_retransmit() {
    let listener = bind_listener(base_config());
    let PeerAddr { ip, port } = listener.local_addr().unwrap();
    let addr = SocketAddr::new(ip, port);

    let payload = sample_payload(64 * 1024);
    let chunks = payload.clone();
    let writer = thread::spawn(move || {
        // A 2-of-7 drop cadence is not aligned with the 13-shard FEC group,
        // so some groups lose more than their 3-shard parity budget and
        // fall back to KCP retransmission for the rest.
        let mut client = dial_lossy(addr, 4, base_config(), |n| n % 7 < 2);
        for chunk in chunks.chunks(16 * 1024) {
            client.write_all(chunk).unwrap();
        }
        thread::sleep(Duration::from_millis(500));
    });

    let mut server = accept_with_deadline(&listener, Duration::from_secs(5));
    let received = read_all(&mut server, payload.len(), Duration::from_secs(20));

    assert_eq!(received, payload);
    let snap = listener.stats().snapshot();
    assert!(snap.retrans_segs > 0);

    writer.join().unwrap();
}

#[test]
fn read_deadline_times_out_then_resets() {
    let listener = bind_listener(base_config());
    let PeerAddr { ip, port } = listener.local_addr().unwrap();
    let addr = SocketAddr::new(ip, port);

    let client = Session::dial(addr, base_config(), None).unwrap();
    let mut server = accept_with_deadline(&listener, Duration::from_secs(5));

    let started = Instant::now();
    server.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 16];
    let err = server.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(90) && elapsed < Duration::from_millis(500));

    // Clearing the deadline makes the next read block normally again.
    server.set_read_deadline(None);
    let mut client = client;
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"resumed").unwrap();
    });
    let n = server.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"resumed");
    writer.join().unwrap();
}

// The concurrent "close unblocks a thread parked in a blocking read" half of
// this scenario is exercised at the `SessionShared` layer in
// `session.rs`'s own unit tests (`close_from_another_thread_unblocks_a_blocking_read`),
// since `Session` doesn't expose a cloneable handle to its shared state.
// This covers the rest: broken-pipe after close, and a second close also
// broken-pipe.
#[test]
fn close_then_read_is_broken_pipe_and_second_close_is_broken_pipe() {
    let listener = bind_listener(base_config());
    let PeerAddr { ip, port } = listener.local_addr().unwrap();
    let addr = SocketAddr::new(ip, port);

    let _client = Session::dial(addr, base_config(), None).unwrap();
    let mut server = accept_with_deadline(&listener, Duration::from_secs(5));

    server.close().unwrap();
    let mut buf = [0u8; 16];
    let err = server.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    assert_eq!(
        server.close().unwrap_err().kind(),
        std::io::ErrorKind::BrokenPipe
    );
}
