//! Listener: demultiplexes one carrier's inbound datagrams across many
//! peers, admitting new sessions and handing them off through a bounded
//! accept queue (`accept_backlog = 128`), the way `TcpListener::accept`
//! blocks on a `Condvar` over a queue of pending connections.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use log::warn;

use crate::carrier::{Carrier, PeerAddr, UdpCarrier};
use crate::config::Config;
use crate::consts::{ACCEPT_BACKLOG, FEC_HEADER_SIZE_PLUS2, RECEIVER_QUEUE};
use crate::crypto::{open_datagram, BlockCrypt, Opened};
use crate::err::Error;
use crate::fec::{self, ShardKind};
use crate::pool::Pool;
use crate::session::{ClosedNotifier, Session, SessionShared};
use crate::stats::Stats;

struct RecvItem {
    buf: Box<[u8; crate::consts::MTU_LIMIT]>,
    len: usize,
    peer: PeerAddr,
}

#[derive(Default)]
struct MonitorState {
    recv_queue: VecDeque<RecvItem>,
    closed_queue: VecDeque<PeerAddr>,
    shutdown: bool,
}

#[derive(Default)]
struct AcceptState {
    queue: VecDeque<Session>,
    closed: bool,
    deadline: Option<Instant>,
}

/// A bound carrier endpoint accepting connections from many peers, in the
/// spirit of a `TcpListener` but demultiplexing by FEC-aware conversation
/// id rather than the kernel's own port/address demux.
pub struct Listener {
    carrier: Arc<dyn Carrier>,
    monitor_state: Arc<Mutex<MonitorState>>,
    monitor_cv: Arc<Condvar>,
    accept_state: Arc<Mutex<AcceptState>>,
    accept_cv: Arc<Condvar>,
    closed: Arc<AtomicBool>,
    stats: Arc<Stats>,
}

impl Listener {
    /// Binds a UDP carrier and starts listening. `crypto` is `None` to
    /// disable the crypto header entirely.
    pub fn bind(
        addr: SocketAddr,
        config: Config,
        crypto: Option<Arc<dyn BlockCrypt>>,
    ) -> io::Result<Listener> {
        let carrier: Arc<dyn Carrier> = Arc::new(UdpCarrier::bind(addr)?);
        Ok(Self::with_carrier(carrier, config, crypto))
    }

    /// Listens over a caller-supplied carrier (e.g. the `raw-icmp`
    /// feature's `IcmpCarrier`).
    pub fn with_carrier(
        carrier: Arc<dyn Carrier>,
        config: Config,
        crypto: Option<Arc<dyn BlockCrypt>>,
    ) -> Listener {
        let monitor_state = Arc::new(Mutex::new(MonitorState::default()));
        let monitor_cv = Arc::new(Condvar::new());
        let accept_state = Arc::new(Mutex::new(AcceptState::default()));
        let accept_cv = Arc::new(Condvar::new());
        let closed = Arc::new(AtomicBool::new(false));
        let stats = Stats::new();
        let pool = Arc::new(Pool::new());

        spawn_receiver(
            carrier.clone(),
            pool.clone(),
            monitor_state.clone(),
            monitor_cv.clone(),
            closed.clone(),
        );
        spawn_monitor(
            carrier.clone(),
            pool,
            monitor_state.clone(),
            monitor_cv.clone(),
            accept_state.clone(),
            accept_cv.clone(),
            config,
            crypto,
            stats.clone(),
        );

        Listener {
            carrier,
            monitor_state,
            monitor_cv,
            accept_state,
            accept_cv,
            closed,
            stats,
        }
    }

    pub fn local_addr(&self) -> io::Result<PeerAddr> {
        self.carrier.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn set_accept_deadline(&self, deadline: Option<Instant>) {
        self.accept_state.lock().unwrap().deadline = deadline;
        self.accept_cv.notify_all();
    }

    /// Blocks until a new session arrives, the accept deadline elapses, or
    /// the listener is closed.
    pub fn accept(&self) -> io::Result<Session> {
        let mut state = self.accept_state.lock().unwrap();
        loop {
            if let Some(session) = state.queue.pop_front() {
                return Ok(session);
            }
            if state.closed {
                return Err(Error::BrokenPipe.into());
            }

            match state.deadline {
                None => state = self.accept_cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout.into());
                    }
                    let (s2, res) = self.accept_cv.wait_timeout(state, deadline - now).unwrap();
                    state = s2;
                    if res.timed_out() && state.queue.is_empty() && !state.closed {
                        return Err(Error::Timeout.into());
                    }
                }
            }
        }
    }

    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::BrokenPipe.into());
        }

        self.monitor_state.lock().unwrap().shutdown = true;
        self.monitor_cv.notify_all();

        self.accept_state.lock().unwrap().closed = true;
        self.accept_cv.notify_all();

        self.carrier.close()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Loops on the carrier's blocking read, delivering each datagram into the
/// monitor's bounded receive queue (`qlen = 128`). Backs off (waits on
/// `monitor_cv`) when the queue is full rather than dropping, since the
/// carrier's own read timeout already bounds how long a full queue stalls
/// ingestion.
fn spawn_receiver(
    carrier: Arc<dyn Carrier>,
    pool: Arc<Pool>,
    monitor_state: Arc<Mutex<MonitorState>>,
    monitor_cv: Arc<Condvar>,
    closed: Arc<AtomicBool>,
) {
    thread::spawn(move || loop {
        if closed.load(Ordering::Relaxed) {
            return;
        }

        let mut buf = pool.acquire();
        match carrier.recv_from(&mut buf[..]) {
            Ok((len, peer)) => {
                let mut state = monitor_state.lock().unwrap();
                while state.recv_queue.len() >= RECEIVER_QUEUE && !state.shutdown {
                    state = monitor_cv.wait(state).unwrap();
                }
                if state.shutdown {
                    pool.release(buf);
                    return;
                }
                state.recv_queue.push_back(RecvItem { buf, len, peer });
                drop(state);
                monitor_cv.notify_all();
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                pool.release(buf);
            }
            Err(e) => {
                pool.release(buf);
                warn!("listener carrier read failed, shutting down: {e}");
                let mut state = monitor_state.lock().unwrap();
                state.shutdown = true;
                drop(state);
                monitor_cv.notify_all();
                return;
            }
        }
    });
}

/// The single demultiplex task (the monitor): owns the peer-address →
/// session map exclusively, so it never needs a lock on it.
fn spawn_monitor(
    carrier: Arc<dyn Carrier>,
    pool: Arc<Pool>,
    monitor_state: Arc<Mutex<MonitorState>>,
    monitor_cv: Arc<Condvar>,
    accept_state: Arc<Mutex<AcceptState>>,
    accept_cv: Arc<Condvar>,
    config: Config,
    crypto: Option<Arc<dyn BlockCrypt>>,
    stats: Arc<Stats>,
) {
    thread::spawn(move || {
        let mut sessions: HashMap<PeerAddr, Arc<SessionShared>> = HashMap::new();
        let mut last_peer: Option<(PeerAddr, Arc<SessionShared>)> = None;

        loop {
            let (item, closed_peers, done) = {
                let mut state = monitor_state.lock().unwrap();
                while state.recv_queue.is_empty() && state.closed_queue.is_empty() && !state.shutdown
                {
                    state = monitor_cv.wait(state).unwrap();
                }
                let closed_peers: Vec<PeerAddr> = state.closed_queue.drain(..).collect();
                let item = state.recv_queue.pop_front();
                let done = state.shutdown && item.is_none() && state.recv_queue.is_empty();
                (item, closed_peers, done)
            };
            monitor_cv.notify_all();

            for peer in closed_peers {
                sessions.remove(&peer);
                if last_peer.as_ref().is_some_and(|(p, _)| *p == peer) {
                    last_peer = None;
                }
            }

            let Some(RecvItem { buf, len, peer }) = item else {
                if done {
                    return;
                }
                continue;
            };

            demux_one(
                &buf[..len],
                peer,
                &mut sessions,
                &mut last_peer,
                &carrier,
                &config,
                &crypto,
                &stats,
                &accept_state,
                &accept_cv,
                &monitor_state,
                &monitor_cv,
            );
            pool.release(buf);
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn demux_one(
    datagram: &[u8],
    peer: PeerAddr,
    sessions: &mut HashMap<PeerAddr, Arc<SessionShared>>,
    last_peer: &mut Option<(PeerAddr, Arc<SessionShared>)>,
    carrier: &Arc<dyn Carrier>,
    config: &Config,
    crypto: &Option<Arc<dyn BlockCrypt>>,
    stats: &Arc<Stats>,
    accept_state: &Arc<Mutex<AcceptState>>,
    accept_cv: &Arc<Condvar>,
    monitor_state: &Arc<Mutex<MonitorState>>,
    monitor_cv: &Arc<Condvar>,
) {
    stats.incr_in_pkts(1);
    stats.incr_in_bytes(datagram.len() as u64);

    let payload = match open_datagram(datagram, crypto.as_deref()) {
        Opened::Payload(p) => p,
        Opened::Malformed => {
            stats.incr_in_errs(1);
            return;
        }
        Opened::ChecksumMismatch => {
            stats.incr_in_csum_errors(1);
            return;
        }
    };

    if let Some((cached_peer, session)) = last_peer.as_ref() {
        if *cached_peer == peer {
            session.ingress_decrypted(&payload);
            return;
        }
    }

    if let Some(session) = sessions.get(&peer) {
        session.ingress_decrypted(&payload);
        *last_peer = Some((peer, session.clone()));
        return;
    }

    admit(
        &payload,
        peer,
        sessions,
        last_peer,
        carrier,
        config,
        crypto,
        stats,
        accept_state,
        accept_cv,
        monitor_state,
        monitor_cv,
    );
}

/// Admits a new session for an unrecognized peer. A peer's first datagram
/// being an FEC parity shard is indistinguishable from noise (no
/// conversation id to key a session on) and is dropped without creating
/// one — a known parity-first asymmetry, kept rather than special-cased.
#[allow(clippy::too_many_arguments)]
fn admit(
    payload: &[u8],
    peer: PeerAddr,
    sessions: &mut HashMap<PeerAddr, Arc<SessionShared>>,
    last_peer: &mut Option<(PeerAddr, Arc<SessionShared>)>,
    carrier: &Arc<dyn Carrier>,
    config: &Config,
    crypto: &Option<Arc<dyn BlockCrypt>>,
    stats: &Arc<Stats>,
    accept_state: &Arc<Mutex<AcceptState>>,
    accept_cv: &Arc<Condvar>,
    monitor_state: &Arc<Mutex<MonitorState>>,
    monitor_cv: &Arc<Condvar>,
) {
    {
        let state = accept_state.lock().unwrap();
        if state.closed || state.queue.len() >= ACCEPT_BACKLOG {
            return;
        }
    }

    let Some(conv) = extract_conv(payload, config.fec_enabled()) else {
        return;
    };

    let notifier: ClosedNotifier = {
        let monitor_state = monitor_state.clone();
        let monitor_cv = monitor_cv.clone();
        Arc::new(move |closed_peer: PeerAddr| {
            let mut state = monitor_state.lock().unwrap();
            state.closed_queue.push_back(closed_peer);
            drop(state);
            monitor_cv.notify_all();
        })
    };

    let shared = match SessionShared::new_passive(
        carrier.clone(),
        peer,
        conv,
        config,
        crypto.clone(),
        stats.clone(),
        notifier,
    ) {
        Ok(shared) => shared,
        Err(e) => {
            warn!("failed to admit session for {peer}: {e}");
            stats.incr_in_errs(1);
            return;
        }
    };

    shared.ingress_decrypted(payload);
    sessions.insert(peer, shared.clone());
    *last_peer = Some((peer, shared.clone()));

    stats.incr_passive_opens(1);
    stats.conn_opened();

    let mut state = accept_state.lock().unwrap();
    if state.closed || state.queue.len() >= ACCEPT_BACKLOG {
        drop(state);
        let _ = shared.close();
        return;
    }
    state.queue.push_back(Session::from_shared(shared));
    drop(state);
    accept_cv.notify_all();
}

/// Extracts the 32-bit conversation id a fresh datagram would use to key a
/// new session: at offset 0 with FEC disabled, or at offset
/// `fec_header_size_plus2` when the FEC header marks the datagram as a data
/// shard. Any other FEC flag (parity) yields `None`.
fn extract_conv(payload: &[u8], fec_enabled: bool) -> Option<u32> {
    let conv_at = if fec_enabled {
        let (_, kind) = fec::parse_header(payload)?;
        if kind != ShardKind::Data {
            return None;
        }
        FEC_HEADER_SIZE_PLUS2
    } else {
        0
    };

    let bytes = payload.get(conv_at..conv_at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}
