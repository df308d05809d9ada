//! Session: binds the packet pool, nonce source, FEC codec, crypto and
//! KCP core to one peer and exposes a blocking duplex byte-stream.
//! `read`/`write` block on `rvar`/`wvar` `Condvar`s under a shared `Mutex`,
//! with a `closed` flag and `Drop`-triggered teardown, generalized from a
//! raw incoming byte queue to KCP's `PeekSize`/`Recv` message interface and
//! from no-deadline waits to `Condvar::wait_timeout` for read/write
//! deadlines.

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Instant;

use log::{debug, trace, warn};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::carrier::{Carrier, PeerAddr, UdpCarrier};
use crate::clock::now_ms;
use crate::config::Config;
use crate::consts::{FEC_HEADER_SIZE, FEC_HEADER_SIZE_PLUS2, MTU_LIMIT, UPDATER_CEIL_MS};
use crate::crypto::{open_datagram, BlockCrypt, Opened};
use crate::err::{Error, Result};
use crate::fec;
use crate::kcp::Kcp;
use crate::nonce::NonceSource;
use crate::stats::Stats;
use crate::updater::{Updatable, Updater};

/// Callback a [`Listener`](crate::Listener) gives an accepted session so it
/// can report its own close back to the listener's monitor thread, which
/// then drops the session out of its peer map. Plain `Fn` rather than
/// `std::sync::mpsc` to keep the listener's cross-thread
/// signaling on the same Mutex+Condvar idiom as everything else here.
pub(crate) type ClosedNotifier = Arc<dyn Fn(PeerAddr) + Send + Sync>;

struct Inner {
    kcp: Kcp,
    fec_encoder: Option<fec::Encoder>,
    fec_decoder: Option<fec::Decoder>,
    carry: Vec<u8>,
    closed: bool,
    fatal_err: Option<io::Error>,
    ack_no_delay: bool,
    write_delay: bool,
    dup: u8,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    updater_id: u64,
}

/// Shared, reference-counted session state. [`Session`] (the public handle)
/// and [`Listener`](crate::Listener)'s peer map both hold an `Arc` to the
/// same instance; closing is an explicit, idempotent operation rather than
/// something that happens merely because one holder's reference count hits
/// zero.
pub(crate) struct SessionShared {
    inner: Mutex<Inner>,
    rvar: Condvar,
    wvar: Condvar,
    fec_enabled: bool,
    conv: u32,
    peer: PeerAddr,
    carrier: Arc<dyn Carrier>,
    owns_carrier: bool,
    crypto: Option<Arc<dyn BlockCrypt>>,
    nonce: Option<NonceSource>,
    stats: Arc<Stats>,
    closed_notifier: Option<ClosedNotifier>,
}

impl SessionShared {
    fn construct(
        carrier: Arc<dyn Carrier>,
        peer: PeerAddr,
        conv: u32,
        config: &Config,
        crypto: Option<Arc<dyn BlockCrypt>>,
        owns_carrier: bool,
        stats: Arc<Stats>,
        closed_notifier: Option<ClosedNotifier>,
    ) -> Result<Arc<SessionShared>> {
        let fec_enabled = config.fec_enabled();

        let mut header_size = 0usize;
        if crypto.is_some() {
            header_size += crate::consts::CRYPTO_HEADER_SIZE;
        }
        if fec_enabled {
            header_size += FEC_HEADER_SIZE_PLUS2;
        }
        let kcp_mtu = config.mtu.saturating_sub(header_size);

        let mut kcp = Kcp::new(conv);
        if !kcp.set_mtu(kcp_mtu) {
            return Err(Error::Malformed(
                "mtu too small to fit the configured crypto/FEC headers and a KCP segment",
            ));
        }
        kcp.set_wnd_size(config.snd_wnd, config.rcv_wnd);
        kcp.set_nodelay(config.nodelay, config.interval, config.resend, config.nc);
        kcp.set_stream_mode(config.stream);

        let (fec_encoder, fec_decoder) = if fec_enabled {
            (
                Some(fec::Encoder::new(config.data_shards, config.parity_shards)?),
                Some(fec::Decoder::new(
                    config.data_shards,
                    config.parity_shards,
                    crate::consts::RX_FEC_MULTI,
                )?),
            )
        } else {
            (None, None)
        };

        let nonce = match &crypto {
            Some(_) => Some(NonceSource::new()?),
            None => None,
        };

        let inner = Inner {
            kcp,
            fec_encoder,
            fec_decoder,
            carry: Vec::new(),
            closed: false,
            fatal_err: None,
            ack_no_delay: config.ack_no_delay,
            write_delay: config.write_delay,
            dup: config.dup,
            read_deadline: None,
            write_deadline: None,
            updater_id: 0,
        };

        let shared = Arc::new(SessionShared {
            inner: Mutex::new(inner),
            rvar: Condvar::new(),
            wvar: Condvar::new(),
            fec_enabled,
            conv,
            peer,
            carrier,
            owns_carrier,
            crypto,
            nonce,
            stats,
            closed_notifier,
        });

        let updater_id = Updater::global().register(weak_updatable(&shared));
        shared.inner.lock().unwrap().updater_id = updater_id;

        Ok(shared)
    }

    pub(crate) fn new_active(
        carrier: Arc<dyn Carrier>,
        peer: PeerAddr,
        conv: u32,
        config: &Config,
        crypto: Option<Arc<dyn BlockCrypt>>,
        stats: Arc<Stats>,
    ) -> Result<Arc<SessionShared>> {
        let shared = Self::construct(carrier, peer, conv, config, crypto, true, stats, None)?;
        spawn_receiver(&shared);
        Ok(shared)
    }

    pub(crate) fn new_passive(
        carrier: Arc<dyn Carrier>,
        peer: PeerAddr,
        conv: u32,
        config: &Config,
        crypto: Option<Arc<dyn BlockCrypt>>,
        stats: Arc<Stats>,
        closed_notifier: ClosedNotifier,
    ) -> Result<Arc<SessionShared>> {
        Self::construct(
            carrier,
            peer,
            conv,
            config,
            crypto,
            false,
            stats,
            Some(closed_notifier),
        )
    }

    pub(crate) fn conv(&self) -> u32 {
        self.conv
    }

    pub(crate) fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub(crate) fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn set_fatal_err(&self, err: io::Error) {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return;
        }
        guard.fatal_err = Some(err);
        drop(guard);
        self.rvar.notify_all();
        self.wvar.notify_all();
    }

    /// Raw ingress entry point for a datagram straight off the wire:
    /// decrypts/verifies, then hands the payload to [`ingress_decrypted`].
    /// Used by dialed sessions, which own their carrier and run their own
    /// receiver loop directly, rather than going through a listener's demux.
    pub(crate) fn ingress(&self, datagram: &[u8]) {
        self.stats.incr_in_pkts(1);
        self.stats.incr_in_bytes(datagram.len() as u64);
        match open_datagram(datagram, self.crypto.as_deref()) {
            Opened::Payload(payload) => self.ingress_decrypted(&payload),
            Opened::Malformed => self.stats.incr_in_errs(1),
            Opened::ChecksumMismatch => self.stats.incr_in_csum_errors(1),
        }
    }

    /// Ingress for a datagram the caller already decrypted/verified (used by
    /// [`Listener`](crate::Listener), which shares one decrypt/CRC pass
    /// across its admission logic and session dispatch).
    pub(crate) fn ingress_decrypted(&self, payload: &[u8]) {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return;
        }
        let ack_no_delay = guard.ack_no_delay;
        let prev_snd_buf_len = guard.kcp.snd_buf_len();

        if self.fec_enabled {
            let Some((seq, kind)) = fec::parse_header(payload) else {
                self.stats.incr_in_errs(1);
                return;
            };
            if matches!(kind, fec::ShardKind::Data) {
                if payload.len() < FEC_HEADER_SIZE_PLUS2 {
                    // Shorter than the FEC header + embedded length:
                    // treated as a parse error, not a zero-length payload.
                    self.stats.incr_kcp_in_errors(1);
                } else {
                    let kcp_payload = &payload[FEC_HEADER_SIZE_PLUS2..];
                    if guard.kcp.input(kcp_payload, true, ack_no_delay).is_err() {
                        self.stats.incr_kcp_in_errors(1);
                    }
                }
            }

            let shard_payload = &payload[FEC_HEADER_SIZE..];
            let recovered = guard
                .fec_decoder
                .as_mut()
                .map(|dec| dec.insert(seq, kind, shard_payload))
                .unwrap_or_default();
            if !recovered.is_empty() {
                self.stats.incr_fec_recovered(recovered.len() as u64);
                trace!("fec recovered {} data shard(s) for conv {}", recovered.len(), self.conv);
            }
            for rec in recovered {
                if guard.kcp.input(&rec, false, ack_no_delay).is_err() {
                    self.stats.incr_fec_errs(1);
                }
            }
        } else if guard.kcp.input(payload, true, ack_no_delay).is_err() {
            self.stats.incr_kcp_in_errors(1);
        }

        let woke_reader = guard.kcp.has_ready_message();
        let had_ack_progress = guard.kcp.snd_buf_len() < prev_snd_buf_len;
        drop(guard);

        if woke_reader {
            self.rvar.notify_one();
        }
        if had_ack_progress {
            self.wvar.notify_one();
        }
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();

        loop {
            if let Some(e) = guard.fatal_err.take() {
                return Err(e);
            }
            if !guard.carry.is_empty() {
                break;
            }
            if guard.kcp.has_ready_message() {
                let sz = guard.kcp.peek_size().max(0) as usize;
                let mut msg = vec![0u8; sz];
                let n = guard.kcp.recv(&mut msg).max(0) as usize;
                msg.truncate(n);
                guard.carry = msg;
                break;
            }
            if guard.closed {
                return Err(Error::BrokenPipe.into());
            }

            match guard.read_deadline {
                None => guard = self.rvar.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout.into());
                    }
                    let (g2, res) = self.rvar.wait_timeout(guard, deadline - now).unwrap();
                    guard = g2;
                    if res.timed_out()
                        && guard.carry.is_empty()
                        && !guard.kcp.has_ready_message()
                        && !guard.closed
                    {
                        return Err(Error::Timeout.into());
                    }
                }
            }
        }

        let n = guard.carry.len().min(buf.len());
        buf[..n].copy_from_slice(&guard.carry[..n]);
        guard.carry.drain(..n);
        drop(guard);
        self.stats.incr_bytes_received(n as u64);
        Ok(n)
    }

    fn send_window_saturated(guard: &Inner) -> bool {
        guard.kcp.snd_buf_len() >= guard.kcp.snd_wnd() as usize
    }

    pub(crate) fn write(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(e) = guard.fatal_err.take() {
                return Err(e);
            }
            if guard.closed {
                return Err(Error::BrokenPipe.into());
            }
            if !Self::send_window_saturated(&guard) {
                break;
            }
            match guard.write_deadline {
                None => guard = self.wvar.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout.into());
                    }
                    let (g2, res) = self.wvar.wait_timeout(guard, deadline - now).unwrap();
                    guard = g2;
                    if res.timed_out() && Self::send_window_saturated(&guard) && !guard.closed {
                        return Err(Error::Timeout.into());
                    }
                }
            }
        }

        let mss = guard.kcp.mss().max(1);
        let mut written = 0;
        for chunk in data.chunks(mss) {
            guard.kcp.send(chunk);
            written += chunk.len();
        }
        let write_delay = guard.write_delay;
        let saturated_now = Self::send_window_saturated(&guard);
        drop(guard);

        if saturated_now || !write_delay {
            self.flush_now();
        }

        Ok(written)
    }

    pub(crate) fn close(&self) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(Error::BrokenPipe.into());
        }
        guard.closed = true;
        let updater_id = guard.updater_id;
        drop(guard);

        self.rvar.notify_all();
        self.wvar.notify_all();
        self.stats.conn_closed();
        Updater::global().unregister(updater_id);

        if let Some(notify) = &self.closed_notifier {
            notify(self.peer);
        }

        debug!("session conv={} with {} closed", self.conv, self.peer);

        if self.owns_carrier {
            self.carrier.close()?;
        }
        Ok(())
    }

    pub(crate) fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.lock().unwrap().read_deadline = deadline;
        self.rvar.notify_all();
    }

    pub(crate) fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.lock().unwrap().write_deadline = deadline;
        self.wvar.notify_all();
    }

    pub(crate) fn set_mtu(&self, mtu: usize) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if !guard.kcp.set_mtu(mtu) {
            return Err(Error::Malformed("mtu smaller than the KCP segment header").into());
        }
        Ok(())
    }

    pub(crate) fn set_window_size(&self, snd: u16, rcv: u16) {
        self.inner.lock().unwrap().kcp.set_wnd_size(snd, rcv);
    }

    pub(crate) fn set_nodelay(&self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.inner
            .lock()
            .unwrap()
            .kcp
            .set_nodelay(nodelay, interval, resend, nc);
    }

    pub(crate) fn set_ack_no_delay(&self, v: bool) {
        self.inner.lock().unwrap().ack_no_delay = v;
    }

    pub(crate) fn set_stream_mode(&self, v: bool) {
        self.inner.lock().unwrap().kcp.set_stream_mode(v);
    }

    pub(crate) fn set_write_delay(&self, v: bool) {
        self.inner.lock().unwrap().write_delay = v;
        self.wvar.notify_all();
    }

    pub(crate) fn set_dup(&self, v: u8) {
        self.inner.lock().unwrap().dup = v;
    }

    pub(crate) fn set_dscp(&self, dscp: u32) -> io::Result<()> {
        if !self.owns_carrier {
            return Err(Error::InvalidOperation.into());
        }
        self.carrier.set_dscp(dscp)
    }

    pub(crate) fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        if !self.owns_carrier {
            return Err(Error::InvalidOperation.into());
        }
        self.carrier.set_read_buffer(bytes)
    }

    pub(crate) fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        if !self.owns_carrier {
            return Err(Error::InvalidOperation.into());
        }
        self.carrier.set_write_buffer(bytes)
    }

    /// Forces an immediate KCP flush, bypassing the updater's cadence.
    /// Called from `write` when the window saturates or `write_delay` is
    /// off.
    pub(crate) fn flush_now(&self) {
        self.do_flush(now_ms());
    }

    fn do_flush(&self, now: u32) -> u32 {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return now.wrapping_add(UPDATER_CEIL_MS as u32);
        }
        let dup = guard.dup;
        let Inner {
            kcp, fec_encoder, ..
        } = &mut *guard;
        let next = kcp.flush(now, |frame| self.emit(fec_encoder, frame, dup));
        self.stats.incr_retrans_segs(kcp.drain_retrans_count());
        now.wrapping_add(next)
    }

    fn emit(&self, fec_encoder: &mut Option<fec::Encoder>, frame: &[u8], dup: u8) {
        match fec_encoder {
            Some(enc) => {
                let (data_shard, parity) = enc.encode(frame);
                self.send_datagram(&data_shard, dup);
                for shard in parity {
                    self.stats.incr_fec_parity_shards(1);
                    self.send_datagram(&shard, dup);
                }
            }
            None => self.send_datagram(frame, dup),
        }
    }

    fn send_datagram(&self, fec_wrapped: &[u8], dup: u8) {
        let wire = match &self.crypto {
            Some(crypt) => {
                let nonce = self
                    .nonce
                    .as_ref()
                    .expect("nonce source required whenever crypto is configured")
                    .next();
                let mut buf =
                    Vec::with_capacity(crate::consts::CRYPTO_HEADER_SIZE + fec_wrapped.len());
                buf.extend_from_slice(&nonce);
                buf.extend_from_slice(&[0u8; crate::consts::CRC_SIZE]);
                buf.extend_from_slice(fec_wrapped);
                let crc = crate::crypto::crc32(&buf[crate::consts::CRYPTO_HEADER_SIZE..]);
                buf[crate::consts::NONCE_SIZE..crate::consts::CRYPTO_HEADER_SIZE]
                    .copy_from_slice(&crc.to_le_bytes());
                crypt.encrypt(&mut buf);
                buf
            }
            None => fec_wrapped.to_vec(),
        };

        for _ in 0..=dup {
            match self.carrier.send_to(&wire, self.peer) {
                Ok(n) => {
                    self.stats.incr_out_pkts(1);
                    self.stats.incr_out_bytes(n as u64);
                    self.stats.incr_bytes_sent(n as u64);
                }
                Err(e) => {
                    // Write failures at the carrier layer are silently
                    // counted, never retried here — KCP's own timer covers
                    // it.
                    warn!("carrier write to {} failed: {e}", self.peer);
                }
            }
        }
    }
}

impl Updatable for SessionShared {
    fn tick(&self, now: u32) -> u32 {
        self.do_flush(now)
    }
}

fn weak_updatable(shared: &Arc<SessionShared>) -> Weak<dyn Updatable> {
    Arc::downgrade(shared) as Weak<dyn Updatable>
}

/// Spawns the receiver thread a dialed (carrier-owning) session drives
/// itself, reading directly off its own carrier rather than going through a
/// listener's demux. Exits once the session is closed or the carrier errors
/// fatally.
fn spawn_receiver(shared: &Arc<SessionShared>) {
    let weak = Arc::downgrade(shared);
    thread::spawn(move || {
        let mut buf = vec![0u8; MTU_LIMIT];
        loop {
            let Some(session) = weak.upgrade() else { return };
            if session.is_closed() {
                return;
            }
            match session.carrier.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if from != session.peer {
                        continue;
                    }
                    session.ingress(&buf[..n]);
                }
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue
                }
                Err(e) => {
                    session.set_fatal_err(e);
                    return;
                }
            }
        }
    });
}

/// Public handle to one reliable, ordered byte-stream connection. Implements
/// [`std::io::Read`]/[`std::io::Write`] as blocking calls over the shared
/// session state; `Drop` closes the session exactly once (idempotent
/// thereafter).
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Dials a peer over a fresh UDP carrier with a randomly chosen
    /// conversation id. `crypto` is `None` to disable the crypto header
    /// entirely.
    pub fn dial(
        peer: std::net::SocketAddr,
        config: Config,
        crypto: Option<Arc<dyn BlockCrypt>>,
    ) -> Result<Session> {
        let mut conv_bytes = [0u8; 4];
        OsRng
            .try_fill_bytes(&mut conv_bytes)
            .map_err(|e| Error::NonceSource(e.to_string()))?;
        Self::dial_with_conv(peer, u32::from_le_bytes(conv_bytes), config, crypto)
    }

    /// Dials with an explicit conversation id — useful when the peer
    /// expects a specific `conv` negotiated out of band.
    pub fn dial_with_conv(
        peer: std::net::SocketAddr,
        conv: u32,
        config: Config,
        crypto: Option<Arc<dyn BlockCrypt>>,
    ) -> Result<Session> {
        let carrier: Arc<dyn Carrier> = Arc::new(UdpCarrier::dial(peer)?);
        Self::dial_with_carrier(carrier, peer.into(), conv, config, crypto)
    }

    /// Dials over a caller-supplied carrier (e.g. the `raw-icmp` feature's
    /// `IcmpCarrier`).
    pub fn dial_with_carrier(
        carrier: Arc<dyn Carrier>,
        peer: PeerAddr,
        conv: u32,
        config: Config,
        crypto: Option<Arc<dyn BlockCrypt>>,
    ) -> Result<Session> {
        let stats = Stats::new();
        stats.incr_active_opens(1);
        stats.conn_opened();
        let shared = SessionShared::new_active(carrier, peer, conv, &config, crypto, stats)?;
        Ok(Session { shared })
    }

    pub fn conv(&self) -> u32 {
        self.shared.conv()
    }

    pub fn peer_addr(&self) -> PeerAddr {
        self.shared.peer()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.shared.stats().clone()
    }

    pub fn close(&self) -> io::Result<()> {
        self.shared.close()
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.set_read_deadline(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.set_write_deadline(deadline);
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.shared.set_read_deadline(deadline);
        self.shared.set_write_deadline(deadline);
    }

    pub fn set_mtu(&self, mtu: usize) -> io::Result<()> {
        self.shared.set_mtu(mtu)
    }

    pub fn set_window_size(&self, snd: u16, rcv: u16) {
        self.shared.set_window_size(snd, rcv);
    }

    pub fn set_nodelay(&self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.shared.set_nodelay(nodelay, interval, resend, nc);
    }

    pub fn set_ack_no_delay(&self, v: bool) {
        self.shared.set_ack_no_delay(v);
    }

    pub fn set_stream_mode(&self, v: bool) {
        self.shared.set_stream_mode(v);
    }

    pub fn set_write_delay(&self, v: bool) {
        self.shared.set_write_delay(v);
    }

    pub fn set_dup(&self, v: u8) {
        self.shared.set_dup(v);
    }

    pub fn set_dscp(&self, dscp: u32) -> io::Result<()> {
        self.shared.set_dscp(dscp)
    }

    pub fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        self.shared.set_read_buffer(bytes)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        self.shared.set_write_buffer(bytes)
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Session {
        Session { shared }
    }
}

impl Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared.read(buf)
    }
}

impl Write for Session {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.flush_now();
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes128Crypt;
    use std::time::Duration;

    fn bind_pair() -> (Arc<dyn Carrier>, PeerAddr, Arc<dyn Carrier>, PeerAddr) {
        let a = UdpCarrier::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpCarrier::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        (Arc::new(a), b_addr, Arc::new(b), a_addr)
    }

    #[test]
    fn dialed_sessions_exchange_a_message() {
        let (carrier_a, peer_b, carrier_b, peer_a) = bind_pair();
        let config = Config::new().nodelay(true, 10, 2, true).stream(true);

        let a = SessionShared::new_active(carrier_a, peer_b, 42, &config, None, Stats::new())
            .unwrap();
        let b = SessionShared::new_active(carrier_b, peer_a, 42, &config, None, Stats::new())
            .unwrap();

        a.write(b"hello session").unwrap();

        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(2);
        b.set_read_deadline(Some(deadline));
        let n = b.read(&mut buf).expect("expected data before the deadline");
        assert_eq!(&buf[..n], b"hello session");

        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn read_after_close_is_broken_pipe() {
        let (carrier_a, peer_b, _carrier_b, _peer_a) = bind_pair();
        let config = Config::new();
        let a = SessionShared::new_active(carrier_a, peer_b, 1, &config, None, Stats::new())
            .unwrap();
        a.close().unwrap();
        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn close_from_another_thread_unblocks_a_blocking_read() {
        let (carrier_a, peer_b, _carrier_b, _peer_a) = bind_pair();
        let config = Config::new();
        let a = SessionShared::new_active(carrier_a, peer_b, 1, &config, None, Stats::new())
            .unwrap();

        let closer = a.clone();
        let closer_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            closer.close().unwrap();
        });

        let start = Instant::now();
        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(start.elapsed() < Duration::from_secs(1));

        closer_thread.join().unwrap();
    }

    #[test]
    fn second_close_is_broken_pipe() {
        let (carrier_a, peer_b, _carrier_b, _peer_a) = bind_pair();
        let config = Config::new();
        let a = SessionShared::new_active(carrier_a, peer_b, 1, &config, None, Stats::new())
            .unwrap();
        a.close().unwrap();
        assert_eq!(a.close().unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn read_deadline_times_out_with_no_peer_traffic() {
        let (carrier_a, peer_b, _carrier_b, _peer_a) = bind_pair();
        let config = Config::new();
        let a = SessionShared::new_active(carrier_a, peer_b, 1, &config, None, Stats::new())
            .unwrap();
        a.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));

        let start = Instant::now();
        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn encrypted_sessions_exchange_a_message() {
        let (carrier_a, peer_b, carrier_b, peer_a) = bind_pair();
        let config = Config::new().nodelay(true, 10, 2, true).stream(true);
        let crypt: Arc<dyn BlockCrypt> = Arc::new(Aes128Crypt::new([9u8; 16]));

        let a = SessionShared::new_active(
            carrier_a,
            peer_b,
            7,
            &config,
            Some(crypt.clone()),
            Stats::new(),
        )
        .unwrap();
        let b = SessionShared::new_active(carrier_b, peer_a, 7, &config, Some(crypt), Stats::new())
            .unwrap();

        a.write(b"secret bytes").unwrap();
        b.set_read_deadline(Some(Instant::now() + Duration::from_secs(2)));
        let mut buf = [0u8; 64];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"secret bytes");

        a.close().unwrap();
        b.close().unwrap();
    }
}
