use crate::consts::*;

/// Builder-style configuration for a [`Session`](crate::Session) or the
/// [`Listener`](crate::Listener) that creates them. Protocol knobs are set
/// through constructor arguments and setters rather than a parsed config
/// file.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) mtu: usize,
    pub(crate) snd_wnd: u16,
    pub(crate) rcv_wnd: u16,
    pub(crate) nodelay: bool,
    pub(crate) interval: u32,
    pub(crate) resend: u32,
    pub(crate) nc: bool,
    pub(crate) stream: bool,
    pub(crate) write_delay: bool,
    pub(crate) ack_no_delay: bool,
    pub(crate) dup: u8,
    pub(crate) data_shards: usize,
    pub(crate) parity_shards: usize,
    pub(crate) dscp: Option<u32>,
    pub(crate) read_buffer: Option<usize>,
    pub(crate) write_buffer: Option<usize>,
    pub(crate) send_replies: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mtu: MTU_DEFAULT,
            snd_wnd: WND_SND_DEFAULT,
            rcv_wnd: WND_RCV_DEFAULT,
            nodelay: false,
            interval: INTERVAL_DEFAULT,
            resend: 0,
            nc: false,
            stream: false,
            write_delay: true,
            ack_no_delay: false,
            dup: 0,
            data_shards: 10,
            parity_shards: 3,
            dscp: None,
            read_buffer: None,
            write_buffer: None,
            send_replies: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn wnd_size(mut self, snd: u16, rcv: u16) -> Self {
        self.snd_wnd = snd;
        self.rcv_wnd = rcv;
        self
    }

    pub fn nodelay(mut self, nodelay: bool, interval: u32, resend: u32, nc: bool) -> Self {
        self.nodelay = nodelay;
        self.interval = interval.clamp(INTERVAL_MIN, INTERVAL_MAX);
        self.resend = resend;
        self.nc = nc;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn write_delay(mut self, delay: bool) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn ack_no_delay(mut self, ack_no_delay: bool) -> Self {
        self.ack_no_delay = ack_no_delay;
        self
    }

    pub fn dup(mut self, dup: u8) -> Self {
        self.dup = dup;
        self
    }

    pub fn fec(mut self, data_shards: usize, parity_shards: usize) -> Self {
        self.data_shards = data_shards;
        self.parity_shards = parity_shards;
        self
    }

    pub fn dscp(mut self, dscp: u32) -> Self {
        self.dscp = Some(dscp);
        self
    }

    pub fn read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = Some(bytes);
        self
    }

    pub fn write_buffer(mut self, bytes: usize) -> Self {
        self.write_buffer = Some(bytes);
        self
    }

    pub fn send_replies(mut self, send_replies: bool) -> Self {
        self.send_replies = send_replies;
        self
    }

    pub(crate) fn fec_enabled(&self) -> bool {
        self.data_shards > 0 || self.parity_shards > 0
    }
}
