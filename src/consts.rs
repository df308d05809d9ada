//! Wire-format and resource-limit constants enumerated in the protocol spec.

pub const NONCE_SIZE: usize = 16;
pub const CRC_SIZE: usize = 4;
pub const CRYPTO_HEADER_SIZE: usize = NONCE_SIZE + CRC_SIZE;

pub const MTU_LIMIT: usize = 1500;
pub const MTU_DEFAULT: usize = 1400;

pub const RX_FEC_MULTI: usize = 3;
pub const ACCEPT_BACKLOG: usize = 128;
pub const RECEIVER_QUEUE: usize = 128;

/// Size of a KCP segment's fixed header, in bytes.
pub const KCP_OVERHEAD: usize = 24;

/// FEC shard header: `fec_seq:4 | fec_flag:2`.
pub const FEC_HEADER_SIZE: usize = 6;
/// FEC shard header plus the embedded big-endian payload length on data shards.
pub const FEC_HEADER_SIZE_PLUS2: usize = FEC_HEADER_SIZE + 2;

pub const FEC_TYPE_DATA: u16 = 0xF1;
pub const FEC_TYPE_PARITY: u16 = 0xF2;

/// ICMP echo identifier used by the raw carrier; obfuscation, not authentication.
pub const ICMP_ECHO_ID: u16 = 420;

pub const RTO_MIN_NODELAY: u32 = 30;
pub const RTO_MIN_NORMAL: u32 = 100;
pub const RTO_DEFAULT: u32 = 200;
pub const RTO_MAX: u32 = 60_000;

pub const WASK_INTERVAL_MIN: u32 = 7_000;
pub const WASK_INTERVAL_MAX: u32 = 120_000;

pub const INTERVAL_MIN: u32 = 10;
pub const INTERVAL_MAX: u32 = 5_000;
pub const INTERVAL_DEFAULT: u32 = 100;

pub const UPDATER_FLOOR_MS: u64 = 10;
pub const UPDATER_CEIL_MS: u64 = 100;

pub const WND_SND_DEFAULT: u16 = 32;
pub const WND_RCV_DEFAULT: u16 = 128;
