//! Reed-Solomon forward error correction: recovers whole lost datagrams
//! without retransmission. `reed_solomon_erasure` does the math; everything
//! here is shard-group bookkeeping and the on-wire FEC header framing.

use std::collections::{BTreeMap, VecDeque};

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::consts::{FEC_HEADER_SIZE, FEC_HEADER_SIZE_PLUS2, FEC_TYPE_DATA, FEC_TYPE_PARITY};
use crate::err::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Data,
    Parity,
}

/// Parses the 6-byte FEC header off the front of a decrypted datagram.
pub fn parse_header(buf: &[u8]) -> Option<(u32, ShardKind)> {
    if buf.len() < FEC_HEADER_SIZE {
        return None;
    }
    let seq = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let flag = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    let kind = match flag {
        FEC_TYPE_DATA => ShardKind::Data,
        FEC_TYPE_PARITY => ShardKind::Parity,
        _ => return None,
    };
    Some((seq, kind))
}

/// Appends one data buffer per call into the current shard group; once
/// `data_shards` calls have accumulated a full group, emits `parity_shards`
/// freshly allocated parity datagrams and starts the next group.
pub struct Encoder {
    data_shards: usize,
    rs: Option<ReedSolomon>,
    group: Vec<Vec<u8>>,
    next_seq: u32,
}

impl Encoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        let rs = if data_shards > 0 && parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards)
                    .map_err(|e| Error::Fec(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(Encoder {
            data_shards: data_shards.max(1),
            rs,
            group: Vec::new(),
            next_seq: 0,
        })
    }

    /// Wraps `payload` with the FEC data-shard header (and, when FEC is
    /// enabled, the 2-byte embedded length), returning the wire-ready data
    /// shard plus any parity shards the group completion produces.
    pub fn encode(&mut self, payload: &[u8]) -> (Vec<u8>, Vec<Vec<u8>>) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let mut data_shard = Vec::with_capacity(FEC_HEADER_SIZE_PLUS2 + payload.len());
        data_shard.extend_from_slice(&seq.to_le_bytes());
        data_shard.extend_from_slice(&FEC_TYPE_DATA.to_le_bytes());
        data_shard.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data_shard.extend_from_slice(payload);

        let Some(rs) = &self.rs else {
            return (data_shard, Vec::new());
        };

        // RS protects the length-prefixed payload so a lost data shard's
        // true length survives reconstruction.
        let mut protected = Vec::with_capacity(2 + payload.len());
        protected.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        protected.extend_from_slice(payload);
        self.group.push(protected);

        if self.group.len() < self.data_shards {
            return (data_shard, Vec::new());
        }

        let parity = self.emit_parity(rs);
        self.group.clear();
        (data_shard, parity)
    }

    fn emit_parity(&mut self, rs: &ReedSolomon) -> Vec<Vec<u8>> {
        let max_len = self.group.iter().map(|s| s.len()).max().unwrap_or(0);
        let parity_shards = rs.parity_shard_count();

        let mut shards: Vec<Vec<u8>> = self
            .group
            .iter()
            .map(|s| {
                let mut padded = s.clone();
                padded.resize(max_len, 0);
                padded
            })
            .collect();
        shards.extend(std::iter::repeat(vec![0u8; max_len]).take(parity_shards));

        if rs.encode(&mut shards).is_err() {
            return Vec::new();
        }

        shards
            .into_iter()
            .skip(self.data_shards)
            .map(|parity_payload| {
                let seq = self.next_seq;
                self.next_seq = self.next_seq.wrapping_add(1);

                let mut buf = Vec::with_capacity(FEC_HEADER_SIZE + parity_payload.len());
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&FEC_TYPE_PARITY.to_le_bytes());
                buf.extend_from_slice(&parity_payload);
                buf
            })
            .collect()
    }
}

struct ShardGroup {
    shards: Vec<Option<Vec<u8>>>,
    present: usize,
    resolved: bool,
}

impl ShardGroup {
    fn new(total: usize) -> Self {
        ShardGroup {
            shards: vec![None; total],
            present: 0,
            resolved: false,
        }
    }
}

/// Bounded, ordered window of received shards, reconstructing missing data
/// shards once a group has `data_shards` of its `data + parity` shards
/// present (any mix).
pub struct Decoder {
    data_shards: usize,
    parity_shards: usize,
    rs: Option<ReedSolomon>,
    groups: BTreeMap<u32, ShardGroup>,
    order: VecDeque<(u32, usize)>,
    capacity: usize,
}

impl Decoder {
    pub fn new(data_shards: usize, parity_shards: usize, window_multiplier: usize) -> Result<Self> {
        let rs = if data_shards > 0 && parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards)
                    .map_err(|e| Error::Fec(e.to_string()))?,
            )
        } else {
            None
        };
        let total = data_shards.max(1) + parity_shards;
        Ok(Decoder {
            data_shards: data_shards.max(1),
            parity_shards,
            rs,
            groups: BTreeMap::new(),
            order: VecDeque::new(),
            capacity: window_multiplier * total,
        })
    }

    fn total_per_group(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Inserts one received shard. Returns the KCP-ready payloads (length
    /// prefix already stripped and validated) of any data shards that this
    /// insertion newly reconstructed.
    pub fn insert(&mut self, seq: u32, kind: ShardKind, shard_payload: &[u8]) -> Vec<Vec<u8>> {
        let total = self.total_per_group();
        let group_id = seq / total as u32;
        let idx = (seq % total as u32) as usize;

        // A data shard's position is always < data_shards; a parity shard's
        // position is always >= data_shards. The modulus above gives that
        // directly because sequence assignment is contiguous per group.
        debug_assert_eq!(
            idx < self.data_shards,
            matches!(kind, ShardKind::Data),
            "fec sequence/flag disagree on shard role"
        );

        {
            let group = self
                .groups
                .entry(group_id)
                .or_insert_with(|| ShardGroup::new(total));

            if group.shards[idx].is_some() {
                return Vec::new();
            }
            group.shards[idx] = Some(shard_payload.to_vec());
            group.present += 1;
        }

        self.order.push_back((group_id, idx));
        self.evict_if_full();

        let ready = self
            .groups
            .get(&group_id)
            .is_some_and(|g| !g.resolved && g.present >= self.data_shards);
        if !ready {
            return Vec::new();
        }

        let recovered = self.reconstruct(group_id);
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.resolved = true;
        }
        recovered
    }

    fn reconstruct(&mut self, group_id: u32) -> Vec<Vec<u8>> {
        let Some(rs) = &self.rs else { return Vec::new() };
        let Some(group) = self.groups.get(&group_id) else {
            return Vec::new();
        };
        if group.present == self.total_per_group() {
            // Nothing missing.
            return Vec::new();
        }

        let max_len = group
            .shards
            .iter()
            .flatten()
            .map(|s| s.len())
            .max()
            .unwrap_or(0);

        let mut option_shards: Vec<Option<Vec<u8>>> = group
            .shards
            .iter()
            .map(|s| {
                s.as_ref().map(|bytes| {
                    let mut padded = bytes.clone();
                    padded.resize(max_len, 0);
                    padded
                })
            })
            .collect();

        let missing_data_idx: Vec<usize> = (0..self.data_shards)
            .filter(|&i| group.shards[i].is_none())
            .collect();

        if rs.reconstruct_data(&mut option_shards).is_err() {
            return Vec::new();
        }

        missing_data_idx
            .into_iter()
            .filter_map(|i| option_shards[i].as_ref())
            .filter_map(|padded| decode_length_prefixed(padded))
            .collect()
    }

    fn evict_if_full(&mut self) {
        while self.order.len() > self.capacity {
            let Some((group_id, idx)) = self.order.pop_front() else {
                break;
            };
            if let Some(group) = self.groups.get_mut(&group_id) {
                if group.shards[idx].take().is_some() {
                    group.present = group.present.saturating_sub(1);
                }
                if group.present == 0 {
                    self.groups.remove(&group_id);
                }
            }
        }
    }
}

/// Strips and validates the 2-byte big-endian length prefix RS-protected
/// payloads carry. A length that doesn't fit the (possibly zero-padded)
/// buffer means the recovered shard is inconsistent with its own size —
/// counted as `FECErrs` rather than treated as a crash.
fn decode_length_prefixed(padded: &[u8]) -> Option<Vec<u8>> {
    if padded.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    padded.get(2..2 + len).map(|s| s.to_vec())
}
