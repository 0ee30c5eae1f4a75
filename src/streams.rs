//! Per-sender stream sessions and the arrival-ordered registry.
//!
//! A session is keyed by `(interface index, peer address, stream name)` and
//! tracks sequence continuity, the last two payloads (for backup/primary
//! correlation), and EWMA/EWMV packet-interval statistics. The registry
//! keeps sessions in arrival order; the head is the primary stream.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::vban::{Header, SampleFormat};

/// One buffered payload plus its played-out flag.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub sent: bool,
}

impl Packet {
    fn new(data: Bytes) -> Packet {
        Packet { data, sent: false }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Sequence classification
// ═══════════════════════════════════════════════════════════════════════

/// Relationship of an incoming sequence number to a session's `expected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqClass {
    /// `seq == expected`: next in order.
    InOrder,
    /// Re-delivery of the current or (already present) previous packet.
    Duplicate,
    /// The missing previous packet arrived late; fills the `prev` slot.
    Restore,
    /// Older than the two-packet window; dropped.
    Stale,
    /// `seq` jumped ahead; carries the number of packets skipped.
    Gap(i64),
}

/// Classify `seq` against `expected` with 32-bit wrap disambiguation:
/// of `delta`, `delta + 2^32` and `delta - 2^32`, the one with the
/// smallest magnitude wins.
pub fn classify(expected: u32, seq: u32, have_prev: bool) -> SeqClass {
    let mut delta = seq as i64 - expected as i64;
    let up = delta + (1i64 << 32);
    let down = delta - (1i64 << 32);

    if up.abs() < delta.abs() {
        delta = up;
    }
    if down.abs() < delta.abs() {
        delta = down;
    }

    match delta {
        0 => SeqClass::InOrder,
        -1 => SeqClass::Duplicate,
        -2 if have_prev => SeqClass::Duplicate,
        -2 => SeqClass::Restore,
        d if d < 0 => SeqClass::Stale,
        d => SeqClass::Gap(d),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Stream session
// ═══════════════════════════════════════════════════════════════════════

/// State for one live sender.
#[derive(Debug)]
pub struct Stream {
    // identity
    pub ifindex: u32,
    pub ifname: String,
    pub peer: SocketAddr,
    pub name: String,

    // format fingerprint
    pub frames: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    pub datasize: usize,

    // counters
    pub lost: i64,
    /// Sequence number immediately after the most recently accepted packet.
    pub expected: u32,
    pub curr: Packet,
    pub prev: Option<Packet>,
    pub ts_first: u64,
    pub ts_last: u64,

    // synchronization
    pub ignore: bool,
    /// < 0 paused, 0..=2 attempting sync, >= 3 synced.
    pub insync: i64,
    /// Backup → primary alignment in samples; always 0 for the primary.
    pub offset: i64,

    // packet-interval statistics (~30 s EWMA window)
    ewma_a1: f64,
    ewma_a2: f64,
    pub dt_average: f64,
    pub dt_variance: f64,
}

impl Stream {
    /// Create a session from the first well-formed packet of a new sender.
    pub fn new(
        hdr: &Header,
        data: Bytes,
        peer: SocketAddr,
        ifindex: u32,
        ifname: String,
        arrival_ns: u64,
    ) -> Stream {
        let pps = hdr.sample_rate as f64 / hdr.frames as f64;
        let ewma_a1 = 2.0 / (1.0 + 30.0 * pps);

        info!(
            stream = %hdr.name,
            iface = %ifname,
            peer = %peer,
            format = hdr.format.name(),
            rate = hdr.sample_rate,
            channels = hdr.channels,
            "stream connected"
        );

        Stream {
            ifindex,
            ifname,
            peer,
            name: hdr.name.clone(),
            frames: hdr.frames,
            sample_rate: hdr.sample_rate,
            channels: hdr.channels,
            format: hdr.format,
            datasize: data.len(),
            lost: 0,
            expected: hdr.seq.wrapping_add(1),
            curr: Packet::new(data),
            prev: None,
            ts_first: arrival_ns,
            ts_last: arrival_ns,
            ignore: false,
            insync: 0,
            offset: 0,
            ewma_a1,
            ewma_a2: 1.0 - ewma_a1,
            dt_average: 1_000_000_000.0 / pps,
            dt_variance: 0.0,
        }
    }

    /// Bytes per frame (one sample across all channels).
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Packets per second the sender advertises.
    pub fn pps(&self) -> u32 {
        self.sample_rate / self.frames
    }

    /// `true` once three consecutive correlation attempts agreed.
    pub fn synchronized(&self) -> bool {
        self.insync >= 3
    }

    /// Feed one parsed packet into the session.
    ///
    /// Returns `true` when the packet was accepted into a slot and the
    /// session should be handed to the synchronizer.
    pub fn accept(&mut self, hdr: &Header, data: Bytes, arrival_ns: u64) -> bool {
        // format fingerprint must not change mid-stream
        if data.len() != self.datasize
            || hdr.frames != self.frames
            || hdr.format != self.format
            || hdr.channels != self.channels
            || hdr.sample_rate != self.sample_rate
        {
            debug!(
                stream = %self.name,
                iface = %self.ifname,
                "packet does not match stream format, dropped"
            );
            return false;
        }

        // interval statistics update on every format-valid packet,
        // duplicates included
        let dt = arrival_ns as f64 - self.ts_last as f64;
        let deviation = dt - self.dt_average;
        self.dt_variance = self.ewma_a2 * (self.dt_variance + self.ewma_a1 * deviation * deviation);
        self.dt_average = self.ewma_a1 * dt + self.ewma_a2 * self.dt_average;
        self.ts_last = arrival_ns;

        match classify(self.expected, hdr.seq, self.prev.is_some()) {
            SeqClass::InOrder => {
                self.prev = Some(std::mem::replace(&mut self.curr, Packet::new(data)));
                self.expected = self.expected.wrapping_add(1);
                true
            }
            SeqClass::Duplicate => {
                trace!(
                    stream = %self.name,
                    iface = %self.ifname,
                    expected = self.expected,
                    seq = hdr.seq,
                    "duplicate packet"
                );
                false
            }
            SeqClass::Restore => {
                self.lost -= 1;
                self.prev = Some(Packet::new(data));
                trace!(
                    stream = %self.name,
                    iface = %self.ifname,
                    expected = self.expected,
                    seq = hdr.seq,
                    "late packet restored"
                );
                true
            }
            SeqClass::Stale => {
                trace!(
                    stream = %self.name,
                    iface = %self.ifname,
                    expected = self.expected,
                    seq = hdr.seq,
                    "stale packet dropped"
                );
                false
            }
            SeqClass::Gap(skipped) => {
                self.lost += skipped;
                trace!(
                    stream = %self.name,
                    iface = %self.ifname,
                    expected = self.expected,
                    seq = hdr.seq,
                    lost = skipped,
                    "sequence gap"
                );
                self.prev = None;
                self.curr = Packet::new(data);
                self.expected = hdr.seq.wrapping_add(1);
                true
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry
// ═══════════════════════════════════════════════════════════════════════

/// Live sessions in arrival order. Index 0 is the primary.
#[derive(Debug, Default)]
pub struct Registry {
    streams: Vec<Stream>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { streams: Vec::new() }
    }

    /// Locate the session a packet belongs to.
    ///
    /// Peer comparison is full `SocketAddr` equality; for IPv6 that covers
    /// address, port, flowinfo and scope id.
    pub fn find(&self, ifindex: u32, peer: &SocketAddr, name: &str) -> Option<usize> {
        self.streams
            .iter()
            .position(|s| s.ifindex == ifindex && s.peer == *peer && s.name == name)
    }

    /// Append a new session at the tail (arrival order).
    pub fn push(&mut self, stream: Stream) -> usize {
        self.streams.push(stream);
        self.streams.len() - 1
    }

    /// Retire one session, logging it offline.
    pub fn remove(&mut self, idx: usize) -> Stream {
        let stream = self.streams.remove(idx);
        info!(stream = %stream.name, iface = %stream.ifname, "stream offline");
        stream
    }

    /// Retire every session.
    pub fn clear(&mut self) {
        for stream in self.streams.drain(..) {
            info!(stream = %stream.name, iface = %stream.ifname, "stream offline");
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Stream {
        &self.streams[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Stream {
        &mut self.streams[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
