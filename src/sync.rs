//! Primary/backup stream synchronization.
//!
//! Backups carry the same audio as the primary over an independent network
//! path, shifted by an unknown whole number of samples. The offset is
//! recovered by sliding the primary's newest payload across the backup's
//! last two payloads at frame-aligned positions and counting byte-exact
//! matches; a unique match confirmed three times in a row puts the backup
//! in sync. The synchronizer also retires senders that stopped arriving
//! and promotes the oldest backup when the primary dies.

use std::io::Write;

use tracing::{info, trace};

use crate::output::PlayoutBuffer;
use crate::streams::{Registry, Stream};

/// Sessions lagging the newest accepted packet by this much are dead.
pub const STREAM_TIMEOUT_MS: i64 = 700;

// ═══════════════════════════════════════════════════════════════════════
//  Payload correlation
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// Stream geometry differs; the candidate can never sync.
    FormatMismatch,
    /// `count` frame-aligned positions matched; `offset` is from the first.
    Matches { count: u32, offset: i64 },
}

/// Search `primary`'s current payload within `candidate`'s last two
/// payloads at frame-aligned positions.
///
/// The first match yields the candidate's sample offset relative to the
/// primary: `(cand.expected − 1 − prim.expected) · frames + position`.
pub fn correlate(primary: &Stream, candidate: &Stream) -> SyncResult {
    if primary.frames != candidate.frames
        || primary.format != candidate.format
        || primary.channels != candidate.channels
        || primary.sample_rate != candidate.sample_rate
    {
        return SyncResult::FormatMismatch;
    }

    let Some(prev) = &candidate.prev else {
        // need two consecutive packets to search across
        return SyncResult::Matches { count: 0, offset: 0 };
    };

    if primary.frame_size() == 0 {
        // packed formats carry no byte-aligned frames to compare
        return SyncResult::Matches { count: 0, offset: 0 };
    }

    let size = candidate.datasize;
    let mut window = Vec::with_capacity(size * 2);
    window.extend_from_slice(&prev.data);
    window.extend_from_slice(&candidate.curr.data);

    let needle = &primary.curr.data[..];
    let w = primary.frame_size();

    let mut count = 0u32;
    let mut offset = 0i64;
    let mut i = 0;
    while i <= size {
        if &window[i..i + size] == needle {
            if count == 0 {
                offset = (candidate.expected as i64 - 1 - primary.expected as i64)
                    * primary.frames as i64
                    + (i / w) as i64;
            }
            count += 1;
        }
        i += w;
    }

    SyncResult::Matches { count, offset }
}

// ═══════════════════════════════════════════════════════════════════════
//  Stale-session sweep
// ═══════════════════════════════════════════════════════════════════════

/// Retire every session (other than the one at `current`) whose last
/// packet lags the current session's by [`STREAM_TIMEOUT_MS`].
///
/// When the primary is among the dead and backups remain, the playout
/// timeline and all offsets are rebased onto the oldest backup, which
/// becomes the new primary. Returns the possibly-shifted index of the
/// current session, or `None` when the primary was the last session
/// standing (caller tears the connection down).
pub fn sweep_dead<W: Write>(
    registry: &mut Registry,
    playout: &mut Option<PlayoutBuffer<W>>,
    current: usize,
) -> Option<usize> {
    let now_ns = registry.get(current).ts_last;
    let mut current = current;

    let mut i = 0;
    while i < registry.len() {
        if i == current {
            i += 1;
            continue;
        }

        let lag_ms = (now_ns as i64 - registry.get(i).ts_last as i64) / 1_000_000;
        if lag_ms < STREAM_TIMEOUT_MS {
            i += 1;
            continue;
        }

        if i == 0 {
            if registry.len() == 1 {
                // last stream timed out; the caller flushes the connection
                return None;
            }

            // primary died: rebase the timeline onto the next stream
            let delta = registry.get(1).offset;
            for idx in 1..registry.len() {
                registry.get_mut(idx).offset -= delta;
            }
            if let Some(out) = playout {
                out.move_outpos(delta);
            }
            info!(shift = delta, "primary stream lost, promoting backup");
        }

        registry.remove(i);
        if i < current {
            current -= 1;
        }
    }

    Some(current)
}

// ═══════════════════════════════════════════════════════════════════════
//  Sync state machine
// ═══════════════════════════════════════════════════════════════════════

/// What the engine should do with the session after synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Not synced (ignored, paused, or still correlating); no playout.
    Skip,
    /// The head session just came online; open the sink and play from the
    /// next packet on.
    PrimaryOnline,
    /// Session is in sync; play its pending packets.
    Play,
}

/// Advance the sync state of the session at `idx`.
///
/// The primary (index 0) is in sync by definition and goes online on its
/// first packet. Backups must produce a unique correlation match with a
/// consistent offset three times in a row; a changed offset or an
/// ambiguous window pauses the attempt for roughly 100 ms of packets.
pub fn synchronize(registry: &mut Registry, idx: usize) -> SyncOutcome {
    if registry.get(idx).ignore {
        return SyncOutcome::Skip;
    }

    if registry.get(idx).insync < 0 {
        registry.get_mut(idx).insync += 1;
        return SyncOutcome::Skip;
    }

    if registry.get(idx).insync >= 3 {
        return SyncOutcome::Play;
    }

    if idx == 0 {
        let stream = registry.get_mut(0);
        info!(stream = %stream.name, iface = %stream.ifname, "stream online, primary");
        stream.insync = 3;
        return SyncOutcome::PrimaryOnline;
    }

    let mut result = correlate(registry.get(0), registry.get(idx));
    if let SyncResult::Matches { count: 0, .. } = result {
        // the backup may be ahead of the primary; search the other way
        result = match correlate(registry.get(idx), registry.get(0)) {
            SyncResult::Matches { count, offset } => SyncResult::Matches { count, offset: -offset },
            mismatch => mismatch,
        };
    }

    let pause = -((registry.get(idx).pps() / 10) as i64);
    let stream = registry.get_mut(idx);

    match result {
        SyncResult::FormatMismatch => {
            info!(
                stream = %stream.name,
                iface = %stream.ifname,
                "stream does not match primary, ignoring"
            );
            stream.ignore = true;
        }
        SyncResult::Matches { count: 1, offset } => {
            let prior = stream.insync;
            stream.insync += 1;

            if prior != 0 && stream.offset != offset {
                // offset moved between attempts; back off and retry
                trace!(
                    stream = %stream.name,
                    was = stream.offset,
                    now = offset,
                    "sync offset mismatch, pausing"
                );
                stream.insync = pause;
                return SyncOutcome::Skip;
            }

            if stream.insync == 3 {
                info!(
                    stream = %stream.name,
                    iface = %stream.ifname,
                    offset,
                    "stream online, backup"
                );
            }
            stream.offset = offset;
        }
        SyncResult::Matches { .. } => {
            // no match or an ambiguous (self-similar) window
            if stream.insync == 0 {
                stream.insync = pause;
            }
        }
    }

    SyncOutcome::Skip
}

// ═══════════════════════════════════════════════════════════════════════
//  Playout calls
// ═══════════════════════════════════════════════════════════════════════

/// Send a synced session's unsent packets to the playout buffer at their
/// presentation-time positions.
pub fn play_pending<W: Write>(
    stream: &mut Stream,
    playout: &mut PlayoutBuffer<W>,
) -> std::io::Result<()> {
    let frames = stream.frames;

    if let Some(prev) = &mut stream.prev {
        if !prev.sent {
            let ts = stream.expected.wrapping_sub(1) as i64 * frames as i64 - stream.offset;
            playout.play(ts, frames, &prev.data)?;
            prev.sent = true;
        }
    }

    if !stream.curr.sent {
        let ts = stream.expected as i64 * frames as i64 - stream.offset;
        playout.play(ts, frames, &stream.curr.data)?;
        stream.curr.sent = true;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
