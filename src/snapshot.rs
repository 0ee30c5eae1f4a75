//! Lock-free statistics hand-off between the ingest thread and the HTTP
//! reader.
//!
//! Three preallocated cells and one atomic published index. The single
//! writer rewrites a cell that is not currently published and then swings
//! the index to it; the single reader loads the index and copies that
//! cell. With three cells, one writer and one reader, the reader's cell is
//! never the one being rewritten. Each cell carries an uncontended mutex
//! so that invariant is enforced by the type system instead of argued in a
//! comment; both sides still cross exactly one atomic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::streams::Stream;

/// Published-index sentinel: nothing published (no live streams).
const NONE: usize = usize::MAX;

// ═══════════════════════════════════════════════════════════════════════
//  Wire records
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Backup,
}

/// Per-stream statistics record as served over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub name: String,
    pub role: Role,
    pub ifname: String,
    /// `ip:port`, or `[ipv6]:port`.
    pub peer: String,
    pub format: &'static str,
    pub rate: u32,
    pub channels: u32,
    pub expected: u32,
    pub lost: i64,
    pub ignored: bool,
    /// Misspelled on the wire for compatibility with existing consumers.
    #[serde(rename = "synchonized")]
    pub synchronized: bool,
    pub offset: i64,
    /// Mean packet interval, microseconds (EWMA).
    pub average_us: f64,
    /// Packet interval standard deviation, microseconds (EWMV).
    pub stddev_us: f64,
    /// Whole seconds between the first and last packet.
    pub uptime: i64,
}

impl StreamSnapshot {
    /// Copy the served fields out of a live session.
    pub fn collect(stream: &Stream, role: Role) -> StreamSnapshot {
        StreamSnapshot {
            name: stream.name.clone(),
            role,
            ifname: stream.ifname.clone(),
            peer: stream.peer.to_string(),
            format: stream.format.name(),
            rate: stream.sample_rate,
            channels: stream.channels,
            expected: stream.expected,
            lost: stream.lost,
            ignored: stream.ignore,
            synchronized: stream.synchronized(),
            offset: stream.offset,
            average_us: stream.dt_average / 1000.0,
            stddev_us: stream.dt_variance.sqrt() / 1000.0,
            uptime: (stream.ts_last.saturating_sub(stream.ts_first) / 1_000_000_000) as i64,
        }
    }
}

/// Top-level HTTP body: playout loss counter plus one record per stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub lost: i64,
    pub streams: Vec<StreamSnapshot>,
}

// ═══════════════════════════════════════════════════════════════════════
//  Publisher
// ═══════════════════════════════════════════════════════════════════════

/// Triple-buffered single-writer/single-reader snapshot cell exchange.
#[derive(Debug)]
pub struct SnapshotPublisher {
    cells: [Mutex<Snapshot>; 3],
    published: AtomicUsize,
}

impl SnapshotPublisher {
    pub fn new() -> SnapshotPublisher {
        SnapshotPublisher {
            cells: Default::default(),
            published: AtomicUsize::new(NONE),
        }
    }

    /// Rewrite a non-published cell and publish it. Ingest thread only.
    ///
    /// The cell's stream vector is reused, so steady-state publishing does
    /// not allocate beyond the session high-water mark.
    pub fn publish<I>(&self, lost: i64, streams: I)
    where
        I: IntoIterator<Item = StreamSnapshot>,
    {
        let current = self.published.load(Ordering::Relaxed);

        // with three cells and a single reader, some cell != current is
        // always free
        let mut target = None;
        for (idx, cell) in self.cells.iter().enumerate() {
            if idx == current {
                continue;
            }
            if let Ok(slot) = cell.try_lock() {
                target = Some((idx, slot));
                break;
            }
        }
        let Some((idx, mut slot)) = target else {
            return;
        };

        slot.lost = lost;
        slot.streams.clear();
        slot.streams.extend(streams);
        drop(slot);
        self.published.store(idx, Ordering::Release);
    }

    /// Publish "no streams"; the reader serves an empty snapshot.
    pub fn clear(&self) {
        self.published.store(NONE, Ordering::Release);
    }

    /// Copy the currently published snapshot. HTTP thread only.
    pub fn read(&self) -> Snapshot {
        match self.published.load(Ordering::Acquire) {
            NONE => Snapshot::default(),
            idx => self.cells[idx]
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
