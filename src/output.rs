//! Presentation-time playout buffer and the named-pipe sink.
//!
//! The buffer holds `frames_per_packet × 2` frames with a per-frame
//! presence map. Writes land at their sample timestamp; whenever a write
//! reaches past the end, the front of the buffer is drained to the sink in
//! contiguous present runs, with absent runs reported as lost audio.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;

use anyhow::Context;
use tracing::{info, trace};

use crate::streams::Stream;

// ═══════════════════════════════════════════════════════════════════════
//  Pipe path template
// ═══════════════════════════════════════════════════════════════════════

/// Expand a pipe path template against the primary stream's format:
/// `%%` → `%`, `%f` → format name, `%r` → sample rate, `%c` → channels.
/// Any other `%X` (and a trailing `%`) is preserved literally.
pub fn expand_template(template: &str, format: &str, rate: u32, channels: u32) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('f') => out.push_str(format),
            Some('r') => out.push_str(&rate.to_string()),
            Some('c') => out.push_str(&channels.to_string()),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    out
}

/// Open the playout pipe for the primary stream: write-only, non-blocking,
/// close-on-exec. Fatal on failure (a reader must already have the FIFO
/// open).
pub fn open_pipe(template: &str, stream: &Stream) -> anyhow::Result<File> {
    let path = expand_template(
        template,
        stream.format.name(),
        stream.sample_rate,
        stream.channels,
    );

    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(&path)
        .with_context(|| format!("pipe open: {path}"))?;

    info!(path = %path, "playout pipe opened");
    Ok(file)
}

// ═══════════════════════════════════════════════════════════════════════
//  Playout buffer
// ═══════════════════════════════════════════════════════════════════════

/// Gap-tolerant jitter buffer in front of a byte sink.
///
/// `outpos` is the sample timestamp of buffer index 0. The buffer is
/// primed by the first write and dropped wholesale on disconnect.
pub struct PlayoutBuffer<W: Write> {
    sink: W,
    /// Capacity in frames (`frames_per_packet × 2`).
    capacity: usize,
    frame_size: usize,
    buffer: Vec<u8>,
    present: Vec<u8>,
    outpos: i64,
    lost_total: i64,
    primed: bool,
}

impl<W: Write> PlayoutBuffer<W> {
    pub fn new(sink: W, frames_per_packet: u32, frame_size: usize) -> PlayoutBuffer<W> {
        let capacity = frames_per_packet as usize * 2;
        PlayoutBuffer {
            sink,
            capacity,
            frame_size,
            buffer: vec![0; capacity * frame_size],
            present: vec![0; capacity],
            outpos: 0,
            lost_total: 0,
            primed: false,
        }
    }

    /// Total samples reported lost since this buffer was opened.
    pub fn lost_total(&self) -> i64 {
        self.lost_total
    }

    pub fn outpos(&self) -> i64 {
        self.outpos
    }

    /// Shift the presentation-time origin without touching contents.
    /// Used when the primary dies and a backup takes over.
    pub fn move_outpos(&mut self, delta: i64) {
        self.outpos += delta;
    }

    /// Place `frames` frames of `data` at sample timestamp `ts`.
    ///
    /// Non-blocking sink overruns are swallowed; any other sink error is
    /// fatal for the process and propagates.
    pub fn play(&mut self, ts: i64, frames: u32, data: &[u8]) -> io::Result<()> {
        let frames = frames as usize;
        let fs = self.frame_size;
        debug_assert!(frames <= self.capacity);
        debug_assert_eq!(data.len(), frames * fs);

        if !self.primed {
            self.buffer[..data.len()].copy_from_slice(data);
            self.present[..frames].fill(1);
            self.present[frames..].fill(0);
            self.outpos = ts;
            self.primed = true;
        }

        // overlap-left: packet starts at or before the buffer origin
        if ts <= self.outpos {
            if ts + frames as i64 <= self.outpos {
                // entirely older than the buffer
                return Ok(());
            }
            let off = (self.outpos - ts) as usize;
            let len = frames - off;
            self.buffer[..len * fs].copy_from_slice(&data[off * fs..]);
            self.present[..len].fill(1);
            return Ok(());
        }

        // fits inside the window
        if ts + frames as i64 <= self.outpos + self.capacity as i64 {
            let off = (ts - self.outpos) as usize;
            self.buffer[off * fs..off * fs + data.len()].copy_from_slice(data);
            self.present[off..off + frames].fill(1);
            return Ok(());
        }

        // reaches past the end: advance by draining the front
        let mut advance = (ts - self.outpos) + (frames as i64 - self.capacity as i64);
        self.outpos += advance;

        let mut tail_lost = 0i64;
        while advance > 0 {
            let run_limit = (advance as usize).min(self.capacity);
            if self.present[0] != 0 {
                let run = self.run_len(run_limit, 1);
                match self.sink.write(&self.buffer[..run * fs]) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        // reader not keeping up; audio time advances anyway
                        trace!(samples = run, "output overrun");
                    }
                    Err(e) => return Err(e),
                }
                self.shift(run);
                advance -= run as i64;
            } else {
                let run = self.run_len(run_limit, 0);
                if run < self.capacity {
                    self.shift(run);
                    self.report_lost(run as i64);
                    advance -= run as i64;
                } else {
                    // whole buffer empty, nothing survives the jump
                    tail_lost = advance;
                    advance = 0;
                }
            }
        }
        if tail_lost > 0 {
            self.report_lost(tail_lost);
        }

        let off = (ts - self.outpos) as usize;
        self.buffer[off * fs..off * fs + data.len()].copy_from_slice(data);
        self.present[off..off + frames].fill(1);
        Ok(())
    }

    /// Length of the run of frames with presence `value` at the buffer
    /// front, capped at `limit` and the capacity.
    fn run_len(&self, limit: usize, value: u8) -> usize {
        let mut i = 1;
        while i < limit && i < self.capacity && self.present[i] == value {
            i += 1;
        }
        i
    }

    /// Drop `n` frames off the front, zeroing the freed presence tail.
    fn shift(&mut self, n: usize) {
        let fs = self.frame_size;
        if n < self.capacity {
            self.buffer.copy_within(n * fs.., 0);
            self.present.copy_within(n.., 0);
            self.present[self.capacity - n..].fill(0);
        } else {
            self.present.fill(0);
        }
    }

    fn report_lost(&mut self, samples: i64) {
        self.lost_total += samples;
        info!(samples, "playout lost samples");
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    // capacity = 4 frames, frame_size = 2 bytes
    fn buf() -> PlayoutBuffer<Vec<u8>> {
        PlayoutBuffer::new(Vec::new(), 2, 2)
    }

    #[test]
    fn test_template_expansion() {
        assert_eq!(
            expand_template("/run/audio-%f-%r-%c.pipe", "s16le", 48000, 2),
            "/run/audio-s16le-48000-2.pipe"
        );
        assert_eq!(expand_template("a%%b", "x", 1, 1), "a%b");
        assert_eq!(expand_template("a%zb", "x", 1, 1), "a%zb");
        assert_eq!(expand_template("tail%", "x", 1, 1), "tail%");
        assert_eq!(expand_template("plain", "x", 1, 1), "plain");
    }

    #[test]
    fn test_gap_fill_drains_and_reports_lost() {
        let mut b = buf();
        b.play(0, 2, &[0xaa, 0xaa, 0xbb, 0xbb]).unwrap();
        assert_eq!(b.outpos(), 0);

        // ts 6 + 2 frames ends at 8 > outpos + capacity (4): advance by 4
        b.play(6, 2, &[0xcc, 0xcc, 0xdd, 0xdd]).unwrap();

        assert_eq!(b.sink, vec![0xaa, 0xaa, 0xbb, 0xbb], "only present frames reach the sink");
        assert_eq!(b.lost_total(), 2, "the two-frame hole is reported lost");
        assert_eq!(b.outpos(), 4);
        assert_eq!(b.present, vec![0, 0, 1, 1], "new packet buffered ahead");
        assert_eq!(&b.buffer[4..8], &[0xcc, 0xcc, 0xdd, 0xdd]);
    }

    #[test]
    fn test_first_write_primes_origin() {
        let mut b = buf();
        b.play(1000, 2, &[1, 1, 2, 2]).unwrap();
        assert_eq!(b.outpos(), 1000);
        assert_eq!(b.present, vec![1, 1, 0, 0]);
        assert!(b.sink.is_empty());
    }

    #[test]
    fn test_fits_inside_marks_presence() {
        let mut b = buf();
        b.play(0, 2, &[1, 1, 2, 2]).unwrap();
        b.play(2, 2, &[3, 3, 4, 4]).unwrap();
        assert_eq!(b.present, vec![1, 1, 1, 1]);
        assert_eq!(b.buffer, vec![1, 1, 2, 2, 3, 3, 4, 4]);
        assert!(b.sink.is_empty(), "nothing drains until the window advances");
    }

    #[test]
    fn test_contiguous_stream_flows_through() {
        let mut b = buf();
        b.play(0, 2, &[1, 1, 2, 2]).unwrap();
        b.play(2, 2, &[3, 3, 4, 4]).unwrap();
        b.play(4, 2, &[5, 5, 6, 6]).unwrap();
        // advance = 2, front two frames drain
        assert_eq!(b.sink, vec![1, 1, 2, 2]);
        assert_eq!(b.outpos(), 2);
        assert_eq!(b.lost_total(), 0);

        b.play(6, 2, &[7, 7, 8, 8]).unwrap();
        assert_eq!(b.sink, vec![1, 1, 2, 2, 3, 3, 4, 4]);
        assert_eq!(b.outpos(), 4);
    }

    #[test]
    fn test_overlap_left_overwrites() {
        let mut b = buf();
        b.play(0, 2, &[1, 1, 2, 2]).unwrap();
        // starts one frame before the origin; its tail overwrites frame 0
        b.play(-1, 2, &[9, 9, 8, 8]).unwrap();
        assert_eq!(b.buffer[..2], [8, 8]);
        assert_eq!(b.present, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_fully_past_discarded() {
        let mut b = buf();
        b.play(10, 2, &[1, 1, 2, 2]).unwrap();
        b.play(4, 2, &[9, 9, 9, 9]).unwrap();
        assert_eq!(b.buffer[..4], [1, 1, 2, 2], "older packet left no trace");
        assert_eq!(b.lost_total(), 0);
    }

    #[test]
    fn test_whole_buffer_empty_jump() {
        let mut b = buf();
        b.play(0, 2, &[1, 1, 2, 2]).unwrap();
        b.play(2, 2, &[3, 3, 4, 4]).unwrap();
        b.play(100, 2, &[7, 7, 8, 8]).unwrap();
        // advance = 98: 4 present frames drain, the rest of the jump is lost
        assert_eq!(b.sink, vec![1, 1, 2, 2, 3, 3, 4, 4]);
        assert_eq!(b.lost_total(), 94);
        assert_eq!(b.outpos(), 98);
        assert_eq!(b.present, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_move_outpos_rebases_timeline() {
        let mut b = buf();
        b.play(0, 2, &[1, 1, 2, 2]).unwrap();
        b.move_outpos(5);
        assert_eq!(b.outpos(), 5);
        assert_eq!(b.present, vec![1, 1, 0, 0], "contents untouched");
    }

    struct BlockingSink;

    impl Write for BlockingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_would_block_is_swallowed() {
        let mut b = PlayoutBuffer::new(BlockingSink, 2, 2);
        b.play(0, 2, &[1, 1, 2, 2]).unwrap();
        b.play(2, 2, &[3, 3, 4, 4]).unwrap();
        // drains past a blocked sink without error; timeline still advances
        b.play(4, 2, &[5, 5, 6, 6]).unwrap();
        assert_eq!(b.outpos(), 2);
        assert_eq!(b.lost_total(), 0, "overruns are not lost samples");
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_error_is_fatal() {
        let mut b = PlayoutBuffer::new(BrokenSink, 2, 2);
        b.play(0, 2, &[1, 1, 2, 2]).unwrap();
        b.play(2, 2, &[3, 3, 4, 4]).unwrap();
        let err = b.play(4, 2, &[5, 5, 6, 6]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
