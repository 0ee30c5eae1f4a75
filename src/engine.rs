//! Ingest engine: the single thread that owns the registry and the
//! playout buffer.
//!
//! Each datagram flows receive → codec → session accept → stale sweep →
//! synchronize → playout. A receive timeout, or the last stream dying,
//! flushes the connection: every session is retired, the pipe is closed,
//! the disconnect hook fires and an empty snapshot is published. The
//! engine then waits for the next sender.

use std::fs::File;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::config::Config;
use crate::hooks;
use crate::output::{self, PlayoutBuffer};
use crate::receiver::{interface_name, VbanReceiver};
use crate::snapshot::{Role, SnapshotPublisher, StreamSnapshot};
use crate::streams::{Registry, Stream};
use crate::sync::{self, SyncOutcome};
use crate::vban;

pub struct Engine {
    config: Config,
    registry: Registry,
    playout: Option<PlayoutBuffer<File>>,
    publisher: Arc<SnapshotPublisher>,
    /// Stream-time second of the last published snapshot.
    stat_sec: u64,
}

impl Engine {
    pub fn new(config: Config, publisher: Arc<SnapshotPublisher>) -> Engine {
        Engine {
            config,
            registry: Registry::new(),
            playout: None,
            publisher,
            stat_sec: 0,
        }
    }

    /// Run forever. Returns only on fatal I/O (socket, pipe open, pipe
    /// write), which exits the process nonzero.
    pub fn run(mut self, mut receiver: VbanReceiver) -> anyhow::Result<()> {
        loop {
            self.play_cycle(&mut receiver)?;

            if !self.registry.is_empty() {
                self.disconnect_all();
            }
        }
    }

    /// One connection lifetime: ingest until every sender goes silent.
    fn play_cycle(&mut self, receiver: &mut VbanReceiver) -> anyhow::Result<()> {
        loop {
            let Some(dgram) = receiver.recv().context("recvmsg")? else {
                // receive timeout: all senders silent
                return Ok(());
            };

            let hdr = match vban::parse(&dgram.payload) {
                Ok(hdr) => hdr,
                Err(e) => {
                    debug!(error = %e, "malformed VBAN packet received");
                    continue;
                }
            };

            if hdr.protocol != vban::PROTOCOL_AUDIO {
                debug!(stream = %hdr.name, protocol = hdr.protocol, "unsupported protocol");
                continue;
            }

            if hdr.codec != vban::CODEC_PCM {
                debug!(stream = %hdr.name, codec = hdr.codec, "unsupported audio codec");
                continue;
            }

            let data = dgram.payload.slice(vban::HEADER_SIZE..);

            let idx = match self.registry.find(dgram.ifindex, &dgram.peer, &hdr.name) {
                Some(idx) => {
                    if !self.registry.get_mut(idx).accept(&hdr, data, dgram.arrival_ns) {
                        continue;
                    }
                    idx
                }
                None => {
                    let ifname = interface_name(dgram.ifindex);
                    self.registry.push(Stream::new(
                        &hdr,
                        data,
                        dgram.peer,
                        dgram.ifindex,
                        ifname,
                        dgram.arrival_ns,
                    ))
                }
            };

            // snapshot the registry once per second of stream time
            let sec = self.registry.get(idx).ts_last / 1_000_000_000;
            if sec != self.stat_sec {
                self.stat_sec = sec;
                self.publish();
            }

            let Some(idx) = sync::sweep_dead(&mut self.registry, &mut self.playout, idx) else {
                // the primary was the last stream standing
                return Ok(());
            };

            match sync::synchronize(&mut self.registry, idx) {
                SyncOutcome::Skip => {}
                SyncOutcome::PrimaryOnline => {
                    let stream = self.registry.get(0);
                    let pipe = output::open_pipe(&self.config.pipe, stream)?;
                    self.playout =
                        Some(PlayoutBuffer::new(pipe, stream.frames, stream.frame_size()));
                    if let Some(hook) = &self.config.exec_on_connect {
                        hooks::run_hook(hook);
                    }
                }
                SyncOutcome::Play => {
                    if let Some(playout) = &mut self.playout {
                        sync::play_pending(self.registry.get_mut(idx), playout)
                            .context("pipe write")?;
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let lost = self.playout.as_ref().map_or(0, |p| p.lost_total());
        let records = self.registry.iter().enumerate().map(|(i, stream)| {
            let role = if i == 0 { Role::Primary } else { Role::Backup };
            StreamSnapshot::collect(stream, role)
        });
        self.publisher.publish(lost, records);
    }

    fn disconnect_all(&mut self) {
        self.registry.clear();
        // dropping the buffer closes the pipe and resets the loss counter
        self.playout = None;

        if let Some(hook) = &self.config.exec_on_disconnect {
            hooks::run_hook(hook);
        }

        self.publisher.clear();
        info!("all streams disconnected");
    }
}
