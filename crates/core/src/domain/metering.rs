//! Engine -> control-plane metering handoff and the periodic query loop
//!
//! The audio thread never calls subscribers. It fills a pre-allocated
//! `MeteringSnapshot` taken from a recycle channel and hands it over with
//! `try_send`. The `QueryLoop` thread drains the newest snapshot on a fixed
//! period, publishes it through the Publisher and returns the buffer.
//!
//! Both channels are bounded by the number of buffers in circulation, so
//! neither side ever blocks or allocates on the audio thread.

use crate::domain::publisher::Publisher;
use crossbeam::channel::{bounded, select, tick, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Levels of one source, as seen by the audio thread
#[derive(Debug, Clone, Default)]
pub struct SourceMeter {
    /// Reused buffer for the source id
    pub id: String,
    pub level: f32,
    /// One entry per output; never resized by the audio thread
    pub outputs: Vec<f32>,
}

/// One audio-cycle worth of metering data
#[derive(Debug, Clone, Default)]
pub struct MeteringSnapshot {
    pub rolling: bool,
    pub frame: u32,
    pub cpu_load: f32,
    pub master_level: f32,
    pub sources: Vec<SourceMeter>,
    /// Set by the audio thread when `sources` has the wrong length
    pub discard_sources: bool,
    /// Source count the audio thread needs on the next round
    pub wanted_sources: usize,
    outputs: usize,
}

impl MeteringSnapshot {
    pub fn new(outputs: usize) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    /// Number of outputs each source meter holds
    pub fn outputs(&self) -> usize {
        self.outputs
    }

    /// Resize for the requested source count; control thread only
    pub fn prepare(&mut self) {
        if self.discard_sources {
            let outputs = self.outputs;
            self.sources.resize_with(self.wanted_sources, || SourceMeter {
                id: String::with_capacity(32),
                level: 0.0,
                outputs: vec![0.0; outputs],
            });
            self.discard_sources = false;
        }
    }
}

/// Producer end, owned by the audio thread
pub struct MeteringSender {
    filled: Sender<MeteringSnapshot>,
    recycled: Receiver<MeteringSnapshot>,
}

impl MeteringSender {
    /// Take an empty buffer, if one is available
    pub fn acquire(&self) -> Option<MeteringSnapshot> {
        self.recycled.try_recv().ok()
    }

    /// Hand a filled buffer over without waiting
    pub fn publish(&self, snapshot: MeteringSnapshot) {
        if self.filled.try_send(snapshot).is_err() {
            trace!("Metering consumer gone, snapshot dropped");
        }
    }
}

/// Consumer end, owned by the query loop
pub struct MeteringReceiver {
    filled: Receiver<MeteringSnapshot>,
    recycled: Sender<MeteringSnapshot>,
}

impl MeteringReceiver {
    /// Newest filled snapshot; older ones go straight back to the producer
    pub fn latest(&self) -> Option<MeteringSnapshot> {
        let mut latest = None;
        for snapshot in self.filled.try_iter() {
            if let Some(older) = latest.replace(snapshot) {
                self.recycle(older);
            }
        }
        latest
    }

    pub fn recycle(&self, mut snapshot: MeteringSnapshot) {
        snapshot.prepare();
        let _ = self.recycled.try_send(snapshot);
    }
}

/// Create a handoff with `buffers` snapshots in circulation
pub fn metering_channel(buffers: usize, outputs: usize) -> (MeteringSender, MeteringReceiver) {
    let buffers = buffers.max(2);
    let (filled_tx, filled_rx) = bounded(buffers);
    let (recycled_tx, recycled_rx) = bounded(buffers);

    for _ in 0..buffers {
        let _ = recycled_tx.try_send(MeteringSnapshot::new(outputs));
    }

    (
        MeteringSender {
            filled: filled_tx,
            recycled: recycled_rx,
        },
        MeteringReceiver {
            filled: filled_rx,
            recycled: recycled_tx,
        },
    )
}

/// Periodic metering poll running on its own thread
pub struct QueryLoop {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl QueryLoop {
    /// Start polling `receiver` every `interval`
    pub fn start(
        publisher: Arc<Publisher>,
        receiver: MeteringReceiver,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("query".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Some(snapshot) = receiver.latest() {
                                publisher.take_control().publish_metering(&snapshot);
                                receiver.recycle(snapshot);
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!("Query loop finished");
            })?;

        info!(interval_ms = interval.as_millis() as u64, "Query loop started");

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop polling and join the thread
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Query loop panicked");
            }
        }
    }
}

impl Drop for QueryLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_keeps_newest() {
        let (sender, receiver) = metering_channel(3, 2);

        for frame in 1..=3 {
            let mut snapshot = sender.acquire().unwrap();
            snapshot.frame = frame;
            sender.publish(snapshot);
        }
        // all buffers are in flight
        assert!(sender.acquire().is_none());

        let latest = receiver.latest().unwrap();
        assert_eq!(latest.frame, 3);
        receiver.recycle(latest);

        // every buffer made it back
        let mut count = 0;
        while sender.acquire().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_prepare_resizes_sources() {
        let mut snapshot = MeteringSnapshot::new(4);
        snapshot.discard_sources = true;
        snapshot.wanted_sources = 2;
        snapshot.prepare();

        assert_eq!(snapshot.sources.len(), 2);
        assert_eq!(snapshot.sources[0].outputs.len(), 4);
        assert!(!snapshot.discard_sources);
    }

    #[test]
    fn test_empty_receiver() {
        let (_sender, receiver) = metering_channel(2, 0);
        assert!(receiver.latest().is_none());
    }
}
