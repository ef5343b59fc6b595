//! Simulated real-time engine
//!
//! Stands in for a loudspeaker renderer. A dedicated `audio` thread runs one
//! cycle per block period, reads the parameter state with `try_lock` and
//! produces metering data as if every input carried a constant signal of
//! `SIGNAL_LEVEL`. It never blocks on the control plane and never allocates
//! once the metering buffers have the right size.

use crossbeam::utils::CachePadded;
use soundscape_core::domain::{
    metering_channel, DirectionalPoint, Loudspeaker, LoudspeakerModel, MeteringReceiver,
    MeteringSender, MeteringSnapshot, RenderError, RenderParams, RenderSource, Renderer,
    SourceId, SourceInput, SourceModel,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Amplitude of the simulated signal on every input
pub const SIGNAL_LEVEL: f32 = 0.5;

/// Distances below this are treated as this for attenuation
const MIN_DISTANCE: f32 = 0.5;

/// Snapshots in circulation between the audio thread and the query loop
const METERING_BUFFERS: usize = 4;

/// State shared with the audio thread
struct Shared {
    params: Mutex<RenderParams>,
    /// Completed audio cycles
    cycles: CachePadded<AtomicU64>,
    frame: CachePadded<AtomicU32>,
    rolling: AtomicBool,
    running: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RenderParams> {
        // A panic while holding the lock leaves plain data behind; keep using it
        self.params.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Renderer running a simulated audio thread
pub struct SimulatedRenderer {
    name: String,
    sample_rate: u32,
    block_size: u32,
    loudspeakers: Arc<[Loudspeaker]>,
    shared: Arc<Shared>,
    sender: Mutex<Option<MeteringSender>>,
    receiver: Mutex<Option<MeteringReceiver>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedRenderer {
    pub fn new(
        name: impl Into<String>,
        sample_rate: u32,
        block_size: u32,
        loudspeakers: Vec<Loudspeaker>,
    ) -> Self {
        let (sender, receiver) = metering_channel(METERING_BUFFERS, loudspeakers.len());
        Self {
            name: name.into(),
            sample_rate: sample_rate.max(1),
            block_size: block_size.max(1),
            loudspeakers: loudspeakers.into(),
            shared: Arc::new(Shared {
                params: Mutex::new(RenderParams::default()),
                cycles: CachePadded::new(AtomicU64::new(0)),
                frame: CachePadded::new(AtomicU32::new(0)),
                rolling: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            thread: Mutex::new(None),
        }
    }

    /// Duration of one audio cycle
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Completed audio cycles since start
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    /// Spawn the audio thread; the engine can be started once
    pub fn start(&self) -> io::Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| io::Error::other("audio thread already started"))?;

        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let loudspeakers = self.loudspeakers.clone();
        let block_size = self.block_size;
        let period = self.period();

        let spawned = thread::Builder::new()
            .name("audio".to_string())
            .spawn(move || run(&shared, &loudspeakers, &sender, block_size, period));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(e);
            }
        };

        *self.thread.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        info!(
            name = %self.name,
            sample_rate = self.sample_rate,
            block_size,
            outputs = self.loudspeakers.len(),
            "Audio thread started"
        );
        Ok(())
    }

    /// Stop the audio thread and wait for it
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Audio thread panicked");
            }
            info!(cycles = self.cycles(), "Audio thread stopped");
        }
    }
}

impl Drop for SimulatedRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Renderer for SimulatedRenderer {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn loudspeakers(&self) -> Vec<Loudspeaker> {
        self.loudspeakers.to_vec()
    }

    fn lock(&self) -> MutexGuard<'_, RenderParams> {
        self.shared.lock()
    }

    fn add_source(&self, id: &SourceId, input: &SourceInput) -> Result<(), RenderError> {
        if input.port_name.is_empty() {
            return Err(RenderError::PortUnavailable(input.port_name.clone()));
        }
        let mut params = self.shared.lock();
        if params.sources.contains_key(id) {
            return Err(RenderError::DuplicateSource(id.clone()));
        }
        params.sources.insert(
            id.clone(),
            RenderSource::new(input.port_name.clone(), input.properties_file.clone()),
        );
        debug!(%id, port = %input.port_name, "Source connected");
        Ok(())
    }

    fn remove_source(&self, id: &SourceId) -> Result<(), RenderError> {
        self.shared
            .lock()
            .sources
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RenderError::UnknownSource(id.clone()))
    }

    fn sync(&self) -> Result<(), RenderError> {
        if !self.is_running() {
            return Ok(());
        }
        // The cycle in flight may have read the old state; wait for one more
        let target = self.cycles() + 2;
        let limit = self.period() * 8 + Duration::from_millis(100);
        let deadline = Instant::now() + limit;
        let nap = (self.period() / 4).max(Duration::from_micros(100));
        while self.cycles() < target {
            if !self.is_running() {
                return Ok(());
            }
            if Instant::now() > deadline {
                warn!(
                    cycles = self.cycles(),
                    target,
                    "Audio thread did not complete a cycle in time"
                );
                return Err(RenderError::SyncTimeout(limit));
            }
            thread::sleep(nap);
        }
        Ok(())
    }

    fn transport_start(&self) {
        self.shared.rolling.store(true, Ordering::Release);
    }

    fn transport_stop(&self) {
        self.shared.rolling.store(false, Ordering::Release);
    }

    fn transport_locate(&self, frame: u32) {
        self.shared.frame.store(frame, Ordering::Release);
    }

    fn transport_state(&self) -> (bool, u32) {
        (
            self.shared.rolling.load(Ordering::Acquire),
            self.shared.frame.load(Ordering::Acquire),
        )
    }

    fn metering(&self) -> Option<MeteringReceiver> {
        self.receiver
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }
}

fn run(
    shared: &Shared,
    loudspeakers: &[Loudspeaker],
    meters: &MeteringSender,
    block_size: u32,
    period: Duration,
) {
    let mut next = Instant::now();
    while shared.running.load(Ordering::Acquire) {
        process(shared, loudspeakers, meters, block_size, period);
        shared.cycles.fetch_add(1, Ordering::AcqRel);

        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}

/// One audio cycle
fn process(
    shared: &Shared,
    loudspeakers: &[Loudspeaker],
    meters: &MeteringSender,
    block_size: u32,
    period: Duration,
) {
    let started = Instant::now();
    let rolling = shared.rolling.load(Ordering::Acquire);
    if rolling {
        shared.frame.fetch_add(block_size, Ordering::AcqRel);
    }

    let Some(mut snapshot) = meters.acquire() else {
        return;
    };
    snapshot.rolling = rolling;
    snapshot.frame = shared.frame.load(Ordering::Acquire);

    match shared.params.try_lock() {
        Ok(params) => fill(&params, loudspeakers, &mut snapshot),
        Err(TryLockError::Poisoned(poisoned)) => {
            fill(&poisoned.into_inner(), loudspeakers, &mut snapshot)
        }
        Err(TryLockError::WouldBlock) => {
            // Control thread is writing; skip source data this round
            snapshot.discard_sources = true;
            snapshot.wanted_sources = snapshot.sources.len();
        }
    }

    snapshot.cpu_load = started.elapsed().as_secs_f32() / period.as_secs_f32() * 100.0;
    meters.publish(snapshot);
}

/// Compute levels for the current parameters into a recycled snapshot
///
/// When the snapshot holds the wrong number of source meters, only the
/// master level is written and the snapshot asks for a resize instead.
pub(crate) fn fill(
    params: &RenderParams,
    loudspeakers: &[Loudspeaker],
    snapshot: &mut MeteringSnapshot,
) {
    let matches = snapshot.sources.len() == params.sources.len();
    snapshot.discard_sources = !matches;
    snapshot.wanted_sources = params.sources.len();

    let reference = params.reference.compose(&params.reference_offset);
    let mut master = 0.0_f32;
    let mut meters = snapshot.sources.iter_mut();

    for (id, source) in &params.sources {
        let level = if params.processing {
            source_level(params, &reference, source)
        } else {
            0.0
        };
        let direction = relative_azimuth(&reference, source);
        let meter = if matches { meters.next() } else { None };

        match meter {
            Some(meter) => {
                meter.id.clear();
                meter.id.push_str(id.as_str());
                meter.level = level;
                for (output, speaker) in meter.outputs.iter_mut().zip(loudspeakers) {
                    *output = level * speaker_gain(speaker, direction) * params.master_volume;
                    master = master.max(*output);
                }
            }
            None => {
                for speaker in loudspeakers {
                    master =
                        master.max(level * speaker_gain(speaker, direction) * params.master_volume);
                }
            }
        }
    }

    snapshot.master_level = master;
}

fn source_level(params: &RenderParams, reference: &DirectionalPoint, source: &RenderSource) -> f32 {
    if source.mute {
        return 0.0;
    }
    let attenuation = match source.model {
        SourceModel::Plane => 1.0,
        _ => {
            let distance = (source.pose.position - reference.position)
                .length()
                .max(MIN_DISTANCE);
            (params.amplitude_reference_distance / distance).powf(params.decay_exponent)
        }
    };
    SIGNAL_LEVEL * source.gain * attenuation
}

/// Azimuth of the source as seen from the listener, `None` when they coincide
fn relative_azimuth(reference: &DirectionalPoint, source: &RenderSource) -> Option<f32> {
    let delta = source.pose.position - reference.position;
    if delta.x.abs() < f32::EPSILON && delta.y.abs() < f32::EPSILON {
        return None;
    }
    Some(delta.azimuth().azimuth - reference.orientation.azimuth)
}

fn speaker_gain(speaker: &Loudspeaker, direction: Option<f32>) -> f32 {
    if speaker.mute {
        return 0.0;
    }
    let directivity = match (speaker.model, direction) {
        (LoudspeakerModel::Subwoofer, _) | (_, None) => 1.0,
        (LoudspeakerModel::Normal, Some(azimuth)) => {
            let delta = (speaker.pose.position.azimuth().azimuth - azimuth).to_radians();
            delta.cos().max(0.0)
        }
    };
    directivity * speaker.weight
}
