//! Publisher, Scene and the simulated engine running together

use soundscape_core::domain::{
    AudioOrigin, NewSource, Position, QueryLoop, Renderer, SourceModel,
};
use soundscape_tests::Rig;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn write_wav(dir: &Path, name: &str, channels: u16, frames: u32) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate: 48000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for _ in 0..frames * u32::from(channels) {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();
    path
}

// ============================================================================
// METERING
// ============================================================================

#[test]
fn test_levels_reach_the_scene() {
    let rig = Rig::running();
    let receiver = rig.renderer.metering().unwrap();
    let mut query = QueryLoop::start(rig.publisher.clone(), receiver, Duration::from_millis(2)).unwrap();

    let id = {
        let mut control = rig.publisher.take_control();
        control.start_processing();
        control
            .new_source(NewSource::new("near", AudioOrigin::input("1")).at(Position::new(0.0, 3.0)))
            .unwrap()
    };

    let scene = rig.publisher.scene().clone();
    assert!(eventually(|| scene.get_source_level(&id).unwrap_or(0.0) > 0.0));
    assert!(eventually(|| scene.get_master_level() > 0.0));
    assert!(eventually(|| {
        scene.get_source(&id).map(|s| s.output_activity.len()) == Some(4)
    }));

    rig.publisher.take_control().set_source_mute(&id, true).unwrap();
    assert!(eventually(|| scene.get_source_level(&id) == Some(0.0)));

    query.stop();
    rig.renderer.stop();
}

#[test]
fn test_transport_follows_the_engine() {
    let rig = Rig::running();
    let receiver = rig.renderer.metering().unwrap();
    let mut query = QueryLoop::start(rig.publisher.clone(), receiver, Duration::from_millis(2)).unwrap();
    let scene = rig.publisher.scene().clone();

    rig.publisher.take_control().transport_start();
    assert!(eventually(|| scene.get_transport_rolling()));
    assert!(eventually(|| scene.get_transport_frame() > 0));

    rig.publisher.take_control().transport_stop();
    assert!(eventually(|| !scene.get_transport_rolling()));

    rig.publisher.take_control().transport_locate_seconds(1.0);
    assert!(eventually(|| scene.get_transport_frame() == 48000));

    query.stop();
    rig.renderer.stop();
}

// ============================================================================
// SOURCE LIFECYCLE
// ============================================================================

#[test]
fn test_delete_waits_for_the_engine() {
    let rig = Rig::running();
    let id = rig
        .publisher
        .take_control()
        .new_source(NewSource::new("a", AudioOrigin::input("1")))
        .unwrap();
    assert!(rig.renderer.lock().sources.contains_key(&id));

    let cycles = rig.renderer.cycles();
    assert!(rig.publisher.take_control().delete_source(&id));
    assert!(rig.renderer.cycles() >= cycles + 2);
    assert!(!rig.renderer.lock().sources.contains_key(&id));

    rig.renderer.stop();
}

#[test]
fn test_file_sources_use_player_ports() {
    let dir = TempDir::new().unwrap();
    let wav = write_wav(dir.path(), "pair.wav", 2, 4800);
    let rig = Rig::idle();

    let id = rig
        .publisher
        .take_control()
        .new_source(NewSource::new("right", AudioOrigin::file(&wav, 2)))
        .unwrap();
    let source = rig.publisher.scene().get_source(&id).unwrap();
    assert!(source.port_name.starts_with("player:"));
    assert_eq!(rig.renderer.lock().sources[&id].port_name, source.port_name);

    let refused = rig
        .publisher
        .take_control()
        .new_source(NewSource::new("third", AudioOrigin::file(&wav, 3)));
    assert!(refused.is_err());
    assert_eq!(rig.publisher.scene().state().sources.len(), 1);
}

// ============================================================================
// SCENE FILES
// ============================================================================

#[test]
fn test_scene_survives_save_and_load() {
    let dir = TempDir::new().unwrap();
    let wav = write_wav(dir.path(), "mono.wav", 1, 480);
    let scene_file = dir.path().join("scenes").join("demo.toml");

    let rig = Rig::idle();
    {
        let mut control = rig.publisher.take_control();
        control.set_master_volume(0.5);
        control
            .new_source(
                NewSource::new("Voice", AudioOrigin::file(&wav, 1))
                    .with_model(SourceModel::Plane)
                    .at(Position::new(1.0, -2.0)),
            )
            .unwrap();
        control
            .new_source(NewSource::new("Mic", AudioOrigin::input("2")))
            .unwrap();
        control.save_scene(&scene_file).unwrap();
    }

    let other = Rig::idle();
    other.publisher.take_control().load_scene(&scene_file).unwrap();

    let state = other.publisher.scene().state();
    assert!((state.master_volume - 0.5).abs() < 1e-3);
    assert_eq!(state.sources.len(), 2);
    let voice = state.sources.values().find(|s| s.name == "Voice").unwrap();
    assert_eq!(voice.model, SourceModel::Plane);
    assert_eq!(voice.pose.position, Position::new(1.0, -2.0));
    let mic = state.sources.values().find(|s| s.name == "Mic").unwrap();
    assert_eq!(mic.port_name, "system:capture_2");
}

#[test]
fn test_broken_scene_keeps_current_one() {
    let dir = TempDir::new().unwrap();
    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "volume_db = \"loud\"").unwrap();

    let rig = Rig::idle();
    rig.publisher
        .take_control()
        .new_source(NewSource::new("keep", AudioOrigin::input("1")))
        .unwrap();

    assert!(rig.publisher.take_control().load_scene(&broken).is_err());
    assert_eq!(rig.publisher.scene().state().sources.len(), 1);
}
