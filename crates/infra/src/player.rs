//! Audio-file playback ports
//!
//! Each opened (file, channel) pair becomes a port named
//! `player:<path>_<channel>` that a renderer can connect a source to.
//! WAV headers are read to validate the channel and report the length;
//! other formats are accepted with an unknown length.

use soundscape_core::domain::{AudioPlayer, PlaybackError, PlaybackHandle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Length and channel count of an opened file
#[derive(Debug, Clone, Copy)]
struct FileInfo {
    frames: u64,
    channels: Option<u32>,
}

/// Player handing out ports for files on the local disk
pub struct FilePlayer {
    client_name: String,
    /// Open handles per port
    open: Mutex<HashMap<String, usize>>,
}

impl FilePlayer {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Number of handles not yet released
    pub fn open_handles(&self) -> usize {
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .sum()
    }

    fn port_name(&self, path: &Path, channel: u32) -> String {
        format!("{}:{}_{}", self.client_name, path.display(), channel)
    }
}

impl Default for FilePlayer {
    fn default() -> Self {
        Self::new("player")
    }
}

fn probe(path: &Path) -> Result<FileInfo, PlaybackError> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PlaybackError::NotFound(path.to_path_buf()),
        _ => PlaybackError::Io(e),
    })?;
    if !metadata.is_file() {
        return Err(PlaybackError::NotFound(path.to_path_buf()));
    }

    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    if !is_wav {
        return Ok(FileInfo {
            frames: 0,
            channels: None,
        });
    }

    match hound::WavReader::open(path) {
        Ok(reader) => Ok(FileInfo {
            frames: u64::from(reader.duration()),
            channels: Some(u32::from(reader.spec().channels)),
        }),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read WAV header");
            Ok(FileInfo {
                frames: 0,
                channels: None,
            })
        }
    }
}

impl AudioPlayer for FilePlayer {
    fn acquire(&self, path: &Path, channel: u32) -> Result<PlaybackHandle, PlaybackError> {
        let info = probe(path)?;
        let invalid = || PlaybackError::InvalidChannel {
            path: PathBuf::from(path),
            channel,
        };
        if channel == 0 {
            return Err(invalid());
        }
        if info.channels.is_some_and(|channels| channel > channels) {
            return Err(invalid());
        }

        let port_name = self.port_name(path, channel);
        *self
            .open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(port_name.clone())
            .or_default() += 1;
        debug!(port = %port_name, frames = info.frames, "Audio file opened");

        Ok(PlaybackHandle {
            path: path.to_path_buf(),
            channel,
            port_name,
            file_length: info.frames,
        })
    }

    fn release(&self, handle: PlaybackHandle) {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        match open.get_mut(&handle.port_name) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                open.remove(&handle.port_name);
                debug!(port = %handle.port_name, "Audio file closed");
            }
            None => warn!(port = %handle.port_name, "Releasing a handle that is not open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_wav(dir: &TempDir, name: &str, channels: u16, frames: u32) -> PathBuf {
        let path = dir.path().join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate: 44100,
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

    #[test]
    fn test_acquire_wav() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "stereo.wav", 2, 1000);
        let player = FilePlayer::default();

        let handle = player.acquire(&path, 2).unwrap();
        assert_eq!(handle.channel, 2);
        assert_eq!(handle.file_length, 1000);
        assert!(handle.port_name.starts_with("player:"));
        assert!(handle.port_name.ends_with("stereo.wav_2"));
        assert_eq!(player.open_handles(), 1);

        player.release(handle);
        assert_eq!(player.open_handles(), 0);
    }

    #[test]
    fn test_invalid_channel() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "mono.wav", 1, 10);
        let player = FilePlayer::default();

        assert!(matches!(
            player.acquire(&path, 2),
            Err(PlaybackError::InvalidChannel { channel: 2, .. })
        ));
        assert!(matches!(
            player.acquire(&path, 0),
            Err(PlaybackError::InvalidChannel { channel: 0, .. })
        ));
        assert_eq!(player.open_handles(), 0);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let player = FilePlayer::default();

        assert!(matches!(
            player.acquire(&dir.path().join("nope.wav"), 1),
            Err(PlaybackError::NotFound(_))
        ));
        assert!(matches!(
            player.acquire(dir.path(), 1),
            Err(PlaybackError::NotFound(_))
        ));
    }

    #[test]
    fn test_other_formats_have_unknown_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("take.flac");
        std::fs::write(&path, b"not decoded").unwrap();
        let player = FilePlayer::default();

        let first = player.acquire(&path, 3).unwrap();
        let second = player.acquire(&path, 3).unwrap();
        assert_eq!(first.file_length, 0);
        assert_eq!(player.open_handles(), 2);

        player.release(first);
        player.release(second);
        assert_eq!(player.open_handles(), 0);
    }
}
