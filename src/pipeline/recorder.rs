//! Raw voice recorder
//!
//! Appends every incoming codec frame, still encoded, to a file behind an
//! ASCII header with no line terminator. Each record is the tunnel payload minus its
//! header byte: `source:u32 BE, sequence:u32 BE, length byte, data`.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::OpusConfig;
use crate::error::Error;

/// Header written when a recording starts, in the layout raw-stream tools expect
pub fn stream_header(config: &OpusConfig) -> String {
    format!(
        "MumbleOpusRawStream [samplerate:<{}> framesize:<{}> mono/stereo/more(1,2...x):<{}>]\
         <BODY>repeatly: channel:int16, packetnumber:int16, datalength:int16, data[datalength]</BODY>",
        config.sample_rate, config.frame_size, config.channels
    )
}

struct Recording {
    writer: BufWriter<File>,
    path: PathBuf,
    frames: u64,
}

/// Toggleable raw frame recorder
#[derive(Default)]
pub struct Recorder {
    active: Mutex<Option<Recording>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording to `path`, truncating it.
    ///
    /// Returns `false` without touching anything if already recording.
    pub fn start(&self, path: impl AsRef<Path>, config: &OpusConfig) -> Result<bool, Error> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Ok(false);
        }

        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(stream_header(config).as_bytes())?;
        writer.flush()?;

        tracing::info!("Recording incoming voice to {}", path.display());
        *active = Some(Recording {
            writer,
            path,
            frames: 0,
        });
        Ok(true)
    }

    /// Close the file. Returns `false` if nothing was being recorded.
    pub fn stop(&self) -> Result<bool, Error> {
        let Some(mut recording) = self.active.lock().take() else {
            return Ok(false);
        };
        recording.writer.flush()?;
        tracing::info!(
            frames = recording.frames,
            "Recording to {} stopped",
            recording.path.display()
        );
        Ok(true)
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Append one tunnel payload, header byte excluded.
    ///
    /// A write failure ends the recording.
    pub fn write(&self, tunnel: &[u8]) {
        let mut active = self.active.lock();
        let Some(recording) = active.as_mut() else {
            return;
        };
        if tunnel.len() < 2 {
            return;
        }

        match recording.writer.write_all(&tunnel[1..]) {
            Ok(()) => recording.frames += 1,
            Err(e) => {
                tracing::error!("Recording to {} failed: {}", recording.path.display(), e);
                *active = None;
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(recording) = self.active.get_mut().as_mut() {
            let _ = recording.writer.flush();
        }
    }
}
