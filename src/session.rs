//! Voice session facade
//!
//! Ties the pipelines to a negotiated codec. Nothing is built until the
//! server has announced Opus support; after that the player and the
//! receive pipeline are created on first use.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::codec::{CodecKind, CodecProvider};
use crate::config::{AppConfig, NormalizerMode, PlayerConfig};
use crate::error::{CodecError, Error};
use crate::network::{UdpTransport, VoiceTransport};
use crate::pipeline::{AudioPlayer, ReceivePipeline};

pub struct VoiceSession {
    config: AppConfig,
    codec: Arc<dyn CodecProvider>,
    transport: Arc<dyn VoiceTransport>,
    negotiated: Option<CodecKind>,
    player: Option<AudioPlayer>,
    receiver: Option<Arc<ReceivePipeline>>,
    record_file: Option<PathBuf>,
}

impl VoiceSession {
    pub fn new(
        config: AppConfig,
        codec: Arc<dyn CodecProvider>,
        transport: Arc<dyn VoiceTransport>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            codec,
            transport,
            negotiated: None,
            player: None,
            receiver: None,
            record_file: None,
        })
    }

    /// Server codec announcement. Only Opus is ever selected.
    pub fn on_codec_version(&mut self, opus: bool) {
        if opus && self.negotiated.is_none() {
            tracing::info!("Codec negotiated: opus");
            self.negotiated = Some(CodecKind::Opus);
        }
    }

    pub fn codec(&self) -> Option<CodecKind> {
        self.negotiated
    }

    fn require_codec(&self) -> Result<CodecKind, Error> {
        self.negotiated
            .ok_or_else(|| CodecError::Unsupported("no codec negotiated".into()).into())
    }

    /// The send pipeline, built on first use
    pub fn player(&mut self) -> Result<&mut AudioPlayer, Error> {
        let kind = self.require_codec()?;
        let player = match self.player.take() {
            Some(player) => player,
            None => {
                let config = PlayerConfig {
                    codec: kind,
                    ..self.config.player.clone()
                };
                AudioPlayer::new(
                    self.codec.clone(),
                    self.transport.clone(),
                    config,
                    self.config.codec.clone(),
                )?
            }
        };
        Ok(self.player.insert(player))
    }

    /// The receive pipeline, built on first use
    pub fn receiver(&mut self) -> Result<Arc<ReceivePipeline>, Error> {
        self.require_codec()?;
        if let Some(receiver) = &self.receiver {
            return Ok(receiver.clone());
        }
        let receiver = Arc::new(ReceivePipeline::new(
            &self.config.receiver,
            &self.config.codec,
            self.codec.clone(),
        )?);
        self.receiver = Some(receiver.clone());
        Ok(receiver)
    }

    /// Feed a tunnel payload; dropped until the receive pipeline exists
    pub fn process_tunnel(&self, data: Bytes) {
        if let Some(receiver) = &self.receiver {
            let _ = receiver.process_tunnel(data);
        }
    }

    /// Route datagrams arriving on `udp` into the receive pipeline
    pub fn attach_udp(
        &mut self,
        udp: &UdpTransport,
        running: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, Error> {
        let receiver = self.receiver()?;
        let handle = udp.spawn_inbound(running, move |data| {
            let _ = receiver.process_tunnel(data);
        })?;
        Ok(handle)
    }

    pub fn set_record_file(&mut self, path: impl AsRef<Path>) {
        self.record_file = Some(path.as_ref().to_path_buf());
    }

    pub fn record_file(&self) -> Option<&Path> {
        self.record_file.as_deref()
    }

    /// Toggle recording. Without a record file this does nothing and returns `false`.
    pub fn record(&mut self, enable: bool) -> Result<bool, Error> {
        let Some(path) = self.record_file.clone() else {
            tracing::warn!("Recording requested but no record file is set");
            return Ok(false);
        };
        let receiver = self.receiver()?;
        if enable {
            receiver.start_recording(path)
        } else {
            receiver.stop_recording()
        }
    }

    /// Select the mixing policy; [`NormalizerMode::Off`] stops decoding
    pub fn play(&mut self, normalizer: NormalizerMode) -> Result<(), Error> {
        self.receiver()?.set_normalizer(normalizer);
        Ok(())
    }

    /// Stop playback and the receive threads
    pub fn shutdown(&mut self) {
        if let Some(mut player) = self.player.take() {
            player.stop();
        }
        if let Some(receiver) = self.receiver.take() {
            receiver.shutdown();
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpusCodec;
    use crate::network::ChannelTransport;

    fn session() -> VoiceSession {
        let (transport, _rx) = ChannelTransport::pair();
        VoiceSession::new(AppConfig::default(), Arc::new(OpusCodec), Arc::new(transport)).unwrap()
    }

    #[test]
    fn test_nothing_before_negotiation() {
        let mut session = session();
        assert!(matches!(
            session.player(),
            Err(Error::Codec(CodecError::Unsupported(_)))
        ));
        assert!(session.receiver().is_err());

        session.on_codec_version(false);
        assert_eq!(session.codec(), None);
        session.on_codec_version(true);
        assert_eq!(session.codec(), Some(CodecKind::Opus));
        assert!(session.player().is_ok());
    }

    #[test]
    fn test_record_needs_file() {
        let mut session = session();
        session.on_codec_version(true);
        assert!(!session.record(true).unwrap());

        let dir = tempfile::tempdir().unwrap();
        session.set_record_file(dir.path().join("session.raw"));
        assert!(session.record(true).unwrap());
        assert!(session.receiver().unwrap().is_recording());
        assert!(session.record(false).unwrap());
        assert!(!session.receiver().unwrap().is_recording());
    }

    #[test]
    fn test_play_selects_normalizer() {
        let mut session = session();
        session.on_codec_version(true);
        session.play(NormalizerMode::SoftNormalize).unwrap();
        assert_eq!(
            session.receiver().unwrap().normalizer(),
            NormalizerMode::SoftNormalize
        );
    }
}
