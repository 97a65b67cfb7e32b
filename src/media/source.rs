//! Local media acquisition interface

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::Result;
use crate::media::slots::MediaKind;

/// Local tracks produced by a media source
#[derive(Clone, Default)]
pub struct MediaTrackSet {
    /// Camera track, when available
    pub video: Option<Arc<dyn TrackLocal + Send + Sync>>,

    /// Microphone track, when available
    pub audio: Option<Arc<dyn TrackLocal + Send + Sync>>,
}

impl MediaTrackSet {
    /// Track for the given kind
    pub fn track_for(&self, kind: MediaKind) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        match kind {
            MediaKind::Video => self.video.clone(),
            MediaKind::Audio => self.audio.clone(),
        }
    }

    /// True when the set carries no tracks
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// Device/camera acquisition boundary.
///
/// Real implementations negotiate capture constraints against the platform
/// and handle fallback; this layer only consumes the resulting tracks.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local media tracks
    async fn acquire(&self) -> Result<MediaTrackSet>;
}

/// Source producing static sample-backed tracks, for tests and demos
pub struct StaticMediaSource {
    stream_id: String,
}

impl StaticMediaSource {
    pub fn new() -> Self {
        Self {
            stream_id: "stagelink".to_string(),
        }
    }

    /// Write blank samples into a track at a fixed cadence until the handle
    /// is stopped. Gives demo connections continuous outbound activity.
    pub fn pump(track: Arc<TrackLocalStaticSample>, interval: Duration) -> PumpHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sample = Sample {
                            data: Bytes::from_static(&[0u8]),
                            duration: interval,
                            ..Default::default()
                        };
                        // Writes fail until the track is negotiated; the pump
                        // just keeps trying.
                        if let Err(e) = track.write_sample(&sample).await {
                            debug!("sample write skipped: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        PumpHandle { shutdown_tx }
    }
}

impl Default for StaticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> Result<MediaTrackSet> {
        let video: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            self.stream_id.clone(),
        ));
        let audio: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        ));
        Ok(MediaTrackSet {
            video: Some(video),
            audio: Some(audio),
        })
    }
}

/// Stops a sample pump when dropped out of use
pub struct PumpHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl PumpHandle {
    /// Stop the pump task
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_produces_both_kinds() {
        let source = StaticMediaSource::new();
        let tracks = source.acquire().await.unwrap();
        assert!(!tracks.is_empty());
        assert!(tracks.track_for(MediaKind::Video).is_some());
        assert!(tracks.track_for(MediaKind::Audio).is_some());
    }

    #[tokio::test]
    async fn test_pump_stops_cleanly() {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "test".to_owned(),
        ));
        let pump = StaticMediaSource::pump(track, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        pump.stop().await;
    }
}
