//! Capture-device boundary.
//!
//! Microphone permission and audio capture are platform concerns. The engine
//! consumes them through two object-safe traits: [`AudioCapability`] is the
//! single yes/no permission gate checked before any device is touched, and
//! [`AudioCapture`] acquires the device and feeds encoded audio into the
//! local track. The returned [`CaptureHandle`] is the engine's lever for
//! releasing the device on every teardown path.

use super::error::CallError;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// The OS permission dialog, reduced to one async capability check.
#[async_trait]
pub trait AudioCapability: Send + Sync {
    async fn request_audio_capability(&self) -> bool;
}

/// A gate that always grants, for tests and headless demos.
#[derive(Default)]
pub struct AlwaysGranted;

#[async_trait]
impl AudioCapability for AlwaysGranted {
    async fn request_audio_capability(&self) -> bool {
        true
    }
}

/// An audio source that can feed the local outbound track.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Acquires the capture device and starts writing samples to `track`.
    /// Fails with [`CallError::Capture`] when the device cannot be opened.
    async fn start(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<CaptureHandle, CallError>;
}

/// Owns a running capture feed. Stopping the handle releases the device and
/// halts the feeder task; dropping it has the same effect, so a handle can
/// never outlive its owning session.
pub struct CaptureHandle {
    task: JoinHandle<()>,
}

impl CaptureHandle {
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn stop(&self) {
        debug!("Stopping audio capture");
        self.task.abort();
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Opus silence frames at a 20 ms cadence. Stands in for a real microphone
/// in the demo binary and in tests; the negotiation and teardown paths are
/// identical to a real capture source.
#[derive(Default)]
pub struct SilenceCapture;

// Canonical opus "silence" payload (a zero-energy CELT frame).
const OPUS_SILENCE_FRAME: &[u8] = &[0xf8, 0xff, 0xfe];
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[async_trait]
impl AudioCapture for SilenceCapture {
    async fn start(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<CaptureHandle, CallError> {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);
            loop {
                ticker.tick().await;
                let sample = Sample {
                    data: Bytes::from_static(OPUS_SILENCE_FRAME),
                    duration: FRAME_INTERVAL,
                    ..Default::default()
                };
                if track.write_sample(&sample).await.is_err() {
                    // Track went away; the session owns cleanup.
                    break;
                }
            }
        });
        Ok(CaptureHandle::from_task(task))
    }
}
