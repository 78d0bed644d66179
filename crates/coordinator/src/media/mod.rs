//! Local media tracks
//!
//! The coordinator owns one audio and one video local track for the session
//! lifetime, plus a lazily created screen-share track. Tracks are added to
//! every peer link at link creation; mute state is carried as registry flags
//! and synchronized through the control plane, not by detaching tracks.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Local media for one call session
pub struct LocalMedia {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    screen: RwLock<Option<Arc<TrackLocalStaticSample>>>,
    stream_id: String,
}

impl LocalMedia {
    /// Acquire local media for the given user.
    ///
    /// Failure here is fatal to session creation; no partial session may be
    /// left running.
    pub fn acquire(user_id: &str) -> crate::Result<Self> {
        let stream_id = format!("meshcall-{}", uuid::Uuid::new_v4());

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", user_id),
            stream_id.clone(),
        ));

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", user_id),
            stream_id.clone(),
        ));

        info!(user_id, "local media acquired");

        Ok(Self {
            audio,
            video,
            screen: RwLock::new(None),
            stream_id,
        })
    }

    /// Microphone track
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio)
    }

    /// Camera track
    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video)
    }

    /// Screen-share track, if capture is active
    pub async fn screen_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.screen.read().await.clone()
    }

    /// Start display capture, creating the screen track.
    ///
    /// Returns the existing track if capture is already active.
    pub async fn start_screen(&self, user_id: &str) -> crate::Result<Arc<TrackLocalStaticSample>> {
        let mut guard = self.screen.write().await;
        if let Some(track) = guard.as_ref() {
            return Ok(Arc::clone(track));
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("screen-{}", user_id),
            self.stream_id.clone(),
        ));

        debug!(user_id, "screen capture started");
        *guard = Some(Arc::clone(&track));
        Ok(track)
    }

    /// Stop display capture and drop the screen track
    pub async fn stop_screen(&self) {
        if self.screen.write().await.take().is_some() {
            debug!("screen capture stopped");
        }
    }

    /// Stop all local capture, best-effort. Called once at teardown.
    pub async fn stop(&self) {
        self.screen.write().await.take();
        debug!("local media stopped");
    }
}
