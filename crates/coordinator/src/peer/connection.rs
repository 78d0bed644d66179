//! One peer link per remote participant
//!
//! A link bundles the WebRTC peer connection, the control channel, and the
//! restart bookkeeping for one remote. Links are created lazily: on the
//! first `join` from a peer we initiate toward, or on the first offer
//! received from a peer that initiates toward us.

use crate::channels::{ControlChannel, ControlMessage};
use crate::config::CoordinatorConfig;
use crate::media::LocalMedia;
use crate::peer::{ReconnectPolicy, RestartTracker};
use crate::signaling::CandidatePayload;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Peer connection plus control channel for one remote participant
pub struct PeerLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    control: RwLock<Option<ControlChannel>>,
    restart: RestartTracker,
    policy: ReconnectPolicy,
    screen_sender: RwLock<Option<Arc<RTCRtpSender>>>,
}

impl PeerLink {
    /// Create a link to `peer_id` and attach the local media tracks.
    #[instrument(skip(config, media), fields(peer_id = %peer_id))]
    pub async fn connect(
        peer_id: String,
        config: &CoordinatorConfig,
        media: &LocalMedia,
    ) -> crate::Result<Self> {
        info!("Creating peer link");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| crate::Error::PeerConnectionError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| {
                crate::Error::PeerConnectionError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            crate::Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        let link = Self {
            peer_id,
            pc,
            control: RwLock::new(None),
            restart: RestartTracker::new(),
            policy: config.reconnect.clone(),
            screen_sender: RwLock::new(None),
        };

        link.add_track(media.audio_track()).await?;
        link.add_track(media.video_track()).await?;
        if let Some(screen) = media.screen_track().await {
            link.attach_screen_track(screen).await?;
        }

        Ok(link)
    }

    /// Remote participant this link connects to
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The underlying connection, for callback wiring
    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Restart bookkeeping for the failure handler
    pub fn restart_tracker(&self) -> &RestartTracker {
        &self.restart
    }

    /// ICE restart policy for this link
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticSample>) -> crate::Result<Arc<RTCRtpSender>> {
        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| crate::Error::MediaError(format!("Failed to add track: {}", e)))
    }

    /// Attach the screen-share track, retaining the sender for removal
    pub async fn attach_screen_track(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> crate::Result<()> {
        let sender = self.add_track(track).await?;
        *self.screen_sender.write().await = Some(sender);
        debug!(peer_id = %self.peer_id, "screen track attached");
        Ok(())
    }

    /// Detach the screen-share track, if attached
    pub async fn detach_screen_track(&self) {
        if let Some(sender) = self.screen_sender.write().await.take() {
            if let Err(e) = self.pc.remove_track(&sender).await {
                warn!(peer_id = %self.peer_id, "Error removing screen track: {}", e);
            }
        }
    }

    /// Open the control channel locally
    pub async fn open_control_channel(&self) -> crate::Result<ControlChannel> {
        let channel = ControlChannel::open(&self.pc).await?;
        *self.control.write().await = Some(channel.clone());
        Ok(channel)
    }

    /// Adopt a control channel announced by the remote side
    pub async fn adopt_control_channel(&self, channel: Arc<RTCDataChannel>) -> ControlChannel {
        let channel = ControlChannel::adopt(channel);
        *self.control.write().await = Some(channel.clone());
        channel
    }

    /// The control channel, if one exists
    pub async fn control_channel(&self) -> Option<ControlChannel> {
        self.control.read().await.clone()
    }

    /// Send a control message if the channel is open
    pub async fn send_control(&self, msg: &ControlMessage) -> crate::Result<()> {
        let guard = self.control.read().await;
        match guard.as_ref() {
            Some(channel) if channel.is_open() => channel.send(msg).await,
            _ => Err(crate::Error::ControlChannelError(format!(
                "No open control channel for {}",
                self.peer_id
            ))),
        }
    }

    /// Create and install the local SDP offer
    pub async fn create_offer(&self) -> crate::Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| crate::Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| crate::Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            crate::Error::SdpError("No local description after setting offer".to_string())
        })?;

        debug!(peer_id = %self.peer_id, "offer created");
        Ok(local.sdp)
    }

    /// Apply a remote offer and produce the answer
    pub async fn accept_offer(&self, offer_sdp: String) -> crate::Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| crate::Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| crate::Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| crate::Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| crate::Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            crate::Error::SdpError("No local description after setting answer".to_string())
        })?;

        debug!(peer_id = %self.peer_id, "answer created");
        Ok(local.sdp)
    }

    /// Apply a remote answer
    pub async fn accept_answer(&self, answer_sdp: String) -> crate::Result<()> {
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| crate::Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| crate::Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    /// Add a remote ICE candidate, tolerating out-of-order arrival
    pub async fn add_ice_candidate(&self, payload: CandidatePayload) -> crate::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: None,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| crate::Error::IceCandidateError(format!("Failed to add candidate: {}", e)))?;

        Ok(())
    }

    /// Restart ICE: produce a new offer with the restart flag set.
    ///
    /// The caller publishes the returned offer to the peer.
    pub async fn restart_ice(&self) -> crate::Result<String> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| crate::Error::IceCandidateError(format!("ICE restart failed: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| crate::Error::SdpError(format!("Failed to set restart offer: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            crate::Error::SdpError("No local description after ICE restart".to_string())
        })?;

        info!(peer_id = %self.peer_id, "ICE restart offer created");
        Ok(local.sdp)
    }

    /// Close the link, best-effort. Failures are logged, never returned.
    pub async fn close(&self) {
        debug!(peer_id = %self.peer_id, "closing peer link");

        if let Some(channel) = self.control.write().await.take() {
            channel.close().await;
        }

        if let Err(e) = self.pc.close().await {
            warn!(peer_id = %self.peer_id, "Error closing connection: {}", e);
        }
    }
}
