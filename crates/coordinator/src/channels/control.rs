//! Control channel over a WebRTC data channel
//!
//! One control channel per peer link. Either side may open it: the local
//! side creates one at link setup, and channels announced by the remote via
//! `on_data_channel` are adopted with the same wrapper.

use crate::channels::ControlMessage;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

/// Label both sides use for the control channel
pub const CONTROL_CHANNEL_LABEL: &str = "meshcall-control";

/// Wrapper around the per-peer control data channel
#[derive(Clone)]
pub struct ControlChannel {
    channel: Arc<RTCDataChannel>,
}

impl ControlChannel {
    /// Open a control channel on the given connection
    pub async fn open(pc: &Arc<RTCPeerConnection>) -> crate::Result<Self> {
        let channel = pc
            .create_data_channel(CONTROL_CHANNEL_LABEL, None)
            .await
            .map_err(|e| {
                crate::Error::ControlChannelError(format!("Failed to create channel: {}", e))
            })?;

        Ok(Self { channel })
    }

    /// Adopt a channel opened by the remote side
    pub fn adopt(channel: Arc<RTCDataChannel>) -> Self {
        Self { channel }
    }

    /// Channel label
    pub fn label(&self) -> String {
        self.channel.label().to_string()
    }

    /// Whether the channel is open and ready to send
    pub fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    /// Send a control message
    pub async fn send(&self, msg: &ControlMessage) -> crate::Result<()> {
        if !self.is_open() {
            return Err(crate::Error::ControlChannelError(
                "Channel not open".to_string(),
            ));
        }

        let bytes = msg.to_bytes()?;
        self.channel
            .send(&Bytes::from(bytes))
            .await
            .map_err(|e| crate::Error::ControlChannelError(format!("Send failed: {}", e)))?;

        Ok(())
    }

    /// Install the incoming-message handler.
    ///
    /// Malformed payloads are dropped with a warning; the handler only ever
    /// sees well-formed control messages.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(ControlMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.channel
            .on_message(Box::new(move |msg: DataChannelMessage| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    match ControlMessage::from_bytes(&msg.data) {
                        Ok(control) => {
                            debug!(kind = control.kind(), "control message received");
                            handler(control).await;
                        }
                        Err(e) => {
                            warn!("Dropping malformed control payload: {}", e);
                        }
                    }
                })
            }));
    }

    /// Close the channel, best-effort
    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            warn!("Error closing control channel: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    async fn connection() -> Arc<RTCPeerConnection> {
        let api = APIBuilder::new().build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_open_control_channel() {
        let pc = connection().await;
        let channel = ControlChannel::open(&pc).await.unwrap();
        assert_eq!(channel.label(), CONTROL_CHANNEL_LABEL);
        // Not connected to anything yet
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_send_on_unopened_channel_fails() {
        let pc = connection().await;
        let channel = ControlChannel::open(&pc).await.unwrap();
        let msg = ControlMessage::HandLower {
            user_id: "@bob:example.org".to_string(),
        };
        assert!(channel.send(&msg).await.is_err());
    }
}
