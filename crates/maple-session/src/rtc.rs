//! Peer connections backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use maple_common::{Error, Result};
use maple_media::{MediaChunk, MediaKind, MediaSource, MediaStream};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerEventSink};
use crate::types::{ConnectionState, IceCandidate, SdpType, SessionDescription};

const VIDEO_CLOCK_RATE: u64 = 90_000;
const AUDIO_CLOCK_RATE: u64 = 48_000;

fn negotiation_error(e: webrtc::Error) -> Error {
    Error::negotiation(e.to_string())
}

/// Creates receive-only video peer connections.
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().map_err(negotiation_error)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut m).map_err(negotiation_error)?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(negotiation_error)?,
        );

        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(negotiation_error)?;

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let candidate = match c.map(|c| c.to_json()).transpose() {
                    Ok(candidate) => candidate.map(IceCandidate::from),
                    Err(e) => {
                        warn!("failed to serialize local ICE candidate: {}", e);
                        return;
                    }
                };
                events.emit(PeerEvent::LocalCandidate(candidate));
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let (kind, default_rate) = match track.kind() {
                        RTPCodecType::Audio => (MediaKind::Audio, AUDIO_CLOCK_RATE),
                        _ => (MediaKind::Video, VIDEO_CLOCK_RATE),
                    };
                    let clock_rate = match u64::from(track.codec().capability.clock_rate) {
                        0 => default_rate,
                        rate => rate,
                    };
                    let stream = MediaStream::new(
                        track.id(),
                        kind,
                        Arc::new(RtpTrackSource { track, clock_rate }),
                    );
                    events.emit(PeerEvent::Track(stream));
                })
            },
        ));

        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    RTCPeerConnectionState::Unspecified => return,
                };
                events.emit(PeerEvent::StateChanged(state));
            })
        }));

        info!("WebRTC peer connection ready (recvonly video)");
        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        Ok(SessionDescription {
            sdp_type: answer.sdp_type.into(),
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(negotiation_error)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(negotiation_error)
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => return Err(Error::negotiation("rollback descriptions are not supported")),
    };
    result.map_err(negotiation_error)
}

impl From<RTCSdpType> for SdpType {
    fn from(value: RTCSdpType) -> Self {
        match value {
            RTCSdpType::Answer => Self::Answer,
            RTCSdpType::Pranswer => Self::Pranswer,
            RTCSdpType::Rollback => Self::Rollback,
            _ => Self::Offer,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// RTP payloads of one remote track.
struct RtpTrackSource {
    track: Arc<TrackRemote>,
    clock_rate: u64,
}

#[async_trait]
impl MediaSource for RtpTrackSource {
    async fn next_chunk(&self) -> Result<Option<MediaChunk>> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Ok(Some(MediaChunk {
                timestamp_us: u64::from(packet.header.timestamp) * 1_000_000 / self.clock_rate,
                payload: packet.payload,
            })),
            Err(e) => {
                debug!("remote track {} ended: {}", self.track.id(), e);
                Ok(None)
            }
        }
    }
}
