//! webrtc-rs peer connection

use super::data_channel::RtcDataChannel;
use super::tracks::SampleTrack;
use super::{rtc_ice_servers, stats};
use crate::channels::DataChannel;
use crate::config::DataChannelMode;
use crate::media::{LocalTrack, RemoteTrack, TrackKind, VideoPreset};
use crate::peer::{
    ConnectionMetricsSample, IceCandidate, IceConnectionState, IceServer, NegotiationState,
    OfferOptions, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, SdpType,
    SessionDescription, TransportState,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds [`WebRtcPeer`]s with the default codecs and interceptors
#[derive(Debug, Default, Clone)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = WebRtcPeer::new(ice_servers, events).await?;
        Ok(Arc::new(peer))
    }
}

/// One webrtc-rs peer connection
pub struct WebRtcPeer {
    id: String,
    pc: Arc<RTCPeerConnection>,
    sink: PeerEventSink,
    tracks: parking_lot::Mutex<Vec<Arc<dyn LocalTrack>>>,
}

impl WebRtcPeer {
    /// Build a connection and wire its callbacks to `sink`
    #[instrument(skip(ice_servers, sink), fields(generation = sink.generation()))]
    pub async fn new(ice_servers: &[IceServer], sink: PeerEventSink) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnectionError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::PeerConnectionError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        let peer = Self {
            id,
            pc,
            sink,
            tracks: parking_lot::Mutex::new(Vec::new()),
        };
        peer.install_handlers();

        info!(
            "Created peer connection {} with {} ICE servers",
            peer.id,
            ice_servers.len()
        );
        Ok(peer)
    }

    fn install_handlers(&self) {
        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                if let Some(state) = map_transport_state(s) {
                    sink.emit(PeerEvent::ConnectionState(state));
                }
                Box::pin(async {})
            }));

        let sink = self.sink.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                if let Some(state) = map_ice_state(s) {
                    sink.emit(PeerEvent::IceConnectionState(state));
                }
                Box::pin(async {})
            }));

        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            sink.emit(PeerEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    },
                    None => {
                        sink.emit(PeerEvent::IceGatheringComplete);
                    }
                }
                Box::pin(async {})
            }));

        let sink = self.sink.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    sink.emit(PeerEvent::Track(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));

                    // Reading keeps the interceptors (receiver reports) running.
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        debug!("Remote {} track ended", kind);
                    });
                }
                Box::pin(async {})
            },
        ));

        let sink = self.sink.clone();
        self.pc.on_data_channel(Box::new(move |rtc_channel: Arc<RTCDataChannel>| {
            let channel = Arc::new(RtcDataChannel::wrap(rtc_channel));
            sink.emit(PeerEvent::DataChannel(
                Arc::clone(&channel) as Arc<dyn DataChannel>
            ));
            channel.bind(sink.clone());
            Box::pin(async {})
        }));
    }

    /// Make sure a transceiver exists for `kind` so the offer has an m-line
    async fn ensure_receiver(&self, kind: RTPCodecType) -> Result<()> {
        let transceivers = self.pc.get_transceivers().await;
        if transceivers.iter().any(|t| t.kind() == kind) {
            return Ok(());
        }

        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                Error::PeerConnectionError(format!("Failed to add {} transceiver: {}", kind, e))
            })?;
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        let sample = track.as_any().downcast_ref::<SampleTrack>().ok_or_else(|| {
            Error::MediaTrackError(format!(
                "Track {} is not backed by a webrtc sample track",
                track.id()
            ))
        })?;

        let sender = self
            .pc
            .add_track(sample.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to add {} track: {}", track.kind(), e))
            })?;

        // RTCP must be drained for the sender interceptors to work.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        debug!("Added {} track {} to {}", track.kind(), track.id(), self.id);
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription> {
        if options.receive_audio {
            self.ensure_receiver(RTPCodecType::Audio).await?;
        }
        if options.receive_video {
            self.ensure_receiver(RTPCodecType::Video).await?;
        }

        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        Ok(from_rtc_description(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(from_rtc_description(&answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn negotiation_state(&self) -> NegotiationState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => NegotiationState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => NegotiationState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => NegotiationState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => NegotiationState::HaveRemotePranswer,
            RTCSignalingState::Closed => NegotiationState::Closed,
            _ => NegotiationState::Stable,
        }
    }

    fn transport_state(&self) -> TransportState {
        map_transport_state(self.pc.connection_state()).unwrap_or(TransportState::New)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Arc<dyn DataChannel>> {
        let channel = RtcDataChannel::create(&self.pc, label, mode, self.sink.clone()).await?;
        debug!("Data channel '{}' created on {}", label, self.id);
        Ok(Arc::new(channel))
    }

    async fn stats(&self) -> Result<ConnectionMetricsSample> {
        let report = self.pc.get_stats().await;
        Ok(stats::collect(&report))
    }

    async fn apply_video_preset(&self, preset: &VideoPreset) -> Result<()> {
        let tracks = self.tracks.lock().clone();
        for track in tracks.iter().filter(|t| t.kind() == TrackKind::Video) {
            track.apply_preset(preset);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection {}", self.id);
        self.pc.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

fn map_transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    Some(match state {
        RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => return None,
    })
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let SessionDescription { sdp_type, sdp } = description;
    let parsed = match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(Error::SdpError("Rollback is not supported".to_string()));
        }
    };
    parsed.map_err(|e| Error::SdpError(format!("Failed to parse {:?} SDP: {}", sdp_type, e)))
}

fn from_rtc_description(description: &RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    }
}
