//! Scripted peer connections
//!
//! A [`FakePeer`] follows the offer/answer state rules of a real connection
//! and records every call; tests drive its transport through
//! [`FakePeer::set_transport`] and friends, which go through the same event
//! sink a real binding would use.

use async_trait::async_trait;
use parking_lot::Mutex;
use rtc_session::channels::{DataChannel, DataChannelState};
use rtc_session::config::DataChannelMode;
use rtc_session::media::{LocalTrack, RemoteTrack, VideoPreset};
use rtc_session::peer::{
    ConnectionMetricsSample, IceCandidate, IceServer, NegotiationState, OfferOptions,
    PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, SdpType,
    SessionDescription, TransportState,
};
use rtc_session::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory data channel
pub struct FakeDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl FakeDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> DataChannelState {
        if self.closed.load(Ordering::SeqCst) {
            DataChannelState::Closed
        } else if self.open.load(Ordering::SeqCst) {
            DataChannelState::Open
        } else {
            DataChannelState::Connecting
        }
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if self.state() != DataChannelState::Open {
            return Err(Error::DataChannelError("not open".to_string()));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Recording peer connection
pub struct FakePeer {
    id: String,
    sink: PeerEventSink,
    ice_servers: Vec<IceServer>,
    negotiation: Mutex<NegotiationState>,
    transport: Mutex<TransportState>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    offers: Mutex<Vec<OfferOptions>>,
    answers: AtomicUsize,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<Arc<dyn LocalTrack>>>,
    channels: Mutex<Vec<Arc<FakeDataChannel>>>,
    presets: Mutex<Vec<VideoPreset>>,
    stats: Mutex<ConnectionMetricsSample>,
    closed: AtomicBool,
}

const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

impl FakePeer {
    fn new(id: String, ice_servers: &[IceServer], sink: PeerEventSink) -> Self {
        Self {
            id,
            sink,
            ice_servers: ice_servers.to_vec(),
            negotiation: Mutex::new(NegotiationState::Stable),
            transport: Mutex::new(TransportState::New),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            offers: Mutex::new(Vec::new()),
            answers: AtomicUsize::new(0),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            presets: Mutex::new(Vec::new()),
            stats: Mutex::new(ConnectionMetricsSample::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.clone()
    }

    pub fn offers(&self) -> Vec<OfferOptions> {
        self.offers.lock().clone()
    }

    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    /// Remote candidates applied, in application order
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn data_channel(&self) -> Option<Arc<FakeDataChannel>> {
        self.channels.lock().first().cloned()
    }

    pub fn presets(&self) -> Vec<VideoPreset> {
        self.presets.lock().clone()
    }

    pub fn set_stats(&self, sample: ConnectionMetricsSample) {
        *self.stats.lock() = sample;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report a transport state change
    pub fn set_transport(&self, state: TransportState) {
        *self.transport.lock() = state;
        self.sink.emit(PeerEvent::ConnectionState(state));
    }

    /// Report a gathered local candidate
    pub fn gather(&self, candidate: IceCandidate) {
        self.sink.emit(PeerEvent::IceCandidate(candidate));
    }

    pub fn finish_gathering(&self) {
        self.sink.emit(PeerEvent::IceGatheringComplete);
    }

    /// Open the locally created data channel
    pub fn open_data_channel(&self) {
        if let Some(channel) = self.data_channel() {
            channel.set_open(true);
            self.sink.emit(PeerEvent::DataChannelOpen {
                label: channel.label().to_string(),
            });
        }
    }

    /// Simulate the remote side opening a channel (responder path)
    pub fn accept_remote_data_channel(&self, label: &str) -> Arc<FakeDataChannel> {
        let channel = Arc::new(FakeDataChannel::new(label));
        self.channels.lock().push(Arc::clone(&channel));
        self.sink
            .emit(PeerEvent::DataChannel(Arc::clone(&channel) as Arc<dyn DataChannel>));
        channel.set_open(true);
        self.sink.emit(PeerEvent::DataChannelOpen {
            label: label.to_string(),
        });
        channel
    }

    pub fn receive_data(&self, text: &str) {
        self.sink.emit(PeerEvent::DataChannelMessage {
            label: "session".to_string(),
            text: text.to_string(),
        });
    }

    pub fn receive_track(&self, track: RemoteTrack) {
        self.sink.emit(PeerEvent::Track(track));
    }

    fn sdp(&self, kind: &str, options: Option<&OfferOptions>) -> String {
        let mut sdp = format!("{}a=fake-peer:{} {}\r\n", OFFER_SDP, self.id, kind);
        let audio = options.map_or(true, |o| o.receive_audio);
        let video = options.map_or(true, |o| o.receive_video);
        if audio {
            sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        }
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        sdp
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerConnectionError("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        self.check_open()?;
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription> {
        self.check_open()?;
        self.offers.lock().push(*options);
        Ok(SessionDescription::offer(self.sdp("offer", Some(options))))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        if *self.negotiation.lock() != NegotiationState::HaveRemoteOffer {
            return Err(Error::SdpError("no remote offer to answer".to_string()));
        }
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(self.sdp("answer", None)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.check_open()?;
        let mut negotiation = self.negotiation.lock();
        *negotiation = match (description.sdp_type, *negotiation) {
            (SdpType::Offer, NegotiationState::Stable) => NegotiationState::HaveLocalOffer,
            (SdpType::Answer, NegotiationState::HaveRemoteOffer) => NegotiationState::Stable,
            (kind, state) => {
                return Err(Error::SdpError(format!(
                    "cannot apply local {:?} in {:?}",
                    kind, state
                )))
            }
        };
        *self.local_description.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.check_open()?;
        let mut negotiation = self.negotiation.lock();
        *negotiation = match (description.sdp_type, *negotiation) {
            (SdpType::Offer, NegotiationState::Stable) => NegotiationState::HaveRemoteOffer,
            (SdpType::Answer, NegotiationState::HaveLocalOffer) => NegotiationState::Stable,
            (kind, state) => {
                return Err(Error::SdpError(format!(
                    "cannot apply remote {:?} in {:?}",
                    kind, state
                )))
            }
        };
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote_description.lock().is_some()
    }

    fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.lock()
    }

    fn transport_state(&self) -> TransportState {
        *self.transport.lock()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check_open()?;
        if self.remote_description.lock().is_none() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _mode: DataChannelMode,
    ) -> Result<Arc<dyn DataChannel>> {
        self.check_open()?;
        let channel = Arc::new(FakeDataChannel::new(label));
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn stats(&self) -> Result<ConnectionMetricsSample> {
        self.check_open()?;
        Ok(self.stats.lock().clone())
    }

    async fn apply_video_preset(&self, preset: &VideoPreset) -> Result<()> {
        self.presets.lock().push(*preset);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        *self.negotiation.lock() = NegotiationState::Closed;
        *self.transport.lock() = TransportState::Closed;
        Ok(())
    }
}

/// Factory keeping every connection it built
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers
            .lock()
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("peer {} was never created", index))
    }

    pub fn latest(&self) -> Arc<FakePeer> {
        self.peers
            .lock()
            .last()
            .cloned()
            .expect("no peer connection created")
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let mut peers = self.peers.lock();
        let peer = Arc::new(FakePeer::new(
            format!("fake-peer-{}", peers.len()),
            ice_servers,
            events,
        ));
        peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}
