use super::{
    capture::MediaTrack,
    peer::{IceState, LinkStats, PeerEvent, PeerEventReceiver, PeerFactory, PeerTransport},
};
use crate::TrackId;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use webrtc::api::{media_engine::MediaEngine, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

impl From<RTCIceConnectionState> for IceState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::New => IceState::New,
            RTCIceConnectionState::Checking => IceState::Checking,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                IceState::Connected
            }
            RTCIceConnectionState::Disconnected => IceState::Disconnected,
            RTCIceConnectionState::Failed => IceState::Failed,
            RTCIceConnectionState::Closed => IceState::Closed,
            RTCIceConnectionState::Unspecified => IceState::New,
        }
    }
}

/// `PeerTransport` over a webrtc-rs RTCPeerConnection.
pub struct RtcPeer {
    id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackId, Arc<RTCRtpSender>>>,
    state: Arc<Mutex<IceState>>,
    events: broadcast::Sender<PeerEvent>,
}

impl RtcPeer {
    pub async fn connect(id: String, ice_urls: Vec<String>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = Registry::new();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_urls
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect();
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (events, _) = broadcast::channel(64);
        let state = Arc::new(Mutex::new(IceState::New));

        let pc_state = state.clone();
        let pc_events = events.clone();
        let pc_id = id.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let ice_state: IceState = s.into();
            info!(id = pc_id, "ice connection state: {:?}", ice_state);
            *pc_state.lock().unwrap() = ice_state;
            pc_events.send(PeerEvent::IceState(ice_state)).ok();
            Box::pin(async {})
        }));

        let track_events = events.clone();
        let track_pc_id = id.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let track_id = track.id().to_string();
            let video = track.kind() == RTPCodecType::Video;
            debug!(id = track_pc_id, track_id, video, "remote track");
            track_events
                .send(PeerEvent::RemoteTrack { track_id, video })
                .ok();
            Box::pin(async {})
        }));

        let nego_events = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            nego_events.send(PeerEvent::NegotiationNeeded).ok();
            Box::pin(async {})
        }));

        Ok(Self {
            id,
            pc,
            senders: Mutex::new(HashMap::new()),
            state,
            events,
        })
    }

    fn track_local(track: &MediaTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>> {
        match &track.rtc {
            Some(rtc) => Ok(rtc.clone() as Arc<dyn TrackLocal + Send + Sync>),
            None => Err(anyhow!("track {} has no rtc backing", track.id)),
        }
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self, remote_offer: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(remote_offer.to_string())?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, remote_answer: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(remote_answer.to_string())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    ) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.to_string(),
                sdp_mid,
                sdp_mline_index: sdp_mline_index.map(|i| i as u16),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let local = Self::track_local(track)?;
        let sender = self.pc.add_track(local).await?;
        self.senders
            .lock()
            .unwrap()
            .insert(track.id.clone(), sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        let sender = self.senders.lock().unwrap().remove(track_id);
        match sender {
            Some(sender) => {
                self.pc.remove_track(&sender).await?;
                Ok(())
            }
            None => Err(anyhow!("no sender for track: {}", track_id)),
        }
    }

    async fn replace_track(&self, old_id: &TrackId, track: &MediaTrack) -> Result<()> {
        let sender = {
            let senders = self.senders.lock().unwrap();
            senders
                .get(old_id)
                .cloned()
                .ok_or_else(|| anyhow!("no sender for track: {}", old_id))?
        };
        let local = Self::track_local(track)?;
        sender.replace_track(Some(local)).await?;
        let mut senders = self.senders.lock().unwrap();
        senders.remove(old_id);
        senders.insert(track.id.clone(), sender);
        Ok(())
    }

    async fn stats(&self) -> Result<LinkStats> {
        let report = self.pc.get_stats().await;
        let mut stats = LinkStats::default();
        for entry in report.reports.values() {
            if let StatsReportType::RemoteInboundRTP(rtp) = entry {
                stats.rtt_ms = (rtp.round_trip_time.unwrap_or_default() * 1000.0) as u32;
                stats.packet_loss_pct = (rtp.fraction_lost * 100.0) as f32;
            }
        }
        Ok(stats)
    }

    fn ice_state(&self) -> IceState {
        *self.state.lock().unwrap()
    }

    fn subscribe(&self) -> PeerEventReceiver {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        debug!(id = self.id, "closing peer connection");
        self.pc.close().await?;
        Ok(())
    }
}

/// Factory producing webrtc-rs peers with a shared ICE server list.
pub struct RtcPeerFactory {
    ice_urls: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_urls: Vec<String>) -> Arc<Self> {
        Arc::new(Self { ice_urls })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, id: &str) -> Result<Arc<dyn PeerTransport>> {
        match RtcPeer::connect(id.to_string(), self.ice_urls.clone()).await {
            Ok(peer) => Ok(Arc::new(peer)),
            Err(e) => {
                warn!(id, "failed to create peer connection: {}", e);
                Err(e)
            }
        }
    }
}
