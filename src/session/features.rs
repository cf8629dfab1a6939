use crate::{
    error::CallError,
    media::recorder::RecorderConfig,
    model::{CallStatus, CallUpdate, TransportState},
    session::{CallSession, Orchestrator, Role, SessionState},
    CallId, UserId,
};
use anyhow::anyhow;
use std::sync::Arc;
use tracing::info;

/// Handle to an in-progress attended transfer: the original call is held
/// while the transferor consults the target on a second call.
pub struct AttendedTransfer {
    pub original: CallId,
    pub consult: CallId,
}

/// Mid-call features riding on the orchestrator's verbs and the media
/// session's local controls. No feature introduces its own signaling path.
pub struct FeatureController {
    orchestrator: Arc<Orchestrator>,
}

impl FeatureController {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    fn session(&self, call_id: &CallId) -> Result<Arc<CallSession>, CallError> {
        self.orchestrator
            .guard()
            .get_existing(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))
    }

    fn connected_session(&self, call_id: &CallId) -> Result<Arc<CallSession>, CallError> {
        let session = self.session(call_id)?;
        if session.state() != SessionState::Connected {
            return Err(CallError::Other(anyhow!("call is not connected")));
        }
        Ok(session)
    }

    /// Hold flips the outbound audio enable flag. Local only: no
    /// renegotiation, no session state change, nothing on the wire.
    pub fn hold(&self, call_id: &CallId, on: bool) -> Result<(), CallError> {
        let session = self.session(call_id)?;
        let media = session
            .media()
            .ok_or_else(|| CallError::Other(anyhow!("call has no media")))?;
        media.set_audio_enabled(!on);
        info!(call_id = session.call_id, on, "hold");
        Ok(())
    }

    pub fn is_held(&self, call_id: &CallId) -> Result<bool, CallError> {
        let session = self.session(call_id)?;
        let media = session
            .media()
            .ok_or_else(|| CallError::Other(anyhow!("call has no media")))?;
        Ok(!media.audio_enabled())
    }

    /// Hand the far end of a connected call to another user without
    /// consulting them. The record is re-targeted first so the remaining
    /// leg can re-invite off it; only then does this device let go.
    pub async fn blind_transfer(
        &self,
        call_id: &CallId,
        target: &UserId,
    ) -> Result<(), CallError> {
        let session = self.connected_session(call_id)?;
        if session.role != Role::Receiver {
            return Err(CallError::Other(anyhow!(
                "only the receiving side can hand off a call"
            )));
        }
        info!(call_id = session.call_id, target, "blind transfer");
        self.orchestrator
            .store
            .update(
                call_id,
                CallUpdate {
                    receiver_id: Some(target.clone()),
                    status: Some(CallStatus::Ringing),
                    transport_state: Some(TransportState::Signaling),
                    ..Default::default()
                },
            )
            .await?;
        self.orchestrator
            .finish_local(&session, "transferred")
            .await;
        Ok(())
    }

    /// Hold the original call and open a consultation call to the target.
    pub async fn attended_transfer_start(
        &self,
        call_id: &CallId,
        target: &UserId,
    ) -> Result<AttendedTransfer, CallError> {
        let session = self.connected_session(call_id)?;
        self.hold(call_id, true)?;
        let consult = self.orchestrator.initiate(target, session.kind()).await?;
        Ok(AttendedTransfer {
            original: call_id.clone(),
            consult: consult.call_id.clone(),
        })
    }

    /// The consultation becomes the call; the original leg ends.
    pub async fn attended_transfer_complete(
        &self,
        transfer: &AttendedTransfer,
    ) -> Result<(), CallError> {
        self.orchestrator
            .end(&transfer.original, Some("transferred".to_string()))
            .await
    }

    /// Abandon the consultation and resume the original call.
    pub async fn attended_transfer_revert(
        &self,
        transfer: &AttendedTransfer,
    ) -> Result<(), CallError> {
        self.orchestrator
            .end(&transfer.consult, Some("transfer abandoned".to_string()))
            .await?;
        self.hold(&transfer.original, false)
    }

    /// Stash the call in a named slot. The row keeps its slot until someone
    /// retrieves it; the partner's leg is told to stand down but the record
    /// stays non-terminal.
    pub async fn park(&self, call_id: &CallId, slot: &str) -> Result<(), CallError> {
        if slot.is_empty() {
            return Err(CallError::Other(anyhow!("park slot must not be empty")));
        }
        let me = self
            .orchestrator
            .identity()
            .ok_or(CallError::AuthRequired)?;
        let session = self.connected_session(call_id)?;
        // the slot must be persisted before teardown or the call is lost
        self.orchestrator
            .store
            .update(
                call_id,
                CallUpdate {
                    parked_slot: Some(slot.to_string()),
                    transport_state: Some(TransportState::Signaling),
                    ..Default::default()
                },
            )
            .await?;
        if let Err(e) = self
            .orchestrator
            .bus
            .publish(crate::transport::SignalEnvelope::new(
                call_id.clone(),
                me,
                session.partner_id(),
                crate::transport::SignalPayload::End {
                    reason: Some("parked".to_string()),
                },
            ))
            .await
        {
            tracing::debug!(call_id = session.call_id, "park notify failed: {}", e);
        }
        info!(call_id = session.call_id, slot, "call parked");
        self.orchestrator.finish_local(&session, "parked").await;
        Ok(())
    }

    /// Pick a parked call back up. The parked row is closed out and a fresh
    /// call is placed to the waiting party.
    pub async fn retrieve_parked(&self, slot: &str) -> Result<Arc<CallSession>, CallError> {
        let me = self
            .orchestrator
            .identity()
            .ok_or(CallError::AuthRequired)?;
        let record = self
            .orchestrator
            .store
            .find_parked(slot)
            .await?
            .ok_or_else(|| CallError::UnknownCall(format!("parked slot {}", slot)))?;
        let partner = record.partner_of(&me).clone();
        let mut update = CallUpdate::terminated(CallStatus::Ended, record.started_at);
        update.parked_slot = Some(String::new());
        self.orchestrator.store.update(&record.id, update).await?;
        info!(slot, call_id = record.id, partner, "retrieving parked call");
        self.orchestrator.initiate(&partner, record.kind).await
    }

    /// Attach a local WAV sink. Purely additive; never touches negotiation.
    pub fn start_recording(&self, call_id: &CallId, path: &str) -> Result<(), CallError> {
        let session = self.session(call_id)?;
        let media = session
            .media()
            .ok_or_else(|| CallError::Other(anyhow!("call has no media")))?;
        media
            .attach_recorder(path, &RecorderConfig::default())
            .map_err(|e| CallError::RecordWriteFailed(e.to_string()))
    }

    pub fn stop_recording(&self, call_id: &CallId) -> Result<(), CallError> {
        let session = self.session(call_id)?;
        let media = session
            .media()
            .ok_or_else(|| CallError::Other(anyhow!("call has no media")))?;
        media
            .detach_recorder()
            .map_err(|e| CallError::RecordWriteFailed(e.to_string()))
    }

    pub fn is_recording(&self, call_id: &CallId) -> Result<bool, CallError> {
        let session = self.session(call_id)?;
        Ok(session
            .media()
            .map(|media| media.is_recording())
            .unwrap_or(false))
    }

    pub fn set_noise_suppression(&self, call_id: &CallId, level: u8) -> Result<(), CallError> {
        let session = self.session(call_id)?;
        let media = session
            .media()
            .ok_or_else(|| CallError::Other(anyhow!("call has no media")))?;
        media.set_noise_suppression(level);
        Ok(())
    }
}
