use crate::{
    error::CallError,
    event::{EventSender, SessionEvent},
    get_timestamp,
    media::{capture::LocalMedia, peer::PeerFactory, MediaSession, MediaSessionBuilder},
    model::ParticipantRow,
    transport::RosterStore,
    CallId, UserId,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct GroupParticipant {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub media: Arc<MediaSession>,
}

/// Per-participant fan-out for a group call. Every remote participant gets
/// its own peer link, all links share the one local capture set by
/// reference. Joins are idempotent and one participant's teardown never
/// touches the others.
pub struct GroupFanout {
    call_id: CallId,
    local: LocalMedia,
    roster: Arc<dyn RosterStore>,
    peers: Arc<dyn PeerFactory>,
    participants: Mutex<HashMap<UserId, GroupParticipant>>,
    events: EventSender,
    cancel_token: CancellationToken,
}

impl GroupFanout {
    pub(crate) fn new(
        call_id: CallId,
        local: LocalMedia,
        roster: Arc<dyn RosterStore>,
        peers: Arc<dyn PeerFactory>,
        events: EventSender,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            call_id,
            local,
            roster,
            peers,
            participants: Mutex::new(HashMap::new()),
            events,
            cancel_token,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.lock().await.len()
    }

    pub async fn participant_ids(&self) -> Vec<UserId> {
        self.participants.lock().await.keys().cloned().collect()
    }

    pub async fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.lock().await.contains_key(user_id)
    }

    /// Link a new participant and publish their roster row.
    pub async fn add_participant(
        &self,
        user_id: UserId,
        display_name: String,
        avatar_url: Option<String>,
    ) -> Result<bool, CallError> {
        self.join(user_id, display_name, avatar_url, false).await
    }

    /// Rebuild links from the persisted roster, e.g. after a process
    /// restart. Already-linked participants are left alone and no roster
    /// rows are rewritten.
    pub async fn reconcile(&self, local_user: &UserId) -> Result<usize, CallError> {
        let rows = self.roster.list_active(&self.call_id).await?;
        let mut added = 0;
        for row in rows {
            if &row.user_id == local_user {
                continue;
            }
            if self
                .join(row.user_id, row.display_name, row.avatar_url, true)
                .await?
            {
                added += 1;
            }
        }
        debug!(call_id = self.call_id, added, "roster reconciled");
        Ok(added)
    }

    async fn join(
        &self,
        user_id: UserId,
        display_name: String,
        avatar_url: Option<String>,
        silent: bool,
    ) -> Result<bool, CallError> {
        if self.participants.lock().await.contains_key(&user_id) {
            return Ok(false);
        }
        let link_id = format!("{}:{}", self.call_id, user_id);
        let peer = self
            .peers
            .create(&link_id)
            .await
            .map_err(CallError::Other)?;
        // every link sends the same capture tracks; no re-acquire
        let media = Arc::new(
            MediaSessionBuilder::new(link_id, peer, self.local.clone())
                .with_cancel_token(self.cancel_token.child_token())
                .build(),
        );
        media.start().await.map_err(CallError::Other)?;

        {
            let mut participants = self.participants.lock().await;
            if participants.contains_key(&user_id) {
                // lost the setup race; drop the spare link
                media.close().await;
                return Ok(false);
            }
            participants.insert(
                user_id.clone(),
                GroupParticipant {
                    user_id: user_id.clone(),
                    display_name: display_name.clone(),
                    avatar_url: avatar_url.clone(),
                    media,
                },
            );
        }
        if !silent {
            self.roster
                .upsert(ParticipantRow {
                    call_id: self.call_id.clone(),
                    user_id: user_id.clone(),
                    display_name,
                    avatar_url,
                    is_active: true,
                })
                .await?;
        }
        info!(call_id = self.call_id, user_id, "participant joined");
        self.events
            .send(SessionEvent::ParticipantJoined {
                call_id: self.call_id.clone(),
                timestamp: get_timestamp(),
                user_id,
            })
            .ok();
        Ok(true)
    }

    /// Tear one participant's link down; every other link is untouched.
    pub async fn remove_participant(&self, user_id: &UserId) -> Result<bool, CallError> {
        let removed = self.participants.lock().await.remove(user_id);
        let Some(participant) = removed else {
            return Ok(false);
        };
        participant.media.close().await;
        let row = ParticipantRow {
            call_id: self.call_id.clone(),
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            avatar_url: participant.avatar_url.clone(),
            is_active: false,
        };
        if let Err(e) = self.roster.upsert(row).await {
            warn!(
                call_id = self.call_id,
                user_id = participant.user_id,
                "roster deactivation failed: {}",
                e
            );
        }
        info!(
            call_id = self.call_id,
            user_id = participant.user_id,
            "participant left"
        );
        self.events
            .send(SessionEvent::ParticipantLeft {
                call_id: self.call_id.clone(),
                timestamp: get_timestamp(),
                user_id: participant.user_id,
            })
            .ok();
        Ok(true)
    }

    pub async fn close(&self) {
        let mut participants = self.participants.lock().await;
        for (_, participant) in participants.drain() {
            participant.media.close().await;
        }
        self.cancel_token.cancel();
        debug!(call_id = self.call_id, "group fan-out closed");
    }
}
