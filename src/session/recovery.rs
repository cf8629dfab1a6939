use crate::{
    config::RecoveryConfig,
    event::{EventSender, SessionEvent},
    get_timestamp,
    media::peer::LinkStats,
    model::CallUpdate,
    session::{CallSession, SessionState},
    transport::CallStore,
    CallId,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{select, sync::mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Classify a stats sample against the configured loss and round-trip
/// boundaries; the worse of the two dimensions wins.
pub fn classify_quality(stats: &LinkStats, config: &RecoveryConfig) -> QualityTier {
    let by_loss = if stats.packet_loss_pct < config.good_loss_pct {
        QualityTier::Excellent
    } else if stats.packet_loss_pct < config.fair_loss_pct {
        QualityTier::Good
    } else if stats.packet_loss_pct < config.poor_loss_pct {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    };
    let by_rtt = if stats.rtt_ms < config.good_rtt_ms {
        QualityTier::Excellent
    } else if stats.rtt_ms < config.fair_rtt_ms {
        QualityTier::Good
    } else if stats.rtt_ms < config.poor_rtt_ms {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    };
    by_loss.max(by_rtt)
}

/// Instructions the supervisor hands back to the orchestrator's serve loop.
/// Renegotiation carries the session generation observed at decision time so
/// the orchestrator can discard commands that raced a newer transition.
#[derive(Debug)]
pub enum RecoveryCommand {
    Renegotiate {
        call_id: CallId,
        generation: u64,
        attempt: u32,
    },
    Fail {
        call_id: CallId,
        reason: String,
    },
}

/// Per-call watchdog: samples the transport on a fixed cadence, confirms a
/// disconnect only after the configured number of consecutive down samples,
/// and spaces renegotiation attempts with capped exponential backoff. Also
/// owns the heartbeat writes; heartbeat failures are logged and never end a
/// call.
pub struct RecoverySupervisor {
    session: Arc<CallSession>,
    store: Arc<dyn CallStore>,
    config: RecoveryConfig,
    commands: mpsc::UnboundedSender<RecoveryCommand>,
    events: EventSender,
}

impl RecoverySupervisor {
    pub fn spawn(
        session: Arc<CallSession>,
        store: Arc<dyn CallStore>,
        config: RecoveryConfig,
        commands: mpsc::UnboundedSender<RecoveryCommand>,
        events: EventSender,
    ) {
        let supervisor = Self {
            session,
            store,
            config,
            commands,
            events,
        };
        tokio::spawn(async move { supervisor.run().await });
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    async fn run(self) {
        let call_id = self.session.call_id.clone();
        let mut sample_tick =
            tokio::time::interval(Duration::from_millis(self.config.sample_interval_ms));
        let mut heartbeat_tick =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        let mut down_samples = 0u32;
        let mut attempt = 0u32;
        let mut hold_until: Option<Instant> = None;
        let mut last_tier: Option<QualityTier> = None;

        debug!(call_id, "recovery supervisor started");
        loop {
            select! {
                _ = self.session.cancel_token.cancelled() => break,
                _ = sample_tick.tick() => {
                    if self.session.state().is_terminal() {
                        break;
                    }
                    let Some(media) = self.session.media() else { continue };
                    let ice = media.peer().ice_state();

                    if ice.is_down() {
                        down_samples += 1;
                        debug!(call_id, down_samples, "transport down sample");
                    } else {
                        if attempt > 0 && self.session.state() == SessionState::Connected {
                            info!(call_id, attempt, "transport recovered");
                            attempt = 0;
                            hold_until = None;
                        }
                        down_samples = 0;
                    }

                    if self.session.state() == SessionState::Connected {
                        if let Ok(stats) = media.peer().stats().await {
                            let tier = classify_quality(&stats, &self.config);
                            if last_tier != Some(tier) {
                                last_tier = Some(tier);
                                self.events
                                    .send(SessionEvent::Quality {
                                        call_id: call_id.clone(),
                                        timestamp: get_timestamp(),
                                        tier,
                                    })
                                    .ok();
                            }
                        }
                    }

                    if down_samples < self.config.disconnect_threshold {
                        continue;
                    }
                    if let Some(until) = hold_until {
                        if Instant::now() < until {
                            continue;
                        }
                    }
                    if attempt >= self.config.max_retries {
                        warn!(call_id, attempt, "reconnect budget exhausted");
                        self.commands
                            .send(RecoveryCommand::Fail {
                                call_id: call_id.clone(),
                                reason: "reconnect retries exhausted".to_string(),
                            })
                            .ok();
                        break;
                    }
                    attempt += 1;
                    hold_until = Some(Instant::now() + self.backoff_for(attempt));
                    info!(call_id, attempt, "requesting renegotiation");
                    self.commands
                        .send(RecoveryCommand::Renegotiate {
                            call_id: call_id.clone(),
                            generation: self.session.generation(),
                            attempt,
                        })
                        .ok();
                }
                _ = heartbeat_tick.tick() => {
                    if self.session.state() != SessionState::Connected {
                        continue;
                    }
                    let update = CallUpdate {
                        heartbeat_at: Some(chrono::Utc::now()),
                        ..Default::default()
                    };
                    // liveness only; a failed write must never end the call
                    if let Err(e) = self.store.update(&call_id, update).await {
                        debug!(call_id, "heartbeat write failed: {}", e);
                    }
                }
            }
        }
        debug!(call_id, "recovery supervisor stopped");
    }
}

impl PartialOrd for QualityTier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QualityTier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(tier: &QualityTier) -> u8 {
            match tier {
                QualityTier::Excellent => 0,
                QualityTier::Good => 1,
                QualityTier::Fair => 2,
                QualityTier::Poor => 3,
            }
        }
        rank(self).cmp(&rank(other))
    }
}
