//! Session controller: "who is this" + "is the weight settled" into
//! "record one measurement for this person".
//!
//! The controller is plain state with no I/O. It is meant to be owned by a
//! single task (see `weighind::session`) which feeds it identification
//! results and settle events from two independent pipelines and carries
//! out the [`SettleDecision`]s it returns.

use crate::stability::{EpisodeId, SessionToken, SettledEvent};
use crate::types::{IdentityId, Measurement, MeasurementId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Returned when an identification is already in flight.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("identification already in progress")]
pub struct Busy;

/// Proof of holding the single identification slot.
#[derive(Debug, PartialEq, Eq)]
pub struct IdentifyTicket {
    seq: u64,
}

/// Resolved identification, after the full identity record was fetched.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyOutcome {
    Identified {
        identity_id: IdentityId,
        display_name: String,
        similarity: f32,
    },
    Unknown,
    /// Nobody enrolled yet.
    Empty,
    NoFace,
    MultipleFaces,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundIdentity {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub similarity: f32,
}

/// Status updates for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Recognizing,
    Identified { name: String, similarity: f32 },
    Unknown,
    NoOneEnrolled,
    NoFace,
    MultipleFaces,
    IdentifyFailed { reason: String },
    MeasurementRecorded { name: String, weight: f32, time: DateTime<Utc> },
    MeasurementFailed { reason: String },
    ScaleConnected { connected: bool },
    ScaleFault { reason: String },
}

impl Notification {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    NoIdentity,
    StaleSession,
    AlreadyCommitted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleDecision {
    /// Hand this to persistence. The episode is already marked committed.
    Commit(Measurement),
    Discarded(DiscardReason),
}

#[derive(Debug, Default)]
pub struct SessionController {
    binding: Option<BoundIdentity>,
    session: Option<SessionToken>,
    in_flight: Option<u64>,
    next_ticket: u64,
    committed: Option<(Option<SessionToken>, EpisodeId)>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_identity(&self) -> Option<&BoundIdentity> {
        self.binding.as_ref()
    }

    pub fn session(&self) -> Option<SessionToken> {
        self.session
    }

    pub fn is_identifying(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Claim the identification slot. Never queues: a second caller gets
    /// [`Busy`] until the first ticket is completed.
    pub fn try_begin_identify(&mut self) -> Result<IdentifyTicket, Busy> {
        if self.in_flight.is_some() {
            return Err(Busy);
        }
        let seq = self.next_ticket;
        self.next_ticket += 1;
        self.in_flight = Some(seq);
        Ok(IdentifyTicket { seq })
    }

    /// Apply an identification result and release the slot.
    ///
    /// Returns `None` for a ticket that no longer holds the slot.
    pub fn complete_identify(
        &mut self,
        ticket: IdentifyTicket,
        outcome: IdentifyOutcome,
    ) -> Option<Notification> {
        if self.in_flight != Some(ticket.seq) {
            tracing::warn!(ticket = ticket.seq, "ignoring stale identification result");
            return None;
        }
        self.in_flight = None;

        let notification = match outcome {
            IdentifyOutcome::Identified {
                identity_id,
                display_name,
                similarity,
            } => {
                tracing::info!(id = %identity_id, name = %display_name, similarity, "identity bound");
                self.binding = Some(BoundIdentity {
                    identity_id,
                    display_name: display_name.clone(),
                    similarity,
                });
                Notification::Identified {
                    name: display_name,
                    similarity,
                }
            }
            IdentifyOutcome::Unknown => {
                self.clear_binding("unknown face");
                Notification::Unknown
            }
            IdentifyOutcome::Empty => {
                self.clear_binding("nobody enrolled");
                Notification::NoOneEnrolled
            }
            IdentifyOutcome::NoFace => Notification::NoFace,
            IdentifyOutcome::MultipleFaces => Notification::MultipleFaces,
            IdentifyOutcome::Failed(reason) => Notification::IdentifyFailed { reason },
        };
        Some(notification)
    }

    pub fn scale_connected(&mut self, token: SessionToken) -> Notification {
        tracing::info!(session = token.0, "scale session started");
        self.session = Some(token);
        Notification::ScaleConnected { connected: true }
    }

    /// End `token`'s session. Later settle events tagged with it are stale.
    pub fn scale_disconnected(&mut self, token: SessionToken) -> Option<Notification> {
        if self.session != Some(token) {
            tracing::debug!(session = token.0, "disconnect for inactive session");
            return None;
        }
        tracing::info!(session = token.0, "scale session ended");
        self.session = None;
        self.clear_binding("scale disconnected");
        Some(Notification::ScaleConnected { connected: false })
    }

    /// The scale reported nobody on it. Clears the binding when that reading
    /// ended an occupancy; returns whether a binding was dropped.
    pub fn absence(&mut self, was_seated: bool) -> bool {
        if !was_seated || self.binding.is_none() {
            return false;
        }
        self.clear_binding("stepped off");
        true
    }

    pub fn on_settled(&mut self, event: SettledEvent, now: DateTime<Utc>) -> SettleDecision {
        if event.session != self.session {
            tracing::debug!(episode = event.episode.0, "dropping settle event from ended session");
            return SettleDecision::Discarded(DiscardReason::StaleSession);
        }

        let key = (event.session, event.episode);
        if self.committed == Some(key) {
            tracing::debug!(episode = event.episode.0, "episode already committed");
            return SettleDecision::Discarded(DiscardReason::AlreadyCommitted);
        }

        let Some(bound) = &self.binding else {
            tracing::info!(weight = event.weight, "settled with nobody identified; discarding");
            return SettleDecision::Discarded(DiscardReason::NoIdentity);
        };

        let measurement = Measurement {
            identity_id: bound.identity_id,
            weight: event.weight,
            recorded_at: now,
        };
        self.committed = Some(key);
        tracing::info!(
            id = %measurement.identity_id,
            weight = measurement.weight,
            episode = event.episode.0,
            "committing measurement"
        );
        SettleDecision::Commit(measurement)
    }

    /// Report how persistence handled a committed measurement.
    ///
    /// Failure does not reopen the episode: commits are attempted at most once.
    pub fn measurement_stored<E: std::fmt::Display>(
        &self,
        measurement: &Measurement,
        name: &str,
        result: Result<MeasurementId, E>,
    ) -> Notification {
        match result {
            Ok(id) => {
                tracing::info!(row = id.0, id = %measurement.identity_id, "measurement stored");
                Notification::MeasurementRecorded {
                    name: name.to_string(),
                    weight: measurement.weight,
                    time: measurement.recorded_at,
                }
            }
            Err(e) => {
                tracing::error!(id = %measurement.identity_id, error = %e, "failed to store measurement");
                Notification::MeasurementFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn clear_binding(&mut self, why: &str) {
        if let Some(prev) = self.binding.take() {
            tracing::info!(id = %prev.identity_id, reason = why, "identity unbound");
        }
    }
}
