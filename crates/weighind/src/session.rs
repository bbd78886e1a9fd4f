//! The session actor.
//!
//! One task owns the [`SessionController`] and is the only writer of "who is
//! on the scale". Two producers feed it: identification requests from D-Bus
//! (through [`SessionHandle`]) and a stability pipeline task that owns the
//! [`StabilityTracker`] and turns raw [`ScaleEvent`]s into settle events.
//! Slow work (matching, record lookup, inserts) runs off the actor and
//! reports back through an internal channel.

use crate::store::{Store, StoreError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use weighin_core::{
    CosineMatcher, Embedding, EmbeddingError, ExtractError, IdentifyOutcome, IdentifyTicket,
    IdentityCache, IdentityId, IdentityLookup, IdentityRecord, MatchResult, Matcher, Measurement,
    MeasurementId, MeasurementSink, Notification, Probe, SampleOutcome, SessionController,
    SessionToken, SettleDecision, SettledEvent, StabilityConfig, StabilityState, StabilityTracker,
};
use weighin_hw::{ScaleEvent, ScaleFault};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("identification already in progress")]
    Busy,
    #[error("invalid embedding: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session actor exited")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub similarity_threshold: f32,
    pub stability: StabilityConfig,
}

/// Point-in-time view of the session, for `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub scale_connected: bool,
    pub identity: Option<String>,
    pub identifying: bool,
    pub stability: StabilityState,
    pub last_reading: Option<f32>,
    pub enrolled: usize,
}

enum SessionRequest {
    Identify {
        probe: Probe,
        reply: oneshot::Sender<Result<Notification, SessionError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Output of the stability pipeline.
#[derive(Debug)]
enum PipelineEvent {
    Connected(SessionToken),
    Disconnected(SessionToken),
    Fault(ScaleFault),
    /// Below-floor reading, still reported as raw telemetry.
    Absent {
        was_seated: bool,
        kg: f32,
        state: StabilityState,
    },
    Reading { kg: f32, state: StabilityState },
    Settled(SettledEvent),
}

/// Completions of work the actor spawned.
enum Internal {
    IdentifyResolved {
        ticket: IdentifyTicket,
        outcome: IdentifyOutcome,
        reply: oneshot::Sender<Result<Notification, SessionError>>,
    },
    Stored {
        measurement: Measurement,
        name: String,
        result: Result<MeasurementId, StoreError>,
    },
}

/// Clone-safe handle to the session actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
    store: Store,
    cache: Arc<IdentityCache>,
    notify: broadcast::Sender<Notification>,
}

impl SessionHandle {
    /// Identify whoever is in front of the camera and bind them to the session.
    ///
    /// Never queues behind another identification: returns
    /// [`SessionError::Busy`] while one is in flight.
    pub async fn identify(&self, probe: Probe) -> Result<Notification, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(SessionRequest::Identify {
                probe,
                reply: reply_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::Busy,
                mpsc::error::TrySendError::Closed(_) => SessionError::ChannelClosed,
            })?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Store a new identity and make it matchable immediately.
    pub async fn enroll(
        &self,
        display_name: &str,
        values: Vec<f32>,
    ) -> Result<IdentityRecord, SessionError> {
        let embedding = Embedding::new(values);
        if let Some(expected) = self.cache.dimension() {
            if embedding.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                }
                .into());
            }
        }
        let normalized = embedding.normalize()?;
        let record = self.store.enroll(display_name, &normalized).await?;
        self.cache.insert(record.id, normalized)?;
        Ok(record)
    }

    /// Reload the identity cache from the store. Returns the number of entries.
    pub async fn refresh(&self) -> Result<usize, SessionError> {
        Ok(self.cache.invalidate(&self.store).await?)
    }

    /// Deactivate an identity. Its measurement history is kept.
    pub async fn remove(&self, id: IdentityId) -> Result<bool, SessionError> {
        let removed = self.store.deactivate_identity(id).await?;
        self.cache.remove(id);
        Ok(removed)
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }
}

/// Spawn the stability pipeline and the session actor on the current runtime.
pub fn spawn_session(
    config: SessionConfig,
    store: Store,
    cache: Arc<IdentityCache>,
    scale_rx: mpsc::Receiver<ScaleEvent>,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(8);
    let (pipeline_tx, pipeline_rx) = mpsc::channel(64);
    let (internal_tx, internal_rx) = mpsc::channel(16);
    let (notify, _) = broadcast::channel(64);

    tokio::spawn(run_stability(config.stability, scale_rx, pipeline_tx));

    let actor = SessionActor {
        ctl: SessionController::new(),
        store: store.clone(),
        cache: Arc::clone(&cache),
        threshold: config.similarity_threshold,
        notify: notify.clone(),
        internal_tx,
        stability: StabilityState::Unseated,
        last_reading: None,
    };
    tokio::spawn(actor.run(rx, pipeline_rx, internal_rx));

    tracing::info!(
        threshold = config.similarity_threshold,
        epsilon = config.stability.epsilon,
        settle_ms = config.stability.settle_duration.as_millis() as u64,
        "session started"
    );

    SessionHandle {
        tx,
        store,
        cache,
        notify,
    }
}

async fn run_stability(
    config: StabilityConfig,
    mut scale_rx: mpsc::Receiver<ScaleEvent>,
    tx: mpsc::Sender<PipelineEvent>,
) {
    let mut tracker = StabilityTracker::new(config);
    let mut next_token = 0u64;

    while let Some(event) = scale_rx.recv().await {
        let out = match event {
            ScaleEvent::Connected => {
                next_token += 1;
                let token = SessionToken(next_token);
                tracker.begin_session(token);
                PipelineEvent::Connected(token)
            }
            ScaleEvent::Disconnected => {
                let Some(token) = tracker.session() else {
                    tracing::debug!("disconnect without a session");
                    continue;
                };
                tracker.end_session();
                PipelineEvent::Disconnected(token)
            }
            ScaleEvent::Error(fault) => PipelineEvent::Fault(fault),
            ScaleEvent::Sample(sample) => match tracker.feed(sample) {
                SampleOutcome::Absent { was_seated } => PipelineEvent::Absent {
                    was_seated,
                    kg: sample.value,
                    state: tracker.state(),
                },
                SampleOutcome::Settled(settled) => PipelineEvent::Settled(settled),
                SampleOutcome::Moving | SampleOutcome::Holding => PipelineEvent::Reading {
                    kg: sample.value,
                    state: tracker.state(),
                },
            },
        };
        if tx.send(out).await.is_err() {
            break;
        }
    }
    tracing::debug!("stability pipeline stopped");
}

struct SessionActor {
    ctl: SessionController,
    store: Store,
    cache: Arc<IdentityCache>,
    threshold: f32,
    notify: broadcast::Sender<Notification>,
    internal_tx: mpsc::Sender<Internal>,
    stability: StabilityState,
    last_reading: Option<f32>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<SessionRequest>,
        mut pipeline: mpsc::Receiver<PipelineEvent>,
        mut internal: mpsc::Receiver<Internal>,
    ) {
        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => self.on_request(req),
                    None => break,
                },
                Some(event) = pipeline.recv() => self.on_pipeline(event),
                Some(msg) = internal.recv() => self.on_internal(msg),
            }
        }
        tracing::info!("session actor stopped");
    }

    fn publish(&self, notification: Notification) {
        tracing::debug!(?notification, "notify");
        // No subscribers is fine.
        let _ = self.notify.send(notification);
    }

    fn on_request(&mut self, req: SessionRequest) {
        match req {
            SessionRequest::Identify { probe, reply } => {
                let ticket = match self.ctl.try_begin_identify() {
                    Ok(ticket) => ticket,
                    Err(_) => {
                        tracing::debug!("identification rejected: busy");
                        let _ = reply.send(Err(SessionError::Busy));
                        return;
                    }
                };
                self.publish(Notification::Recognizing);

                let cache = Arc::clone(&self.cache);
                let store = self.store.clone();
                let threshold = self.threshold;
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let outcome = resolve_identity(probe, cache, &store, threshold).await;
                    let _ = internal
                        .send(Internal::IdentifyResolved {
                            ticket,
                            outcome,
                            reply,
                        })
                        .await;
                });
            }
            SessionRequest::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    scale_connected: self.ctl.session().is_some(),
                    identity: self.ctl.current_identity().map(|b| b.display_name.clone()),
                    identifying: self.ctl.is_identifying(),
                    stability: self.stability,
                    last_reading: self.last_reading,
                    enrolled: self.cache.len(),
                });
            }
        }
    }

    fn on_pipeline(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Connected(token) => {
                self.stability = StabilityState::Unseated;
                let n = self.ctl.scale_connected(token);
                self.publish(n);
            }
            PipelineEvent::Disconnected(token) => {
                self.stability = StabilityState::Unseated;
                self.last_reading = None;
                if let Some(n) = self.ctl.scale_disconnected(token) {
                    self.publish(n);
                }
            }
            PipelineEvent::Fault(fault) => {
                tracing::warn!(?fault, "scale fault");
                self.publish(Notification::ScaleFault {
                    reason: fault.to_string(),
                });
            }
            PipelineEvent::Absent {
                was_seated,
                kg,
                state,
            } => {
                self.stability = state;
                self.last_reading = kg.is_finite().then_some(kg);
                self.ctl.absence(was_seated);
            }
            PipelineEvent::Reading { kg, state } => {
                self.stability = state;
                self.last_reading = Some(kg);
            }
            PipelineEvent::Settled(event) => {
                self.stability = StabilityState::Settled;
                self.last_reading = Some(event.weight);
                self.on_settled(event);
            }
        }
    }

    fn on_settled(&mut self, event: SettledEvent) {
        let measurement = match self.ctl.on_settled(event, chrono::Utc::now()) {
            SettleDecision::Commit(m) => m,
            SettleDecision::Discarded(reason) => {
                tracing::debug!(?reason, weight = event.weight, "settle event discarded");
                return;
            }
        };
        let name = self
            .ctl
            .current_identity()
            .map(|b| b.display_name.clone())
            .unwrap_or_default();

        let store = self.store.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = store.insert_measurement(measurement.clone()).await;
            let _ = internal
                .send(Internal::Stored {
                    measurement,
                    name,
                    result,
                })
                .await;
        });
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::IdentifyResolved {
                ticket,
                outcome,
                reply,
            } => match self.ctl.complete_identify(ticket, outcome) {
                Some(n) => {
                    self.publish(n.clone());
                    let _ = reply.send(Ok(n));
                }
                None => {
                    let _ = reply.send(Err(SessionError::Busy));
                }
            },
            Internal::Stored {
                measurement,
                name,
                result,
            } => {
                let n = self.ctl.measurement_stored(&measurement, &name, result);
                self.publish(n);
            }
        }
    }
}

/// Match a probe and fetch the full record of the winner.
async fn resolve_identity(
    probe: Probe,
    cache: Arc<IdentityCache>,
    store: &Store,
    threshold: f32,
) -> IdentifyOutcome {
    let embedding = match probe {
        Ok(embedding) => embedding,
        Err(ExtractError::NoFace) => return IdentifyOutcome::NoFace,
        Err(ExtractError::MultipleFaces) => return IdentifyOutcome::MultipleFaces,
        Err(ExtractError::Failed(reason)) => return IdentifyOutcome::Failed(reason),
    };
    if let Some(expected) = cache.dimension() {
        if embedding.len() != expected {
            let err = EmbeddingError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            };
            return IdentifyOutcome::Failed(err.to_string());
        }
    }
    let probe = match embedding.normalize() {
        Ok(p) => p,
        Err(e) => return IdentifyOutcome::Failed(e.to_string()),
    };

    let matcher = CosineMatcher::new(cache);
    let result =
        match tokio::task::spawn_blocking(move || matcher.identify(&probe, threshold)).await {
            Ok(result) => result,
            Err(e) => return IdentifyOutcome::Failed(format!("matcher task failed: {e}")),
        };

    match result {
        MatchResult::Empty => IdentifyOutcome::Empty,
        MatchResult::Unknown => IdentifyOutcome::Unknown,
        MatchResult::Identified {
            identity_id,
            similarity,
        } => {
            let display_name = match store.find_identity_by_id(identity_id).await {
                Ok(Some(record)) => record.display_name,
                Ok(None) => {
                    tracing::warn!(id = %identity_id, "matched identity no longer in store");
                    return IdentifyOutcome::Unknown;
                }
                Err(e) => {
                    tracing::warn!(id = %identity_id, error = %e, "identity lookup failed; using id");
                    format!("#{identity_id}")
                }
            };
            IdentifyOutcome::Identified {
                identity_id,
                display_name,
                similarity,
            }
        }
    }
}
