//! Offline replay: run a scenario through the tracker and controller
//! without a daemon or database.

use chrono::{DateTime, Utc};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use weighin_core::{
    CosineMatcher, DiscardReason, Embedding, EmbeddingError, IdentifyOutcome, IdentityCache,
    IdentityId, MatchResult, Matcher, Measurement, MeasurementId, Notification, SampleOutcome,
    SessionController, SessionToken, SettleDecision, StabilityConfig, StabilityTracker,
};
use weighin_hw::{Scenario, ScaleEvent};

pub const REPLAY_NAME: &str = "replay";

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub notifications: Vec<Notification>,
    pub measurements: Vec<Measurement>,
    pub discarded: Vec<(f32, DiscardReason)>,
}

/// Replay `scenario`. With a probe, a single identity enrolled from that
/// probe is identified before the first step.
pub fn replay(
    scenario: &Scenario,
    probe: Option<Embedding>,
    stability: StabilityConfig,
    threshold: f32,
    started_at: DateTime<Utc>,
) -> Result<ReplayReport, EmbeddingError> {
    let mut report = ReplayReport::default();
    let mut ctl = SessionController::new();

    if let Some(probe) = probe {
        let probe = probe.normalize()?;
        let cache = Arc::new(IdentityCache::new());
        cache.insert(IdentityId(1), probe.clone())?;
        let outcome = match CosineMatcher::new(cache).identify(&probe, threshold) {
            MatchResult::Identified {
                identity_id,
                similarity,
            } => IdentifyOutcome::Identified {
                identity_id,
                display_name: REPLAY_NAME.to_string(),
                similarity,
            },
            MatchResult::Unknown => IdentifyOutcome::Unknown,
            MatchResult::Empty => IdentifyOutcome::Empty,
        };
        if let Ok(ticket) = ctl.try_begin_identify() {
            report.notifications.push(Notification::Recognizing);
            report.notifications.extend(ctl.complete_identify(ticket, outcome));
        }
    }

    let mut tracker = StabilityTracker::new(stability);
    let mut next_token = 0u64;
    let t0 = Instant::now();

    for (offset, event) in scenario.events(t0) {
        match event {
            ScaleEvent::Connected => {
                next_token += 1;
                let token = SessionToken(next_token);
                tracker.begin_session(token);
                report.notifications.push(ctl.scale_connected(token));
            }
            ScaleEvent::Disconnected => {
                if let Some(token) = tracker.session() {
                    tracker.end_session();
                    report.notifications.extend(ctl.scale_disconnected(token));
                }
            }
            ScaleEvent::Error(fault) => report.notifications.push(Notification::ScaleFault {
                reason: fault.to_string(),
            }),
            ScaleEvent::Sample(sample) => match tracker.feed(sample) {
                SampleOutcome::Absent { was_seated } => {
                    ctl.absence(was_seated);
                }
                SampleOutcome::Settled(settled) => {
                    let now = started_at + chrono::Duration::milliseconds(offset.as_millis() as i64);
                    match ctl.on_settled(settled, now) {
                        SettleDecision::Commit(m) => {
                            let row = MeasurementId(report.measurements.len() as i64 + 1);
                            report.notifications.push(ctl.measurement_stored(
                                &m,
                                REPLAY_NAME,
                                Ok::<_, Infallible>(row),
                            ));
                            report.measurements.push(m);
                        }
                        SettleDecision::Discarded(reason) => {
                            report.discarded.push((settled.weight, reason));
                        }
                    }
                }
                SampleOutcome::Moving | SampleOutcome::Holding => {}
            },
        }
    }

    Ok(report)
}
