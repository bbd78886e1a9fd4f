//! Debounce for raw scale readings.
//!
//! A physical scale oscillates for a moment before it rests. The tracker
//! holds a baseline and a dwell clock; once readings have stayed within
//! `epsilon` of the baseline for `settle_duration`, it emits exactly one
//! [`SettledEvent`] for that baseline. A deviation starts a new episode,
//! which may settle and emit again.
//!
//! Readings below the plausibility floor never touch the baseline or the
//! dwell clock. Only an absence lasting `settle_duration` ends the
//! occupancy, so a single dropped reading from the load cell is harmless.
//!
//! ```text
//!             plausible            in band, dwell >= settle
//! Unseated ─────────────▶ Accumulating ─────────────────────▶ Settled
//!    ▲                      ▲     │  ▲                          │
//!    │                      │     └──┘ deviation                │
//!    │                      └───────────────────────────────────┘
//!    │                                  deviation
//!    └──── sustained absence / end_session (from any state)
//! ```

use crate::types::WeightSample;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Tuning knobs for [`StabilityTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Largest deviation from the baseline still treated as the same value (kg).
    pub epsilon: f32,
    /// Dwell time within `epsilon` before a reading counts as settled.
    #[serde(with = "millis")]
    pub settle_duration: Duration,
    /// Readings below this mean nobody is on the scale (kg). They are
    /// reported but ignored for stability.
    pub min_plausible_weight: f32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.2,
            settle_duration: Duration::from_millis(3000),
            min_plausible_weight: 10.0,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Identifies one scale connection. Events from an ended session are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub u64);

/// Identifies one stable-baseline episode within a tracker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpisodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityState {
    Unseated,
    Accumulating,
    Settled,
}

/// Emitted once per stable episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettledEvent {
    /// The reading that completed the dwell (kg).
    pub weight: f32,
    pub observed_at: Instant,
    pub episode: EpisodeId,
    pub session: Option<SessionToken>,
}

/// What a single sample did to the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// Below the plausibility floor. `was_seated` is true only for the
    /// reading that ended an occupancy, i.e. the absence has lasted
    /// `settle_duration`. Otherwise the episode is untouched.
    Absent { was_seated: bool },
    /// New baseline; the dwell clock restarted.
    Moving,
    /// Within the band of the current baseline, no event.
    Holding,
    Settled(SettledEvent),
}

#[derive(Debug, Clone, Copy)]
struct Episode {
    id: EpisodeId,
    baseline: f32,
    baseline_set_at: Instant,
    /// A confirming in-band sample has arrived since the baseline was taken.
    confirmed: bool,
    emitted: bool,
}

/// Per-session state machine over a stream of [`WeightSample`]s.
#[derive(Debug)]
pub struct StabilityTracker {
    config: StabilityConfig,
    state: StabilityState,
    episode: Option<Episode>,
    session: Option<SessionToken>,
    next_episode: u64,
    /// First below-floor reading of the current run of absences.
    absent_since: Option<Instant>,
}

impl StabilityTracker {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            state: StabilityState::Unseated,
            episode: None,
            session: None,
            next_episode: 0,
            absent_since: None,
        }
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    pub fn state(&self) -> StabilityState {
        self.state
    }

    pub fn session(&self) -> Option<SessionToken> {
        self.session
    }

    /// Current baseline, if someone is on the scale.
    pub fn baseline(&self) -> Option<f32> {
        self.episode.map(|e| e.baseline)
    }

    /// Start tagging events with `token`. Any in-progress episode is dropped.
    pub fn begin_session(&mut self, token: SessionToken) {
        self.reset();
        self.session = Some(token);
    }

    /// Tear down on disconnect: pending state is discarded and nothing
    /// further is emitted for the old session.
    pub fn end_session(&mut self) {
        self.reset();
        self.session = None;
    }

    pub fn feed(&mut self, sample: WeightSample) -> SampleOutcome {
        let WeightSample { value, observed_at: t } = sample;

        if !value.is_finite() || value < self.config.min_plausible_weight {
            return self.absent(value, t);
        }
        self.absent_since = None;

        let Some(episode) = self.episode.as_mut() else {
            self.start_episode(value, t);
            return SampleOutcome::Moving;
        };

        if (value - episode.baseline).abs() >= self.config.epsilon {
            tracing::trace!(value, baseline = episode.baseline, "baseline moved");
            self.start_episode(value, t);
            return SampleOutcome::Moving;
        }

        if !episode.confirmed {
            episode.confirmed = true;
            episode.baseline_set_at = t;
        }

        let dwell = t.saturating_duration_since(episode.baseline_set_at);
        if episode.emitted || dwell < self.config.settle_duration {
            return SampleOutcome::Holding;
        }

        episode.emitted = true;
        self.state = StabilityState::Settled;
        let event = SettledEvent {
            weight: value,
            observed_at: t,
            episode: episode.id,
            session: self.session,
        };
        tracing::debug!(
            weight = value,
            baseline = episode.baseline,
            episode = episode.id.0,
            dwell_ms = dwell.as_millis() as u64,
            "weight settled"
        );
        SampleOutcome::Settled(event)
    }

    fn absent(&mut self, value: f32, t: Instant) -> SampleOutcome {
        if self.episode.is_none() {
            return SampleOutcome::Absent { was_seated: false };
        }
        let since = *self.absent_since.get_or_insert(t);
        if t.saturating_duration_since(since) < self.config.settle_duration {
            tracing::trace!(value, "below-floor reading ignored");
            return SampleOutcome::Absent { was_seated: false };
        }
        tracing::debug!(value, "scale vacated");
        self.reset();
        SampleOutcome::Absent { was_seated: true }
    }

    fn start_episode(&mut self, value: f32, t: Instant) {
        let id = EpisodeId(self.next_episode);
        self.next_episode += 1;
        self.episode = Some(Episode {
            id,
            baseline: value,
            baseline_set_at: t,
            confirmed: false,
            emitted: false,
        });
        self.state = StabilityState::Accumulating;
    }

    fn reset(&mut self) {
        self.episode = None;
        self.absent_since = None;
        self.state = StabilityState::Unseated;
    }
}
