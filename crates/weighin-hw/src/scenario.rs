//! Scripted scale sessions loaded from TOML.
//!
//! ```toml
//! [[step]]
//! at_ms = 0
//! event = "connect"
//!
//! [[step]]
//! at_ms = 250
//! kg = 74.8
//! ```

use crate::scale::{ScaleEvent, ScaleFault};
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use weighin_core::WeightSample;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("failed to read scenario {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("bad scenario TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("step {index}: exactly one of `kg` or `event` is required")]
    AmbiguousStep { index: usize },
    #[error("step {index}: at_ms goes backwards ({at_ms} < {previous})")]
    OutOfOrder { index: usize, at_ms: u64, previous: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepEvent {
    Connect,
    Disconnect,
    Overload,
    Timeout,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    /// Offset from the start of the replay.
    pub at_ms: u64,
    pub kg: Option<f32>,
    pub event: Option<StepEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(rename = "step", default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_toml_str(src: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = toml::from_str(src)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let src = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    fn validate(&self) -> Result<(), ScenarioError> {
        let mut previous = 0u64;
        for (index, step) in self.steps.iter().enumerate() {
            if step.kg.is_some() == step.event.is_some() {
                return Err(ScenarioError::AmbiguousStep { index });
            }
            if step.at_ms < previous {
                return Err(ScenarioError::OutOfOrder {
                    index,
                    at_ms: step.at_ms,
                    previous,
                });
            }
            previous = step.at_ms;
        }
        Ok(())
    }

    /// Total scripted duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.steps.last().map_or(0, |s| s.at_ms))
    }

    /// Expand into timestamped events, with samples stamped relative to `t0`.
    pub fn events(&self, t0: Instant) -> Vec<(Duration, ScaleEvent)> {
        self.steps
            .iter()
            .map(|step| {
                let offset = Duration::from_millis(step.at_ms);
                let event = match (step.kg, step.event) {
                    (Some(kg), _) => ScaleEvent::Sample(WeightSample::new(kg, t0 + offset)),
                    (None, Some(StepEvent::Connect)) => ScaleEvent::Connected,
                    (None, Some(StepEvent::Disconnect)) => ScaleEvent::Disconnected,
                    (None, Some(StepEvent::Overload)) => ScaleEvent::Error(ScaleFault::Overload),
                    (None, Some(StepEvent::Timeout)) | (None, None) => {
                        ScaleEvent::Error(ScaleFault::Timeout)
                    }
                };
                (offset, event)
            })
            .collect()
    }

    /// Play the scenario in real time into `tx`. Stops early if the
    /// receiver goes away.
    pub async fn play(&self, tx: mpsc::Sender<ScaleEvent>) {
        let start = tokio::time::Instant::now();
        let t0 = Instant::now();
        for (offset, event) in self.events(t0) {
            tokio::time::sleep_until(start + offset).await;
            let event = match event {
                ScaleEvent::Sample(s) => ScaleEvent::Sample(WeightSample::new(s.value, Instant::now())),
                other => other,
            };
            if tx.send(event).await.is_err() {
                tracing::debug!("scenario receiver dropped");
                return;
            }
        }
        tracing::info!(steps = self.steps.len(), "scenario finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTLE: &str = r#"
        [[step]]
        at_ms = 0
        event = "connect"

        [[step]]
        at_ms = 100
        kg = 75.0

        [[step]]
        at_ms = 600
        kg = 75.1

        [[step]]
        at_ms = 3700
        kg = 75.15

        [[step]]
        at_ms = 5000
        event = "disconnect"
    "#;

    #[test]
    fn test_parse_and_expand() {
        let scenario = Scenario::from_toml_str(SETTLE).unwrap();
        assert_eq!(scenario.steps.len(), 5);
        assert_eq!(scenario.duration(), Duration::from_millis(5000));

        let t0 = Instant::now();
        let events = scenario.events(t0);
        assert_eq!(events[0].1, ScaleEvent::Connected);
        match events[2].1 {
            ScaleEvent::Sample(s) => {
                assert_eq!(s.value, 75.1);
                assert_eq!(s.observed_at, t0 + Duration::from_millis(600));
            }
            ref other => panic!("expected sample, got {other:?}"),
        }
        assert_eq!(events[4].1, ScaleEvent::Disconnected);
    }

    #[test]
    fn test_rejects_ambiguous_step() {
        let err = Scenario::from_toml_str("[[step]]\nat_ms = 0\nkg = 70.0\nevent = \"connect\"\n")
            .unwrap_err();
        assert!(matches!(err, ScenarioError::AmbiguousStep { index: 0 }));

        let err = Scenario::from_toml_str("[[step]]\nat_ms = 0\n").unwrap_err();
        assert!(matches!(err, ScenarioError::AmbiguousStep { index: 0 }));
    }

    #[test]
    fn test_rejects_out_of_order() {
        let src = "[[step]]\nat_ms = 500\nkg = 70.0\n[[step]]\nat_ms = 100\nkg = 70.0\n";
        assert!(matches!(
            Scenario::from_toml_str(src),
            Err(ScenarioError::OutOfOrder { index: 1, at_ms: 100, previous: 500 })
        ));
    }

    #[test]
    fn test_fault_events() {
        let src = "[[step]]\nat_ms = 0\nevent = \"overload\"\n";
        let scenario = Scenario::from_toml_str(src).unwrap();
        assert_eq!(
            scenario.events(Instant::now())[0].1,
            ScaleEvent::Error(ScaleFault::Overload)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_delivers_in_order() {
        let scenario = Scenario::from_toml_str(SETTLE).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(async move { scenario.play(tx).await });

        let mut kinds = Vec::new();
        while let Some(ev) = rx.recv().await {
            kinds.push(match ev {
                ScaleEvent::Connected => "connect",
                ScaleEvent::Disconnected => "disconnect",
                ScaleEvent::Sample(_) => "sample",
                ScaleEvent::Error(_) => "error",
            });
        }
        assert_eq!(kinds, ["connect", "sample", "sample", "sample", "disconnect"]);
    }
}
