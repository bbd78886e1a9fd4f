//! Scale event stream and a simulated scale for bench use.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use weighin_core::WeightSample;

/// Everything a scale can tell the daemon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleEvent {
    Connected,
    Disconnected,
    Sample(WeightSample),
    Error(ScaleFault),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleFault {
    #[error("sensor overload")]
    Overload,
    #[error("sensor read timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ScaleError {
    #[error("scale event receiver dropped")]
    ChannelClosed,
    #[error("scale is not connected")]
    NotConnected,
}

/// Random-walk parameters for [`SimulatedScale`].
#[derive(Debug, Clone)]
pub struct SimulatedScaleConfig {
    /// Starting reading (kg).
    pub start_weight: f32,
    /// Maximum step per reading in either direction (kg).
    pub jitter: f32,
    pub min_weight: f32,
    pub max_weight: f32,
    /// Delay before the first reading after connect.
    pub first_reading_after: Duration,
    pub period: Duration,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for SimulatedScaleConfig {
    fn default() -> Self {
        Self {
            start_weight: 75.0,
            jitter: 0.3,
            min_weight: 40.0,
            max_weight: 150.0,
            first_reading_after: Duration::from_secs(3),
            period: Duration::from_secs(5),
            seed: None,
        }
    }
}

impl SimulatedScaleConfig {
    /// One random-walk step from `last`.
    fn step(&self, last: f32, rng: &mut impl Rng) -> f32 {
        let variation = (rng.gen::<f32>() - 0.5) * 2.0 * self.jitter;
        (last + variation).clamp(self.min_weight, self.max_weight)
    }
}

/// Scale that produces a jittery random walk on a timer.
pub struct SimulatedScale {
    config: SimulatedScaleConfig,
    tx: mpsc::Sender<ScaleEvent>,
    walker: Option<JoinHandle<()>>,
}

impl SimulatedScale {
    /// Create the scale and the receiving end of its event stream.
    pub fn new(config: SimulatedScaleConfig) -> (Self, mpsc::Receiver<ScaleEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                config,
                tx,
                walker: None,
            },
            rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.walker.is_some()
    }

    /// Announce the connection and start streaming readings.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(&mut self) -> Result<(), ScaleError> {
        if self.walker.is_some() {
            return Ok(());
        }
        self.tx
            .send(ScaleEvent::Connected)
            .await
            .map_err(|_| ScaleError::ChannelClosed)?;

        let config = self.config.clone();
        let tx = self.tx.clone();
        self.walker = Some(tokio::spawn(async move {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let mut weight = config.start_weight;
            tokio::time::sleep(config.first_reading_after).await;
            let mut ticker = tokio::time::interval(config.period);
            loop {
                ticker.tick().await;
                weight = config.step(weight, &mut rng);
                let sample = WeightSample::new(weight, Instant::now());
                if tx.send(ScaleEvent::Sample(sample)).await.is_err() {
                    tracing::debug!("scale receiver gone; stopping simulation");
                    break;
                }
            }
        }));
        tracing::info!(start = self.config.start_weight, "simulated scale connected");
        Ok(())
    }

    /// Stop streaming and announce the disconnect.
    pub async fn disconnect(&mut self) -> Result<(), ScaleError> {
        let Some(walker) = self.walker.take() else {
            return Ok(());
        };
        walker.abort();
        tracing::info!("simulated scale disconnected");
        self.tx
            .send(ScaleEvent::Disconnected)
            .await
            .map_err(|_| ScaleError::ChannelClosed)
    }

    /// Inject one reading, as if someone stepped on with `weight` kg.
    pub async fn simulate_weight(&self, weight: f32) -> Result<(), ScaleError> {
        if self.walker.is_none() {
            return Err(ScaleError::NotConnected);
        }
        self.tx
            .send(ScaleEvent::Sample(WeightSample::new(weight, Instant::now())))
            .await
            .map_err(|_| ScaleError::ChannelClosed)
    }
}

impl Drop for SimulatedScale {
    fn drop(&mut self) {
        if let Some(walker) = self.walker.take() {
            walker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_stays_in_bounds() {
        let config = SimulatedScaleConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut w = config.start_weight;
        for _ in 0..10_000 {
            let next = config.step(w, &mut rng);
            assert!((next - w).abs() <= config.jitter + 1e-4);
            assert!((config.min_weight..=config.max_weight).contains(&next));
            w = next;
        }
    }

    #[test]
    fn test_step_clamps_at_floor() {
        let config = SimulatedScaleConfig {
            start_weight: 40.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert!(config.step(40.0, &mut rng) >= 40.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stream_disconnect() {
        let config = SimulatedScaleConfig {
            seed: Some(3),
            ..Default::default()
        };
        let (mut scale, mut rx) = SimulatedScale::new(config);

        assert!(matches!(
            scale.simulate_weight(70.0).await,
            Err(ScaleError::NotConnected)
        ));

        scale.connect().await.unwrap();
        assert_eq!(rx.recv().await, Some(ScaleEvent::Connected));

        for _ in 0..3 {
            match rx.recv().await {
                Some(ScaleEvent::Sample(s)) => assert!((40.0..=150.0).contains(&s.value)),
                other => panic!("expected sample, got {other:?}"),
            }
        }

        scale.simulate_weight(82.5).await.unwrap();
        scale.disconnect().await.unwrap();
        assert!(!scale.is_connected());

        let mut saw_injected = false;
        loop {
            match rx.recv().await {
                Some(ScaleEvent::Sample(s)) if s.value == 82.5 => saw_injected = true,
                Some(ScaleEvent::Sample(_)) => {}
                Some(ScaleEvent::Disconnected) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_injected);
    }
}
