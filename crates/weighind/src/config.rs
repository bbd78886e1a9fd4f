use std::path::PathBuf;
use std::time::Duration;
use weighin_core::StabilityConfig;

/// Where scale events come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleSource {
    /// Built-in random-walk scale.
    Simulated,
    /// Replay a TOML scenario file once.
    Scenario(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Embedding length produced by the feature extractor.
    pub embedding_dim: usize,
    pub stability: StabilityConfig,
    /// Measurements older than this many days are purged at startup.
    pub retention_days: u32,
    pub scale: ScaleSource,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `WEIGHIN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("weighin");

        let db_path = lookup("WEIGHIN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("weighin.db"));

        let defaults = StabilityConfig::default();
        let stability = StabilityConfig {
            epsilon: parsed(&lookup, "WEIGHIN_EPSILON_KG", defaults.epsilon),
            settle_duration: Duration::from_millis(parsed(
                &lookup,
                "WEIGHIN_SETTLE_MS",
                defaults.settle_duration.as_millis() as u64,
            )),
            min_plausible_weight: parsed(
                &lookup,
                "WEIGHIN_MIN_WEIGHT_KG",
                defaults.min_plausible_weight,
            ),
        };

        let scale = match lookup("WEIGHIN_SCENARIO") {
            Some(path) if !path.is_empty() => ScaleSource::Scenario(PathBuf::from(path)),
            _ => ScaleSource::Simulated,
        };

        let bus = match lookup("WEIGHIN_BUS").as_deref() {
            Some("session") => BusKind::Session,
            _ => BusKind::System,
        };

        Self {
            db_path,
            similarity_threshold: parsed(&lookup, "WEIGHIN_SIMILARITY_THRESHOLD", 0.60),
            embedding_dim: parsed(&lookup, "WEIGHIN_EMBEDDING_DIM", 128),
            stability,
            retention_days: parsed(&lookup, "WEIGHIN_RETENTION_DAYS", 183),
            scale,
            bus,
        }
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable setting; using default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/olga")]);
        assert_eq!(cfg.db_path, PathBuf::from("/home/olga/.local/share/weighin/weighin.db"));
        assert_eq!(cfg.similarity_threshold, 0.60);
        assert_eq!(cfg.embedding_dim, 128);
        assert_eq!(cfg.stability, StabilityConfig::default());
        assert_eq!(cfg.retention_days, 183);
        assert_eq!(cfg.scale, ScaleSource::Simulated);
        assert_eq!(cfg.bus, BusKind::System);
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("XDG_DATA_HOME", "/var/lib"),
            ("WEIGHIN_SIMILARITY_THRESHOLD", "0.75"),
            ("WEIGHIN_SETTLE_MS", "1500"),
            ("WEIGHIN_EPSILON_KG", "0.1"),
            ("WEIGHIN_SCENARIO", "/etc/weighin/demo.toml"),
            ("WEIGHIN_BUS", "session"),
        ]);
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/weighin/weighin.db"));
        assert_eq!(cfg.similarity_threshold, 0.75);
        assert_eq!(cfg.stability.settle_duration, Duration::from_millis(1500));
        assert_eq!(cfg.stability.epsilon, 0.1);
        assert_eq!(cfg.scale, ScaleSource::Scenario("/etc/weighin/demo.toml".into()));
        assert_eq!(cfg.bus, BusKind::Session);
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let cfg = config(&[("WEIGHIN_EMBEDDING_DIM", "lots")]);
        assert_eq!(cfg.embedding_dim, 128);
    }
}
