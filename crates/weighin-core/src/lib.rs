//! weighin-core: who is on the scale, and when is the reading final.
//!
//! Matches face embeddings against an in-memory identity cache and
//! debounces raw scale readings into settled measurements. Everything here
//! is I/O free; storage and sensors plug in through the traits in
//! [`persistence`] and [`extractor`].

pub mod cache;
pub mod extractor;
pub mod matcher;
pub mod persistence;
pub mod session;
pub mod stability;
pub mod types;

pub use cache::{IdentityCache, Snapshot};
pub use extractor::{ExtractError, FeatureExtractor, Probe};
pub use matcher::{CosineMatcher, MatchResult, Matcher};
pub use persistence::{IdentityLookup, IdentitySource, MeasurementSink};
pub use session::{
    BoundIdentity, Busy, DiscardReason, IdentifyOutcome, IdentifyTicket, Notification,
    SessionController, SettleDecision,
};
pub use stability::{
    EpisodeId, SampleOutcome, SessionToken, SettledEvent, StabilityConfig, StabilityState,
    StabilityTracker,
};
pub use types::{
    Embedding, EmbeddingError, IdentityId, IdentityRecord, Measurement, MeasurementId,
    WeightSample,
};
