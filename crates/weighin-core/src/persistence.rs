//! Contracts the core consumes from the storage layer.
//!
//! Methods return `Send` futures so implementations can be driven from
//! spawned tokio tasks.

use crate::types::{IdentityId, IdentityRecord, Measurement, MeasurementId};
use std::future::Future;

/// Source of enrolled identities for [`IdentityCache::load`](crate::IdentityCache::load).
pub trait IdentitySource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// All active identities. Records without an embedding may be included;
    /// the cache filters them out.
    fn load_active_identities(
        &self,
    ) -> impl Future<Output = Result<Vec<IdentityRecord>, Self::Error>> + Send;
}

pub trait IdentityLookup {
    type Error: std::error::Error + Send + Sync + 'static;

    fn find_identity_by_id(
        &self,
        id: IdentityId,
    ) -> impl Future<Output = Result<Option<IdentityRecord>, Self::Error>> + Send;
}

pub trait MeasurementSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn insert_measurement(
        &self,
        measurement: Measurement,
    ) -> impl Future<Output = Result<MeasurementId, Self::Error>> + Send;
}
