use crate::session::{SessionError, SessionHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use weighin_core::extractor::probe_from_face_count;
use weighin_core::{IdentityId, IdentityRecord};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.weighin.Scales1";
pub const OBJECT_PATH: &str = "/org/weighin/Scales1";

/// D-Bus interface for the weighin daemon.
///
/// Bus name: org.weighin.Scales1
/// Object path: /org/weighin/Scales1
pub struct ScalesService {
    session: SessionHandle,
}

impl ScalesService {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }
}

#[derive(Serialize)]
struct IdentityView<'a> {
    id: IdentityId,
    display_name: &'a str,
    enrolled_at: DateTime<Utc>,
    has_embedding: bool,
}

impl<'a> From<&'a IdentityRecord> for IdentityView<'a> {
    fn from(r: &'a IdentityRecord) -> Self {
        Self {
            id: r.id,
            display_name: &r.display_name,
            enrolled_at: r.enrolled_at,
            has_embedding: r.embedding.is_some(),
        }
    }
}

fn to_fdo(e: SessionError) -> zbus::fdo::Error {
    match e {
        SessionError::Busy => zbus::fdo::Error::LimitsExceeded(e.to_string()),
        SessionError::Embedding(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        SessionError::Store(crate::store::StoreError::DuplicateName(_)) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_f32(values: Vec<f64>) -> Vec<f32> {
    values.into_iter().map(|v| v as f32).collect()
}

#[interface(name = "org.weighin.Scales1")]
impl ScalesService {
    /// Identify the person in front of the camera from a face embedding.
    ///
    /// `faces` is the detector's face count for the frame; anything other
    /// than 1 skips matching. Returns the resulting notification as JSON.
    async fn identify(&self, embedding: Vec<f64>, faces: u32) -> zbus::fdo::Result<String> {
        tracing::info!(faces, dim = embedding.len(), "identify requested");
        let probe = probe_from_face_count(faces, to_f32(embedding));
        let notification = self.session.identify(probe).await.map_err(to_fdo)?;
        Ok(notification.to_json())
    }

    /// Enroll a new identity. Returns the stored record as JSON.
    async fn enroll(&self, name: &str, embedding: Vec<f64>) -> zbus::fdo::Result<String> {
        tracing::info!(name, dim = embedding.len(), "enroll requested");
        let record = self
            .session
            .enroll(name, to_f32(embedding))
            .await
            .map_err(to_fdo)?;
        to_json(&IdentityView::from(&record))
    }

    /// Reload the identity cache from the database.
    async fn refresh(&self) -> zbus::fdo::Result<u32> {
        let loaded = self.session.refresh().await.map_err(to_fdo)?;
        Ok(loaded as u32)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.session.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": status,
        })
        .to_string())
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let records = self
            .session
            .store()
            .list_identities()
            .await
            .map_err(|e| to_fdo(e.into()))?;
        let views: Vec<IdentityView<'_>> = records.iter().map(IdentityView::from).collect();
        to_json(&views)
    }

    /// Measurements of the last `days` days plus change statistics.
    async fn history(&self, identity_id: i64, days: u32) -> zbus::fdo::Result<String> {
        let id = IdentityId(identity_id);
        let store = self.session.store();
        let now = Utc::now();
        let from = now - chrono::Duration::days(i64::from(days));
        let measurements = store
            .measurements_between(id, from, now)
            .await
            .map_err(|e| to_fdo(e.into()))?;
        let stats = store
            .weight_change_stats(id, now)
            .await
            .map_err(|e| to_fdo(e.into()))?;
        let summary = store
            .weight_summary(id)
            .await
            .map_err(|e| to_fdo(e.into()))?;
        let latest = store
            .latest_measurement(id)
            .await
            .map_err(|e| to_fdo(e.into()))?;
        let today = store
            .measurement_on_day(id, now)
            .await
            .map_err(|e| to_fdo(e.into()))?;
        Ok(serde_json::json!({
            "identity_id": id,
            "latest": latest,
            "today": today,
            "measurements": measurements,
            "change": stats,
            "summary": summary,
        })
        .to_string())
    }

    /// Deactivate an identity. History is kept.
    async fn remove(&self, identity_id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(identity_id, "remove requested");
        self.session
            .remove(IdentityId(identity_id))
            .await
            .map_err(to_fdo)
    }

    /// Emitted for every session notification; payload is JSON.
    #[zbus(signal)]
    pub async fn status_changed(emitter: &SignalEmitter<'_>, payload: &str)
        -> zbus::Result<()>;
}
