//! Endpoint heartbeat log, global compute-hours counter and static endpoint
//! metadata.
//!
//! Each endpoint keeps a capped list of JSON heartbeat entries, most recent
//! first. An entry carries a Unix `timestamp` (fractional seconds) plus the
//! metrics reported by the backend. If a heartbeat reports
//! [`COMPUTE_HOURS_METRIC`], the figure is also added to a process-wide
//! aggregate.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::keys::Keyspace;
use crate::store::{decode_utf8, SharedStore};

/// Default log capacity: two heartbeats a minute for two days.
pub const DEFAULT_CAPACITY: usize = 2880;

/// Metric carrying incremental compute hours.
pub const COMPUTE_HOURS_METRIC: &str = "total_core_hrs";

/// One heartbeat snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Submission time, Unix seconds.
    pub timestamp: f64,
    /// Backend-reported metrics.
    #[serde(flatten)]
    pub metrics: Map<String, Value>,
}

impl StatusEntry {
    /// Submission time as a `DateTime`.
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        let micros = (self.timestamp * 1_000_000.0).round() as i64;
        DateTime::from_timestamp_micros(micros)
    }

    /// The compute-hours figure, if reported.
    pub fn compute_hours(&self) -> Option<f64> {
        self.metrics.get(COMPUTE_HOURS_METRIC).and_then(Value::as_f64)
    }
}

fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Static facts about an endpoint, written once at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMetadata {
    /// Public address the endpoint connected from.
    #[serde(default, alias = "ip")]
    pub ip_address: Option<String>,
    /// Reverse-resolved hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// City.
    #[serde(default)]
    pub city: Option<String>,
    /// Region or state.
    #[serde(default)]
    pub region: Option<String>,
    /// Country code.
    #[serde(default)]
    pub country: Option<String>,
    /// `"lat,lon"`.
    #[serde(default)]
    pub loc: Option<String>,
    /// Network operator.
    #[serde(default)]
    pub org: Option<String>,
}

impl EndpointMetadata {
    fn to_fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("ip_address", &self.ip_address),
            ("hostname", &self.hostname),
            ("city", &self.city),
            ("region", &self.region),
            ("country", &self.country),
            ("loc", &self.loc),
            ("org", &self.org),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.as_deref().map(|v| (field, v)))
        .collect()
    }

    fn from_fields(mut fields: HashMap<String, String>) -> Self {
        Self {
            ip_address: fields.remove("ip_address"),
            hostname: fields.remove("hostname"),
            city: fields.remove("city"),
            region: fields.remove("region"),
            country: fields.remove("country"),
            loc: fields.remove("loc"),
            org: fields.remove("org"),
        }
    }

    /// Returns `true` if no field is set.
    pub fn is_empty(&self) -> bool {
        self.to_fields().is_empty()
    }
}

/// Reads and writes endpoint heartbeat logs.
#[derive(Clone)]
pub struct EndpointStatusLog {
    store: SharedStore,
    keys: Keyspace,
    capacity: usize,
}

impl std::fmt::Debug for EndpointStatusLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointStatusLog")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl EndpointStatusLog {
    /// Creates a log with [`DEFAULT_CAPACITY`].
    pub fn new(store: SharedStore, keys: Keyspace) -> Self {
        Self::with_capacity(store, keys, DEFAULT_CAPACITY)
    }

    /// Creates a log keeping at most `capacity` entries per endpoint.
    pub fn with_capacity(store: SharedStore, keys: Keyspace, capacity: usize) -> Self {
        Self {
            store,
            keys,
            capacity: capacity.max(1),
        }
    }

    /// Maximum entries kept per endpoint.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a heartbeat stamped with the current time.
    pub async fn record_heartbeat(
        &self,
        endpoint_id: &str,
        metrics: Map<String, Value>,
    ) -> Result<StatusEntry> {
        self.record_heartbeat_at(endpoint_id, metrics, Utc::now())
            .await
    }

    /// Appends a heartbeat stamped `at`, trims the log to capacity and adds
    /// any compute-hours figure to the global counter.
    pub async fn record_heartbeat_at(
        &self,
        endpoint_id: &str,
        mut metrics: Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<StatusEntry> {
        metrics.remove("timestamp");
        let entry = StatusEntry {
            timestamp: unix_seconds(at),
            metrics,
        };
        let key = self.keys.endpoint_status(endpoint_id);
        let encoded = serde_json::to_vec(&entry)?;
        self.store.lpush(&key, &encoded).await?;
        self.store
            .ltrim(&key, 0, self.capacity as isize - 1)
            .await?;

        if let Some(hours) = entry.compute_hours() {
            let total = self
                .store
                .incr_by_float(&self.keys.compute_hours(), hours)
                .await?;
            debug!(endpoint_id, hours, total, "compute hours accumulated");
        }
        Ok(entry)
    }

    /// Up to `count` most recent entries, newest first.
    pub async fn read_recent(&self, endpoint_id: &str, count: usize) -> Result<Vec<StatusEntry>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = self.keys.endpoint_status(endpoint_id);
        let stop = isize::try_from(count).unwrap_or(isize::MAX) - 1;
        self.store
            .lrange(&key, 0, stop)
            .await?
            .into_iter()
            .map(|raw| serde_json::from_slice(&raw).map_err(Into::into))
            .collect()
    }

    /// Whether the endpoint heartbeated within `threshold` of now.
    pub async fn liveness(&self, endpoint_id: &str, threshold: Duration) -> Result<bool> {
        self.liveness_at(endpoint_id, threshold, Utc::now()).await
    }

    /// Whether the newest entry is younger than `threshold` at time `now`.
    /// An endpoint with no entries is offline.
    pub async fn liveness_at(
        &self,
        endpoint_id: &str,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let latest = self.read_recent(endpoint_id, 1).await?;
        Ok(latest
            .first()
            .is_some_and(|entry| unix_seconds(now) - entry.timestamp < threshold.as_secs_f64()))
    }

    /// The global compute-hours aggregate.
    pub async fn global_compute_hours(&self) -> Result<f64> {
        let key = self.keys.compute_hours();
        match self.store.get(&key).await? {
            Some(raw) => decode_utf8(&key, "", raw)?.parse().map_err(|e| {
                crate::Error::MalformedField {
                    key,
                    field: String::new(),
                    message: format!("{e}"),
                }
            }),
            None => Ok(0.0),
        }
    }

    /// Writes endpoint metadata. Fields already recorded are kept. Returns
    /// `true` if anything new was written.
    pub async fn set_metadata(&self, endpoint_id: &str, metadata: &EndpointMetadata) -> Result<bool> {
        let key = self.keys.endpoint_metadata(endpoint_id);
        let mut wrote = false;
        for (field, value) in metadata.to_fields() {
            wrote |= self.store.hset_nx(&key, field, value.as_bytes()).await?;
        }
        Ok(wrote)
    }

    /// Reads endpoint metadata. Unknown endpoints yield an empty record.
    pub async fn metadata(&self, endpoint_id: &str) -> Result<EndpointMetadata> {
        let key = self.keys.endpoint_metadata(endpoint_id);
        let fields = self
            .store
            .hgetall(&key)
            .await?
            .into_iter()
            .map(|(field, raw)| decode_utf8(&key, &field, raw).map(|value| (field, value)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(EndpointMetadata::from_fields(fields))
    }
}
