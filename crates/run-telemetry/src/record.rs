// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run identity and the closed set of telemetry records a run can emit.
//!
//! Every record is stamped with a per-run sequence number when it enters the
//! dispatcher. The sequence number is the only ordering key used by the cache
//! and by replay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Delivery mode of a run, fixed when the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Online,
    Offline,
}

/// Lifecycle of a run as seen by the client.
///
/// `Lost` is only ever assigned by the server; the client never moves a run
/// into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Terminated,
    Lost,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Terminated
        )
    }

    /// Whether moving from `self` to `next` respects the monotonic lifecycle.
    ///
    /// Terminal states are final; staying in the same state is always allowed.
    #[must_use]
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            RunStatus::Created => !matches!(next, RunStatus::Lost),
            RunStatus::Running => !matches!(next, RunStatus::Created | RunStatus::Lost),
            RunStatus::Lost => next.is_terminal(),
            RunStatus::Completed | RunStatus::Failed | RunStatus::Terminated => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Terminated => "terminated",
            RunStatus::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Identity of one tracked run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub run_id: Uuid,
    pub name: String,
    pub mode: RunMode,
    pub status: RunStatus,
}

impl RunIdentity {
    /// New run in `Running` state with a random id.
    pub fn new(name: impl Into<String>, mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            name: name.into(),
            mode,
            status: RunStatus::Running,
        }
    }
}

/// Numeric value of a metric point. Integers stay integers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: MetricValue,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub step: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Metadata update; keys merge last-write-wins on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDelta {
    pub entries: BTreeMap<String, serde_json::Value>,
}

/// Alert declared by the run. Alerts are unique by name, so creation is
/// create-if-absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDeclaration {
    pub name: String,
    pub rule: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub local_path: String,
    pub category: String,
    pub server_name: String,
}

/// One unit of telemetry emitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Metric(MetricPoint),
    Event(EventRecord),
    Metadata(MetadataDelta),
    Alert(AlertDeclaration),
    Artifact(ArtifactRef),
}

impl TelemetryRecord {
    pub fn metric(name: impl Into<String>, value: impl Into<MetricValue>, step: i64) -> Self {
        TelemetryRecord::Metric(MetricPoint {
            name: name.into(),
            value: value.into(),
            timestamp: OffsetDateTime::now_utc(),
            step,
        })
    }

    pub fn event(message: impl Into<String>) -> Self {
        TelemetryRecord::Event(EventRecord {
            message: message.into(),
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            TelemetryRecord::Metric(_) => RecordKind::Metric,
            TelemetryRecord::Event(_) => RecordKind::Event,
            TelemetryRecord::Metadata(_) => RecordKind::Metadata,
            TelemetryRecord::Alert(_) => RecordKind::Alert,
            TelemetryRecord::Artifact(_) => RecordKind::Artifact,
        }
    }
}

/// Discriminant of [`TelemetryRecord`], used to group records into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Metric,
    Event,
    Metadata,
    Alert,
    Artifact,
}

impl RecordKind {
    /// Metrics and events go to bulk endpoints; everything else is one
    /// request per record.
    #[must_use]
    pub fn is_bulk(self) -> bool {
        matches!(self, RecordKind::Metric | RecordKind::Event)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordKind::Metric => "metric",
            RecordKind::Event => "event",
            RecordKind::Metadata => "metadata",
            RecordKind::Alert => "alert",
            RecordKind::Artifact => "artifact",
        };
        f.write_str(s)
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "metric" | "metrics" => Ok(RecordKind::Metric),
            "event" | "events" => Ok(RecordKind::Event),
            "metadata" => Ok(RecordKind::Metadata),
            "alert" | "alerts" => Ok(RecordKind::Alert),
            "artifact" | "artifacts" => Ok(RecordKind::Artifact),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

/// A record together with its per-run sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedRecord {
    pub seq: u64,
    pub record: TelemetryRecord,
}

impl SequencedRecord {
    /// Serialized size in bytes, as it would appear in the cache and roughly
    /// on the wire.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|v| v.len())
    }
}
