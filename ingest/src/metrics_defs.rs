//! Metrics definitions for ingestion runs and notifications.

use shared::metrics_defs::{MetricDef, MetricType};

pub const INGEST_RUNS: MetricDef = MetricDef {
    name: "ingest.runs",
    metric_type: MetricType::Counter,
    description: "Number of ingestion runs. Tagged with outcome (completed, locked, failed, timeout).",
};

pub const INGEST_RUN_DURATION: MetricDef = MetricDef {
    name: "ingest.run.duration",
    metric_type: MetricType::Histogram,
    description: "Wall time of an ingestion run holding the lock, in seconds",
};

pub const INGEST_SESSIONS: MetricDef = MetricDef {
    name: "ingest.sessions",
    metric_type: MetricType::Counter,
    description: "Races handled by ingestion. Tagged with outcome (created, linked, already_ingested, failed).",
};

pub const INGEST_LAPS_LOADED: MetricDef = MetricDef {
    name: "ingest.laps.loaded",
    metric_type: MetricType::Counter,
    description: "Lap sets fetched from upstream on demand",
};

pub const NOTIFY_PUSHES: MetricDef = MetricDef {
    name: "notify.pushes",
    metric_type: MetricType::Counter,
    description: "Messages pushed to websocket connections. Tagged with result (delivered, gone, error).",
};

pub const NOTIFY_PRUNED: MetricDef = MetricDef {
    name: "notify.pruned",
    metric_type: MetricType::Counter,
    description: "Stale websocket registrations removed after the gateway reported them gone",
};

pub const ALL_METRICS: &[MetricDef] = &[
    INGEST_RUNS,
    INGEST_RUN_DURATION,
    INGEST_SESSIONS,
    INGEST_LAPS_LOADED,
    NOTIFY_PUSHES,
    NOTIFY_PRUNED,
];
