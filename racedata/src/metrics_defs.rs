//! Metrics definitions for the upstream data client and reference caches.

use shared::metrics_defs::{MetricDef, MetricType};

pub const UPSTREAM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "upstream.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete an authenticated upstream call in seconds. Tagged with status.",
};

pub const UPSTREAM_UNAUTHORIZED: MetricDef = MetricDef {
    name: "upstream.unauthorized",
    metric_type: MetricType::Counter,
    description: "Number of upstream calls rejected with 401",
};

pub const UPSTREAM_CHUNKS_FETCHED: MetricDef = MetricDef {
    name: "upstream.chunks.fetched",
    metric_type: MetricType::Counter,
    description: "Number of result chunks downloaded",
};

pub const UPSTREAM_RATELIMIT_REMAINING: MetricDef = MetricDef {
    name: "upstream.ratelimit.remaining",
    metric_type: MetricType::Gauge,
    description: "Remaining upstream request quota as of the last response",
};

pub const UPSTREAM_RATELIMIT_LOW: MetricDef = MetricDef {
    name: "upstream.ratelimit.low",
    metric_type: MetricType::Counter,
    description: "Number of responses where remaining quota was under 20% of the limit",
};

pub const CACHE_MEMORY_HIT: MetricDef = MetricDef {
    name: "cache.memory.hit",
    metric_type: MetricType::Counter,
    description: "Reference data served from process memory. Tagged with key.",
};

pub const CACHE_BLOB_HIT: MetricDef = MetricDef {
    name: "cache.blob.hit",
    metric_type: MetricType::Counter,
    description: "Reference data served from the blob cache. Tagged with key.",
};

pub const CACHE_BLOB_MISS: MetricDef = MetricDef {
    name: "cache.blob.miss",
    metric_type: MetricType::Counter,
    description: "Blob cache lookups that were missing or stale. Tagged with key.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    UPSTREAM_REQUEST_DURATION,
    UPSTREAM_UNAUTHORIZED,
    UPSTREAM_CHUNKS_FETCHED,
    UPSTREAM_RATELIMIT_REMAINING,
    UPSTREAM_RATELIMIT_LOW,
    CACHE_MEMORY_HIT,
    CACHE_BLOB_HIT,
    CACHE_BLOB_MISS,
];
