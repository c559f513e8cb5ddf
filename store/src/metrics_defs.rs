//! Metrics definitions for the store.

use shared::metrics_defs::{MetricDef, MetricType};

pub const STORE_TRANSACTIONS: MetricDef = MetricDef {
    name: "store.transactions",
    metric_type: MetricType::Counter,
    description: "Number of transactions submitted to the table",
};

pub const STORE_TRANSACTION_ITEMS: MetricDef = MetricDef {
    name: "store.transaction.items",
    metric_type: MetricType::Histogram,
    description: "Number of write operations per transaction",
};

pub const STORE_BATCH_FAILED: MetricDef = MetricDef {
    name: "store.batch.failed",
    metric_type: MetricType::Counter,
    description: "Multi-batch writes that failed part way. Earlier batches stay committed.",
};

pub const STORE_CONDITIONAL_CONFLICTS: MetricDef = MetricDef {
    name: "store.conditional.conflicts",
    metric_type: MetricType::Counter,
    description: "Conditional writes rejected because their precondition did not hold",
};

pub const ALL_METRICS: &[MetricDef] = &[
    STORE_TRANSACTIONS,
    STORE_TRANSACTION_ITEMS,
    STORE_BATCH_FAILED,
    STORE_CONDITIONAL_CONFLICTS,
];
