//! Metrics definitions for the relay optimizer.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RELAY_MAP_ALREADY_EXISTS: MetricDef = MetricDef {
    name: "relay_map.add.already_exists",
    metric_type: MetricType::Counter,
    description: "Number of relay inserts rejected because the address was already present",
};

pub const RELAY_MAP_UPDATE_NOT_FOUND: MetricDef = MetricDef {
    name: "relay_map.update.not_found",
    metric_type: MetricType::Counter,
    description: "Number of relay updates dropped because the address was not in the map",
};

pub const RELAY_MAP_RELAYS: MetricDef = MetricDef {
    name: "relay_map.relays",
    metric_type: MetricType::Gauge,
    description: "Number of relays currently held in the relay map",
};

pub const RELAY_INIT_LOOKUP_FAILED: MetricDef = MetricDef {
    name: "relay_cache.init.lookup_failed",
    metric_type: MetricType::Counter,
    description: "Number of added relays that could not be loaded from the relay store",
};

pub const RELAY_CACHE_FETCH_FAILED: MetricDef = MetricDef {
    name: "relay_cache.fetch_failed",
    metric_type: MetricType::Counter,
    description: "Number of failed relay inventory fetches or diffs",
};

pub const RELAY_CACHE_ADDED: MetricDef = MetricDef {
    name: "relay_cache.added",
    metric_type: MetricType::Counter,
    description: "Number of relays added to the relay map by reconciliation",
};

pub const RELAY_CACHE_REMOVED: MetricDef = MetricDef {
    name: "relay_cache.removed",
    metric_type: MetricType::Counter,
    description: "Number of relays removed from the relay map by reconciliation",
};

pub const RELAY_UPDATE_PROCESSED: MetricDef = MetricDef {
    name: "relay_update.processed",
    metric_type: MetricType::Counter,
    description: "Number of relay update messages applied",
};

pub const RELAY_UPDATE_DECODE_FAILED: MetricDef = MetricDef {
    name: "relay_update.decode_failed",
    metric_type: MetricType::Counter,
    description: "Number of relay update messages dropped because they could not be decoded",
};

pub const RELAY_UPDATE_RELAY_NOT_FOUND: MetricDef = MetricDef {
    name: "relay_update.relay_not_found",
    metric_type: MetricType::Counter,
    description: "Number of relay update messages dropped because the relay is not in the map",
};

pub const MATRIX_METADATA_LOOKUP_FAILED: MetricDef = MetricDef {
    name: "matrix.metadata.lookup_failed",
    metric_type: MetricType::Counter,
    description: "Number of relays whose metadata could not be loaded while building a matrix",
};

pub const COST_MATRIX_INVOCATIONS: MetricDef = MetricDef {
    name: "cost_matrix.invocations",
    metric_type: MetricType::Counter,
    description: "Number of cost matrix builds",
};

pub const COST_MATRIX_DURATION: MetricDef = MetricDef {
    name: "cost_matrix.duration",
    metric_type: MetricType::Histogram,
    description: "Time to build and serialize a cost matrix in seconds",
};

pub const COST_MATRIX_LONG_UPDATES: MetricDef = MetricDef {
    name: "cost_matrix.long_updates",
    metric_type: MetricType::Counter,
    description: "Number of cost matrix builds that took longer than one second",
};

pub const COST_MATRIX_BYTES: MetricDef = MetricDef {
    name: "cost_matrix.bytes",
    metric_type: MetricType::Gauge,
    description: "Size of the serialized cost matrix",
};

pub const ROUTE_MATRIX_INVOCATIONS: MetricDef = MetricDef {
    name: "route_matrix.invocations",
    metric_type: MetricType::Counter,
    description: "Number of route optimization cycles",
};

pub const ROUTE_MATRIX_DURATION: MetricDef = MetricDef {
    name: "route_matrix.duration",
    metric_type: MetricType::Histogram,
    description: "Time to optimize and serialize a route matrix in seconds",
};

pub const ROUTE_MATRIX_LONG_UPDATES: MetricDef = MetricDef {
    name: "route_matrix.long_updates",
    metric_type: MetricType::Counter,
    description: "Number of route optimization cycles that took longer than one second",
};

pub const ROUTE_MATRIX_NO_ROUTES: MetricDef = MetricDef {
    name: "route_matrix.no_routes",
    metric_type: MetricType::Counter,
    description: "Number of optimization cycles that produced no routes",
};

pub const ROUTE_MATRIX_BYTES: MetricDef = MetricDef {
    name: "route_matrix.bytes",
    metric_type: MetricType::Gauge,
    description: "Size of the serialized route matrix",
};

pub const ROUTE_MATRIX_RELAYS: MetricDef = MetricDef {
    name: "route_matrix.relays",
    metric_type: MetricType::Gauge,
    description: "Number of relays in the latest route matrix",
};

pub const ROUTE_MATRIX_DATACENTERS: MetricDef = MetricDef {
    name: "route_matrix.datacenters",
    metric_type: MetricType::Gauge,
    description: "Number of distinct datacenters in the latest route matrix",
};

pub const ROUTE_MATRIX_ROUTES: MetricDef = MetricDef {
    name: "route_matrix.routes",
    metric_type: MetricType::Gauge,
    description: "Total number of routes in the latest route matrix",
};

pub const MATRIX_STORE_FAILED: MetricDef = MetricDef {
    name: "matrix_store.update_failed",
    metric_type: MetricType::Counter,
    description: "Number of failed matrix persistence or archive writes",
};

pub const PING_STATS_PUBLISHED: MetricDef = MetricDef {
    name: "ping_stats.published",
    metric_type: MetricType::Counter,
    description: "Number of ping stats entries handed to the publisher",
};

pub const RELAY_STATS_PUBLISHED: MetricDef = MetricDef {
    name: "relay_stats.published",
    metric_type: MetricType::Counter,
    description: "Number of relay stats entries handed to the publisher",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RELAY_MAP_ALREADY_EXISTS,
    RELAY_MAP_UPDATE_NOT_FOUND,
    RELAY_MAP_RELAYS,
    RELAY_INIT_LOOKUP_FAILED,
    RELAY_CACHE_FETCH_FAILED,
    RELAY_CACHE_ADDED,
    RELAY_CACHE_REMOVED,
    RELAY_UPDATE_PROCESSED,
    RELAY_UPDATE_DECODE_FAILED,
    RELAY_UPDATE_RELAY_NOT_FOUND,
    MATRIX_METADATA_LOOKUP_FAILED,
    COST_MATRIX_INVOCATIONS,
    COST_MATRIX_DURATION,
    COST_MATRIX_LONG_UPDATES,
    COST_MATRIX_BYTES,
    ROUTE_MATRIX_INVOCATIONS,
    ROUTE_MATRIX_DURATION,
    ROUTE_MATRIX_LONG_UPDATES,
    ROUTE_MATRIX_NO_ROUTES,
    ROUTE_MATRIX_BYTES,
    ROUTE_MATRIX_RELAYS,
    ROUTE_MATRIX_DATACENTERS,
    ROUTE_MATRIX_ROUTES,
    MATRIX_STORE_FAILED,
    PING_STATS_PUBLISHED,
    RELAY_STATS_PUBLISHED,
];
