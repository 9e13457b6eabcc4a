//! Cached tabular features keyed by an entity id and, optionally, a date.
//!
//! - parameter fingerprints addressing cache entries
//! - static and dynamic feature descriptors over a filesystem cache
//! - look-back ("N days before") resolution for dynamic features
//! - assembly of several features into one indexed table per date

mod builder;
mod cache;
mod feature;
mod fingerprint;
mod history;
mod observability;
mod table;

pub use builder::{build_features, BuildOptions, Dates, RowFilter};
pub use cache::{
    cache_config_from_env, CacheConfig, CacheError, CacheStore, BLOB_EXTENSION,
    DYNAMIC_NAMESPACE, STATIC_NAMESPACE,
};
pub use feature::{
    AsDay, BoxError, DynamicFeature, DynamicFeatureBuilder, Feature, FeatureError,
    StaticFeature, StaticFeatureBuilder, DEFAULT_DATE_COL, DEFAULT_ID_COL,
};
pub use fingerprint::{fingerprint, Params};
pub use history::lagged_column_name;
pub use observability::{
    init_logging, log_cache_config, logging_config_from_env, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use table::{IndexedTable, RowView, Table, TableError, Value};
