//! Static and dynamic feature descriptors.
//!
//! A descriptor pairs a caller-supplied computation with its bound parameters
//! and a [`CacheStore`]. Running it returns the cached table when one exists
//! for the descriptor's key, otherwise computes, persists and returns it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use thiserror::Error;
use tracing::info;

use crate::cache::{CacheError, CacheStore};
use crate::fingerprint::{fingerprint, Params};
use crate::history::resolve_offset;
use crate::table::{Table, TableError, Value};

pub const DEFAULT_ID_COL: &str = "city_code";
pub const DEFAULT_DATE_COL: &str = "day_date";

pub(crate) const OFFSET_PARAM: &str = "offset";
const DATE_PARAM: &str = "prediction_date";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type StaticFn = Arc<dyn Fn(&Params) -> Result<Table, BoxError> + Send + Sync>;
type DynamicFn = Arc<dyn Fn(NaiveDate, &Params) -> Result<Table, BoxError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("the given features list must have at least one feature")]
    EmptyFeatureList,
    #[error("feature '{feature}' failed: {source}")]
    Computation {
        feature: String,
        #[source]
        source: BoxError,
    },
    #[error("feature '{feature}' output is missing column '{column}'")]
    MissingColumn { feature: String, column: String },
    #[error("no identifiers shared by all features on {date}")]
    JoinMismatch { date: NaiveDate },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Anything that names a calendar day. Time of day is discarded.
pub trait AsDay {
    fn as_day(&self) -> NaiveDate;
}

impl AsDay for NaiveDate {
    fn as_day(&self) -> NaiveDate {
        *self
    }
}

impl AsDay for NaiveDateTime {
    fn as_day(&self) -> NaiveDate {
        self.date()
    }
}

impl<Tz: TimeZone> AsDay for DateTime<Tz> {
    fn as_day(&self) -> NaiveDate {
        self.date_naive()
    }
}

/// Fields shared by both descriptor variants.
#[derive(Debug, Clone)]
struct Binding {
    name: String,
    id_col: String,
    params: Params,
    filter_on: Option<Vec<String>>,
}

impl Binding {
    fn new(name: String) -> Self {
        Self {
            name,
            id_col: DEFAULT_ID_COL.to_string(),
            params: Params::new(),
            filter_on: None,
        }
    }

    fn validate(&self) -> Result<(), FeatureError> {
        let name = self.name.as_str();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
        {
            return Err(FeatureError::InvalidArgument(format!(
                "feature name '{name}' must be a single non-empty path segment"
            )));
        }
        if self.id_col.is_empty() {
            return Err(FeatureError::InvalidArgument(format!(
                "feature '{name}' has an empty id column"
            )));
        }
        for reserved in [OFFSET_PARAM, DATE_PARAM] {
            if self.params.contains_key(reserved) {
                return Err(FeatureError::InvalidArgument(format!(
                    "feature '{name}' binds reserved parameter '{reserved}'"
                )));
            }
        }
        Ok(())
    }

    fn require_column(&self, table: &Table, column: &str) -> Result<(), FeatureError> {
        if table.has_column(column) {
            Ok(())
        } else {
            Err(FeatureError::MissingColumn {
                feature: self.name.clone(),
                column: column.to_string(),
            })
        }
    }

    /// Projects to `[id_col] + filter_on` when a column filter is set.
    fn project(&self, table: Table) -> Result<Table, FeatureError> {
        let Some(filter_on) = &self.filter_on else {
            return Ok(table);
        };
        let mut columns = Vec::with_capacity(filter_on.len() + 1);
        columns.push(self.id_col.as_str());
        columns.extend(filter_on.iter().map(String::as_str));
        for column in &columns {
            self.require_column(&table, column)?;
        }
        Ok(table.project(&columns)?)
    }
}

macro_rules! binding_setters {
    () => {
        pub fn id_col(mut self, id_col: impl Into<String>) -> Self {
            self.binding.id_col = id_col.into();
            self
        }

        pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
            self.binding.params.insert(key, value);
            self
        }

        pub fn params(mut self, params: Params) -> Self {
            self.binding.params = params;
            self
        }

        /// Keep only these columns (plus the id column) in the output.
        pub fn filter_on<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
            self.binding.filter_on = Some(columns.into_iter().map(Into::into).collect());
            self
        }
    };
}

/// Time-invariant feature, cached once per parameter set.
#[derive(Clone)]
pub struct StaticFeature {
    binding: Binding,
    func: StaticFn,
    cache: CacheStore,
}

pub struct StaticFeatureBuilder {
    binding: Binding,
    func: StaticFn,
}

impl StaticFeatureBuilder {
    binding_setters!();

    pub fn build(self, cache: &CacheStore) -> Result<StaticFeature, FeatureError> {
        self.binding.validate()?;
        Ok(StaticFeature {
            binding: self.binding,
            func: self.func,
            cache: cache.clone(),
        })
    }
}

impl StaticFeature {
    pub fn builder<F>(name: impl Into<String>, func: F) -> StaticFeatureBuilder
    where
        F: Fn(&Params) -> Result<Table, BoxError> + Send + Sync + 'static,
    {
        StaticFeatureBuilder {
            binding: Binding::new(name.into()),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.binding.name
    }

    pub fn id_col(&self) -> &str {
        &self.binding.id_col
    }

    pub fn params(&self) -> &Params {
        &self.binding.params
    }

    pub fn filter_on(&self) -> Option<&[String]> {
        self.binding.filter_on.as_deref()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.binding.params)
    }

    pub fn entry_path(&self) -> PathBuf {
        self.cache
            .static_entry_path(&self.binding.name, &self.fingerprint())
    }

    pub fn run(&self) -> Result<Table, FeatureError> {
        let path = self.entry_path();
        let table = match self.cache.load(&path)? {
            Some(table) => {
                info!(
                    component = "features",
                    event = "features.static.cached",
                    feature = %self.binding.name,
                    path = %path.display()
                );
                table
            }
            None => {
                let table = (self.func)(&self.binding.params).map_err(|source| {
                    FeatureError::Computation {
                        feature: self.binding.name.clone(),
                        source,
                    }
                })?;
                self.binding.require_column(&table, &self.binding.id_col)?;
                self.cache.store(&path, &table)?;
                info!(
                    component = "features",
                    event = "features.static.computed",
                    feature = %self.binding.name,
                    rows = table.len()
                );
                table
            }
        };
        self.binding.project(table)
    }
}

impl fmt::Debug for StaticFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticFeature")
            .field("binding", &self.binding)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Time-varying feature, cached once per (parameter set, offset, date).
#[derive(Clone)]
pub struct DynamicFeature {
    binding: Binding,
    date_col: String,
    offset: i64,
    func: DynamicFn,
    cache: CacheStore,
}

pub struct DynamicFeatureBuilder {
    binding: Binding,
    date_col: String,
    offset: i64,
    func: DynamicFn,
}

impl DynamicFeatureBuilder {
    binding_setters!();

    pub fn date_col(mut self, date_col: impl Into<String>) -> Self {
        self.date_col = date_col.into();
        self
    }

    /// Days to look back. Must be non-negative.
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn build(self, cache: &CacheStore) -> Result<DynamicFeature, FeatureError> {
        self.binding.validate()?;
        if self.offset < 0 {
            return Err(FeatureError::InvalidArgument(format!(
                "feature '{}' has negative offset {}",
                self.binding.name, self.offset
            )));
        }
        if self.date_col.is_empty() || self.date_col == self.binding.id_col {
            return Err(FeatureError::InvalidArgument(format!(
                "feature '{}' needs a date column distinct from its id column",
                self.binding.name
            )));
        }
        Ok(DynamicFeature {
            binding: self.binding,
            date_col: self.date_col,
            offset: self.offset,
            func: self.func,
            cache: cache.clone(),
        })
    }
}

impl DynamicFeature {
    pub fn builder<F>(name: impl Into<String>, func: F) -> DynamicFeatureBuilder
    where
        F: Fn(NaiveDate, &Params) -> Result<Table, BoxError> + Send + Sync + 'static,
    {
        DynamicFeatureBuilder {
            binding: Binding::new(name.into()),
            date_col: DEFAULT_DATE_COL.to_string(),
            offset: 0,
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.binding.name
    }

    pub fn id_col(&self) -> &str {
        &self.binding.id_col
    }

    pub fn date_col(&self) -> &str {
        &self.date_col
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn params(&self) -> &Params {
        &self.binding.params
    }

    pub fn filter_on(&self) -> Option<&[String]> {
        self.binding.filter_on.as_deref()
    }

    pub(crate) fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Fingerprint of the bound parameters extended with `offset`.
    pub fn fingerprint_at_offset(&self, offset: i64) -> String {
        let keyed = self.binding.params.clone().with(OFFSET_PARAM, offset);
        fingerprint(&keyed)
    }

    pub fn entry_path(&self, prediction_date: impl AsDay, offset: i64) -> PathBuf {
        self.cache.dynamic_entry_path(
            &self.binding.name,
            &self.fingerprint_at_offset(offset),
            prediction_date.as_day(),
        )
    }

    /// Value of this feature at `prediction_date`, looked back by the
    /// configured offset and projected by `filter_on`.
    pub fn run(&self, prediction_date: impl AsDay) -> Result<Table, FeatureError> {
        self.run_at_offset(prediction_date, self.offset)
    }

    /// Like [`DynamicFeature::run`] with an explicit look-back.
    pub fn run_at_offset(
        &self,
        prediction_date: impl AsDay,
        offset: i64,
    ) -> Result<Table, FeatureError> {
        let table = resolve_offset(self, prediction_date.as_day(), offset)?;
        self.binding.project(table)
    }

    /// Invokes the caller's function for `date` with no look-back.
    pub(crate) fn compute_base(&self, date: NaiveDate) -> Result<Table, FeatureError> {
        let table = (self.func)(date, &self.binding.params).map_err(|source| {
            FeatureError::Computation {
                feature: self.binding.name.clone(),
                source,
            }
        })?;
        self.binding.require_column(&table, &self.binding.id_col)?;
        self.binding.require_column(&table, &self.date_col)?;
        Ok(table)
    }
}

impl fmt::Debug for DynamicFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicFeature")
            .field("binding", &self.binding)
            .field("date_col", &self.date_col)
            .field("offset", &self.offset)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Either kind of descriptor, dispatched by the assembler.
#[derive(Debug, Clone)]
pub enum Feature {
    Static(StaticFeature),
    Dynamic(DynamicFeature),
}

impl Feature {
    pub fn name(&self) -> &str {
        match self {
            Self::Static(feature) => feature.name(),
            Self::Dynamic(feature) => feature.name(),
        }
    }

    pub fn id_col(&self) -> &str {
        match self {
            Self::Static(feature) => feature.id_col(),
            Self::Dynamic(feature) => feature.id_col(),
        }
    }

    /// Date column a dynamic feature emits; `None` for static features.
    pub fn date_col(&self) -> Option<&str> {
        match self {
            Self::Static(_) => None,
            Self::Dynamic(feature) => Some(feature.date_col()),
        }
    }

    /// Static features ignore `date`; dynamic features require it.
    pub fn compute(&self, date: Option<NaiveDate>) -> Result<Table, FeatureError> {
        match (self, date) {
            (Self::Static(feature), _) => feature.run(),
            (Self::Dynamic(feature), Some(date)) => feature.run(date),
            (Self::Dynamic(feature), None) => Err(FeatureError::InvalidArgument(format!(
                "dynamic feature '{}' needs a prediction date",
                feature.name()
            ))),
        }
    }
}

impl From<StaticFeature> for Feature {
    fn from(feature: StaticFeature) -> Self {
        Self::Static(feature)
    }
}

impl From<DynamicFeature> for Feature {
    fn from(feature: DynamicFeature) -> Self {
        Self::Dynamic(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use tempfile::tempdir;

    fn store_in(path: &std::path::Path) -> CacheStore {
        CacheStore::new(&CacheConfig {
            root: path.to_path_buf(),
        })
    }

    fn population(_params: &Params) -> Result<Table, BoxError> {
        Ok(Table::new(
            ["city_code", "total_pop", "area"],
            vec![vec![Value::from("TLV"), Value::Int(460_000), Value::Float(52.0)]],
        )?)
    }

    #[test]
    fn builder_rejects_path_like_names_and_reserved_params() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());

        for name in ["", "..", "a/b", "a\\b"] {
            let err = StaticFeature::builder(name, population)
                .build(&store)
                .unwrap_err();
            assert!(matches!(err, FeatureError::InvalidArgument(_)), "{name}");
        }

        let err = DynamicFeature::builder("rain", |_, _| Ok(Table::default()))
            .param("offset", 3)
            .build(&store)
            .unwrap_err();
        assert!(matches!(err, FeatureError::InvalidArgument(_)));
    }

    #[test]
    fn negative_offset_is_rejected_at_build_time() {
        let temp = tempdir().unwrap();
        let err = DynamicFeature::builder("rain", |_, _| Ok(Table::default()))
            .offset(-1)
            .build(&store_in(temp.path()))
            .unwrap_err();
        assert!(matches!(err, FeatureError::InvalidArgument(_)));
    }

    #[test]
    fn missing_id_column_is_reported_and_not_cached() {
        let temp = tempdir().unwrap();
        let feature = StaticFeature::builder("no_ids", |_| {
            Ok(Table::new(["total_pop"], vec![vec![Value::Int(1)]])?)
        })
        .build(&store_in(temp.path()))
        .unwrap();

        let err = feature.run().unwrap_err();
        assert!(matches!(
            err,
            FeatureError::MissingColumn { ref column, .. } if column == "city_code"
        ));
        assert!(!feature.entry_path().exists());
    }

    #[test]
    fn projection_keeps_id_column_first() {
        let temp = tempdir().unwrap();
        let feature = StaticFeature::builder("population", population)
            .filter_on(["area"])
            .build(&store_in(temp.path()))
            .unwrap();

        let table = feature.run().unwrap();
        assert_eq!(table.columns(), ["city_code", "area"]);
    }

    #[test]
    fn dynamic_feature_without_date_is_invalid() {
        let temp = tempdir().unwrap();
        let feature: Feature = DynamicFeature::builder("rain", |_, _| Ok(Table::default()))
            .build(&store_in(temp.path()))
            .unwrap()
            .into();
        assert!(matches!(
            feature.compute(None).unwrap_err(),
            FeatureError::InvalidArgument(_)
        ));
    }

    #[test]
    fn as_day_discards_time_of_day() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(17, 45, 3)
            .unwrap();
        assert_eq!(dt.as_day(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(dt.and_utc().as_day(), dt.date());
    }
}
