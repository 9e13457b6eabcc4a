//! Assembles several features into one table per requested date.

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{info, warn};

use crate::feature::{AsDay, Feature, FeatureError, DEFAULT_DATE_COL, DEFAULT_ID_COL};
use crate::table::{IndexedTable, RowView, Table, Value};

const DEFAULT_FILTER_COLUMN: &str = "total_pop";
const DEFAULT_FILTER_THRESHOLD: f64 = 10_000.0;

/// Requested prediction dates. A `Single` date yields a table indexed by the
/// id column only; `Many` (even with one element) adds the date to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dates {
    Single(NaiveDate),
    Many(Vec<NaiveDate>),
}

impl Dates {
    pub fn single(date: impl AsDay) -> Self {
        Self::Single(date.as_day())
    }

    pub fn many<D: AsDay>(dates: impl IntoIterator<Item = D>) -> Self {
        Self::Many(dates.into_iter().map(|d| d.as_day()).collect())
    }

    pub fn as_slice(&self) -> &[NaiveDate] {
        match self {
            Self::Single(date) => std::slice::from_ref(date),
            Self::Many(dates) => dates,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Self::Single(_))
    }
}

impl From<NaiveDate> for Dates {
    fn from(date: NaiveDate) -> Self {
        Self::single(date)
    }
}

impl From<NaiveDateTime> for Dates {
    fn from(date: NaiveDateTime) -> Self {
        Self::single(date)
    }
}

impl From<Vec<NaiveDate>> for Dates {
    fn from(dates: Vec<NaiveDate>) -> Self {
        Self::Many(dates)
    }
}

impl From<&[NaiveDate]> for Dates {
    fn from(dates: &[NaiveDate]) -> Self {
        Self::Many(dates.to_vec())
    }
}

impl From<Vec<NaiveDateTime>> for Dates {
    fn from(dates: Vec<NaiveDateTime>) -> Self {
        Self::many(dates)
    }
}

type RowPredicate = Arc<dyn Fn(&RowView<'_>) -> bool + Send + Sync>;

/// Row filter applied to each date's joined table.
#[derive(Clone)]
pub enum RowFilter {
    KeepAll,
    /// Keeps rows whose `column` is numeric and strictly above `threshold`.
    /// The column must exist in the joined table.
    ColumnGreaterThan { column: String, threshold: f64 },
    Predicate(RowPredicate),
}

impl RowFilter {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&RowView<'_>) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    fn apply(&self, table: Table) -> Result<Table, FeatureError> {
        match self {
            Self::KeepAll => Ok(table),
            Self::ColumnGreaterThan { column, threshold } => {
                let idx = table.column_index(column)?;
                Ok(table.filter_rows(|row| {
                    row.cells()[idx]
                        .as_f64()
                        .map(|v| v > *threshold)
                        .unwrap_or(false)
                }))
            }
            Self::Predicate(keep) => Ok(table.filter_rows(|row| keep(row))),
        }
    }
}

/// `total_pop > 10000`.
impl Default for RowFilter {
    fn default() -> Self {
        Self::ColumnGreaterThan {
            column: DEFAULT_FILTER_COLUMN.to_string(),
            threshold: DEFAULT_FILTER_THRESHOLD,
        }
    }
}

impl fmt::Debug for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepAll => f.write_str("KeepAll"),
            Self::ColumnGreaterThan { column, threshold } => f
                .debug_struct("ColumnGreaterThan")
                .field("column", column)
                .field("threshold", threshold)
                .finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub id_col: String,
    pub date_col: String,
    pub filter: RowFilter,
    /// Fail with `JoinMismatch` instead of returning an empty slice when the
    /// features share no identifiers on some date.
    pub strict_join: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            id_col: DEFAULT_ID_COL.to_string(),
            date_col: DEFAULT_DATE_COL.to_string(),
            filter: RowFilter::default(),
            strict_join: false,
        }
    }
}

pub fn build_features(
    features: &[Feature],
    dates: impl Into<Dates>,
    options: &BuildOptions,
) -> Result<IndexedTable, FeatureError> {
    if features.is_empty() {
        return Err(FeatureError::EmptyFeatureList);
    }
    let dates = dates.into();
    if dates.as_slice().is_empty() {
        return Err(FeatureError::InvalidArgument(
            "at least one prediction date is required".to_string(),
        ));
    }

    info!(
        component = "builder",
        event = "features.build.start",
        feature_count = features.len(),
        date_count = dates.as_slice().len(),
        single_date = dates.is_single(),
        filter = ?options.filter
    );

    let mut per_date = Vec::with_capacity(dates.as_slice().len());
    for date in dates.as_slice() {
        let joined = join_for_date(features, *date, options)?;
        let filtered = options.filter.apply(joined)?;
        per_date.push(filtered.with_constant_column(&options.date_col, Value::Date(*date)));
    }

    let stacked = Table::concat(per_date);
    let indexed = if dates.is_single() {
        stacked
            .drop_column(&options.date_col)
            .set_index(&[options.id_col.as_str()])?
    } else {
        stacked.set_index(&[options.id_col.as_str(), options.date_col.as_str()])?
    };

    info!(
        component = "builder",
        event = "features.build.finish",
        rows = indexed.len(),
        columns = indexed.columns().len()
    );

    Ok(indexed)
}

fn join_for_date(
    features: &[Feature],
    date: NaiveDate,
    options: &BuildOptions,
) -> Result<Table, FeatureError> {
    let mut joined: Option<Table> = None;
    let mut inputs_non_empty = true;

    for feature in features {
        let mut table = feature
            .compute(Some(date))?
            .drop_column(&options.date_col);
        if let Some(own) = feature.date_col() {
            table = table.drop_column(own);
        }
        inputs_non_empty &= !table.is_empty();
        joined = Some(match joined {
            None => table,
            Some(acc) => acc.inner_join(&table, &options.id_col)?,
        });
    }

    let joined = joined.ok_or(FeatureError::EmptyFeatureList)?;
    if joined.is_empty() && inputs_non_empty && features.len() > 1 {
        if options.strict_join {
            return Err(FeatureError::JoinMismatch { date });
        }
        let names: Vec<&str> = features.iter().map(Feature::name).collect();
        warn!(
            component = "builder",
            event = "features.build.empty_join",
            date = %date,
            features = ?names
        );
    }

    Ok(joined)
}
