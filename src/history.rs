//! Look-back resolution for dynamic features.
//!
//! A value "N days back" is never derived by shifting an existing series. It
//! is recomputed at `date - N` with no offset and relabelled, so every
//! (offset, date) pair gets its own cache entry.

use chrono::{Days, NaiveDate};
use tracing::info;

use crate::feature::{DynamicFeature, FeatureError};
use crate::table::Table;

/// Column name a value takes when looked back by `offset` days.
pub fn lagged_column_name(column: &str, offset: i64) -> String {
    format!("{column}_before_{offset}_days")
}

pub(crate) fn resolve_offset(
    feature: &DynamicFeature,
    date: NaiveDate,
    offset: i64,
) -> Result<Table, FeatureError> {
    if offset < 0 {
        return Err(FeatureError::InvalidArgument(format!(
            "offset must be non-negative, got {offset}"
        )));
    }

    let path = feature.entry_path(date, offset);
    if let Some(table) = feature.cache().load(&path)? {
        info!(
            component = "history",
            event = "features.history.resolve",
            feature = feature.name(),
            date = %date,
            offset,
            source = "cached"
        );
        return Ok(table);
    }

    let table = if offset == 0 {
        feature.compute_base(date)?
    } else {
        let earlier = date
            .checked_sub_days(Days::new(offset.unsigned_abs()))
            .ok_or_else(|| {
                FeatureError::InvalidArgument(format!(
                    "offset {offset} reaches before the earliest representable date from {date}"
                ))
            })?;
        let base = resolve_offset(feature, earlier, 0)?;
        lag_columns(base, feature.id_col(), feature.date_col(), offset)?
    };

    feature.cache().store(&path, &table)?;
    info!(
        component = "history",
        event = "features.history.resolve",
        feature = feature.name(),
        date = %date,
        offset,
        source = "computed",
        rows = table.len()
    );
    Ok(table)
}

fn lag_columns(
    table: Table,
    id_col: &str,
    date_col: &str,
    offset: i64,
) -> Result<Table, FeatureError> {
    let renamed = table.rename_columns(|column| {
        if column == id_col || column == date_col {
            None
        } else {
            Some(lagged_column_name(column, offset))
        }
    })?;
    Ok(renamed)
}
