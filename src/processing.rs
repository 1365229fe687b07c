use crate::config::ColumnMapping;
use crate::error::{PipelineError, Result};
use crate::types::{AttributeTable, JoinedDataset, PolygonDataset, PolygonRecord, Scalar, ScalarKey};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    /// Keep every polygon; unmatched ones get nulls.
    #[default]
    Left,
    /// Keep only polygons with a matching row.
    Inner,
}

/// Select `columns` from `table`, renamed, in the order given.
pub fn project(table: &AttributeTable, columns: &[ColumnMapping]) -> Result<AttributeTable> {
    let mut indices = Vec::with_capacity(columns.len());
    let mut seen = HashSet::new();
    for mapping in columns {
        let idx = table
            .column_index(&mapping.from)
            .ok_or_else(|| PipelineError::column_not_found(&mapping.from, &table.columns))?;
        if !seen.insert(mapping.to.as_str()) {
            return Err(PipelineError::ColumnConflict(mapping.to.clone()));
        }
        indices.push(idx);
    }

    let rows = table
        .rows
        .iter()
        .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
        .collect();

    Ok(AttributeTable {
        columns: columns.iter().map(|m| m.to.clone()).collect(),
        rows,
    })
}

/// Attach `table` rows to `polygons` where `polygon_key` equals `table_key`.
///
/// The result holds the polygon columns followed by every table column except
/// `table_key`. When the table repeats a key only its first row is used, so a
/// left join always yields one record per polygon.
pub fn join(
    polygons: &PolygonDataset,
    table: &AttributeTable,
    polygon_key: &str,
    table_key: &str,
    how: JoinKind,
) -> Result<JoinedDataset> {
    let pk = polygons
        .column_index(polygon_key)
        .ok_or_else(|| PipelineError::column_not_found(polygon_key, &polygons.columns))?;
    let tk = table
        .column_index(table_key)
        .ok_or_else(|| PipelineError::column_not_found(table_key, &table.columns))?;

    let carried: Vec<usize> = (0..table.columns.len()).filter(|&i| i != tk).collect();
    let mut columns = polygons.columns.clone();
    for &i in &carried {
        let name = &table.columns[i];
        if columns.contains(name) {
            return Err(PipelineError::ColumnConflict(name.clone()));
        }
        columns.push(name.clone());
    }

    let mut lookup: HashMap<ScalarKey, usize> = HashMap::with_capacity(table.len());
    let mut duplicates = 0;
    for (row_idx, row) in table.rows.iter().enumerate() {
        if row[tk].is_null() {
            continue;
        }
        if lookup.contains_key(&row[tk].key()) {
            duplicates += 1;
            debug!("Duplicate join key {} at table row {}", row[tk], row_idx);
            continue;
        }
        lookup.insert(row[tk].key(), row_idx);
    }
    if duplicates > 0 {
        warn!(
            "Table column '{}' repeats {} key(s); only the first row per key is joined",
            table_key, duplicates
        );
    }

    let mut records = Vec::with_capacity(polygons.len());
    let mut unmatched = Vec::new();
    for record in &polygons.records {
        let key = &record.values[pk];
        let matched = if key.is_null() {
            None
        } else {
            lookup.get(&key.key()).map(|&row| &table.rows[row])
        };

        let joined: Vec<Scalar> = match matched {
            Some(row) => carried.iter().map(|&i| row[i].clone()).collect(),
            None => {
                unmatched.push(key.clone());
                if how == JoinKind::Inner {
                    continue;
                }
                vec![Scalar::Null; carried.len()]
            }
        };

        let mut values = record.values.clone();
        values.extend(joined);
        records.push(PolygonRecord {
            geometry: record.geometry.clone(),
            values,
        });
    }

    info!(
        "Joined {} polygons against {} rows on {} = {}: {} matched, {} unmatched",
        polygons.len(),
        table.len(),
        polygon_key,
        table_key,
        polygons.len() - unmatched.len(),
        unmatched.len()
    );
    if !unmatched.is_empty() {
        debug!("Unmatched keys: {:?}", unmatched);
    }

    Ok(JoinedDataset {
        dataset: PolygonDataset { columns, records },
        unmatched,
    })
}

/// Keep the first record for each distinct value of `column`.
pub fn distinct_by(dataset: &PolygonDataset, column: &str) -> Result<PolygonDataset> {
    let idx = dataset
        .column_index(column)
        .ok_or_else(|| PipelineError::column_not_found(column, &dataset.columns))?;

    let mut seen = HashSet::new();
    let records: Vec<PolygonRecord> = dataset
        .records
        .iter()
        .filter(|r| seen.insert(r.values[idx].key()))
        .cloned()
        .collect();

    info!(
        "Kept {} of {} polygons distinct on '{}'",
        records.len(),
        dataset.len(),
        column
    );
    Ok(PolygonDataset {
        columns: dataset.columns.clone(),
        records,
    })
}

/// Distinct values of `column` in first-seen order.
pub fn unique_values(dataset: &PolygonDataset, column: &str) -> Result<Vec<Scalar>> {
    let idx = dataset
        .column_index(column)
        .ok_or_else(|| PipelineError::column_not_found(column, &dataset.columns))?;

    let mut seen = HashSet::new();
    Ok(dataset
        .records
        .iter()
        .map(|r| &r.values[idx])
        .filter(|v| seen.insert(v.key()))
        .cloned()
        .collect())
}
