use crate::config::AppConfig;
use crate::data;
use crate::error::{PipelineError, Result};
use crate::processing;
use crate::render::{self, Figure, Legend};
use crate::types::{JoinedDataset, PolygonDataset, Scalar};
use tracing::info;

pub struct PipelineOutput {
    /// The dataset the figure was rendered from.
    pub dataset: JoinedDataset,
    pub figure: Figure,
}

/// load -> distinct -> project -> join -> render
pub fn run(config: &AppConfig) -> Result<PipelineOutput> {
    // 1. Polygons
    let mut polygons = data::load_polygons(&config.input.shapefile)?;
    if let Some(column) = &config.processing.distinct_on {
        polygons = processing::distinct_by(&polygons, column)?;
    }

    // 2. Table, projected and joined
    let dataset = match &config.input.table {
        Some(table_config) => {
            let polygon_key = config.input.join_column_shape.as_deref().ok_or_else(|| {
                PipelineError::Config(
                    "input.join_column_shape is required when input.table is set".to_string(),
                )
            })?;
            let table = data::load_table_with(&table_config.path, &table_config.options())?;
            let table = if config.processing.columns.is_empty() {
                table
            } else {
                processing::project(&table, &config.processing.columns)?
            };
            processing::join(
                &polygons,
                &table,
                polygon_key,
                &table_config.join_column,
                config.processing.join,
            )?
        }
        None => JoinedDataset::from(polygons),
    };

    // 3. Render
    let figure = render::render(&dataset.dataset, &config.style)?;
    match &figure.legend {
        Some(Legend::Continuous { min, max, colormap }) => {
            info!("Legend: {} from {} to {}", colormap, min, max)
        }
        Some(Legend::Categorical(entries)) => {
            for (value, color) in entries {
                let [r, g, b, _] = color.0;
                info!("Legend: {} -> #{:02x}{:02x}{:02x}", value, r, g, b);
            }
        }
        None => {}
    }

    Ok(PipelineOutput { dataset, figure })
}

/// Distinct values of the `distinct_on` and style columns the polygons carry.
pub fn configured_column_values(
    config: &AppConfig,
    polygons: &PolygonDataset,
) -> Result<Vec<(String, Vec<Scalar>)>> {
    let mut summaries: Vec<(String, Vec<Scalar>)> = Vec::new();
    let candidates = [
        config.processing.distinct_on.as_ref(),
        config.style.column.as_ref(),
    ];
    for column in candidates.into_iter().flatten() {
        // Style columns may come from the table instead
        if polygons.column_index(column).is_none() || summaries.iter().any(|(c, _)| c == column) {
            continue;
        }
        let values = processing::unique_values(polygons, column)?;
        summaries.push((column.clone(), values));
    }
    Ok(summaries)
}
