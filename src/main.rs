pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod processing;
pub mod render;
pub mod types;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the attribute table onto the polygons and render the choropleth
    Render {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Overrides output.image from the config
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// List the columns of the configured inputs and the values of the keyed columns
    Inspect {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Render { config, output } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            let image_path = output.clone().unwrap_or_else(|| app_config.output.image.clone());

            let result = pipeline::run(&app_config)
                .with_context(|| format!("Rendering with config {:?} failed", config))?;
            result
                .figure
                .save(&image_path)
                .with_context(|| format!("Failed to write {:?}", image_path))?;

            println!(
                "Rendered {} polygons to {:?}",
                result.dataset.dataset.len(),
                image_path
            );
        }
        Commands::Inspect { config } => {
            let app_config = config::AppConfig::load_from_file(config)?;

            let polygons = data::load_polygons(&app_config.input.shapefile)?;
            println!("{:?}: {} polygons", app_config.input.shapefile, polygons.len());
            for column in &polygons.columns {
                println!("  {}", column);
            }
            for (column, values) in pipeline::configured_column_values(&app_config, &polygons)? {
                let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                println!("{}: {} distinct values", column, values.len());
                println!("  {}", values.join(", "));
            }

            if let Some(table_config) = &app_config.input.table {
                let table = data::load_table_with(&table_config.path, &table_config.options())?;
                println!("{:?}: {} rows", table_config.path, table.len());
                for column in &table.columns {
                    println!("  {}", column);
                }
            }
        }
    }

    Ok(())
}
