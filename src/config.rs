use crate::data::TableOptions;
use crate::processing::JoinKind;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub style: StyleConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub shapefile: PathBuf, // .shp, .json or .geojson
    pub join_column_shape: Option<String>,
    pub table: Option<TableConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TableConfig {
    pub path: PathBuf,
    pub join_column: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub na_values: Vec<String>,
}

impl TableConfig {
    pub fn options(&self) -> TableOptions {
        TableOptions {
            encoding: self.encoding.clone(),
            delimiter: self.delimiter as u8,
            na_values: self.na_values.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProcessingConfig {
    /// Table columns to keep, renamed, in output order. Empty keeps all.
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub join: JoinKind,
    pub distinct_on: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ColumnMapping {
    pub from: String,
    pub to: String,
}

impl ColumnMapping {
    pub fn new(from: &str, to: &str) -> Self {
        ColumnMapping {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StyleConfig {
    pub column: Option<String>,
    #[serde(default = "default_colormap")]
    pub colormap: String,
    #[serde(default = "default_edge_color")]
    pub edge_color: String,
    #[serde(default = "default_line_width")]
    pub line_width: f32,
    #[serde(default)]
    pub legend: bool,
    #[serde(default = "default_true")]
    pub axes: bool,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_background")]
    pub background: String,
    pub missing_color: Option<String>,
}

impl Default for StyleConfig {
    fn default() -> Self {
        StyleConfig {
            column: None,
            colormap: default_colormap(),
            edge_color: default_edge_color(),
            line_width: default_line_width(),
            legend: false,
            axes: true,
            width: default_width(),
            height: default_height(),
            background: default_background(),
            missing_color: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub image: PathBuf,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_colormap() -> String {
    "viridis".to_string()
}

fn default_edge_color() -> String {
    "black".to_string()
}

fn default_line_width() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_width() -> u32 {
    1000
}

fn default_height() -> u32 {
    750
}

fn default_background() -> String {
    "white".to_string()
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.input.table.is_some() && self.input.join_column_shape.is_none() {
            bail!("input.join_column_shape is required when input.table is set");
        }
        if let Some(table) = &self.input.table {
            if !table.delimiter.is_ascii() {
                bail!("Table delimiter must be an ASCII character, got {:?}", table.delimiter);
            }
        }
        if self.style.width == 0 || self.style.height == 0 {
            bail!("style.width and style.height must be non-zero");
        }
        Ok(())
    }
}
