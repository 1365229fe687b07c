use crate::error::{PipelineError, Result};
use crate::types::{AttributeTable, PolygonDataset, PolygonRecord, Scalar};
use csv::ReaderBuilder;
use encoding_rs::Encoding;
use geo::MultiPolygon;
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

/// Cells treated as missing regardless of configuration.
const DEFAULT_NA_VALUES: &[&str] = &["", "NA", "N/A", "n/a", "NaN", "nan", "NULL", "null", "#N/A"];

pub fn load_polygons(path: &Path) -> Result<PolygonDataset> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    let dataset = match extension.as_str() {
        "shp" => load_shapefile(path)?,
        "json" | "geojson" => load_geojson(path)?,
        _ => {
            return Err(PipelineError::io(
                path,
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported geometry format '{}'", extension),
                ),
            ))
        }
    };

    info!(
        "Loaded {} polygons with columns {:?} from {:?}",
        dataset.len(),
        dataset.columns,
        path
    );
    Ok(dataset)
}

fn load_shapefile(path: &Path) -> Result<PolygonDataset> {
    // Surface unreadable files as I/O failures before the shapefile reader wraps them
    File::open(path).map_err(|e| PipelineError::io(path, e))?;

    let dbf_path = path.with_extension("dbf");
    File::open(&dbf_path).map_err(|e| PipelineError::io(&dbf_path, e))?;
    let table = shapefile::dbase::Reader::from_path(&dbf_path)
        .map_err(|e| PipelineError::format(&dbf_path, e.to_string()))?;
    let columns: Vec<String> = table.fields().iter().map(|f| f.name().to_string()).collect();
    drop(table);

    let mut reader =
        Reader::from_path(path).map_err(|e| PipelineError::format(path, e.to_string()))?;

    let mut records = Vec::new();
    for (index, result) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = result.map_err(|e| PipelineError::format(path, e.to_string()))?;

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon.try_into().map_err(|e| {
                PipelineError::format(path, format!("shape {}: {:?}", index, e))
            })?,
            shapefile::Shape::PolygonM(polygon) => polygon.try_into().map_err(|e| {
                PipelineError::format(path, format!("shape {}: {:?}", index, e))
            })?,
            shapefile::Shape::PolygonZ(polygon) => polygon.try_into().map_err(|e| {
                PipelineError::format(path, format!("shape {}: {:?}", index, e))
            })?,
            shapefile::Shape::NullShape => {
                warn!("Skipping null shape at index {}", index);
                continue;
            }
            other => {
                return Err(PipelineError::format(
                    path,
                    format!("shape {} is a {:?}, expected a polygon", index, other.shapetype()),
                ))
            }
        };

        let values = columns
            .iter()
            .map(|name| record.get(name).map(field_to_scalar).unwrap_or(Scalar::Null))
            .collect();

        records.push(PolygonRecord { geometry, values });
    }

    Ok(PolygonDataset { columns, records })
}

fn field_to_scalar(value: &FieldValue) -> Scalar {
    match value {
        FieldValue::Character(Some(s)) | FieldValue::Memo(s) => {
            let s = s.trim();
            if s.is_empty() {
                Scalar::Null
            } else {
                Scalar::Text(s.to_string())
            }
        }
        FieldValue::Character(None) => Scalar::Null,
        FieldValue::Numeric(n) => n.map(Scalar::Number).unwrap_or(Scalar::Null),
        FieldValue::Float(n) => n.map(|v| Scalar::Number(v as f64)).unwrap_or(Scalar::Null),
        FieldValue::Integer(n) => Scalar::Number(*n as f64),
        FieldValue::Double(n) | FieldValue::Currency(n) => Scalar::Number(*n),
        FieldValue::Logical(b) => b.map(|b| Scalar::Text(b.to_string())).unwrap_or(Scalar::Null),
        other => Scalar::Text(format!("{:?}", other)),
    }
}

fn load_geojson(path: &Path) -> Result<PolygonDataset> {
    use geojson::GeoJson;

    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let reader = BufReader::new(file);

    // Parse the GeoJSON. warning: this loads the whole file into memory.
    let geojson = GeoJson::from_reader(reader)
        .map_err(|e| PipelineError::format(path, e.to_string()))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(PipelineError::format(path, "GeoJSON must be a FeatureCollection")),
    };

    // Property names in first-seen order across all features
    let mut columns: Vec<String> = Vec::new();
    for feature in &collection.features {
        if let Some(props) = &feature.properties {
            for key in props.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }

    let mut records = Vec::new();
    for (index, feature) in collection.features.into_iter().enumerate() {
        let geometry = match feature.geometry {
            Some(geom) => {
                let geometry: geo::Geometry<f64> = geom.value.try_into().map_err(|e| {
                    PipelineError::format(path, format!("feature {}: {:?}", index, e))
                })?;
                match geometry {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    other => {
                        return Err(PipelineError::format(
                            path,
                            format!("feature {} is not a polygon: {:?}", index, other),
                        ))
                    }
                }
            }
            None => {
                warn!("Skipping feature {} without geometry", index);
                continue;
            }
        };

        let values = columns
            .iter()
            .map(|name| {
                feature
                    .properties
                    .as_ref()
                    .and_then(|props| props.get(name))
                    .map(json_to_scalar)
                    .unwrap_or(Scalar::Null)
            })
            .collect();

        records.push(PolygonRecord { geometry, values });
    }

    Ok(PolygonDataset { columns, records })
}

fn json_to_scalar(value: &serde_json::Value) -> Scalar {
    match value {
        serde_json::Value::Null => Scalar::Null,
        serde_json::Value::String(s) => Scalar::Text(s.clone()),
        serde_json::Value::Number(n) => n.as_f64().map(Scalar::Number).unwrap_or(Scalar::Null),
        other => Scalar::Text(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct TableOptions {
    /// WHATWG encoding label, e.g. `cp1252` or `utf-8`.
    pub encoding: String,
    pub delimiter: u8,
    pub na_values: Vec<String>,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            encoding: "utf-8".to_string(),
            delimiter: b',',
            na_values: Vec::new(),
        }
    }
}

pub fn load_table(path: &Path, encoding: &str) -> Result<AttributeTable> {
    let options = TableOptions {
        encoding: encoding.to_string(),
        ..TableOptions::default()
    };
    load_table_with(path, &options)
}

pub fn load_table_with(path: &Path, options: &TableOptions) -> Result<AttributeTable> {
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;

    let encoding = Encoding::for_label(options.encoding.trim().as_bytes()).ok_or_else(|| {
        PipelineError::Encoding {
            path: path.to_path_buf(),
            encoding: options.encoding.clone(),
            message: "unknown encoding label".to_string(),
        }
    })?;
    let (text, had_errors) = encoding.decode_with_bom_removal(&bytes);
    if had_errors {
        return Err(PipelineError::Encoding {
            path: path.to_path_buf(),
            encoding: options.encoding.clone(),
            message: format!("input is not valid {}", encoding.name()),
        });
    }

    let table_err = |source| PipelineError::Table {
        path: path.to_path_buf(),
        source,
    };

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(options.delimiter)
        .from_reader(text.as_bytes());
    let columns: Vec<String> = rdr
        .headers()
        .map_err(table_err)?
        .iter()
        .map(|h| h.to_string())
        .collect();
    debug!("Table columns: {:?}", columns);

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(table_err)?;
        raw_rows.push(record.iter().map(|s| s.to_string()).collect());
    }

    let rows = infer_columns(&columns, raw_rows, &options.na_values);
    info!("Loaded {} rows x {} columns from {:?}", rows.len(), columns.len(), path);

    Ok(AttributeTable { columns, rows })
}

/// A column is numeric when every non-missing cell parses as a number,
/// otherwise all of its cells stay text.
fn infer_columns(columns: &[String], raw: Vec<Vec<String>>, extra_na: &[String]) -> Vec<Vec<Scalar>> {
    let is_na = |cell: &str| {
        let cell = cell.trim();
        DEFAULT_NA_VALUES.contains(&cell) || extra_na.iter().any(|na| na == cell)
    };

    let numeric: Vec<bool> = (0..columns.len())
        .map(|col| {
            raw.iter()
                .filter_map(|row| row.get(col))
                .filter(|cell| !is_na(cell))
                .all(|cell| cell.trim().parse::<f64>().is_ok())
        })
        .collect();

    let numeric_names: Vec<&String> = columns
        .iter()
        .zip(&numeric)
        .filter(|(_, is_numeric)| **is_numeric)
        .map(|(name, _)| name)
        .collect();
    debug!("Inferred numeric columns: {:?}", numeric_names);

    raw.into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .map(|(col, cell)| {
                    if is_na(&cell) {
                        Scalar::Null
                    } else if numeric[col] {
                        cell.trim().parse::<f64>().map(Scalar::Number).unwrap_or(Scalar::Null)
                    } else {
                        Scalar::Text(cell)
                    }
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shapefile::dbase;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub(crate) fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    /// Unit squares two apart, one per row, with a COMPONENTE/AREA table.
    fn write_soils(dir: &TempDir, rows: &[(Option<&str>, f64)]) -> PathBuf {
        let path = dir.path().join("soils.shp");
        let table = dbase::TableWriterBuilder::new()
            .add_character_field(dbase::FieldName::try_from("COMPONENTE").unwrap(), 50)
            .add_numeric_field(dbase::FieldName::try_from("AREA").unwrap(), 10, 2);
        let mut writer = shapefile::Writer::from_path(&path, table).unwrap();
        for (i, (name, area)) in rows.iter().enumerate() {
            let x = i as f64 * 2.0;
            let square = shapefile::Polygon::new(shapefile::PolygonRing::Outer(vec![
                shapefile::Point::new(x, 0.0),
                shapefile::Point::new(x, 1.0),
                shapefile::Point::new(x + 1.0, 1.0),
                shapefile::Point::new(x + 1.0, 0.0),
                shapefile::Point::new(x, 0.0),
            ]));
            let mut record = dbase::Record::default();
            record.insert(
                "COMPONENTE".to_string(),
                FieldValue::Character(name.map(str::to_string)),
            );
            record.insert("AREA".to_string(), FieldValue::Numeric(Some(*area)));
            writer.write_shape_and_record(&square, &record).unwrap();
        }
        path
    }

    /// Rewrites one record of a .shp as a null shape and drops the index.
    fn null_out_shape(shp: &Path, index: usize) {
        let bytes = fs::read(shp).unwrap();
        let mut out = bytes[..100].to_vec();
        let mut pos = 100;
        let mut n = 0;
        while pos < bytes.len() {
            let words = i32::from_be_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
            let end = pos + 8 + words * 2;
            if n == index {
                out.extend_from_slice(&bytes[pos..pos + 4]);
                out.extend_from_slice(&2i32.to_be_bytes());
                out.extend_from_slice(&0i32.to_le_bytes());
            } else {
                out.extend_from_slice(&bytes[pos..end]);
            }
            pos = end;
            n += 1;
        }
        // Header file length is in 16-bit words
        let words = (out.len() / 2) as i32;
        out[24..28].copy_from_slice(&words.to_be_bytes());
        fs::write(shp, out).unwrap();
        fs::remove_file(shp.with_extension("shx")).unwrap();
    }

    #[test]
    fn loads_shapefile_with_dbf_columns() {
        let dir = TempDir::new().unwrap();
        let path = write_soils(&dir, &[(Some("Typic"), 2.5), (None, 3.0)]);

        let dataset = load_polygons(&path).unwrap();
        assert_eq!(dataset.columns, vec!["COMPONENTE".to_string(), "AREA".to_string()]);
        assert_eq!(dataset.len(), 2);
        assert_eq!(
            dataset.records[0].values,
            vec![Scalar::from("Typic"), Scalar::Number(2.5)]
        );
        assert_eq!(dataset.records[1].values, vec![Scalar::Null, Scalar::Number(3.0)]);
        assert!(dataset.records.iter().all(|r| r.geometry.0.len() == 1));
    }

    #[test]
    fn null_shapes_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_soils(
            &dir,
            &[(Some("Typic"), 1.0), (Some("Andic"), 2.0), (Some("Lithic"), 3.0)],
        );
        null_out_shape(&path, 1);

        let dataset = load_polygons(&path).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.value(0, "COMPONENTE"), Some(&Scalar::from("Typic")));
        assert_eq!(dataset.value(1, "COMPONENTE"), Some(&Scalar::from("Lithic")));
        assert_eq!(dataset.value(1, "AREA"), Some(&Scalar::Number(3.0)));
    }

    #[test]
    fn point_shapefile_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wells.shp");
        let table = dbase::TableWriterBuilder::new()
            .add_character_field(dbase::FieldName::try_from("NAME").unwrap(), 20);
        let mut writer = shapefile::Writer::from_path(&path, table).unwrap();
        let mut record = dbase::Record::default();
        record.insert("NAME".to_string(), FieldValue::Character(Some("w1".to_string())));
        writer
            .write_shape_and_record(&shapefile::Point::new(0.0, 0.0), &record)
            .unwrap();
        drop(writer);

        assert!(matches!(load_polygons(&path), Err(PipelineError::Format { .. })));
    }

    #[test]
    fn missing_dbf_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let path = write_soils(&dir, &[(Some("Typic"), 1.0)]);
        fs::remove_file(path.with_extension("dbf")).unwrap();

        match load_polygons(&path) {
            Err(PipelineError::Io { path: failed, .. }) => {
                assert_eq!(failed, path.with_extension("dbf"))
            }
            other => panic!("expected an I/O error, got {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn geojson_columns_keep_file_order() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "ordered.geojson",
            br#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {"zeta": 1, "NAME": "A"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}},
                {"type": "Feature", "properties": {"NAME": "B", "alpha": 2},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}}
            ]}"#,
        );
        let dataset = load_polygons(&path).unwrap();
        assert_eq!(
            dataset.columns,
            vec!["zeta".to_string(), "NAME".to_string(), "alpha".to_string()]
        );
        assert_eq!(dataset.value(0, "alpha"), Some(&Scalar::Null));
    }

    pub(crate) const TWO_SQUARES: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": {"NAME": "A", "code": 1},
                "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}
            },
            {
                "type": "Feature",
                "properties": {"NAME": "B", "code": 2},
                "geometry": {"type": "MultiPolygon", "coordinates": [[[[2,0],[3,0],[3,1],[2,1],[2,0]]]]}
            }
        ]
    }"#;

    #[test]
    fn loads_geojson_polygons() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "areas.geojson", TWO_SQUARES.as_bytes());

        let dataset = load_polygons(&path).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.columns.contains(&"NAME".to_string()));
        assert_eq!(dataset.value(0, "NAME"), Some(&Scalar::from("A")));
        assert_eq!(dataset.value(1, "code"), Some(&Scalar::Number(2.0)));
        assert_eq!(dataset.records[1].geometry.0.len(), 1);
    }

    #[test]
    fn geojson_point_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.json",
            br#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {}, "geometry": {"type": "Point", "coordinates": [0, 0]}}
            ]}"#,
        );
        assert!(matches!(load_polygons(&path), Err(PipelineError::Format { .. })));
    }

    #[test]
    fn bare_geometry_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "bare.geojson",
            br#"{"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}"#,
        );
        assert!(matches!(load_polygons(&path), Err(PipelineError::Format { .. })));
    }

    #[test]
    fn missing_and_unsupported_files_are_io_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nothing.shp");
        assert!(matches!(load_polygons(&missing), Err(PipelineError::Io { .. })));

        let kml = write_file(&dir, "areas.kml", b"<kml/>");
        match load_polygons(&kml) {
            Err(PipelineError::Io { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::Unsupported)
            }
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn loads_cp1252_table_with_inferred_types() {
        let dir = TempDir::new().unwrap();
        // 0xE9 is 'é' in windows-1252 and invalid on its own in UTF-8
        let mut bytes = b"Area_name,Happiness,Code\n".to_vec();
        bytes.extend_from_slice(b"Caf\xe9 Town,7.1,E09\nCamden,.,E10\n");
        let path = write_file(&dir, "profiles.csv", &bytes);

        let options = TableOptions {
            encoding: "cp1252".to_string(),
            na_values: vec![".".to_string()],
            ..TableOptions::default()
        };
        let table = load_table_with(&path, &options).unwrap();
        assert_eq!(table.columns, vec!["Area_name", "Happiness", "Code"]);
        assert_eq!(table.value(0, "Area_name"), Some(&Scalar::from("Café Town")));
        assert_eq!(table.value(0, "Happiness"), Some(&Scalar::Number(7.1)));
        assert_eq!(table.value(1, "Happiness"), Some(&Scalar::Null));
        assert_eq!(table.value(1, "Code"), Some(&Scalar::from("E10")));
    }

    #[test]
    fn mixed_column_stays_text() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "t.csv", b"k,v\na,1\nb,x\nc,\n");
        let table = load_table(&path, "utf-8").unwrap();
        assert_eq!(table.value(0, "v"), Some(&Scalar::from("1")));
        assert_eq!(table.value(2, "v"), Some(&Scalar::Null));
    }

    #[test]
    fn utf8_bom_is_stripped_from_header() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "bom.csv", b"\xef\xbb\xbfid,value\n1,2\n");
        let table = load_table(&path, "utf-8").unwrap();
        assert_eq!(table.columns[0], "id");
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "latin.csv", b"name\nCaf\xe9\n");
        assert!(matches!(
            load_table(&path, "utf-8"),
            Err(PipelineError::Encoding { .. })
        ));
    }

    #[test]
    fn unknown_encoding_label_is_an_encoding_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "t.csv", b"a\n1\n");
        assert!(matches!(
            load_table(&path, "klingon-8"),
            Err(PipelineError::Encoding { .. })
        ));
    }

    #[test]
    fn missing_table_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_table(&dir.path().join("absent.csv"), "utf-8"),
            Err(PipelineError::Io { .. })
        ));
    }

    #[test]
    fn ragged_rows_are_a_table_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "ragged.csv", b"a,b\n1,2,3\n");
        assert!(matches!(
            load_table(&path, "utf-8"),
            Err(PipelineError::Table { .. })
        ));
    }
}
