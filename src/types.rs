use geo::MultiPolygon;
use std::fmt;

/// A single attribute cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Text(String),
    Number(f64),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Hashable form of the value. Used for join lookups and de-duplication.
    pub fn key(&self) -> ScalarKey {
        match self {
            Scalar::Null => ScalarKey::Null,
            Scalar::Text(s) => ScalarKey::Text(s.clone()),
            // -0.0 and 0.0 must land on the same key
            Scalar::Number(n) if *n == 0.0 => ScalarKey::Number(0.0f64.to_bits()),
            Scalar::Number(n) => ScalarKey::Number(n.to_bits()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Text(s) => write!(f, "{}", s),
            Scalar::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarKey {
    Null,
    Text(String),
    Number(u64),
}

#[derive(Debug, Clone)]
pub struct PolygonRecord {
    pub geometry: MultiPolygon<f64>,
    // One value per column of the owning dataset
    pub values: Vec<Scalar>,
}

/// Polygons with attributes, in file order.
#[derive(Debug, Clone, Default)]
pub struct PolygonDataset {
    pub columns: Vec<String>,
    pub records: Vec<PolygonRecord>,
}

impl PolygonDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Scalar> {
        let idx = self.column_index(column)?;
        self.records.get(row).and_then(|r| r.values.get(idx))
    }
}

/// Rows read from delimited text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl AttributeTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Scalar> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

/// Polygons with table attributes attached.
#[derive(Debug, Clone, Default)]
pub struct JoinedDataset {
    pub dataset: PolygonDataset,
    // Polygon key values that found no row in the table
    pub unmatched: Vec<Scalar>,
}

impl From<PolygonDataset> for JoinedDataset {
    fn from(dataset: PolygonDataset) -> Self {
        JoinedDataset {
            dataset,
            unmatched: Vec::new(),
        }
    }
}
