use serde::{Deserialize, Serialize};

/// Storage type of a metric cache column.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Text,
    Integer,
    Float,
    Boolean,
    DateTime,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::DateTime => "datetime",
        }
    }

    /// String columns are created non-null with an empty default.
    pub fn is_string(self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Text)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl MetricValue {
    pub fn is_null(&self) -> bool {
        matches!(self, MetricValue::Null)
    }

    /// Infinite and NaN results are stored as null.
    pub fn normalized(self) -> Self {
        match self {
            MetricValue::Real(value) if !value.is_finite() => MetricValue::Null,
            other => other,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Integer(value) => Some(*value),
            MetricValue::Real(value) if value.fract() == 0.0 && value.is_finite() => {
                Some(*value as i64)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Integer(value) => Some(*value as f64),
            MetricValue::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn to_sql_value(&self) -> sea_query::Value {
        match self {
            MetricValue::Null => sea_query::Value::BigInt(None),
            MetricValue::Integer(value) => sea_query::Value::BigInt(Some(*value)),
            MetricValue::Real(value) => sea_query::Value::Double(Some(*value)),
            MetricValue::Text(value) => sea_query::Value::String(Some(Box::new(value.clone()))),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

impl From<i32> for MetricValue {
    fn from(value: i32) -> Self {
        MetricValue::Integer(i64::from(value))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Real(value)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Integer(i64::from(value))
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl<T> From<Option<T>> for MetricValue
where
    T: Into<MetricValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(MetricValue::Null, Into::into)
    }
}
