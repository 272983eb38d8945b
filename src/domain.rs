use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::HarvestError;

static STORAGE_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(s3|gs)://([^/]+)/(.+)$").expect("valid storage URI regex"));

/// Path-like identifier of one portal entity, e.g. `/measurement-sets/IGVFDS2259DWKL/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Second path segment: `/sequence-files/IGVFFI1517VBJH/` -> `IGVFFI1517VBJH`.
    pub fn accession(&self) -> Option<&str> {
        self.0.split('/').nth(2).filter(|segment| !segment.is_empty())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let id = Self(trimmed.to_string());
        let has_collection = trimmed
            .split('/')
            .nth(1)
            .map(|segment| !segment.is_empty())
            .unwrap_or(false);
        if !trimmed.starts_with('/') || !has_collection || id.accession().is_none() {
            return Err(HarvestError::InvalidEntityId(value.to_string()));
        }
        Ok(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    File,
    FileSet,
    Sample,
    Donor,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::File,
        EntityKind::FileSet,
        EntityKind::Sample,
        EntityKind::Donor,
    ];

    /// Workspace table name.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::File => "files",
            EntityKind::FileSet => "file_sets",
            EntityKind::Sample => "samples",
            EntityKind::Donor => "donors",
        }
    }

    /// Leading header cell of the kind's table.
    pub fn id_column(&self) -> &'static str {
        match self {
            EntityKind::File => "file_id",
            EntityKind::FileSet => "file_set_id",
            EntityKind::Sample => "sample_id",
            EntityKind::Donor => "donor_id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_name())
    }
}

/// One portal record as returned with `frame=object`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: EntityId,
    fields: Map<String, Value>,
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Entity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::<String, Value>::deserialize(deserializer)?;
        Entity::from_map(fields).map_err(serde::de::Error::custom)
    }
}

impl Entity {
    pub fn from_value(value: Value) -> Result<Self, HarvestError> {
        match value {
            Value::Object(fields) => Self::from_map(fields),
            other => Err(HarvestError::MalformedEntity(format!(
                "expected object, got {other}"
            ))),
        }
    }

    pub fn from_map(fields: Map<String, Value>) -> Result<Self, HarvestError> {
        let id = fields
            .get("@id")
            .and_then(Value::as_str)
            .map(EntityId::new)
            .ok_or_else(|| HarvestError::MalformedEntity("missing @id".to_string()))?;
        Ok(Self { id, fields })
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// First element of `@type`, the most specific type marker.
    pub fn type_name(&self) -> Option<&str> {
        match self.fields.get("@type") {
            Some(Value::Array(types)) => types.first().and_then(Value::as_str),
            Some(Value::String(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn accession(&self) -> Option<&str> {
        self.get_str("accession")
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Identifier references held by `field`, either a single id or a list of ids.
    /// Embedded objects contribute their own `@id`.
    pub fn references(&self, field: &str) -> Vec<EntityId> {
        match self.fields.get(field) {
            Some(value) => reference_ids(value),
            None => Vec::new(),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

pub fn reference_ids(value: &Value) -> Vec<EntityId> {
    match value {
        Value::String(id) if !id.is_empty() => vec![EntityId::new(id.clone())],
        Value::Object(object) => object
            .get("@id")
            .and_then(Value::as_str)
            .map(|id| vec![EntityId::new(id)])
            .unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(reference_ids).collect(),
        _ => Vec::new(),
    }
}

/// Object location in a cloud bucket, `s3://bucket/path` or `gs://bucket/path`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageUri {
    pub scheme: String,
    pub bucket: String,
    pub path: String,
}

impl StorageUri {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.path)
    }
}

impl FromStr for StorageUri {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let captures = STORAGE_URI
            .captures(value.trim())
            .ok_or_else(|| HarvestError::InvalidStorageUri(value.to_string()))?;
        Ok(Self {
            scheme: captures[1].to_string(),
            bucket: captures[2].to_string(),
            path: captures[3].to_string(),
        })
    }
}
