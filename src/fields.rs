use std::collections::{BTreeMap, BTreeSet};
use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;

use crate::cache::EntityCache;
use crate::domain::{Entity, EntityId, EntityKind, StorageUri, reference_ids};
use crate::error::HarvestError;
use crate::manifest::destination_path;
use crate::portal::PortalClient;
use crate::walker::HarvestResult;

pub const FILE_FIELDS: &[&str] = &[
    "type",
    "summary",
    "assay_titles",
    "content_type",
    "file_name",
    "file_format",
    "file_format_type",
    "file_size",
    "file_md5sum",
    "file_set",
    "seqspecs",
    "workflow",
    "derived_from",
    "reference_assembly",
    "cell_type_annotation",
    "flowcell_id",
    "illumina_read_type",
    "lane",
    "mean_read_length",
    "sequencing_kit",
    "sequencing_platform",
    "sequencing_run",
    "transcriptome_annotation",
];

pub const FILE_SET_FIELDS: &[&str] = &[
    "type",
    "assay_term",
    "assay_titles",
    "files",
    "associated_phenotypes",
    "auxiliary_sets",
    "average_guide_coverage",
    "average_insert_size",
    "award",
    "barcode_map",
    "construct_library_sets",
    "control_file_sets",
    "exon",
    "file_set_type",
    "guide_type",
    "input_file_sets",
    "lab",
    "preferred_assay_title",
    "sample_summary",
    "samples",
    "scope",
    "selection_criteria",
    "sequencing_library_types",
    "small_scale_gene_list",
    "small_scale_loci_list",
    "summary",
    "targeted_genes",
];

pub const SAMPLE_FIELDS: &[&str] = &[
    "type",
    "summary",
    "sample_terms",
    "modifications",
    "targeted_sample_term",
    "biosample_type",
    "multiplexed_samples",
    "pooled_from",
    "donors",
    "construct_library_sets",
    "biosample_qualifiers",
    "embryonic",
    "sorted_fractions",
    "donor_age_at_collection_unit_upper_bound",
    "donor_age_at_collection_unit_lower_bound",
    "donor_age_at_collection_unit",
    "moi",
];

pub const DONOR_FIELDS: &[&str] = &[
    "type",
    "reported_ethnicity",
    "phenotypic_features",
    "phenotypic_sex",
    "organism_type",
];

/// Reference fields exported as accessions instead of full ids.
pub const IDENTIFIER_LINKS: &[&str] = &[
    "seqspecs",
    "derived_from",
    "file_set",
    "files",
    "input_file_sets",
    "samples",
    "donors",
    "file_id",
    "file_set_id",
];

pub fn field_list(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::File => FILE_FIELDS,
        EntityKind::FileSet => FILE_SET_FIELDS,
        EntityKind::Sample => SAMPLE_FIELDS,
        EntityKind::Donor => DONOR_FIELDS,
    }
}

/// Where the value of an exported column comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// The entity field of this name.
    Direct(&'static str),
    /// First element of `@type`.
    TypeMarker,
    /// The entity's own `@id`.
    Identifier,
    /// Last path segment of `s3_uri`.
    StorageFileName,
    /// Term id(s) in the named field, replaced by each term's `term_name`.
    TermName(&'static str),
    /// Phenotypic feature ids in the named field; each feature's `feature`
    /// term is resolved to its `term_name`, deduplicated and sorted.
    FeatureTermNames(&'static str),
}

struct FieldOverride {
    kind: Option<EntityKind>,
    field: &'static str,
    source: FieldSource,
}

const fn any_kind(field: &'static str, source: FieldSource) -> FieldOverride {
    FieldOverride {
        kind: None,
        field,
        source,
    }
}

const fn only(kind: EntityKind, field: &'static str, source: FieldSource) -> FieldOverride {
    FieldOverride {
        kind: Some(kind),
        field,
        source,
    }
}

const FIELD_OVERRIDES: &[FieldOverride] = &[
    any_kind("type", FieldSource::TypeMarker),
    any_kind("id", FieldSource::Identifier),
    any_kind("file_name", FieldSource::StorageFileName),
    any_kind("file_md5sum", FieldSource::Direct("md5sum")),
    only(EntityKind::File, "reference_assembly", FieldSource::Direct("assembly")),
    only(
        EntityKind::File,
        "sequencing_platform",
        FieldSource::TermName("sequencing_platform"),
    ),
    only(EntityKind::Donor, "organism_type", FieldSource::Direct("taxa")),
    only(EntityKind::Donor, "phenotypic_sex", FieldSource::Direct("sex")),
    only(
        EntityKind::Donor,
        "reported_ethnicity",
        FieldSource::Direct("ethnicities"),
    ),
    only(
        EntityKind::Donor,
        "phenotypic_features",
        FieldSource::FeatureTermNames("phenotypic_features"),
    ),
    only(
        EntityKind::Sample,
        "biosample_type",
        FieldSource::Direct("classifications"),
    ),
    only(
        EntityKind::Sample,
        "donor_age_at_collection_unit_upper_bound",
        FieldSource::Direct("upper_bound_age"),
    ),
    only(
        EntityKind::Sample,
        "donor_age_at_collection_unit_lower_bound",
        FieldSource::Direct("lower_bound_age"),
    ),
    only(
        EntityKind::Sample,
        "donor_age_at_collection_unit",
        FieldSource::Direct("age_units"),
    ),
    only(
        EntityKind::Sample,
        "sample_terms",
        FieldSource::TermName("sample_terms"),
    ),
    only(
        EntityKind::Sample,
        "targeted_sample_term",
        FieldSource::TermName("targeted_sample_term"),
    ),
];

pub fn field_source(kind: EntityKind, field: &'static str) -> FieldSource {
    FIELD_OVERRIDES
        .iter()
        .find(|entry| entry.field == field && entry.kind.is_none_or(|only| only == kind))
        .map(|entry| entry.source)
        .unwrap_or(FieldSource::Direct(field))
}

#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Bucket files are transferred into; used for the `file_path` column.
    pub destination_bucket: String,
    /// Prefix of the `portal_url` column.
    pub portal_ui_url: String,
}

/// Turns harvested entities into workspace table rows.
pub struct FieldResolver<'a, P: PortalClient> {
    cache: &'a mut EntityCache<P>,
}

impl<'a, P: PortalClient> FieldResolver<'a, P> {
    pub fn new(cache: &'a mut EntityCache<P>) -> Self {
        Self { cache }
    }

    /// One cell per entry of `fields`, in order.
    pub fn resolve_row(
        &mut self,
        entity: &Entity,
        fields: &[&'static str],
        kind: EntityKind,
    ) -> Result<Vec<String>, HarvestError> {
        let mut row = Vec::with_capacity(fields.len());
        for &field in fields {
            let value = self
                .resolve_value(entity, kind, field)?
                .ok_or_else(|| HarvestError::UnresolvedField {
                    kind: kind.to_string(),
                    id: entity.id().to_string(),
                    field: field.to_string(),
                })?;
            let value = if IDENTIFIER_LINKS.contains(&field) {
                to_accessions(&value)
            } else {
                value
            };
            row.push(serialize_cell(&value)?);
        }
        Ok(row)
    }

    fn resolve_value(
        &mut self,
        entity: &Entity,
        kind: EntityKind,
        field: &'static str,
    ) -> Result<Option<Value>, HarvestError> {
        let value = match field_source(kind, field) {
            FieldSource::Direct(name) => Some(entity.get(name).cloned().unwrap_or_else(empty)),
            FieldSource::TypeMarker => Some(
                entity
                    .type_name()
                    .map(|name| Value::String(name.into()))
                    .unwrap_or_else(empty),
            ),
            FieldSource::Identifier => Some(Value::String(entity.id().to_string())),
            FieldSource::StorageFileName => Some(
                entity
                    .get_str("s3_uri")
                    .and_then(|uri| uri.rsplit('/').next())
                    .map(|name| Value::String(name.to_string()))
                    .unwrap_or_else(empty),
            ),
            FieldSource::TermName(name) => Some(self.term_names(entity.get(name))?),
            FieldSource::FeatureTermNames(name) => {
                Some(self.feature_term_names(&entity.references(name))?)
            }
        };
        Ok(value)
    }

    /// Replaces term ids with term names, keeping the single/list shape.
    fn term_names(&mut self, source: Option<&Value>) -> Result<Value, HarvestError> {
        let Some(source) = source else {
            return Ok(empty());
        };
        let ids = reference_ids(source);
        if ids.is_empty() {
            return Ok(empty());
        }
        let unique: BTreeSet<EntityId> = ids.iter().cloned().collect();
        let terms = self.cache.batch_get(&unique)?;
        let names = ids
            .iter()
            .map(|id| {
                terms
                    .get(id)
                    .and_then(|term| term.get_str("term_name"))
                    .unwrap_or_default()
                    .to_string()
            })
            .collect::<Vec<_>>();
        Ok(match source {
            Value::Array(_) => Value::Array(names.into_iter().map(Value::String).collect()),
            _ => names.into_iter().next().map(Value::String).unwrap_or_else(empty),
        })
    }

    fn feature_term_names(&mut self, features: &[EntityId]) -> Result<Value, HarvestError> {
        if features.is_empty() {
            return Ok(empty());
        }
        let feature_ids: BTreeSet<EntityId> = features.iter().cloned().collect();
        let fetched = self.cache.batch_get(&feature_ids)?;
        let term_ids: BTreeSet<EntityId> = fetched
            .values()
            .flat_map(|feature| feature.references("feature"))
            .collect();
        if term_ids.is_empty() {
            return Ok(empty());
        }
        let terms = self.cache.batch_get(&term_ids)?;
        let names: BTreeSet<String> = terms
            .values()
            .filter_map(|term| term.get_str("term_name"))
            .map(str::to_string)
            .collect();
        Ok(Value::Array(names.into_iter().map(Value::String).collect()))
    }

    /// One TSV per entity kind: header row then one row per harvested entity.
    pub fn build_tables(
        &mut self,
        harvest: &HarvestResult,
        options: &TableOptions,
    ) -> Result<BTreeMap<EntityKind, String>, HarvestError> {
        let mut tables = BTreeMap::new();
        for kind in EntityKind::ALL {
            let table = self.build_table(kind, harvest.ids(kind), options)?;
            tracing::info!(table = kind.table_name(), rows = harvest.ids(kind).len(), "built table");
            tables.insert(kind, table);
        }
        Ok(tables)
    }

    fn build_table(
        &mut self,
        kind: EntityKind,
        ids: &[EntityId],
        options: &TableOptions,
    ) -> Result<String, HarvestError> {
        let fields = field_list(kind);
        let mut lines = Vec::with_capacity(ids.len() + 1);
        lines.push(table_header(kind).join("\t"));
        for id in ids {
            let entity = self.cache.require(id)?.clone();
            let mut row = vec![entity_accession(&entity)];
            if kind == EntityKind::File {
                let uri: StorageUri = entity
                    .get_str("s3_uri")
                    .ok_or_else(|| HarvestError::MissingStorageUri(id.to_string()))?
                    .parse()?;
                row.push(destination_path(&options.destination_bucket, &uri));
            }
            row.push(format!("{}{}", options.portal_ui_url, entity.id()));
            row.extend(self.resolve_row(&entity, fields, kind)?);
            lines.push(row.join("\t"));
        }
        Ok(lines.join("\n"))
    }
}

pub fn table_header(kind: EntityKind) -> Vec<&'static str> {
    let mut header = vec![kind.id_column()];
    if kind == EntityKind::File {
        header.push("file_path");
    }
    header.push("portal_url");
    header.extend_from_slice(field_list(kind));
    header
}

fn entity_accession(entity: &Entity) -> String {
    entity
        .accession()
        .or_else(|| entity.id().accession())
        .unwrap_or_default()
        .to_string()
}

fn empty() -> Value {
    Value::String(String::new())
}

fn accession_of(value: &Value) -> Option<Value> {
    let id = match value {
        Value::String(id) => id.as_str(),
        Value::Object(object) => object.get("@id").and_then(Value::as_str)?,
        _ => return None,
    };
    let id = EntityId::new(id);
    Some(Value::String(id.accession().unwrap_or(id.as_str()).to_string()))
}

fn to_accessions(value: &Value) -> Value {
    match value {
        Value::String(id) if id.is_empty() => empty(),
        Value::Array(items) => Value::Array(items.iter().filter_map(accession_of).collect()),
        other => accession_of(other).unwrap_or_else(|| other.clone()),
    }
}

/// Writes JSON with `", "` and `": "` separators.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    /// Non-ASCII characters are written as `\uXXXX` escapes, surrogate pairs
    /// outside the basic plane.
    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
                continue;
            }
            for unit in ch.encode_utf16(&mut units).iter() {
                write!(writer, "\\u{:04x}", *unit)?;
            }
        }
        Ok(())
    }
}

/// Renders one TSV cell. Lists and objects become JSON text, numbers their
/// decimal form, booleans `True`/`False`, null an empty cell.
pub fn serialize_cell(value: &Value) -> Result<String, HarvestError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(true) => Ok("True".to_string()),
        Value::Bool(false) => Ok("False".to_string()),
        Value::Number(number) => Ok(number.to_string()),
        Value::String(text) => Ok(text.replace(['\t', '\n', '\r'], " ")),
        Value::Array(_) | Value::Object(_) => {
            let mut buffer = Vec::new();
            let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, SpacedFormatter);
            value
                .serialize(&mut serializer)
                .map_err(|err| HarvestError::Serialize(err.to_string()))?;
            String::from_utf8(buffer).map_err(|err| HarvestError::Serialize(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn override_table_is_kind_scoped() {
        assert_eq!(
            field_source(EntityKind::Donor, "organism_type"),
            FieldSource::Direct("taxa")
        );
        assert_eq!(
            field_source(EntityKind::Sample, "organism_type"),
            FieldSource::Direct("organism_type")
        );
        assert_eq!(field_source(EntityKind::FileSet, "type"), FieldSource::TypeMarker);
        assert_eq!(
            field_source(EntityKind::File, "file_md5sum"),
            FieldSource::Direct("md5sum")
        );
    }

    #[test]
    fn cells_follow_export_format() {
        assert_eq!(serialize_cell(&json!(1242)).unwrap(), "1242");
        assert_eq!(serialize_cell(&json!(32.0)).unwrap(), "32.0");
        assert_eq!(serialize_cell(&json!(false)).unwrap(), "False");
        assert_eq!(serialize_cell(&json!(null)).unwrap(), "");
        assert_eq!(
            serialize_cell(&json!(["IGVFFI9831SEGU", "IGVFFI8905WBYU"])).unwrap(),
            r#"["IGVFFI9831SEGU", "IGVFFI8905WBYU"]"#
        );
        assert_eq!(serialize_cell(&json!({"a": 1, "b": [2]})).unwrap(), r#"{"a": 1, "b": [2]}"#);
        assert_eq!(serialize_cell(&json!({"b": 1, "a": 2})).unwrap(), r#"{"b": 1, "a": 2}"#);
        assert_eq!(
            serialize_cell(&json!(["Sjögren", "\u{1F9EC}"])).unwrap(),
            r#"["Sj\u00f6gren", "\ud83e\uddec"]"#
        );
        assert_eq!(serialize_cell(&json!("Sjögren")).unwrap(), "Sjögren");
        assert_eq!(serialize_cell(&json!("a\tb")).unwrap(), "a b");
    }

    #[test]
    fn identifier_links_become_accessions() {
        assert_eq!(
            to_accessions(&json!("/measurement-sets/IGVFDS2534CJYA/")),
            json!("IGVFDS2534CJYA")
        );
        assert_eq!(
            to_accessions(&json!(["/tabular-files/A/", "/matrix-files/B/"])),
            json!(["A", "B"])
        );
        assert_eq!(to_accessions(&json!([])), json!([]));
        assert_eq!(to_accessions(&json!("")), json!(""));
    }

    #[test]
    fn header_has_leading_columns() {
        let header = table_header(EntityKind::File);
        assert_eq!(&header[..4], &["file_id", "file_path", "portal_url", "type"]);
        assert_eq!(header.len(), FILE_FIELDS.len() + 3);
        let header = table_header(EntityKind::Donor);
        assert_eq!(&header[..2], &["donor_id", "portal_url"]);
    }
}
