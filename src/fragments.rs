//! Positioned text fragments from a document-extraction service.
//!
//! We read the JSON that Document AI style processors return: a flat list
//! of `entities`, each with a type, the matched text, and a page anchor with
//! a normalized bounding polygon.

use serde_json::Value;

use crate::prelude::*;

/// What kind of field a fragment holds.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldLabel {
    /// The voter identifier. One per record, near its top.
    Identifier,
    PrintedSerial,
    Name,
    RelationName,
    HouseNo,
    Age,
    Gender,
    /// Unlabeled free text.
    Text,
}

impl FieldLabel {
    /// Map an extraction-service entity type to a label.
    pub fn from_entity_type(entity_type: &str) -> FieldLabel {
        match entity_type.trim().to_ascii_lowercase().as_str() {
            "voterid" | "voter_id" | "epic" => FieldLabel::Identifier,
            "sno" | "serial" => FieldLabel::PrintedSerial,
            "name" => FieldLabel::Name,
            "relativename" | "relative_name" | "relationname" => FieldLabel::RelationName,
            "houseno" | "house_no" | "housenumber" => FieldLabel::HouseNo,
            "age" => FieldLabel::Age,
            "sex" | "gender" => FieldLabel::Gender,
            _ => FieldLabel::Text,
        }
    }
}

/// A positioned span of recognized text.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Fragment {
    /// Zero-based page number.
    pub page: usize,
    /// Normalized horizontal position, 0 at the left edge.
    pub x: f64,
    /// Normalized vertical position, 0 at the top edge.
    pub y: f64,
    pub label: FieldLabel,
    pub text: String,
}

/// The parts of an extraction document we care about.
#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    entities: Vec<RawEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntity {
    #[serde(rename = "type", default)]
    entity_type: String,
    #[serde(default)]
    mention_text: String,
    page_anchor: Option<RawPageAnchor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPageAnchor {
    #[serde(default)]
    page_refs: Vec<RawPageRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPageRef {
    /// Serialized protobuf `int64`s arrive as strings, but be lenient.
    #[serde(default)]
    page: Option<Value>,
    bounding_poly: Option<RawBoundingPoly>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBoundingPoly {
    #[serde(default)]
    normalized_vertices: Vec<RawVertex>,
}

#[derive(Debug, Deserialize)]
struct RawVertex {
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

/// Parse a page number that may be a JSON string or number. Missing means
/// page 0.
fn parse_page(page: Option<&Value>) -> Result<usize> {
    match page {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| anyhow!("invalid page number {n}")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid page number {s:?}")),
        Some(other) => Err(anyhow!("invalid page number {other}")),
    }
}

impl RawEntity {
    /// Convert to a [`Fragment`], or `None` if the entity has no position.
    fn into_fragment(self) -> Result<Option<Fragment>> {
        let Some(page_ref) = self
            .page_anchor
            .and_then(|anchor| anchor.page_refs.into_iter().next())
        else {
            return Ok(None);
        };
        let page = parse_page(page_ref.page.as_ref())?;
        let Some(vertex) = page_ref
            .bounding_poly
            .and_then(|poly| poly.normalized_vertices.into_iter().next())
        else {
            return Ok(None);
        };
        Ok(Some(Fragment {
            page,
            x: vertex.x,
            y: vertex.y,
            label: FieldLabel::from_entity_type(&self.entity_type),
            text: self.mention_text,
        }))
    }
}

/// Parse extraction-service JSON into fragments. Entities without a position
/// can't be placed on a page, so they are skipped.
pub fn parse_document_fragments(json: &str) -> Result<Vec<Fragment>> {
    let doc: RawDocument =
        serde_json::from_str(json).context("failed to parse extraction JSON")?;
    let total = doc.entities.len();
    let mut fragments = Vec::with_capacity(total);
    for entity in doc.entities {
        if let Some(fragment) = entity.into_fragment()? {
            fragments.push(fragment);
        }
    }
    if fragments.len() < total {
        debug!(
            skipped = total - fragments.len(),
            "Skipped entities without a page position"
        );
    }
    Ok(fragments)
}

/// Load extraction-service JSON from a file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn load_document_fragments(path: &Path) -> Result<Vec<Fragment>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {:?}", path))?;
    parse_document_fragments(&json).with_context(|| format!("in {:?}", path))
}
