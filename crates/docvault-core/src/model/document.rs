use base64::Engine as _;
use blake2::{Blake2s256, Digest as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DocvaultError, Result};

pub const BLOB_CLASS: &str = "core:class:Blob";
pub const LEGACY_BLOB_CLASS: &str = "core:class:BlobData";

/// Metadata field carrying the store-side content hash. Never part of content
/// comparisons.
pub const HASH_FIELD: &str = "%hash%";

/// Space assigned to restored documents that carry none.
pub const DEFAULT_SPACE: &str = "core:space:Workspace";

const TX_CLASS_PREFIX: &str = "core:class:Tx";
const OBJECT_SPACE_FIELD: &str = "objectSpace";

/// An ordinary document: identity, class and opaque attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_class")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    #[serde(rename = "%hash%", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            space: None,
            hash: None,
            attributes: Map::new(),
        }
    }

    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Binary payload metadata. Bytes travel separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_class")]
    pub class: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    #[serde(rename = "%hash%", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl BlobDoc {
    pub fn new(id: impl Into<String>, content_type: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            class: BLOB_CLASS.to_string(),
            content_type: content_type.into(),
            size,
            etag: String::new(),
            provider: String::new(),
            space: Some(DEFAULT_SPACE.to_string()),
            hash: None,
            attributes: Map::new(),
        }
    }
}

/// A document as handled by backup and restore, discriminated by `_class`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Doc {
    Plain(Document),
    Blob(BlobDoc),
}

/// Result of decoding a stored document: legacy blob shapes may carry their
/// bytes inline.
#[derive(Debug)]
pub struct LoadedDoc {
    pub doc: Doc,
    pub inline_data: Option<Vec<u8>>,
}

impl Doc {
    /// Decode a document, migrating legacy `BlobData` shapes into a [`BlobDoc`]
    /// whose inline base64 payload is returned separately.
    pub fn from_value(value: Value) -> Result<LoadedDoc> {
        let class = value
            .get("_class")
            .and_then(Value::as_str)
            .ok_or_else(|| DocvaultError::InvalidDocument("missing _class".into()))?
            .to_string();
        if value.get("_id").and_then(Value::as_str).is_none() {
            return Err(DocvaultError::InvalidDocument(format!(
                "missing _id on {class} document"
            )));
        }

        match class.as_str() {
            BLOB_CLASS => Ok(LoadedDoc {
                doc: Doc::Blob(serde_json::from_value(value)?),
                inline_data: None,
            }),
            LEGACY_BLOB_CLASS => migrate_blob_data(value),
            _ => Ok(LoadedDoc {
                doc: Doc::Plain(serde_json::from_value(value)?),
                inline_data: None,
            }),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<LoadedDoc> {
        Self::from_value(serde_json::from_slice(data)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn id(&self) -> &str {
        match self {
            Doc::Plain(d) => &d.id,
            Doc::Blob(b) => &b.id,
        }
    }

    pub fn class(&self) -> &str {
        match self {
            Doc::Plain(d) => &d.class,
            Doc::Blob(b) => &b.class,
        }
    }

    pub fn hash(&self) -> Option<&str> {
        match self {
            Doc::Plain(d) => d.hash.as_deref(),
            Doc::Blob(b) => b.hash.as_deref(),
        }
    }

    pub fn set_hash(&mut self, hash: Option<String>) {
        match self {
            Doc::Plain(d) => d.hash = hash,
            Doc::Blob(b) => b.hash = hash,
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Doc::Blob(_))
    }

    /// Equality of everything except the hash metadata field.
    pub fn content_eq(&self, other: &Doc) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.set_hash(None);
        b.set_hash(None);
        a == b
    }

    /// Stable hash of the document content, excluding the hash field.
    pub fn content_hash(&self) -> Result<String> {
        let mut bare = self.clone();
        bare.set_hash(None);
        let json = bare.to_json()?;
        Ok(hex::encode(Blake2s256::digest(&json)))
    }

    /// Fill in the default space (and `objectSpace` for transactions) where
    /// missing.
    pub fn apply_default_space(&mut self) {
        match self {
            Doc::Plain(d) => {
                if d.space.is_none() {
                    d.space = Some(DEFAULT_SPACE.to_string());
                }
                if d.class.starts_with(TX_CLASS_PREFIX)
                    && d.attributes
                        .get(OBJECT_SPACE_FIELD)
                        .is_none_or(Value::is_null)
                {
                    d.attributes.insert(
                        OBJECT_SPACE_FIELD.to_string(),
                        Value::String(DEFAULT_SPACE.to_string()),
                    );
                }
            }
            Doc::Blob(b) => {
                if b.space.is_none() {
                    b.space = Some(DEFAULT_SPACE.to_string());
                }
            }
        }
    }

    /// Serialized size used to bound upload batches.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

fn migrate_blob_data(mut value: Value) -> Result<LoadedDoc> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| DocvaultError::InvalidDocument("document is not an object".into()))?;

    let legacy_type = obj.remove("type");
    let encoded = obj.remove("base64Data");
    if obj.get("contentType").is_none_or(Value::is_null) {
        if let Some(t) = legacy_type {
            obj.insert("contentType".into(), t);
        }
    }
    obj.insert("_class".into(), Value::String(BLOB_CLASS.to_string()));

    let inline_data = match encoded.as_ref().and_then(Value::as_str) {
        Some(text) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| DocvaultError::InvalidDocument(format!("base64Data: {e}")))?,
        ),
        None => None,
    };

    let mut blob: BlobDoc = serde_json::from_value(value)?;
    if let Some(data) = &inline_data {
        if blob.size == 0 {
            blob.size = data.len() as u64;
        }
    }
    Ok(LoadedDoc {
        doc: Doc::Blob(blob),
        inline_data,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn plain_document_keeps_unknown_attributes() {
        let loaded = Doc::from_value(json!({
            "_id": "task-1",
            "_class": "tracker:class:Issue",
            "space": "space-1",
            "%hash%": "\"abc\"",
            "title": "Fix login",
            "rank": 3
        }))
        .unwrap();
        let Doc::Plain(doc) = &loaded.doc else {
            panic!("expected plain document");
        };
        assert_eq!(doc.hash.as_deref(), Some("\"abc\""));
        assert_eq!(doc.attributes["title"], "Fix login");

        let back: Value = serde_json::from_slice(&loaded.doc.to_json().unwrap()).unwrap();
        assert_eq!(back["rank"], 3);
        assert_eq!(back["_class"], "tracker:class:Issue");
    }

    #[test]
    fn blob_class_decodes_to_blob() {
        let loaded = Doc::from_value(json!({
            "_id": "b1",
            "_class": BLOB_CLASS,
            "contentType": "application/pdf",
            "size": 10,
            "etag": "e1",
            "provider": "fs"
        }))
        .unwrap();
        let Doc::Blob(blob) = loaded.doc else {
            panic!("expected blob");
        };
        assert_eq!(blob.content_type, "application/pdf");
        assert_eq!(blob.size, 10);
        assert!(loaded.inline_data.is_none());
    }

    #[test]
    fn legacy_blob_data_is_migrated() {
        let loaded = Doc::from_value(json!({
            "_id": "old",
            "_class": LEGACY_BLOB_CLASS,
            "type": "text/plain",
            "base64Data": "aGVsbG8="
        }))
        .unwrap();
        let Doc::Blob(blob) = loaded.doc else {
            panic!("expected blob");
        };
        assert_eq!(blob.class, BLOB_CLASS);
        assert_eq!(blob.content_type, "text/plain");
        assert_eq!(blob.size, 5);
        assert!(!blob.attributes.contains_key("base64Data"));
        assert_eq!(loaded.inline_data.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn missing_discriminator_is_rejected() {
        assert!(Doc::from_value(json!({"_id": "x"})).is_err());
        assert!(Doc::from_value(json!({"_class": "c"})).is_err());
    }

    #[test]
    fn content_eq_ignores_hash() {
        let a = Doc::Plain(Document::new("a", "c").with_attr("n", 1));
        let mut b = a.clone();
        b.set_hash(Some("h".into()));
        assert!(a.content_eq(&b));
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());

        let c = Doc::Plain(Document::new("a", "c").with_attr("n", 2));
        assert!(!a.content_eq(&c));
    }

    #[test]
    fn default_space_fills_tx_object_space() {
        let mut tx = Doc::Plain(Document::new("tx1", "core:class:TxCreateDoc"));
        tx.apply_default_space();
        let Doc::Plain(tx) = tx else { unreachable!() };
        assert_eq!(tx.space.as_deref(), Some(DEFAULT_SPACE));
        assert_eq!(tx.attributes[OBJECT_SPACE_FIELD], DEFAULT_SPACE);

        let mut kept = Doc::Plain(Document::new("d", "c").with_space("mine"));
        kept.apply_default_space();
        let Doc::Plain(kept) = kept else { unreachable!() };
        assert_eq!(kept.space.as_deref(), Some("mine"));
        assert!(!kept.attributes.contains_key(OBJECT_SPACE_FIELD));
    }
}
