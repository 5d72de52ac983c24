//! Document model for one experimental run.
//!
//! A run is delivered as a stream of four document kinds: a `start` document,
//! any interleaving of `descriptor` and data-record documents, and a `stop`
//! document. Each document carries a nested key/value body (string keys;
//! scalar, string, array, or nested-object values) that header and row
//! templates are rendered against.
//!
//! Bodies are kept as [`serde_json::Value`] objects so that templates can
//! reach arbitrarily deep paths like `md[XDI][Element_symbol]`. The typed
//! accessors on each variant expose only the fields the serializer itself
//! depends on; everything else stays opaque.

use serde_json::Value;

/// Errors raised while validating an incoming document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The document body was not a JSON object.
    #[error("{kind} document body is not an object")]
    NotAnObject {
        /// Kind of the offending document.
        kind: DocumentKind,
    },

    /// A field the serializer depends on is absent.
    #[error("{kind} document is missing required field '{field}'")]
    MissingField {
        /// Kind of the offending document.
        kind: DocumentKind,
        /// Name of the absent field.
        field: &'static str,
    },

    /// A required field is present but has the wrong shape.
    #[error("{kind} document field '{field}' is not {expected}")]
    WrongType {
        /// Kind of the offending document.
        kind: DocumentKind,
        /// Name of the malformed field.
        field: &'static str,
        /// Shape the serializer expected.
        expected: &'static str,
    },

    /// The document name does not map to any of the four run document kinds.
    #[error("unknown document kind '{0}'")]
    UnknownKind(String),
}

/// The four document kinds that make up a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// Opens the run; carries run-wide metadata and the start timestamp.
    Start,
    /// Declares the data keys a stream of data records will carry.
    Descriptor,
    /// One row of measured values tied to a descriptor.
    DataRecord,
    /// Closes the run; carries the stop timestamp.
    Stop,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DocumentKind::Start => "start",
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::DataRecord => "data record",
            DocumentKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

fn require_str(
    body: &Value,
    kind: DocumentKind,
    field: &'static str,
) -> Result<String, DocumentError> {
    match body.get(field) {
        None => Err(DocumentError::MissingField { kind, field }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DocumentError::WrongType { kind, field, expected: "a string" }),
    }
}

fn require_f64(
    body: &Value,
    kind: DocumentKind,
    field: &'static str,
) -> Result<f64, DocumentError> {
    match body.get(field) {
        None => Err(DocumentError::MissingField { kind, field }),
        Some(v) => v
            .as_f64()
            .ok_or(DocumentError::WrongType { kind, field, expected: "a number" }),
    }
}

// An `event` carries one scalar per data key; wrap each into a length-1
// array so record bodies always look like event pages.
fn paginate(mut body: Value) -> Value {
    if let Some(data) = body.get_mut("data").and_then(Value::as_object_mut) {
        for value in data.values_mut() {
            if !value.is_array() {
                let scalar = value.take();
                *value = Value::Array(vec![scalar]);
            }
        }
    }
    body
}

fn require_object(body: &Value, kind: DocumentKind) -> Result<(), DocumentError> {
    if body.is_object() {
        Ok(())
    } else {
        Err(DocumentError::NotAnObject { kind })
    }
}

/// The run-opening document.
#[derive(Debug, Clone)]
pub struct StartDoc {
    uid: String,
    time: f64,
    body: Value,
}

impl StartDoc {
    /// Validate a start document body: must be an object with a string `uid`
    /// and a numeric `time`.
    pub fn new(body: Value) -> Result<Self, DocumentError> {
        require_object(&body, DocumentKind::Start)?;
        let uid = require_str(&body, DocumentKind::Start, "uid")?;
        let time = require_f64(&body, DocumentKind::Start, "time")?;
        Ok(Self { uid, time, body })
    }

    /// Unique identifier for the run.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Start timestamp in epoch seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Full nested body, for template rendering.
    pub fn body(&self) -> &Value {
        &self.body
    }
}

/// Declares the named data keys a stream of data records will carry.
#[derive(Debug, Clone)]
pub struct DescriptorDoc {
    uid: String,
    name: Option<String>,
    data_keys: Vec<String>,
    body: Value,
}

impl DescriptorDoc {
    /// Validate a descriptor body: must be an object with a string `uid` and
    /// an object-valued `data_keys`.
    pub fn new(body: Value) -> Result<Self, DocumentError> {
        require_object(&body, DocumentKind::Descriptor)?;
        let uid = require_str(&body, DocumentKind::Descriptor, "uid")?;
        let data_keys = match body.get("data_keys") {
            None => {
                return Err(DocumentError::MissingField {
                    kind: DocumentKind::Descriptor,
                    field: "data_keys",
                })
            }
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(_) => {
                return Err(DocumentError::WrongType {
                    kind: DocumentKind::Descriptor,
                    field: "data_keys",
                    expected: "an object",
                })
            }
        };
        let name = body.get("name").and_then(Value::as_str).map(str::to_owned);
        Ok(Self { uid, name, data_keys, body })
    }

    /// Unique identifier of this descriptor.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Stream name, when the upstream framework provides one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The declared data-key names.
    pub fn data_keys(&self) -> &[String] {
        &self.data_keys
    }

    /// Full nested body, for template rendering.
    pub fn body(&self) -> &Value {
        &self.body
    }
}

/// One row of measured values, tied to the descriptor it references.
#[derive(Debug, Clone)]
pub struct DataRecordDoc {
    descriptor: String,
    seq_num: Option<u64>,
    body: Value,
}

impl DataRecordDoc {
    /// Validate a data-record body: must be an object with a string
    /// `descriptor` reference and a `data` map.
    pub fn new(body: Value) -> Result<Self, DocumentError> {
        require_object(&body, DocumentKind::DataRecord)?;
        let descriptor = require_str(&body, DocumentKind::DataRecord, "descriptor")?;
        if !body.get("data").map(Value::is_object).unwrap_or(false) {
            return Err(DocumentError::MissingField {
                kind: DocumentKind::DataRecord,
                field: "data",
            });
        }
        let seq_num = body.get("seq_num").and_then(Value::as_u64);
        Ok(Self { descriptor, seq_num, body })
    }

    /// Identifier of the descriptor this record belongs to.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Sequence number within the stream, when present.
    pub fn seq_num(&self) -> Option<u64> {
        self.seq_num
    }

    /// Full nested body, for template rendering.
    pub fn body(&self) -> &Value {
        &self.body
    }
}

/// The run-closing document.
#[derive(Debug, Clone)]
pub struct StopDoc {
    time: f64,
    body: Value,
}

impl StopDoc {
    /// Validate a stop document body: must be an object with a numeric `time`.
    pub fn new(body: Value) -> Result<Self, DocumentError> {
        require_object(&body, DocumentKind::Stop)?;
        let time = require_f64(&body, DocumentKind::Stop, "time")?;
        Ok(Self { time, body })
    }

    /// Stop timestamp in epoch seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Full nested body, for template rendering.
    pub fn body(&self) -> &Value {
        &self.body
    }
}

/// A tagged variant over the four run document kinds.
#[derive(Debug, Clone)]
pub enum Document {
    /// Run start.
    Start(StartDoc),
    /// Data-stream descriptor.
    Descriptor(DescriptorDoc),
    /// One measured row.
    DataRecord(DataRecordDoc),
    /// Run stop.
    Stop(StopDoc),
}

impl Document {
    /// Build a document from a `(name, body)` pair as delivered by the
    /// upstream framework. Data records may arrive under the name `event`
    /// (one measurement per data key, wrapped into length-1 arrays so row
    /// templates can index uniformly) or `event_page` (already array-valued);
    /// any other name is an [`DocumentError::UnknownKind`].
    pub fn from_parts(name: &str, body: Value) -> Result<Self, DocumentError> {
        match name {
            "start" => Ok(Document::Start(StartDoc::new(body)?)),
            "descriptor" => Ok(Document::Descriptor(DescriptorDoc::new(body)?)),
            "event" => Ok(Document::DataRecord(DataRecordDoc::new(paginate(body))?)),
            "event_page" => Ok(Document::DataRecord(DataRecordDoc::new(body)?)),
            "stop" => Ok(Document::Stop(StopDoc::new(body)?)),
            other => Err(DocumentError::UnknownKind(other.to_owned())),
        }
    }

    /// The kind tag of this document.
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Start(_) => DocumentKind::Start,
            Document::Descriptor(_) => DocumentKind::Descriptor,
            Document::DataRecord(_) => DocumentKind::DataRecord,
            Document::Stop(_) => DocumentKind::Stop,
        }
    }

    /// The nested key/value body, for template rendering.
    pub fn body(&self) -> &Value {
        match self {
            Document::Start(d) => d.body(),
            Document::Descriptor(d) => d.body(),
            Document::DataRecord(d) => d.body(),
            Document::Stop(d) => d.body(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_doc_accessors() {
        let doc = StartDoc::new(json!({
            "uid": "abc",
            "time": 1_568_843_383.08,
            "md": {"XDI": {"Element_symbol": "A"}},
        }))
        .unwrap();

        assert_eq!(doc.uid(), "abc");
        assert!((doc.time() - 1_568_843_383.08).abs() < 1e-9);
        assert_eq!(doc.body()["md"]["XDI"]["Element_symbol"], "A");
    }

    #[test]
    fn test_start_doc_missing_time() {
        let err = StartDoc::new(json!({"uid": "abc"})).unwrap_err();
        assert!(matches!(
            err,
            DocumentError::MissingField { field: "time", .. }
        ));
    }

    #[test]
    fn test_descriptor_data_keys() {
        let doc = DescriptorDoc::new(json!({
            "uid": "d1",
            "name": "primary",
            "data_keys": {"det1": {}, "det2": {}},
        }))
        .unwrap();

        assert_eq!(doc.uid(), "d1");
        assert_eq!(doc.name(), Some("primary"));
        let mut keys = doc.data_keys().to_vec();
        keys.sort();
        assert_eq!(keys, vec!["det1", "det2"]);
    }

    #[test]
    fn test_data_record_requires_data_map() {
        let err = DataRecordDoc::new(json!({"descriptor": "d1"})).unwrap_err();
        assert!(matches!(
            err,
            DocumentError::MissingField { field: "data", .. }
        ));
    }

    #[test]
    fn test_from_parts_routes_event_names() {
        let body = json!({"descriptor": "d1", "data": {"det": [1.0]}});
        for name in ["event", "event_page"] {
            let doc = Document::from_parts(name, body.clone()).unwrap();
            assert_eq!(doc.kind(), DocumentKind::DataRecord);
        }
    }

    #[test]
    fn test_event_scalars_are_wrapped_into_arrays() {
        let doc = Document::from_parts(
            "event",
            json!({"descriptor": "d1", "data": {"det": 8979.0, "labels": ["a"]}}),
        )
        .unwrap();

        // Scalars become length-1 arrays so `{data[det][0]}` templates
        // index uniformly; already-array values are left alone.
        assert_eq!(doc.body()["data"]["det"], json!([8979.0]));
        assert_eq!(doc.body()["data"]["labels"], json!(["a"]));

        // An event page is taken as-is.
        let page = Document::from_parts(
            "event_page",
            json!({"descriptor": "d1", "data": {"det": [8979.0]}}),
        )
        .unwrap();
        assert_eq!(page.body()["data"]["det"], json!([8979.0]));
    }

    #[test]
    fn test_from_parts_unknown_kind() {
        let err = Document::from_parts("resource", json!({})).unwrap_err();
        assert!(matches!(err, DocumentError::UnknownKind(name) if name == "resource"));
    }
}
