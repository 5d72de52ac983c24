//! Incremental header resolution.
//!
//! The header of an XDI file is an ordered buffer of named fields whose
//! values trickle in over the lifetime of a run: some resolve from the start
//! document, some from a descriptor, and some (`Scan.end_time`) only from the
//! stop document. The buffer is seeded once from the template and then
//! updated with every document that arrives; a field that fails to resolve is
//! simply left pending, and the first successful resolution is permanent.
//!
//! Two field names bypass template rendering entirely and are filled from
//! document timestamps via one lookup table ([`SPECIAL_FIELDS`]):
//! `Scan.start_time` from the start document and `Scan.end_time` from the
//! stop document.
//!
//! Field order never changes after seeding: versions, then columns, then
//! required headers, then optional headers, each in template declaration
//! order. A field still unresolved at output time renders as the literal
//! `None`.

use chrono::{DateTime, Utc};

use crate::document::Document;
use crate::render::{Rendered, RenderError, ValueTemplate};
use crate::template::{ColumnDef, XdiTemplate};

/// Header field filled from the start document's timestamp.
pub const SCAN_START_TIME: &str = "Scan.start_time";

/// Header field filled from the stop document's timestamp.
pub const SCAN_END_TIME: &str = "Scan.end_time";

/// Separator between the `field = value` block and the column-label line.
pub const SEPARATOR_LINE: &str = "#----";

/// Literal written for fields still unresolved at output time.
pub const NONE_LITERAL: &str = "None";

type SpecialResolver = fn(&Document) -> Option<String>;

/// Fields whose values come from document timestamps, not templates.
const SPECIAL_FIELDS: &[(&str, SpecialResolver)] = &[
    (SCAN_START_TIME, resolve_scan_start_time),
    (SCAN_END_TIME, resolve_scan_end_time),
];

fn resolve_scan_start_time(doc: &Document) -> Option<String> {
    match doc {
        Document::Start(start) => Some(iso8601(start.time())),
        _ => None,
    }
}

fn resolve_scan_end_time(doc: &Document) -> Option<String> {
    match doc {
        Document::Stop(stop) => Some(iso8601(stop.time())),
        _ => None,
    }
}

fn special_resolver(name: &str) -> Option<SpecialResolver> {
    SPECIAL_FIELDS
        .iter()
        .find(|(field, _)| *field == name)
        .map(|(_, resolver)| *resolver)
}

/// Convert an epoch-seconds timestamp to ISO-8601 text (UTC, microsecond
/// precision, no offset suffix).
pub fn iso8601(epoch_seconds: f64) -> String {
    // Rounding to whole microseconds first lets a fraction just below a
    // second boundary roll over into the next second.
    let micros = (epoch_seconds * 1e6).round() as i64;
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    match DateTime::<Utc>::from_timestamp(secs, nanos) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        None => epoch_seconds.to_string(),
    }
}

#[derive(Debug, Clone)]
enum FieldSource {
    /// A version line; resolved at seeding, never re-rendered.
    Literal,
    /// A column: the rendered label, optionally suffixed with units.
    Label {
        template: ValueTemplate,
        units: Option<String>,
    },
    /// A required/optional header entry's `data` template, when declared.
    Data(Option<ValueTemplate>),
}

#[derive(Debug, Clone)]
struct HeaderField {
    name: String,
    source: FieldSource,
    required: bool,
    value: Option<String>,
}

/// Ordered buffer of header fields, progressively resolved over a run.
#[derive(Debug, Clone)]
pub struct HeaderBuffer {
    fields: Vec<HeaderField>,
}

impl HeaderBuffer {
    /// Seed the buffer from a template and perform the first resolution pass
    /// against the start document.
    pub fn initialize(template: &XdiTemplate, start: &Document) -> Result<Self, RenderError> {
        let mut fields = Vec::new();

        for (name, line) in template.versions() {
            fields.push(HeaderField {
                name: name.clone(),
                source: FieldSource::Literal,
                required: false,
                value: Some(line.clone()),
            });
        }
        for column in template.columns() {
            fields.push(HeaderField {
                name: column.name().to_owned(),
                source: FieldSource::Label {
                    template: column.label_template().clone(),
                    units: column.units().map(str::to_owned),
                },
                required: false,
                value: None,
            });
        }
        for spec in template.required_headers() {
            fields.push(HeaderField {
                name: spec.name().to_owned(),
                source: FieldSource::Data(spec.data().cloned()),
                required: true,
                value: None,
            });
        }
        for spec in template.optional_headers() {
            fields.push(HeaderField {
                name: spec.name().to_owned(),
                source: FieldSource::Data(spec.data().cloned()),
                required: false,
                value: None,
            });
        }

        let mut buffer = Self { fields };
        buffer.update(start)?;
        Ok(buffer)
    }

    /// Attempt to resolve every still-pending field against one incoming
    /// document. Already-resolved fields are untouched; a field that still
    /// cannot resolve stays pending.
    pub fn update(&mut self, doc: &Document) -> Result<(), RenderError> {
        for field in self.fields.iter_mut().filter(|f| f.value.is_none()) {
            // Special fields resolve only through their timestamp resolver,
            // regardless of any competing template.
            if let Some(resolver) = special_resolver(&field.name) {
                field.value = resolver(doc);
                continue;
            }

            let rendered = match &field.source {
                FieldSource::Literal => continue,
                FieldSource::Data(None) => continue,
                FieldSource::Data(Some(template)) => template.render(doc.body())?,
                FieldSource::Label { template, units } => match template.render(doc.body())? {
                    Rendered::Resolved(label) => match units {
                        Some(units) => Rendered::Resolved(format!("{label} {units}")),
                        None => Rendered::Resolved(label),
                    },
                    unresolved => unresolved,
                },
            };

            match rendered {
                Rendered::Resolved(value) => field.value = Some(value),
                Rendered::Unresolved(reference) => {
                    log::debug!(
                        "header field '{}' still pending: no value for '{}' in {} document",
                        field.name,
                        reference,
                        doc.kind()
                    );
                }
            }
        }
        Ok(())
    }

    /// Resolved value of a field, if any.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.value.as_deref())
    }

    /// Field names in buffer order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Names of required header fields that never resolved.
    pub fn unresolved_required(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.required && f.value.is_none())
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Render the complete header block: version lines, `# field = value`
    /// lines in buffer order (`None` for pending fields), the separator, and
    /// the tab-joined column-label line.
    pub fn render_block(&self, columns: &[ColumnDef]) -> String {
        let mut out = String::new();
        for field in &self.fields {
            let is_version = matches!(field.source, FieldSource::Literal);
            let value = field.value.as_deref().unwrap_or(NONE_LITERAL);
            // The XDI version line carries its own comment prefix and is
            // written as-is; every other field becomes a `# name = value`
            // comment line.
            if is_version && field.name == "XDI" {
                out.push_str(value);
                out.push('\n');
            } else {
                out.push_str(&format!("# {} = {}\n", field.name, value));
            }
        }
        out.push_str(SEPARATOR_LINE);
        out.push('\n');
        let labels: Vec<&str> = columns.iter().map(ColumnDef::label).collect();
        out.push_str(&format!("# {}\n", labels.join("\t")));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DataRecordDoc, DescriptorDoc, StartDoc, StopDoc};
    use crate::template::XdiTemplate;
    use serde_json::json;

    const TEMPLATE: &str = r##"
[versions]
"XDI"             = "# XDI/1.0 Bluesky"

[columns]
"Column.1"        = {column_label="energy", data_key="det", column_data="{data[det][0]}", units="eV"}

[required_headers]
"Element.symbol"  = {data="{md[XDI][Element_symbol]}"}

[optional_headers]
"Facility.name"   = {data="{md[NX][Source][name]}"}
"Scan.start_time" = {}
"Scan.end_time"   = {}
"##;

    fn template() -> XdiTemplate {
        XdiTemplate::from_toml_str(TEMPLATE).unwrap()
    }

    fn start_doc(body: serde_json::Value) -> Document {
        Document::Start(StartDoc::new(body).unwrap())
    }

    #[test]
    fn test_field_order_is_section_concatenation() {
        let start = start_doc(json!({"uid": "u", "time": 0.0}));
        let buffer = HeaderBuffer::initialize(&template(), &start).unwrap();
        let names: Vec<_> = buffer.field_names().collect();
        assert_eq!(
            names,
            vec![
                "XDI",
                "Column.1",
                "Element.symbol",
                "Facility.name",
                "Scan.start_time",
                "Scan.end_time",
            ]
        );
    }

    #[test]
    fn test_initialize_resolves_from_start() {
        let start = start_doc(json!({
            "uid": "u",
            "time": 0.0,
            "md": {"XDI": {"Element_symbol": "A"}},
        }));
        let buffer = HeaderBuffer::initialize(&template(), &start).unwrap();

        assert_eq!(buffer.value("XDI"), Some("# XDI/1.0 Bluesky"));
        assert_eq!(buffer.value("Column.1"), Some("energy eV"));
        assert_eq!(buffer.value("Element.symbol"), Some("A"));
        assert_eq!(buffer.value("Facility.name"), None);
        assert_eq!(buffer.value("Scan.end_time"), None);
    }

    #[test]
    fn test_first_resolution_wins() {
        let start = start_doc(json!({
            "uid": "u",
            "time": 0.0,
            "md": {"XDI": {"Element_symbol": "first"}},
        }));
        let mut buffer = HeaderBuffer::initialize(&template(), &start).unwrap();

        let descriptor = Document::Descriptor(
            DescriptorDoc::new(json!({
                "uid": "d1",
                "data_keys": {"det": {}},
                "md": {"XDI": {"Element_symbol": "second"}},
            }))
            .unwrap(),
        );
        buffer.update(&descriptor).unwrap();
        assert_eq!(buffer.value("Element.symbol"), Some("first"));
    }

    #[test]
    fn test_late_resolution_from_descriptor() {
        let start = start_doc(json!({"uid": "u", "time": 0.0}));
        let mut buffer = HeaderBuffer::initialize(&template(), &start).unwrap();
        assert_eq!(buffer.value("Element.symbol"), None);

        let descriptor = Document::Descriptor(
            DescriptorDoc::new(json!({
                "uid": "d1",
                "data_keys": {"det": {}},
                "md": {"XDI": {"Element_symbol": "A"}},
            }))
            .unwrap(),
        );
        buffer.update(&descriptor).unwrap();
        assert_eq!(buffer.value("Element.symbol"), Some("A"));
    }

    #[test]
    fn test_scan_times_come_from_timestamps() {
        let start = start_doc(json!({"uid": "u", "time": 1_568_843_383.0}));
        let mut buffer = HeaderBuffer::initialize(&template(), &start).unwrap();
        assert_eq!(buffer.value(SCAN_START_TIME), Some("2019-09-18T21:49:43.000000"));

        // A data record must not resolve Scan.end_time.
        let record = Document::DataRecord(
            DataRecordDoc::new(json!({
                "descriptor": "d1",
                "data": {"det": [1.0]},
                "time": 1_568_843_400.0,
            }))
            .unwrap(),
        );
        buffer.update(&record).unwrap();
        assert_eq!(buffer.value(SCAN_END_TIME), None);

        let stop = Document::Stop(StopDoc::new(json!({"time": 1_568_843_500.5})).unwrap());
        buffer.update(&stop).unwrap();
        assert_eq!(buffer.value(SCAN_END_TIME), Some("2019-09-18T21:51:40.500000"));
    }

    #[test]
    fn test_iso8601_rolls_over_at_second_boundary() {
        assert_eq!(iso8601(1_000_000_000.999_999_9), "2001-09-09T01:46:41.000000");
        assert_eq!(iso8601(1_000_000_000.0), "2001-09-09T01:46:40.000000");
    }

    #[test]
    fn test_unresolved_required_reporting() {
        let start = start_doc(json!({"uid": "u", "time": 0.0}));
        let buffer = HeaderBuffer::initialize(&template(), &start).unwrap();
        assert_eq!(buffer.unresolved_required(), vec!["Element.symbol"]);
    }

    #[test]
    fn test_render_block_shape() {
        let start = start_doc(json!({
            "uid": "u",
            "time": 0.0,
            "md": {"XDI": {"Element_symbol": "A"}},
        }));
        let template = template();
        let buffer = HeaderBuffer::initialize(&template, &start).unwrap();
        let block = buffer.render_block(template.columns());

        let lines: Vec<_> = block.lines().collect();
        assert_eq!(lines[0], "# XDI/1.0 Bluesky");
        assert_eq!(lines[1], "# Column.1 = energy eV");
        assert_eq!(lines[2], "# Element.symbol = A");
        assert_eq!(lines[3], "# Facility.name = None");
        assert_eq!(lines[4], "# Scan.start_time = 1970-01-01T00:00:00.000000");
        assert_eq!(lines[5], "# Scan.end_time = None");
        assert_eq!(lines[6], SEPARATOR_LINE);
        assert_eq!(lines[7], "# energy");
    }
}
