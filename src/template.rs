//! XDI file-template loading.
//!
//! The shape of an output file is described declaratively in TOML with four
//! sections, each an ordered mapping:
//!
//! ```toml
//! [versions]
//! "XDI"             = "# XDI/1.0 Bluesky"
//!
//! [columns]
//! "Column.1"        = {column_label="energy", data_key="det", column_data="{data[det][0]}", units="eV"}
//!
//! [required_headers]
//! "Element.symbol"  = {data="{md[XDI][Element_symbol]}"}
//!
//! [optional_headers]
//! "Facility.name"   = {data="{md[NX][Source][name]}"}
//! "Scan.start_time" = {}
//! ```
//!
//! Declaration order inside every section is significant: it fixes both the
//! header-field order and the per-row column order for the whole run. The
//! loader therefore parses with the `toml` crate's order-preserving tables
//! and re-checks section shape eagerly, so a malformed template fails before
//! any output is produced.
//!
//! Header entries may carry extra metadata keys (`units`, `type`, `use`,
//! `stream`); rendering ignores them and the loader tolerates them.

use std::collections::BTreeSet;
use std::path::Path;

use toml::Value as TomlValue;

use crate::document::StartDoc;
use crate::render::{TemplateParseError, ValueTemplate};

/// Key under the start document's `md` mapping where this crate looks for
/// its configuration (`config` inline or `config-file-path`).
pub const CONFIG_MD_KEY: &str = "xdi";

/// Errors raised while loading or validating a file template.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a template file.
    #[error("failed to read template file: {0}")]
    Io(#[from] std::io::Error),

    /// The template is not valid TOML.
    #[error("template is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value template inside the configuration has bad syntax.
    #[error(transparent)]
    Template(#[from] TemplateParseError),

    /// One of the four mandatory sections is absent or not a table.
    #[error("template is missing section [{0}]")]
    MissingSection(&'static str),

    /// The `columns` section is present but empty.
    #[error("template declares no columns")]
    NoColumns,

    /// A section entry does not have the expected shape.
    #[error("entry '{name}' in [{section}] is malformed: expected {expected}")]
    MalformedEntry {
        /// Section containing the entry.
        section: &'static str,
        /// Entry key.
        name: String,
        /// Shape the loader expected.
        expected: &'static str,
    },

    /// The start document supplies neither an inline configuration nor a
    /// configuration file path.
    #[error(
        "start document must carry a template under md[{CONFIG_MD_KEY}][config] \
         or md[{CONFIG_MD_KEY}][config-file-path]"
    )]
    MissingConfig,

    /// The start document supplies both configuration sources.
    #[error(
        "start document carries both md[{CONFIG_MD_KEY}][config] and \
         md[{CONFIG_MD_KEY}][config-file-path]; exactly one is allowed"
    )]
    AmbiguousConfig,
}

/// One column of the output file.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    name: String,
    label: String,
    label_template: ValueTemplate,
    data_key: String,
    data: ValueTemplate,
    units: Option<String>,
}

impl ColumnDef {
    /// Header-field name of this column (the section entry key,
    /// e.g. `Column.1`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw label text, as written in the template. Used verbatim in the
    /// column-label row.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Label as a renderable template, for the header field value.
    pub fn label_template(&self) -> &ValueTemplate {
        &self.label_template
    }

    /// The data key a record must carry for this column.
    pub fn data_key(&self) -> &str {
        &self.data_key
    }

    /// Template producing this column's cell for one data record.
    pub fn data(&self) -> &ValueTemplate {
        &self.data
    }

    /// Units suffixed to the rendered label in the header, when declared.
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }
}

/// One `required_headers` / `optional_headers` entry.
#[derive(Debug, Clone)]
pub struct HeaderSpec {
    name: String,
    data: Option<ValueTemplate>,
}

impl HeaderSpec {
    /// Header-field name (e.g. `Element.symbol`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value template, when the entry declares one. Entries without
    /// `data` (e.g. `Scan.start_time = {}`) stay unresolved unless a special
    /// resolver fills them.
    pub fn data(&self) -> Option<&ValueTemplate> {
        self.data.as_ref()
    }
}

/// Immutable parsed representation of one file template.
#[derive(Debug, Clone)]
pub struct XdiTemplate {
    versions: Vec<(String, String)>,
    columns: Vec<ColumnDef>,
    required_headers: Vec<HeaderSpec>,
    optional_headers: Vec<HeaderSpec>,
}

impl XdiTemplate {
    /// Parse a template from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let root: toml::Table = text.parse()?;

        let versions = section(&root, "versions")?
            .iter()
            .map(|(name, value)| match value {
                TomlValue::String(line) => Ok((name.clone(), line.clone())),
                _ => Err(ConfigError::MalformedEntry {
                    section: "versions",
                    name: name.clone(),
                    expected: "a literal string",
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let columns = section(&root, "columns")?
            .iter()
            .map(|(name, value)| parse_column(name, value))
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(ConfigError::NoColumns);
        }

        let required_headers = parse_headers(&root, "required_headers")?;
        let optional_headers = parse_headers(&root, "optional_headers")?;

        Ok(Self { versions, columns, required_headers, optional_headers })
    }

    /// Read and parse a template file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Locate and load the template named by a start document: either inline
    /// text at `md[xdi][config]` or a path at `md[xdi][config-file-path]`.
    /// Exactly one of the two must be present.
    pub fn from_start(start: &StartDoc) -> Result<Self, ConfigError> {
        let section = start.body().get("md").and_then(|md| md.get(CONFIG_MD_KEY));
        let inline = section
            .and_then(|s| s.get("config"))
            .and_then(|v| v.as_str());
        let path = section
            .and_then(|s| s.get("config-file-path"))
            .and_then(|v| v.as_str());

        match (inline, path) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousConfig),
            (Some(text), None) => Self::from_toml_str(text),
            (None, Some(path)) => Self::from_file(path),
            (None, None) => Err(ConfigError::MissingConfig),
        }
    }

    /// Static version lines, in declaration order.
    pub fn versions(&self) -> &[(String, String)] {
        &self.versions
    }

    /// Column definitions, in declaration order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Header fields that must eventually resolve, in declaration order.
    pub fn required_headers(&self) -> &[HeaderSpec] {
        &self.required_headers
    }

    /// Header fields that may stay unresolved, in declaration order.
    pub fn optional_headers(&self) -> &[HeaderSpec] {
        &self.optional_headers
    }

    /// The set of data keys a descriptor must wholly declare for its records
    /// to be eligible for row emission.
    pub fn required_data_keys(&self) -> BTreeSet<&str> {
        self.columns.iter().map(|c| c.data_key()).collect()
    }
}

fn section<'a>(root: &'a toml::Table, name: &'static str) -> Result<&'a toml::Table, ConfigError> {
    root.get(name)
        .and_then(TomlValue::as_table)
        .ok_or(ConfigError::MissingSection(name))
}

fn parse_column(name: &str, value: &TomlValue) -> Result<ColumnDef, ConfigError> {
    let malformed = |expected| ConfigError::MalformedEntry {
        section: "columns",
        name: name.to_owned(),
        expected,
    };

    let table = value
        .as_table()
        .ok_or_else(|| malformed("a table with column_label, data_key, and column_data"))?;
    let field = |key: &str, expected: &'static str| {
        table
            .get(key)
            .and_then(TomlValue::as_str)
            .ok_or_else(|| malformed(expected))
    };

    let label = field("column_label", "a string column_label")?;
    let data_key = field("data_key", "a string data_key")?;
    let data = field("column_data", "a string column_data")?;
    let units = table
        .get("units")
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| malformed("a string units"))
        })
        .transpose()?;

    Ok(ColumnDef {
        name: name.to_owned(),
        label: label.to_owned(),
        label_template: ValueTemplate::parse(label)?,
        data_key: data_key.to_owned(),
        data: ValueTemplate::parse(data)?,
        units,
    })
}

fn parse_headers(root: &toml::Table, name: &'static str) -> Result<Vec<HeaderSpec>, ConfigError> {
    section(root, name)?
        .iter()
        .map(|(entry_name, value)| {
            let table = value.as_table().ok_or_else(|| ConfigError::MalformedEntry {
                section: name,
                name: entry_name.clone(),
                expected: "a table",
            })?;
            let data = match table.get("data") {
                None => None,
                Some(TomlValue::String(text)) => Some(ValueTemplate::parse(text)?),
                Some(_) => {
                    return Err(ConfigError::MalformedEntry {
                        section: name,
                        name: entry_name.clone(),
                        expected: "a string data template",
                    })
                }
            };
            Ok(HeaderSpec { name: entry_name.clone(), data })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::StartDoc;
    use serde_json::json;

    const TEMPLATE: &str = r##"
[versions]
"XDI"                         = "# XDI/1.0 Bluesky"

[columns]
"Column.1"                    = {column_label="energy",  data_key="det1", column_data="{data[det1][0]}", units="eV"}
"Column.2"                    = {column_label="mutrans", data_key="det2", column_data="{data[det2][0]:.3}"}
"Column.3"                    = {column_label="i0",      data_key="det2", column_data="{data[det2][0]:.5}"}

[required_headers]
"Element.symbol"              = {data="{md[XDI][Element_symbol]}"}
"Element.edge"                = {data="{md[XDI][Element_edge]}"}
"Mono.d_spacing"              = {data="{md[XDI][Mono_d_spacing]}"}

[optional_headers]
"Facility.name"               = {data="{md[NX][Source][name]}"}
"Beamline.focusing"           = {data="parabolic mirror", type="string", units="none", use=true}
"Scan.start_time"             = {}
"Scan.end_time"               = {}
"##;

    #[test]
    fn test_sections_preserve_declaration_order() {
        let template = XdiTemplate::from_toml_str(TEMPLATE).unwrap();

        assert_eq!(template.versions(), &[("XDI".to_owned(), "# XDI/1.0 Bluesky".to_owned())]);
        let column_names: Vec<_> = template.columns().iter().map(ColumnDef::name).collect();
        assert_eq!(column_names, vec!["Column.1", "Column.2", "Column.3"]);
        let required: Vec<_> = template.required_headers().iter().map(HeaderSpec::name).collect();
        assert_eq!(required, vec!["Element.symbol", "Element.edge", "Mono.d_spacing"]);
        let optional: Vec<_> = template.optional_headers().iter().map(HeaderSpec::name).collect();
        assert_eq!(
            optional,
            vec!["Facility.name", "Beamline.focusing", "Scan.start_time", "Scan.end_time"]
        );
    }

    #[test]
    fn test_column_fields() {
        let template = XdiTemplate::from_toml_str(TEMPLATE).unwrap();
        let column = &template.columns()[0];

        assert_eq!(column.label(), "energy");
        assert_eq!(column.data_key(), "det1");
        assert_eq!(column.units(), Some("eV"));
        assert_eq!(template.columns()[1].units(), None);
    }

    #[test]
    fn test_required_data_keys_deduplicated() {
        let template = XdiTemplate::from_toml_str(TEMPLATE).unwrap();
        let keys: Vec<_> = template.required_data_keys().into_iter().collect();
        assert_eq!(keys, vec!["det1", "det2"]);
    }

    #[test]
    fn test_entries_without_data_stay_templateless() {
        let template = XdiTemplate::from_toml_str(TEMPLATE).unwrap();
        let start_time = template
            .optional_headers()
            .iter()
            .find(|h| h.name() == "Scan.start_time")
            .unwrap();
        assert!(start_time.data().is_none());
    }

    #[test]
    fn test_missing_section_rejected() {
        let err = XdiTemplate::from_toml_str("[versions]\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("columns")));
    }

    #[test]
    fn test_empty_columns_rejected() {
        let text = r#"
[versions]
[columns]
[required_headers]
[optional_headers]
"#;
        assert!(matches!(XdiTemplate::from_toml_str(text).unwrap_err(), ConfigError::NoColumns));
    }

    #[test]
    fn test_bad_placeholder_syntax_rejected_at_load() {
        let text = r#"
[versions]
[columns]
"Column.1" = {column_label="energy", data_key="det", column_data="{data[det"}
[required_headers]
[optional_headers]
"#;
        assert!(matches!(
            XdiTemplate::from_toml_str(text).unwrap_err(),
            ConfigError::Template(_)
        ));
    }

    #[test]
    fn test_from_start_requires_exactly_one_source() {
        let neither = StartDoc::new(json!({"uid": "u", "time": 0.0, "md": {}})).unwrap();
        assert!(matches!(
            XdiTemplate::from_start(&neither).unwrap_err(),
            ConfigError::MissingConfig
        ));

        let both = StartDoc::new(json!({
            "uid": "u",
            "time": 0.0,
            "md": {"xdi": {"config": "x", "config-file-path": "y"}},
        }))
        .unwrap();
        assert!(matches!(
            XdiTemplate::from_start(&both).unwrap_err(),
            ConfigError::AmbiguousConfig
        ));

        let inline = StartDoc::new(json!({
            "uid": "u",
            "time": 0.0,
            "md": {"xdi": {"config": TEMPLATE}},
        }))
        .unwrap();
        let template = XdiTemplate::from_start(&inline).unwrap();
        assert_eq!(template.columns().len(), 3);
    }
}
