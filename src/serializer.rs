//! Run serialization: document stream in, one XDI file out.
//!
//! An [`XdiSerializer`] processes exactly one run, document by document, and
//! moves through three states:
//!
//! ```text
//! Idle --start--> Open --stop--> Closed
//! ```
//!
//! On `start` the template is loaded, the header buffer is seeded, and a
//! *provisional* header is written immediately, so the output file is valid
//! readable text for the whole acquisition and its data rows can be tailed
//! live. Descriptors whose declared data keys cover every column's data key
//! become eligible; each data record referencing an eligible descriptor
//! appends one tab-separated row. On `stop` the header buffer gets its final
//! update (resolving `Scan.end_time`), and the finalization pass rewrites
//! each artifact in place: a fresh header block, then every non-header line
//! of the provisional contents, byte-for-byte and in order.
//!
//! A record with no eligible descriptor is skipped with a warning rather
//! than failing the run; one stray stream should not abort a long
//! acquisition. A row cell that cannot render, by contrast, is fatal, since
//! dropping it mid-row would corrupt column alignment.
//!
//! A run abandoned between `start` and `stop` leaves a valid provisional
//! file behind; this is a documented limitation, not an error.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;

use serde_json::Value;

use crate::document::{Document, DocumentError, DocumentKind};
use crate::header::HeaderBuffer;
use crate::manager::{ArtifactHandle, ManagerError, OutputManager};
use crate::render::{RenderError, ValueTemplate};
use crate::template::{ColumnDef, ConfigError, XdiTemplate};

/// Label under which the output file is opened on the manager.
pub const STREAM_DATA_LABEL: &str = "stream_data";

/// Default file-prefix template; `uid` is guaranteed present and unique.
pub const DEFAULT_FILE_PREFIX: &str = "{uid}-";

/// Errors that can abort a run.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    /// The file template is absent or malformed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A mandatory render (row cell, file prefix) could not be satisfied.
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// The output manager failed.
    #[error("output error: {0}")]
    Manager(#[from] ManagerError),

    /// An incoming document failed validation.
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// A document arrived outside the `start → descriptor*/record* → stop`
    /// lifecycle.
    #[error("{document} document received while the run is {state}")]
    Sequence {
        /// State the run was in.
        state: &'static str,
        /// Kind of the out-of-order document.
        document: DocumentKind,
    },
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializerStats {
    /// Data rows appended to the output.
    pub rows_written: usize,
    /// Data records skipped because no eligible descriptor matched.
    pub records_skipped: usize,
    /// Descriptor documents received.
    pub descriptors_seen: usize,
    /// Descriptors that became eligible for row emission.
    pub eligible_descriptors: usize,
}

impl std::fmt::Display for SerializerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wrote {} rows ({} records skipped) from {} eligible of {} descriptors",
            self.rows_written,
            self.records_skipped,
            self.eligible_descriptors,
            self.descriptors_seen
        )
    }
}

struct OpenRun {
    template: XdiTemplate,
    header: HeaderBuffer,
    handle: ArtifactHandle,
    eligible: HashSet<String>,
}

enum RunState {
    Idle,
    Open(OpenRun),
    Closed,
}

impl RunState {
    fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Open(_) => "open",
            RunState::Closed => "closed",
        }
    }
}

/// Serializes one run's document stream to one XDI output resource.
pub struct XdiSerializer<M: OutputManager> {
    manager: M,
    file_prefix: ValueTemplate,
    state: RunState,
    stats: SerializerStats,
}

impl<M: OutputManager> XdiSerializer<M> {
    /// Create a serializer writing through `manager`. `file_prefix` is a
    /// value template rendered against the start document to derive the
    /// output file name (see [`DEFAULT_FILE_PREFIX`]).
    pub fn new(manager: M, file_prefix: &str) -> Result<Self, SerializerError> {
        let file_prefix = ValueTemplate::parse(file_prefix).map_err(ConfigError::from)?;
        Ok(Self {
            manager,
            file_prefix,
            state: RunState::Idle,
            stats: SerializerStats::default(),
        })
    }

    /// Feed the next document of the run.
    pub fn process(&mut self, doc: &Document) -> Result<(), SerializerError> {
        match doc {
            Document::Start(_) => self.start(doc),
            Document::Descriptor(_) => self.descriptor(doc),
            Document::DataRecord(_) => self.data_record(doc),
            Document::Stop(_) => self.stop(doc),
        }
    }

    fn start(&mut self, doc: &Document) -> Result<(), SerializerError> {
        let Document::Start(start) = doc else { unreachable!() };
        if !matches!(self.state, RunState::Idle) {
            return Err(SerializerError::Sequence {
                state: self.state.name(),
                document: DocumentKind::Start,
            });
        }

        let template = XdiTemplate::from_start(start)?;
        let header = HeaderBuffer::initialize(&template, doc)?;

        let prefix = self.file_prefix.render_required(start.body())?;
        let filename = format!("{prefix}.xdi");
        let handle = self.manager.open(STREAM_DATA_LABEL, &filename)?;
        log::info!("opened output resource '{filename}' for run {}", start.uid());

        // Provisional header: likely still carrying unresolved fields, but
        // it keeps the file valid, readable text throughout the run. The
        // full header is rewritten when the stop document arrives.
        self.manager
            .write_text(handle, &header.render_block(template.columns()))?;

        self.state = RunState::Open(OpenRun {
            template,
            header,
            handle,
            eligible: HashSet::new(),
        });
        Ok(())
    }

    fn descriptor(&mut self, doc: &Document) -> Result<(), SerializerError> {
        let Document::Descriptor(descriptor) = doc else { unreachable!() };
        let run = match &mut self.state {
            RunState::Open(run) => run,
            other => {
                return Err(SerializerError::Sequence {
                    state: other.name(),
                    document: DocumentKind::Descriptor,
                })
            }
        };
        self.stats.descriptors_seen += 1;

        let required = run.template.required_data_keys();
        let declared: HashSet<&str> =
            descriptor.data_keys().iter().map(String::as_str).collect();
        if required.iter().all(|key| declared.contains(key)) {
            if run.eligible.insert(descriptor.uid().to_owned()) {
                self.stats.eligible_descriptors += 1;
            }
            log::debug!(
                "descriptor {} ({}) eligible for row emission",
                descriptor.uid(),
                descriptor.name().unwrap_or("unnamed stream")
            );
        } else {
            // Not an error: this stream just does not feed the columns.
            log::debug!(
                "descriptor {} does not declare all of {:?}; ineligible",
                descriptor.uid(),
                required
            );
        }

        run.header.update(doc)?;
        Ok(())
    }

    fn data_record(&mut self, doc: &Document) -> Result<(), SerializerError> {
        let Document::DataRecord(record) = doc else { unreachable!() };
        let run = match &mut self.state {
            RunState::Open(run) => run,
            other => {
                return Err(SerializerError::Sequence {
                    state: other.name(),
                    document: DocumentKind::DataRecord,
                })
            }
        };

        if run.eligible.is_empty() {
            log::warn!(
                "skipping data record: no descriptor declaring {:?} seen yet",
                run.template.required_data_keys()
            );
            self.stats.records_skipped += 1;
            return Ok(());
        }
        if !run.eligible.contains(record.descriptor()) {
            log::warn!(
                "skipping data record for descriptor {}: no data to export",
                record.descriptor()
            );
            self.stats.records_skipped += 1;
            return Ok(());
        }

        let row = render_row(run.template.columns(), record.body())?;
        self.manager.write_text(run.handle, &row)?;
        self.stats.rows_written += 1;
        Ok(())
    }

    fn stop(&mut self, doc: &Document) -> Result<(), SerializerError> {
        let mut run = match std::mem::replace(&mut self.state, RunState::Closed) {
            RunState::Open(run) => run,
            other => {
                let state = other.name();
                self.state = other;
                return Err(SerializerError::Sequence {
                    state,
                    document: DocumentKind::Stop,
                });
            }
        };

        // Final resolution pass: Scan.end_time and any fields whose source
        // data only exists at the end of the run.
        run.header.update(doc)?;
        for name in run.header.unresolved_required() {
            log::warn!("required header field '{name}' never resolved; writing None");
        }

        self.manager.close()?;

        let header_block = run.header.render_block(run.template.columns());
        self.manager.rewrite_artifacts(&mut |current, sink| {
            sink.write_all(header_block.as_bytes())?;
            // Keep every data line byte-for-byte; drop only the provisional
            // header, identified by its comment prefix.
            for line in current.split_inclusive('\n') {
                if !line.starts_with('#') {
                    sink.write_all(line.as_bytes())?;
                }
            }
            Ok(())
        })?;
        log::info!("finalized run: {}", self.stats);
        Ok(())
    }

    /// Counters for this run so far.
    pub fn stats(&self) -> SerializerStats {
        self.stats
    }

    /// Mapping from label to produced artifacts, straight from the manager.
    pub fn artifacts(&self) -> BTreeMap<String, Vec<M::Artifact>> {
        self.manager.artifacts()
    }

    /// Borrow the underlying manager (e.g. to inspect memory buffers).
    pub fn manager(&self) -> &M {
        &self.manager
    }
}

fn render_row(columns: &[ColumnDef], record: &Value) -> Result<String, RenderError> {
    let cells = columns
        .iter()
        .map(|column| column.data().render_required(record))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("{}\n", cells.join("\t")))
}

/// Drive a whole run through a fresh serializer and return the artifacts
/// and counters.
pub fn export<M, I>(
    documents: I,
    manager: M,
    file_prefix: &str,
) -> Result<(BTreeMap<String, Vec<M::Artifact>>, SerializerStats), SerializerError>
where
    M: OutputManager,
    I: IntoIterator<Item = Document>,
{
    let mut serializer = XdiSerializer::new(manager, file_prefix)?;
    for doc in documents {
        serializer.process(&doc)?;
    }
    Ok((serializer.artifacts(), serializer.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DataRecordDoc, DescriptorDoc, StartDoc, StopDoc};
    use crate::manager::MemoryBufferManager;
    use serde_json::json;

    const TEMPLATE: &str = r##"
[versions]
"XDI"             = "# XDI/1.0 Bluesky"

[columns]
"Column.1"        = {column_label="energy", data_key="det", column_data="{data[det][0]}"}

[required_headers]
"Element.symbol"  = {data="{md[XDI][Element_symbol]}"}

[optional_headers]
"Scan.start_time" = {}
"Scan.end_time"   = {}
"##;

    fn start(time: f64) -> Document {
        Document::Start(
            StartDoc::new(json!({
                "uid": "run-1",
                "time": time,
                "md": {
                    "xdi": {"config": TEMPLATE},
                    "XDI": {"Element_symbol": "A"},
                },
            }))
            .unwrap(),
        )
    }

    fn descriptor(uid: &str, keys: &[&str]) -> Document {
        let mut data_keys = serde_json::Map::new();
        for key in keys {
            data_keys.insert((*key).to_owned(), json!({}));
        }
        Document::Descriptor(
            DescriptorDoc::new(json!({"uid": uid, "data_keys": data_keys})).unwrap(),
        )
    }

    fn record(descriptor: &str, value: i64) -> Document {
        Document::DataRecord(
            DataRecordDoc::new(json!({
                "descriptor": descriptor,
                "data": {"det": [value]},
            }))
            .unwrap(),
        )
    }

    fn stop(time: f64) -> Document {
        Document::Stop(StopDoc::new(json!({"time": time})).unwrap())
    }

    #[test]
    fn test_document_before_start_is_fatal() {
        let mut serializer =
            XdiSerializer::new(MemoryBufferManager::new(), DEFAULT_FILE_PREFIX).unwrap();
        let err = serializer.process(&descriptor("d1", &["det"])).unwrap_err();
        assert!(matches!(
            err,
            SerializerError::Sequence { state: "idle", document: DocumentKind::Descriptor }
        ));
    }

    #[test]
    fn test_second_start_is_fatal() {
        let mut serializer =
            XdiSerializer::new(MemoryBufferManager::new(), DEFAULT_FILE_PREFIX).unwrap();
        serializer.process(&start(0.0)).unwrap();
        let err = serializer.process(&start(1.0)).unwrap_err();
        assert!(matches!(
            err,
            SerializerError::Sequence { state: "open", document: DocumentKind::Start }
        ));
    }

    #[test]
    fn test_document_after_stop_is_fatal() {
        let mut serializer =
            XdiSerializer::new(MemoryBufferManager::new(), DEFAULT_FILE_PREFIX).unwrap();
        serializer.process(&start(0.0)).unwrap();
        serializer.process(&stop(1.0)).unwrap();
        let err = serializer.process(&record("d1", 1)).unwrap_err();
        assert!(matches!(err, SerializerError::Sequence { state: "closed", .. }));
    }

    #[test]
    fn test_ineligible_records_are_skipped_not_fatal() {
        let mut serializer =
            XdiSerializer::new(MemoryBufferManager::new(), DEFAULT_FILE_PREFIX).unwrap();
        serializer.process(&start(0.0)).unwrap();

        // No descriptor yet: skipped.
        serializer.process(&record("d1", 1)).unwrap();
        // Descriptor without the needed key: ineligible, records skipped.
        serializer.process(&descriptor("d2", &["other"])).unwrap();
        serializer.process(&record("d2", 2)).unwrap();
        serializer.process(&stop(1.0)).unwrap();

        let stats = serializer.stats();
        assert_eq!(stats.rows_written, 0);
        assert_eq!(stats.records_skipped, 2);
        assert_eq!(stats.descriptors_seen, 1);
        assert_eq!(stats.eligible_descriptors, 0);
    }

    #[test]
    fn test_rows_written_for_eligible_descriptor_only() {
        let mut serializer =
            XdiSerializer::new(MemoryBufferManager::new(), DEFAULT_FILE_PREFIX).unwrap();
        serializer.process(&start(0.0)).unwrap();
        serializer.process(&descriptor("d1", &["det", "extra"])).unwrap();
        serializer.process(&record("d1", 1)).unwrap();
        serializer.process(&record("unknown", 2)).unwrap();
        serializer.process(&record("d1", 3)).unwrap();
        serializer.process(&stop(10.0)).unwrap();

        let stats = serializer.stats();
        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.records_skipped, 1);

        let contents = serializer
            .manager()
            .contents(STREAM_DATA_LABEL, "run-1-.xdi")
            .unwrap();
        let data_lines: Vec<_> =
            contents.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(data_lines, vec!["1", "3"]);
    }

    #[test]
    fn test_reemitted_descriptor_counted_once() {
        let mut serializer =
            XdiSerializer::new(MemoryBufferManager::new(), DEFAULT_FILE_PREFIX).unwrap();
        serializer.process(&start(0.0)).unwrap();
        serializer.process(&descriptor("d1", &["det"])).unwrap();
        serializer.process(&descriptor("d1", &["det"])).unwrap();
        serializer.process(&record("d1", 1)).unwrap();
        serializer.process(&stop(1.0)).unwrap();

        let stats = serializer.stats();
        assert_eq!(stats.descriptors_seen, 2);
        assert_eq!(stats.eligible_descriptors, 1);
        assert_eq!(stats.rows_written, 1);
    }

    #[test]
    fn test_row_render_failure_is_fatal() {
        let mut serializer =
            XdiSerializer::new(MemoryBufferManager::new(), DEFAULT_FILE_PREFIX).unwrap();
        serializer.process(&start(0.0)).unwrap();
        serializer.process(&descriptor("d1", &["det"])).unwrap();

        let bad = Document::DataRecord(
            DataRecordDoc::new(json!({"descriptor": "d1", "data": {"other": [1.0]}})).unwrap(),
        );
        let err = serializer.process(&bad).unwrap_err();
        assert!(matches!(
            err,
            SerializerError::Render(RenderError::MissingReference { .. })
        ));
    }

    #[test]
    fn test_missing_file_prefix_source_is_fatal() {
        let mut serializer =
            XdiSerializer::new(MemoryBufferManager::new(), "{md[absent]}-").unwrap();
        let err = serializer.process(&start(0.0)).unwrap_err();
        assert!(matches!(
            err,
            SerializerError::Render(RenderError::MissingReference { .. })
        ));
    }
}
