//! # xdi-export - Run Serialization to the XDI Text Format
//!
//! `xdi-export` converts the document stream of one experimental run (start,
//! data-stream descriptors, data records, stop) into a single self-describing
//! XDI text file: a `#`-prefixed key/value header, a separator, a column-label
//! line, and one tab-separated row per accepted data record.
//!
//! ## Key Features
//!
//! - **Template-driven output**: a TOML template declares the version lines,
//!   columns, and header fields, and how each value is computed from document
//!   fields via embedded references like `{md[XDI][Element_symbol]}`.
//!
//! - **Deferred header resolution**: header values scattered across the run's
//!   documents are filled in as they become available; a field missing at
//!   start simply stays pending until a later document supplies it, and the
//!   first successful resolution is permanent.
//!
//! - **Live-readable output**: a provisional header is written as soon as the
//!   run starts, so the file is valid text (and its rows can be tailed)
//!   during a long acquisition.
//!
//! - **Finalization rewrite**: when the run stops, the header is re-rendered
//!   with the fully resolved values and the file is atomically rewritten,
//!   preserving every data row byte-for-byte.
//!
//! - **Pluggable output**: the serializer writes through an
//!   [`manager::OutputManager`]; files on disk and in-memory buffers ship in
//!   the crate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xdi_export::document::Document;
//! use xdi_export::manager::MultiFileManager;
//! use xdi_export::serializer::{export, DEFAULT_FILE_PREFIX};
//!
//! # fn documents() -> Vec<Document> { Vec::new() }
//! let manager = MultiFileManager::new("out");
//! let (artifacts, stats) = export(documents(), manager, DEFAULT_FILE_PREFIX)?;
//! println!("{stats}");
//! for (label, paths) in &artifacts {
//!     println!("{label}: {paths:?}");
//! }
//! # Ok::<(), xdi_export::serializer::SerializerError>(())
//! ```
//!
//! ## Output File Format
//!
//! ```text
//! # XDI/1.0 Bluesky
//! # Column.1 = energy eV
//! # Element.symbol = A
//! # Scan.start_time = 2019-09-18T21:49:43.080123
//! # Scan.end_time = 2019-09-18T21:51:40.500000
//! #----
//! # energy
//! 8979.0
//! 8980.0
//! ```
//!
//! ## Architecture
//!
//! - [`document`]: tagged model of the four run document kinds
//! - [`render`]: value-template parsing and rendering
//! - [`template`]: TOML file-template loading (order-preserving)
//! - [`header`]: ordered header buffer with incremental resolution
//! - [`manager`]: output resource contract plus file and memory backends
//! - [`serializer`]: run state machine, row emission, finalization

#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

pub mod document;
pub mod header;
pub mod manager;
pub mod render;
pub mod serializer;
pub mod template;

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::document::{
        DataRecordDoc, DescriptorDoc, Document, DocumentError, DocumentKind, StartDoc, StopDoc,
    };
    pub use crate::header::{HeaderBuffer, NONE_LITERAL, SCAN_END_TIME, SCAN_START_TIME};
    pub use crate::manager::{
        ArtifactHandle, ManagerError, MemoryBufferManager, MultiFileManager, OutputManager,
    };
    pub use crate::render::{Rendered, RenderError, TemplateParseError, ValueTemplate};
    pub use crate::serializer::{
        export, SerializerError, SerializerStats, XdiSerializer, DEFAULT_FILE_PREFIX,
        STREAM_DATA_LABEL,
    };
    pub use crate::template::{ColumnDef, ConfigError, HeaderSpec, XdiTemplate};
}
