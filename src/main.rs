//! # xdi-export CLI
//!
//! A command-line tool for serializing a run's document stream to an XDI
//! text file.
//!
//! ## Usage
//!
//! ```bash
//! # Serialize a captured document stream (newline-delimited JSON)
//! xdi-export convert run.jsonl out/
//!
//! # Generate and export a small synthetic run
//! xdi-export demo out/
//! ```
//!
//! The input to `convert` is one JSON object per line, each of the form
//! `{"name": "start", "doc": {...}}`, in the order the upstream framework
//! emitted them. Document kinds this crate does not serialize (resources,
//! datums, ...) are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use serde::Deserialize;

use xdi_export::document::{Document, DocumentError};
use xdi_export::manager::MultiFileManager;
use xdi_export::serializer::{XdiSerializer, DEFAULT_FILE_PREFIX};

/// xdi-export - XDI Run Serializer
#[derive(Parser)]
#[command(name = "xdi-export")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serialize a captured document stream to an XDI file
    Convert {
        /// Input stream: one `{"name": ..., "doc": ...}` JSON object per line
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output directory
        #[arg(value_name = "OUT_DIR", default_value = ".")]
        out_dir: PathBuf,

        /// File-prefix template, rendered against the start document
        #[arg(short = 'p', long, default_value = DEFAULT_FILE_PREFIX)]
        file_prefix: String,
    },

    /// Generate a small synthetic run and export it
    Demo {
        /// Output directory
        #[arg(value_name = "OUT_DIR", default_value = ".")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Convert { input, out_dir, file_prefix } => {
            run_convert(input, out_dir, &file_prefix)
        }
        Commands::Demo { out_dir } => run_demo(out_dir),
    }
}

#[derive(Deserialize)]
struct StreamItem {
    name: String,
    doc: serde_json::Value,
}

fn run_convert(input: PathBuf, out_dir: PathBuf, file_prefix: &str) -> Result<()> {
    info!("Input:  {}", input.display());
    info!("Output: {}", out_dir.display());

    let manager = MultiFileManager::new(&out_dir);
    let mut serializer =
        XdiSerializer::new(manager, file_prefix).context("Invalid file prefix template")?;

    let reader = BufReader::new(
        File::open(&input).with_context(|| format!("Failed to open {}", input.display()))?,
    );
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item: StreamItem = serde_json::from_str(&line)
            .with_context(|| format!("Malformed JSON on line {}", line_no + 1))?;
        match Document::from_parts(&item.name, item.doc) {
            Ok(doc) => serializer
                .process(&doc)
                .with_context(|| format!("Failed while processing line {}", line_no + 1))?,
            Err(DocumentError::UnknownKind(name)) => {
                debug!("skipping '{name}' document on line {}", line_no + 1);
            }
            Err(other) => {
                return Err(other)
                    .with_context(|| format!("Malformed document on line {}", line_no + 1));
            }
        }
    }

    report(&serializer);
    Ok(())
}

const DEMO_TEMPLATE: &str = r##"
[versions]
"XDI"                 = "# XDI/1.0 Bluesky"

[columns]
"Column.1"            = {column_label="energy",  data_key="det1", column_data="{data[det1][0]}", units="eV"}
"Column.2"            = {column_label="mutrans", data_key="det2", column_data="{data[det2][0]:.3}"}

[required_headers]
"Element.symbol"      = {data="{md[XDI][Element_symbol]}"}
"Element.edge"        = {data="{md[XDI][Element_edge]}"}

[optional_headers]
"Facility.name"       = {data="{md[NX][Source][name]}"}
"Beamline.name"       = {data="{md[NX][Instrument][name]}"}
"Scan.start_time"     = {}
"Scan.end_time"       = {}
"##;

fn run_demo(out_dir: PathBuf) -> Result<()> {
    use serde_json::json;
    use xdi_export::document::{DataRecordDoc, DescriptorDoc, StartDoc, StopDoc};

    let now = || chrono::Utc::now().timestamp_micros() as f64 / 1e6;

    let mut documents = vec![
        Document::Start(StartDoc::new(json!({
            "uid": "demo-run",
            "time": now(),
            "plan_name": "count",
            "md": {
                "xdi": {"config": DEMO_TEMPLATE},
                "XDI": {"Element_symbol": "Cu", "Element_edge": "K"},
                "NX": {
                    "Source": {"name": "NSLS-II"},
                    "Instrument": {"name": "BMM"},
                },
            },
        }))?),
        Document::Descriptor(DescriptorDoc::new(json!({
            "uid": "demo-descriptor",
            "name": "primary",
            "data_keys": {"det1": {}, "det2": {}},
        }))?),
    ];
    for seq_num in 0..5u32 {
        documents.push(Document::DataRecord(DataRecordDoc::new(json!({
            "descriptor": "demo-descriptor",
            "seq_num": seq_num,
            "time": now(),
            "data": {
                "det1": [8979.0 + f64::from(seq_num)],
                "det2": [1.0 / f64::from(seq_num + 1)],
            },
        }))?));
    }
    documents.push(Document::Stop(StopDoc::new(json!({
        "time": now(),
        "exit_status": "success",
    }))?));

    let manager = MultiFileManager::new(&out_dir);
    let mut serializer = XdiSerializer::new(manager, DEFAULT_FILE_PREFIX)?;
    for doc in &documents {
        serializer.process(doc)?;
    }

    report(&serializer);
    Ok(())
}

fn report(serializer: &XdiSerializer<MultiFileManager>) {
    println!("{}", serializer.stats());
    for (label, paths) in serializer.artifacts() {
        for path in paths {
            println!("{label}: {}", path.display());
        }
    }
}
