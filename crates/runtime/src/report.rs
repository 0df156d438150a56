//! At-exit report for Proto hosts
//!
//! Dumps runtime KPIs when the Space shuts down, controlled by the
//! `PROTO_REPORT` env var:
//! - Unset → no report, zero cost
//! - `1` → human-readable to stderr
//! - `json` → JSON to stderr
//! - `json:/path` → JSON to file

use crate::gc::{TOTAL_CELLS_SWEPT, TOTAL_GC_CYCLES};
use crate::space::{PEAK_HEAP_BYTES, TOTAL_CELLS_ALLOCATED};
use crate::thread::{PEAK_THREADS, TOTAL_THREADS_SPAWNED};
use std::io::Write;
use std::sync::OnceLock;
use std::sync::atomic::Ordering;

// =============================================================================
// Report Configuration (parsed from PROTO_REPORT env var)
// =============================================================================

/// Output format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFormat {
    Human,
    Json,
}

/// Output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDestination {
    Stderr,
    File(String),
}

/// Parsed report configuration
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub format: ReportFormat,
    pub destination: ReportDestination,
}

impl ReportConfig {
    /// Parse from the PROTO_REPORT environment variable
    pub fn from_env() -> Option<Self> {
        let val = std::env::var("PROTO_REPORT").ok()?;
        Self::parse(&val)
    }

    fn parse(val: &str) -> Option<Self> {
        match val {
            "" | "0" => None,
            "1" => Some(ReportConfig {
                format: ReportFormat::Human,
                destination: ReportDestination::Stderr,
            }),
            "json" => Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::Stderr,
            }),
            s if s.starts_with("json:") => Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::File(s[5..].to_string()),
            }),
            _ => {
                eprintln!("Warning: PROTO_REPORT='{val}' not recognized, ignoring");
                None
            }
        }
    }
}

static REPORT_CONFIG: OnceLock<Option<ReportConfig>> = OnceLock::new();

fn get_report_config() -> &'static Option<ReportConfig> {
    REPORT_CONFIG.get_or_init(ReportConfig::from_env)
}

// =============================================================================
// Report Data
// =============================================================================

/// Collected metrics for the report
#[derive(Debug)]
pub struct ReportData {
    pub cells_allocated: u64,
    pub cells_swept: u64,
    pub gc_cycles: u64,
    pub peak_heap_bytes: usize,
    pub threads_spawned: u64,
    pub peak_threads: usize,
}

fn collect_report_data() -> ReportData {
    ReportData {
        cells_allocated: TOTAL_CELLS_ALLOCATED.load(Ordering::Relaxed),
        cells_swept: TOTAL_CELLS_SWEPT.load(Ordering::Relaxed),
        gc_cycles: TOTAL_GC_CYCLES.load(Ordering::Relaxed),
        peak_heap_bytes: PEAK_HEAP_BYTES.load(Ordering::Relaxed),
        threads_spawned: TOTAL_THREADS_SPAWNED.load(Ordering::Relaxed),
        peak_threads: PEAK_THREADS.load(Ordering::Relaxed),
    }
}

// =============================================================================
// Formatting
// =============================================================================

fn format_human(data: &ReportData) -> String {
    let mut out = String::new();
    out.push_str("=== PROTO REPORT ===\n");
    out.push_str(&format!("Cells allocated: {}\n", data.cells_allocated));
    out.push_str(&format!("Cells swept:     {}\n", data.cells_swept));
    out.push_str(&format!("GC cycles:       {}\n", data.gc_cycles));
    out.push_str(&format!("Heap peak:       {} bytes\n", data.peak_heap_bytes));
    out.push_str(&format!("Threads spawned: {}\n", data.threads_spawned));
    out.push_str(&format!("Peak threads:    {}\n", data.peak_threads));
    out.push_str("====================\n");
    out
}

#[cfg(feature = "report-json")]
fn format_json(data: &ReportData) -> String {
    let mut map = serde_json::Map::new();
    map.insert(
        "cells_allocated".into(),
        serde_json::Value::Number(data.cells_allocated.into()),
    );
    map.insert(
        "cells_swept".into(),
        serde_json::Value::Number(data.cells_swept.into()),
    );
    map.insert(
        "gc_cycles".into(),
        serde_json::Value::Number(data.gc_cycles.into()),
    );
    map.insert(
        "heap_peak_bytes".into(),
        serde_json::Value::Number((data.peak_heap_bytes as u64).into()),
    );
    map.insert(
        "threads_spawned".into(),
        serde_json::Value::Number(data.threads_spawned.into()),
    );
    map.insert(
        "peak_threads".into(),
        serde_json::Value::Number((data.peak_threads as u64).into()),
    );
    let obj = serde_json::Value::Object(map);
    serde_json::to_string(&obj).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(not(feature = "report-json"))]
fn format_json(data: &ReportData) -> String {
    eprintln!(
        "Warning: PROTO_REPORT=json requires the 'report-json' feature. Falling back to human format."
    );
    format_human(data)
}

// =============================================================================
// Emit
// =============================================================================

/// Emit the report if PROTO_REPORT asks for one. Called when a Space run
/// finishes.
pub fn emit_report() {
    let config = match get_report_config() {
        Some(c) => c,
        None => return,
    };

    let data = collect_report_data();
    let output = match config.format {
        ReportFormat::Human => format_human(&data),
        ReportFormat::Json => format_json(&data),
    };

    match &config.destination {
        ReportDestination::Stderr => {
            let _ = std::io::stderr().write_all(output.as_bytes());
        }
        ReportDestination::File(path) => {
            if let Ok(mut f) = std::fs::File::create(path) {
                let _ = f.write_all(output.as_bytes());
            } else {
                eprintln!("Warning: could not write report to {path}");
                let _ = std::io::stderr().write_all(output.as_bytes());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse_variants() {
        assert!(ReportConfig::parse("0").is_none());
        assert!(ReportConfig::parse("").is_none());
        assert!(ReportConfig::parse("bogus").is_none());

        let human = ReportConfig::parse("1").unwrap();
        assert_eq!(human.format, ReportFormat::Human);
        assert_eq!(human.destination, ReportDestination::Stderr);

        let json = ReportConfig::parse("json").unwrap();
        assert_eq!(json.format, ReportFormat::Json);

        let file = ReportConfig::parse("json:/tmp/report.json").unwrap();
        assert_eq!(
            file.destination,
            ReportDestination::File("/tmp/report.json".to_string())
        );
    }

    #[test]
    fn test_format_human() {
        let data = ReportData {
            cells_allocated: 1000,
            cells_swept: 900,
            gc_cycles: 3,
            peak_heap_bytes: 524288,
            threads_spawned: 2,
            peak_threads: 2,
        };
        let output = format_human(&data);
        assert!(output.contains("PROTO REPORT"));
        assert!(output.contains("Cells allocated: 1000"));
        assert!(output.contains("GC cycles:       3"));
        assert!(output.contains("524288 bytes"));
    }

    #[cfg(feature = "report-json")]
    #[test]
    fn test_format_json() {
        let data = ReportData {
            cells_allocated: 10,
            cells_swept: 9,
            gc_cycles: 1,
            peak_heap_bytes: 64,
            threads_spawned: 1,
            peak_threads: 1,
        };
        let output = format_json(&data);
        assert!(output.contains("\"cells_allocated\":10"));
        assert!(output.contains("\"heap_peak_bytes\":64"));
    }

    #[test]
    fn test_report_to_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        let data = collect_report_data();
        let output = format_json(&data);
        std::fs::write(&path, &output).expect("write report");
        let read_back = std::fs::read_to_string(&path).expect("read report");
        assert_eq!(read_back, output);
    }

    #[test]
    fn test_emit_report_noop_when_disabled() {
        // When PROTO_REPORT is not set, emit_report is a no-op.
        emit_report();
    }
}
