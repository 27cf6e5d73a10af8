//! CSV and console renderings of a registry snapshot.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::LatencyError;
use crate::metric::MetricSummary;
use crate::registry::LatencyRegistry;

pub const CSV_HEADER: &str = "name,count,min_ns,max_ns,avg_ns,avg_us,avg_ms,p50_ns,p90_ns,p99_ns";

pub fn summaries_to_csv(rows: &[MetricSummary]) -> String {
    let mut out = String::with_capacity(64 * (rows.len() + 1));
    out.push_str(CSV_HEADER);
    out.push('\n');

    for row in rows {
        let _ = write!(
            out,
            "{},{},{},{},{:.3},{:.3},{:.6},",
            row.name,
            row.count,
            row.min_ns,
            row.max_ns,
            row.avg_ns,
            row.avg_us(),
            row.avg_ms()
        );
        match row.percentiles {
            Some(p) => {
                let _ = write!(out, "{:.3},{:.3},{:.3}", p.p50_ns, p.p90_ns, p.p99_ns);
            }
            None => out.push_str("N/A,N/A,N/A"),
        }
        out.push('\n');
    }

    out
}

/// Fixed-width table in microseconds.
pub fn summaries_to_table(rows: &[MetricSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<30}{:>10}{:>15}{:>15}{:>15}{:>15}{:>15}{:>15}",
        "operation", "count", "min (us)", "max (us)", "avg (us)", "p50 (us)", "p90 (us)", "p99 (us)"
    );
    let _ = writeln!(out, "{}", "-".repeat(130));

    for row in rows {
        let _ = write!(
            out,
            "{:<30}{:>10}{:>15.3}{:>15.3}{:>15.3}",
            row.name,
            row.count,
            row.min_ns as f64 / 1_000.0,
            row.max_ns as f64 / 1_000.0,
            row.avg_us()
        );
        match row.percentiles {
            Some(p) => {
                let _ = writeln!(
                    out,
                    "{:>15.3}{:>15.3}{:>15.3}",
                    p.p50_ns / 1_000.0,
                    p.p90_ns / 1_000.0,
                    p.p99_ns / 1_000.0
                );
            }
            None => {
                let _ = writeln!(out, "{:>15}{:>15}{:>15}", "N/A", "N/A", "N/A");
            }
        }
    }

    out
}

impl LatencyRegistry {
    pub fn to_csv(&self) -> String {
        summaries_to_csv(&self.snapshot())
    }

    pub fn render_table(&self) -> String {
        summaries_to_table(&self.snapshot())
    }

    pub fn export_csv(&self, path: impl AsRef<Path>) -> Result<(), LatencyError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_csv()).map_err(|source| LatencyError::Export {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> LatencyRegistry {
        let registry = LatencyRegistry::new();
        let t = registry.tracker("cache.orderbook_fetch");
        for s in [10, 20, 30, 40] {
            t.record_ns(s);
        }
        registry.tracker_with("dispatch.callback", false, 0).record_ns(2_000);
        registry
    }

    #[test]
    fn test_csv_rows() {
        let csv = registry().to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(
            lines[1],
            "cache.orderbook_fetch,4,10,40,25.000,0.025,0.000025,25.000,37.000,39.700"
        );
        assert_eq!(
            lines[2],
            "dispatch.callback,1,2000,2000,2000.000,2.000,0.002000,N/A,N/A,N/A"
        );
    }

    #[test]
    fn test_table_renders_every_row() {
        let table = registry().render_table();
        assert!(table.contains("cache.orderbook_fetch"));
        assert!(table.contains("N/A"));
        assert_eq!(table.lines().count(), 4);
    }

    #[test]
    fn test_export_csv_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");
        registry().export_csv(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(CSV_HEADER));
    }

    #[test]
    fn test_export_csv_bad_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("latency.csv");
        let err = registry().export_csv(&path).unwrap_err();
        assert!(matches!(err, LatencyError::Export { .. }));
    }
}
