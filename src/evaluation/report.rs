//! Plain-text metrics file.
//!
//! One four-line block per protocol, protocols in sorted order:
//!
//! ```text
//! easy
//!   mAP=83.82
//!   mP@k[1 5 10] [97.06 92.06 86.49]
//!   mR@k[1 5 10] [5.99 20.47 31.71]
//! ```
//!
//! Values are percentages rounded to two decimals; in memory they are
//! fractions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use super::metrics::ProtocolMetrics;
use super::{EvaluationError, Result};

const PRECISION_PREFIX: &str = "  mP@k[";
const RECALL_PREFIX: &str = "  mR@k[";

/// Mean metrics of one protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSummary {
    pub mean_average_precision: f64,
    pub mean_precisions: Vec<f64>,
    pub mean_recalls: Vec<f64>,
}

impl From<&ProtocolMetrics> for ProtocolSummary {
    fn from(metrics: &ProtocolMetrics) -> Self {
        Self {
            mean_average_precision: metrics.mean_average_precision,
            mean_precisions: metrics.mean_precisions.clone(),
            mean_recalls: metrics.mean_recalls.clone(),
        }
    }
}

/// Contents of a metrics file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub pr_ranks: Vec<usize>,
    pub protocols: BTreeMap<String, ProtocolSummary>,
}

impl MetricsSummary {
    pub fn new(pr_ranks: Vec<usize>) -> Self {
        Self {
            pr_ranks,
            protocols: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, protocol: impl Into<String>, summary: ProtocolSummary) {
        self.protocols.insert(protocol.into(), summary);
    }

    /// Mean average precision of `protocol`, if present.
    pub fn map(&self, protocol: &str) -> Option<f64> {
        self.protocols
            .get(protocol)
            .map(|p| p.mean_average_precision)
    }
}

/// Renders the summary in the metrics file format.
pub fn format_metrics(summary: &MetricsSummary) -> String {
    let ranks = summary
        .pr_ranks
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" ");

    let mut out = String::new();
    for (protocol, metrics) in &summary.protocols {
        let _ = writeln!(out, "{protocol}");
        let _ = writeln!(out, "  mAP={}", percent(metrics.mean_average_precision));
        let _ = writeln!(
            out,
            "{PRECISION_PREFIX}{ranks}] [{}]",
            percent_list(&metrics.mean_precisions)
        );
        let _ = writeln!(
            out,
            "{RECALL_PREFIX}{ranks}] [{}]",
            percent_list(&metrics.mean_recalls)
        );
    }
    out
}

fn percent(value: f64) -> String {
    format!("{:.2}", value * 100.0)
}

fn percent_list(values: &[f64]) -> String {
    values.iter().map(|&v| percent(v)).collect::<Vec<_>>().join(" ")
}

/// Writes the summary to `path`.
pub fn save_metrics_file(summary: &MetricsSummary, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, format_metrics(summary)).map_err(|e| EvaluationError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Reads a metrics file written by [`save_metrics_file`].
pub fn read_metrics_file(path: impl AsRef<Path>) -> Result<MetricsSummary> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| EvaluationError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_metrics(&contents).map_err(|reason| EvaluationError::MalformedMetrics {
        path: path.to_path_buf(),
        reason,
    })
}

/// Parses the metrics file format.
pub fn parse_metrics(contents: &str) -> std::result::Result<MetricsSummary, String> {
    let lines: Vec<&str> = contents.lines().map(str::trim_end).collect();
    if lines.len() % 4 != 0 {
        return Err(format!(
            "number of lines must be a multiple of 4, but it is {}",
            lines.len()
        ));
    }

    let mut summary = MetricsSummary::default();
    for block in lines.chunks(4) {
        let protocol = block[0].to_string();
        if summary.protocols.contains_key(&protocol) {
            return Err(format!("protocol {protocol} is found a second time"));
        }

        let map = block[1]
            .split_once('=')
            .map(|(_, v)| v.trim())
            .ok_or_else(|| format!("line {:?} has no mAP value", block[1]))
            .and_then(parse_float)?;

        let ranks = bracketed(block[2], &[PRECISION_PREFIX], 0)?
            .into_iter()
            .map(|r| {
                r.parse::<usize>()
                    .map_err(|_| format!("invalid PR rank {r:?}"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if summary.protocols.is_empty() {
            summary.pr_ranks = ranks;
        } else if ranks != summary.pr_ranks {
            return Err("inconsistent PR ranks".to_string());
        }

        let precisions = scores(block[2], summary.pr_ranks.len())?;
        let recalls = scores(block[3], summary.pr_ranks.len())?;

        summary.insert(
            protocol,
            ProtocolSummary {
                mean_average_precision: map / 100.0,
                mean_precisions: precisions.into_iter().map(|v| v / 100.0).collect(),
                mean_recalls: recalls.into_iter().map(|v| v / 100.0).collect(),
            },
        );
    }
    Ok(summary)
}

fn parse_float(value: &str) -> std::result::Result<f64, String> {
    value
        .parse::<f64>()
        .map_err(|_| format!("invalid number {value:?}"))
}

/// Whitespace-separated entries of the `field`-th bracket group after a known prefix.
fn bracketed<'a>(
    line: &'a str,
    prefixes: &[&str],
    field: usize,
) -> std::result::Result<Vec<&'a str>, String> {
    let rest = prefixes
        .iter()
        .find_map(|p| line.strip_prefix(p))
        .ok_or_else(|| format!("line {line:?} is malformed, cannot find valid prefixes"))?;
    // The prefix consumed the first opening bracket.
    let group = rest
        .split('[')
        .nth(field)
        .and_then(|g| g.split(']').next())
        .ok_or_else(|| format!("line {line:?} is missing bracket group {field}"))?;
    Ok(group.split_whitespace().collect())
}

fn scores(line: &str, expected: usize) -> std::result::Result<Vec<f64>, String> {
    let values = bracketed(line, &[PRECISION_PREFIX, RECALL_PREFIX], 1)?
        .into_iter()
        .map(parse_float)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if values.len() != expected {
        return Err(format!(
            "line {line:?} is malformed, expected {expected} scores but found {}",
            values.len()
        ));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn summary() -> MetricsSummary {
        let mut summary = MetricsSummary::new(vec![1, 5, 10]);
        summary.insert(
            "medium",
            ProtocolSummary {
                mean_average_precision: 0.4563,
                mean_precisions: vec![0.8, 0.5, 0.25],
                mean_recalls: vec![0.1, 0.2, 0.3],
            },
        );
        summary.insert(
            "easy",
            ProtocolSummary {
                mean_average_precision: 1.0,
                mean_precisions: vec![1.0, 1.0, 0.9],
                mean_recalls: vec![0.5, 0.75, 1.0],
            },
        );
        summary
    }

    #[test]
    fn formats_sorted_blocks() {
        let text = format_metrics(&summary());
        assert_eq!(
            text,
            "easy\n  mAP=100.00\n  mP@k[1 5 10] [100.00 100.00 90.00]\n  mR@k[1 5 10] [50.00 75.00 100.00]\n\
             medium\n  mAP=45.63\n  mP@k[1 5 10] [80.00 50.00 25.00]\n  mR@k[1 5 10] [10.00 20.00 30.00]\n"
        );
    }

    #[test]
    fn save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.txt");
        save_metrics_file(&summary(), &path).unwrap();

        let read = read_metrics_file(&path).unwrap();
        assert_eq!(read.pr_ranks, vec![1, 5, 10]);
        assert_eq!(read.protocols.len(), 2);
        assert!((read.map("medium").unwrap() - 0.4563).abs() < 1e-9);
        assert!((read.protocols["easy"].mean_recalls[1] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn reads_numpy_style_spacing() {
        let text = "hard\n  mAP=12.5\n  mP@k[ 1  5 10] [50.   40.5  30.25]\n  mR@k[ 1  5 10] [ 1.  2.  3.]\n";
        let summary = parse_metrics(text).unwrap();
        assert_eq!(summary.pr_ranks, vec![1, 5, 10]);
        assert!((summary.protocols["hard"].mean_precisions[2] - 0.3025).abs() < 1e-9);
        assert!((summary.protocols["hard"].mean_recalls[0] - 0.01).abs() < 1e-9);
    }

    #[test]
    fn line_count_must_be_multiple_of_four() {
        let err = parse_metrics("easy\n  mAP=1.0\n").unwrap_err();
        assert!(err.contains("multiple of 4"));
    }

    #[test]
    fn duplicate_protocol_is_rejected() {
        let block = "easy\n  mAP=1.0\n  mP@k[1] [1.0]\n  mR@k[1] [1.0]\n";
        let err = parse_metrics(&format!("{block}{block}")).unwrap_err();
        assert!(err.contains("second time"));
    }

    #[test]
    fn inconsistent_ranks_are_rejected() {
        let text = "easy\n  mAP=1.0\n  mP@k[1] [1.0]\n  mR@k[1] [1.0]\n\
                    hard\n  mAP=1.0\n  mP@k[5] [1.0]\n  mR@k[5] [1.0]\n";
        assert_eq!(parse_metrics(text).unwrap_err(), "inconsistent PR ranks");
    }

    #[test]
    fn wrong_score_count_is_rejected() {
        let text = "easy\n  mAP=1.0\n  mP@k[1 5] [1.0 2.0]\n  mR@k[1 5] [1.0]\n";
        let err = parse_metrics(text).unwrap_err();
        assert!(err.contains("expected 2 scores but found 1"));
    }

    #[test]
    fn missing_prefix_is_rejected() {
        let text = "easy\n  mAP=1.0\n  precision [1]\n  mR@k[1] [1.0]\n";
        assert!(parse_metrics(text).unwrap_err().contains("valid prefixes"));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.txt");
        std::fs::write(&path, "easy\n").unwrap();
        assert!(matches!(
            read_metrics_file(&path),
            Err(EvaluationError::MalformedMetrics { .. })
        ));
    }
}
