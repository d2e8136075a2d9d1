//! Files written by a run.
//!
//! ```text
//! <output_dir>/
//!   rankings/<query_id>.tsv   rank, corpus id, score (id percent-encoded)
//!   failures.tsv              role, image id, embedder, reason
//!   metrics.txt               benchmark metrics, when ground truth is given
//!   report.json               run summary
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::pipeline_service::{PipelineError, Result};
use crate::domain::{ImageId, Ranking, ScoredImage};
use crate::embedding::AttentionKind;

pub const RANKINGS_DIR: &str = "rankings";
pub const FAILURES_FILE: &str = "failures.tsv";
pub const METRICS_FILE: &str = "metrics.txt";
pub const REPORT_FILE: &str = "report.json";

const RANKING_EXTENSION: &str = "tsv";

/// Whether a failed image belongs to the corpus or the queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Corpus,
    Query,
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Corpus => "corpus",
            Self::Query => "query",
        })
    }
}

impl FromStr for ImageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "corpus" => Ok(Self::Corpus),
            "query" => Ok(Self::Query),
            other => Err(format!("unknown image role: {other}")),
        }
    }
}

/// An image that could not be embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub role: ImageRole,
    pub image_id: ImageId,
    pub embedder: AttentionKind,
    pub reason: String,
}

fn output_error(path: &Path, e: impl fmt::Display) -> PipelineError {
    PipelineError::Output {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// File name of a query's ranking.
///
/// `%`, `/` and `\` are percent-encoded so that distinct ids never share a
/// file and [`query_id_from_file_name`] recovers the id.
pub fn ranking_file_name(query: &ImageId) -> String {
    let mut name = String::with_capacity(query.as_str().len());
    for c in query.as_str().chars() {
        match c {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '\\' => name.push_str("%5C"),
            c => name.push(c),
        }
    }
    format!("{name}.{RANKING_EXTENSION}")
}

/// Query id encoded in a ranking file stem.
pub fn query_id_from_file_name(stem: &str) -> Option<ImageId> {
    let mut id = String::with_capacity(stem.len());
    let mut rest = stem;
    while let Some(at) = rest.find('%') {
        id.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3)?;
        id.push(match code {
            "25" => '%',
            "2F" | "2f" => '/',
            "5C" | "5c" => '\\',
            _ => return None,
        });
        rest = &rest[at + 3..];
    }
    id.push_str(rest);
    Some(ImageId(id))
}

/// Writes one ranking as `rank<TAB>id<TAB>score` lines, ranks starting at 1.
pub fn write_ranking(dir: &Path, ranking: &Ranking, top_k: Option<usize>) -> Result<PathBuf> {
    let path = dir.join(ranking_file_name(ranking.query()));
    let limit = top_k.unwrap_or(ranking.len());

    let mut out = String::new();
    for (i, entry) in ranking.entries().iter().take(limit).enumerate() {
        out.push_str(&format!("{}\t{}\t{}\n", i + 1, entry.id, entry.score));
    }
    fs::write(&path, out).map_err(|e| output_error(&path, e))?;
    Ok(path)
}

/// Writes every ranking into `<output_dir>/rankings`.
///
/// Two rankings for the same query are an error rather than an overwrite.
pub fn write_rankings(output_dir: &Path, rankings: &[Ranking], top_k: Option<usize>) -> Result<PathBuf> {
    let dir = output_dir.join(RANKINGS_DIR);
    fs::create_dir_all(&dir).map_err(|e| output_error(&dir, e))?;
    let mut written = HashSet::new();
    for ranking in rankings {
        let name = ranking_file_name(ranking.query());
        if !written.insert(name) {
            return Err(output_error(
                &dir,
                format!("more than one ranking for query {}", ranking.query()),
            ));
        }
        write_ranking(&dir, ranking, top_k)?;
    }
    Ok(dir)
}

/// Reads a ranking file; the query id is decoded from the file stem.
pub fn read_ranking(path: &Path) -> Result<Ranking> {
    let query = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(query_id_from_file_name)
        .ok_or_else(|| output_error(path, "file name is not a query id"))?;
    let contents = fs::read_to_string(path).map_err(|e| output_error(path, e))?;

    let mut scores = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let [_, id, score] = fields.as_slice() else {
            return Err(output_error(path, format!("line {}: expected 3 fields", i + 1)));
        };
        let score: f64 = score
            .parse()
            .map_err(|_| output_error(path, format!("line {}: invalid score {score:?}", i + 1)))?;
        scores.push(ScoredImage::new(*id, score));
    }
    Ok(Ranking::from_scores(query, scores))
}

/// Reads every ranking file in `dir`, keyed by query id.
pub fn read_rankings(dir: &Path) -> Result<HashMap<ImageId, Ranking>> {
    let entries = fs::read_dir(dir).map_err(|e| output_error(dir, e))?;
    let mut rankings = HashMap::new();
    for entry in entries {
        let path = entry.map_err(|e| output_error(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RANKING_EXTENSION) {
            continue;
        }
        let ranking = read_ranking(&path)?;
        rankings.insert(ranking.query().clone(), ranking);
    }
    Ok(rankings)
}

/// Writes `role<TAB>image_id<TAB>embedder<TAB>reason` lines.
pub fn write_failures(path: &Path, failures: &[FailureRecord]) -> Result<()> {
    let mut file = fs::File::create(path).map_err(|e| output_error(path, e))?;
    for failure in failures {
        let reason = failure.reason.replace(['\t', '\n'], " ");
        writeln!(
            file,
            "{}\t{}\t{}\t{}",
            failure.role, failure.image_id, failure.embedder, reason
        )
        .map_err(|e| output_error(path, e))?;
    }
    Ok(())
}

/// Reads a failures file written by [`write_failures`].
///
/// A missing file means nothing failed.
pub fn read_failures(path: &Path) -> Result<Vec<FailureRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).map_err(|e| output_error(path, e))?;
    let mut failures = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(4, '\t').collect();
        let [role, image_id, embedder, reason] = fields.as_slice() else {
            return Err(output_error(path, format!("line {}: expected 4 fields", i + 1)));
        };
        let line_error = |e: String| output_error(path, format!("line {}: {e}", i + 1));
        failures.push(FailureRecord {
            role: role.parse().map_err(line_error)?,
            image_id: ImageId::from(*image_id),
            embedder: embedder.parse().map_err(line_error)?,
            reason: reason.to_string(),
        });
    }
    Ok(failures)
}

/// Writes any serializable value as pretty JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| output_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ranking() -> Ranking {
        Ranking::from_scores(
            ImageId::from("q1"),
            vec![
                ScoredImage::new("b", 0.25),
                ScoredImage::new("a", 0.9),
                ScoredImage::new("c", -1.0 / 3.0),
            ],
        )
    }

    #[test]
    fn ranking_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ranking(dir.path(), &ranking(), None).unwrap();
        assert_eq!(path, dir.path().join("q1.tsv"));

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "1\ta\t0.9");
        assert_eq!(lines[1], "2\tb\t0.25");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn top_k_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ranking(dir.path(), &ranking(), Some(2)).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap().lines().count(), 2);
    }

    #[test]
    fn rankings_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let written = ranking();
        let rankings_dir = write_rankings(dir.path(), &[written.clone()], None).unwrap();
        fs::write(rankings_dir.join("notes.md"), "ignored").unwrap();

        let read = read_rankings(&rankings_dir).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[&ImageId::from("q1")], written);
    }

    #[test]
    fn malformed_ranking_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.tsv");
        fs::write(&path, "1\ta\n").unwrap();
        assert!(matches!(
            read_ranking(&path),
            Err(PipelineError::Output { .. })
        ));
    }

    #[test]
    fn query_ids_with_separators_survive_a_round_trip() {
        assert_eq!(ranking_file_name(&ImageId::from("sub/q")), "sub%2Fq.tsv");
        assert_eq!(ranking_file_name(&ImageId::from("50%\\x")), "50%25%5Cx.tsv");

        let dir = tempfile::tempdir().unwrap();
        let written = Ranking::from_scores(
            ImageId::from("sub/q"),
            vec![ScoredImage::new("a", 1.0)],
        );
        let rankings_dir = write_rankings(dir.path(), &[written.clone()], None).unwrap();
        let read = read_rankings(&rankings_dir).unwrap();
        assert_eq!(read[&ImageId::from("sub/q")], written);
    }

    #[test]
    fn slash_and_underscore_ids_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let slash = Ranking::from_scores(ImageId::from("a/b"), vec![ScoredImage::new("x", 1.0)]);
        let underscore =
            Ranking::from_scores(ImageId::from("a_b"), vec![ScoredImage::new("y", 1.0)]);
        let rankings_dir =
            write_rankings(dir.path(), &[slash.clone(), underscore.clone()], None).unwrap();

        let read = read_rankings(&rankings_dir).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[&ImageId::from("a/b")], slash);
        assert_eq!(read[&ImageId::from("a_b")], underscore);
    }

    #[test]
    fn duplicate_query_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_rankings(dir.path(), &[ranking(), ranking()], None);
        assert!(matches!(result, Err(PipelineError::Output { .. })));
    }

    #[test]
    fn undecodable_file_name_is_an_error() {
        assert_eq!(query_id_from_file_name("a%2"), None);
        assert_eq!(query_id_from_file_name("a%41"), None);
        assert_eq!(
            query_id_from_file_name("x%2fy%25"),
            Some(ImageId::from("x/y%"))
        );
    }

    #[test]
    fn failures_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FAILURES_FILE);
        let failures = vec![
            FailureRecord {
                role: ImageRole::Query,
                image_id: ImageId::from("q"),
                embedder: AttentionKind::Spatial,
                reason: "bad crop".to_string(),
            },
            FailureRecord {
                role: ImageRole::Corpus,
                image_id: ImageId::from("c"),
                embedder: AttentionKind::Cbam,
                reason: "truncated file".to_string(),
            },
        ];
        write_failures(&path, &failures).unwrap();
        assert_eq!(read_failures(&path).unwrap(), failures);
        assert!(read_failures(&dir.path().join("absent.tsv")).unwrap().is_empty());
    }

    #[test]
    fn failures_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FAILURES_FILE);
        write_failures(
            &path,
            &[FailureRecord {
                role: ImageRole::Corpus,
                image_id: ImageId::from("broken"),
                embedder: AttentionKind::Cbam,
                reason: "malformed image\tdata".to_string(),
            }],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "corpus\tbroken\tcbam\tmalformed image data\n"
        );
    }
}
