//! CSV reader: glob-scoped per-file configs, offset header rows, template or
//! join-based content assembly, and detector-backed metadata.

use globset::Glob;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

use crate::config::SourceConfig;
use crate::detector::detect_columns;
use crate::document::{Document, SourceType};
use crate::error::{Error, Result};
use crate::readers::{parse_date, sanitize_id_component};

/// Sample depth for column auto-detection.
const DETECT_SAMPLE_ROWS: usize = 5;

// ---------------------------------------------------------------------------
// Config resolution
// ---------------------------------------------------------------------------

/// Find the first config whose glob matches the basename. Both sides are
/// normalized to composition form C so decomposed filenames still match.
pub fn resolve_source_config<'a>(
    basename: &str,
    configs: &'a [SourceConfig],
) -> Result<&'a SourceConfig> {
    let name: String = basename.nfc().collect();
    for cfg in configs {
        let pattern: String = cfg.pattern.nfc().collect();
        let glob = Glob::new(&pattern)
            .map_err(|e| Error::Validation(format!("bad source pattern '{}': {e}", cfg.pattern)))?
            .compile_matcher();
        if glob.is_match(&name) {
            return Ok(cfg);
        }
    }
    Err(Error::ConfigMissing(basename.to_string()))
}

// ---------------------------------------------------------------------------
// Row access helpers
// ---------------------------------------------------------------------------

/// Look up a cell by header name: case-insensitive, trimmed. Out-of-range or
/// unknown headers yield the empty string.
fn cell(headers: &[String], row: &[String], name: &str) -> String {
    let want = name.trim().to_lowercase();
    headers
        .iter()
        .position(|h| h.trim().to_lowercase() == want)
        .and_then(|i| row.get(i))
        .map(|c| c.trim().to_string())
        .unwrap_or_default()
}

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").unwrap())
}

/// Substitute `{{col}}` placeholders with trimmed cell values (empty when
/// the column is unknown).
fn render_template(template: &str, headers: &[String], row: &[String]) -> String {
    template_re()
        .replace_all(template, |caps: &regex::Captures<'_>| cell(headers, row, &caps[1]))
        .into_owned()
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read a CSV file into Documents using the first matching source config.
pub fn read_csv(path: &Path, configs: &[SourceConfig]) -> Result<Vec<Document>> {
    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Validation(format!("{}: not a file path", path.display())))?;
    let cfg = resolve_source_config(basename, configs)?;

    let raw = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let rows: Vec<Vec<String>> = reader
        .records()
        .map(|r| {
            r.map(|rec| rec.iter().map(|c| c.to_string()).collect())
                .map_err(|e| Error::FileRead {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
        })
        .collect::<Result<_>>()?;

    let header_row = cfg.header_row.max(1);
    if header_row > rows.len() {
        return Err(Error::Validation(format!(
            "{basename}: header_row {header_row} exceeds {} rows",
            rows.len()
        )));
    }
    let headers = &rows[header_row - 1];
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(Error::Validation(format!("{basename}: header row {header_row} is empty")));
    }

    let data = &rows[header_row..];

    // Column roles: explicit config wins; the detector fills the gaps.
    let sample: Vec<Vec<String>> = data.iter().take(DETECT_SAMPLE_ROWS).cloned().collect();
    let detected = if cfg.auto_detect() {
        detect_columns(headers, &sample)
    } else {
        Default::default()
    };

    let content_columns: Vec<String> = if !cfg.content_columns.is_empty() {
        cfg.content_columns.clone()
    } else {
        detected.content.clone()
    };
    let title_col = cfg.title_column.clone().or(detected.title);
    let category_col = cfg.category_column.clone().or(detected.category);
    let id_col = cfg.id_column.clone().or(detected.id);

    let file_id = sanitize_id_component(basename);
    let mut docs = Vec::new();

    for (offset, row) in data.iter().enumerate() {
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        // Absolute 1-indexed row number in the file.
        let row_number = header_row + 1 + offset;

        let content = match cfg.template.as_deref() {
            Some(t) => render_template(t, headers, row),
            None => content_columns
                .iter()
                .map(|c| cell(headers, row, c))
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        if content.trim().is_empty() {
            continue;
        }

        let id_cell = id_col.as_deref().map(|c| cell(headers, row, c)).unwrap_or_default();
        let id = if id_cell.is_empty() {
            format!("csv_{file_id}_row{row_number}")
        } else {
            format!("csv_{file_id}_row{row_number}_{}", sanitize_id_component(&id_cell))
        };

        let title = title_col
            .as_deref()
            .map(|c| cell(headers, row, c))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("{basename} row {row_number}"));

        let mut doc = Document::new(id, title, content, SourceType::Csv);
        doc.file_path = path.display().to_string();
        doc.custom_fields.insert("row_index".into(), serde_json::json!(row_number));

        if let Some(ref c) = category_col {
            doc.category = cell(headers, row, c);
        }
        if let Some(ref c) = cfg.tags_column {
            doc.tags = cell(headers, row, c)
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect::<BTreeSet<_>>();
        }
        if let Some(ref c) = cfg.reference_column {
            doc.reference = cell(headers, row, c);
        }
        if let Some(ts) =
            cfg.created_at_column.as_deref().and_then(|c| parse_date(&cell(headers, row, c)))
        {
            doc.created_at = ts;
        }
        if let Some(ts) =
            cfg.updated_at_column.as_deref().and_then(|c| parse_date(&cell(headers, row, c)))
        {
            doc.updated_at = ts;
        }
        if doc.updated_at < doc.created_at {
            doc.updated_at = doc.created_at;
        }

        doc.validate()?;
        docs.push(doc);
    }

    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source(pattern: &str) -> SourceConfig {
        SourceConfig { pattern: pattern.to_string(), ..Default::default() }
    }

    fn write_csv(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let p = dir.path().join(name);
        let mut f = std::fs::File::create(&p).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        p
    }

    #[test]
    fn pattern_resolution_is_ordered() {
        let configs = vec![source("important*.csv"), source("*.csv")];
        let got = resolve_source_config("important_notes.csv", &configs).unwrap();
        assert_eq!(got.pattern, "important*.csv");
        let got = resolve_source_config("other.csv", &configs).unwrap();
        assert_eq!(got.pattern, "*.csv");
        assert!(matches!(
            resolve_source_config("notes.tsv", &configs),
            Err(Error::ConfigMissing(_))
        ));
    }

    #[test]
    fn nfc_normalization_before_match() {
        // "ポ" decomposed (ホ + combining半濁点) must match the composed pattern.
        let decomposed = "レホ\u{309a}ート.csv";
        let configs = vec![source("レポート.csv")];
        assert!(resolve_source_config(decomposed, &configs).is_ok());
    }

    #[test]
    fn multi_pattern_content_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_csv(
            &dir,
            "sample_escalation.csv",
            "エスカレタイトル,スレッド内容,サマリ\nテスト相談,スレッドの内容です,サマリは要約です\n",
        );
        let mut important = source("important*.csv");
        important.content_columns = vec!["詳細".into()];
        important.title_column = Some("タイトル".into());
        let mut sample = source("sample*.csv");
        sample.content_columns = vec!["スレッド内容".into(), "サマリ".into()];
        sample.title_column = Some("エスカレタイトル".into());

        let docs = read_csv(&p, &[important, sample]).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "スレッドの内容です\n\nサマリは要約です");
        assert_eq!(docs[0].title, "テスト相談");
    }

    #[test]
    fn header_row_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut noise = String::new();
        for i in 1..=6 {
            noise.push_str(&format!("junk{i},,\n"));
        }
        noise.push_str("id,title,content\n");
        noise.push_str("1,First,long enough content for a document body\n");
        noise.push_str("2,Second,another long enough content body right here\n");
        noise.push_str("3,Third,and a third long enough content body too\n");
        let p = write_csv(&dir, "offset.csv", &noise);

        let mut cfg = source("offset*.csv");
        cfg.header_row = 7;
        let docs = read_csv(&p, &[cfg]).unwrap();
        assert_eq!(docs.len(), 3);
        let rows: Vec<i64> = docs
            .iter()
            .map(|d| d.custom_fields["row_index"].as_i64().unwrap())
            .collect();
        assert_eq!(rows, vec![8, 9, 10]);
    }

    #[test]
    fn header_row_past_end_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_csv(&dir, "short.csv", "a,b\n1,2\n");
        let mut cfg = source("short*.csv");
        cfg.header_row = 10;
        let err = read_csv(&p, &[cfg]).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn empty_header_row_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_csv(&dir, "blank.csv", " , , \nid,content\n");
        let cfg = source("blank*.csv");
        let err = read_csv(&p, &[cfg]).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn empty_data_rows_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_csv(
            &dir,
            "gaps.csv",
            "title,content\nA,the first content body with enough length\n , \nB,the second content body with enough length\n",
        );
        let docs = read_csv(&p, &[source("gaps*.csv")]).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn template_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_csv(&dir, "tpl.csv", "name,desc\nWidget,A very fine widget\n");
        let mut cfg = source("tpl*.csv");
        cfg.template = Some("Product: {{name}}\n\n{{desc}} ({{missing}})".into());
        cfg.title_column = Some("name".into());
        let docs = read_csv(&p, &[cfg]).unwrap();
        assert_eq!(docs[0].content, "Product: Widget\n\nA very fine widget ()");
    }

    #[test]
    fn deterministic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_csv(
            &dir,
            "my data.csv",
            "id,content\nTKT-7,some sufficiently long content body here\n,another sufficiently long content body here\n",
        );
        let docs = read_csv(&p, &[source("my*.csv")]).unwrap();
        assert_eq!(docs[0].id, "csv_my_data_csv_row2_TKT-7");
        assert_eq!(docs[1].id, "csv_my_data_csv_row3");
    }

    #[test]
    fn cell_lookup_is_case_insensitive_and_trimmed() {
        let headers = vec!["  Title ".to_string(), "Body".to_string()];
        let row = vec![" padded value ".to_string()];
        assert_eq!(cell(&headers, &row, "title"), "padded value");
        assert_eq!(cell(&headers, &row, "TITLE"), "padded value");
        // Out-of-range column access yields empty, not a panic.
        assert_eq!(cell(&headers, &row, "body"), "");
        assert_eq!(cell(&headers, &row, "missing"), "");
    }

    #[test]
    fn detector_fills_unmapped_roles() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_csv(
            &dir,
            "auto.csv",
            "id,title,body,category\n9,Auto Title,a body column that is comfortably past the length floor,docs\n",
        );
        let docs = read_csv(&p, &[source("auto*.csv")]).unwrap();
        assert_eq!(docs[0].title, "Auto Title");
        assert_eq!(docs[0].category, "docs");
        assert!(docs[0].content.contains("length floor"));
        assert!(docs[0].id.ends_with("_9"));
    }
}
