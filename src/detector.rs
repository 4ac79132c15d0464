//! Heuristic column-role inference for tabular sources.
//!
//! Matches headers against known role names (romanized and CJK), falling
//! back to an average-length heuristic for the content role only. Title,
//! category, and id are never guessed: unknown means empty.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const CONTENT_NAMES: &[&str] = &["content", "body", "text", "本文", "詳細"];
const TITLE_NAMES: &[&str] = &["title", "subject", "name", "タイトル", "件名"];
const CATEGORY_NAMES: &[&str] = &["category", "type", "kind", "カテゴリ", "種別"];
const ID_NAMES: &[&str] = &["id", "#", "番号", "no"];

/// Minimum average cell length for a column to qualify as content when no
/// header name matches.
const CONTENT_LENGTH_FLOOR: f64 = 30.0;

/// Inferred roles for a header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnRoles {
    /// Ordered; may name several columns.
    pub content: Vec<String>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub id: Option<String>,
}

/// Normalize a header for comparison: trim, lowercase, strip combining marks.
fn normalize(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

fn matches_any(header: &str, names: &[&str]) -> bool {
    let n = normalize(header);
    names.iter().any(|name| n == normalize(name))
}

/// Infer a role for each header given a few sample rows.
///
/// `sample_rows` are parallel to `headers`; ragged rows are tolerated
/// (missing cells count as empty).
pub fn detect_columns(headers: &[String], sample_rows: &[Vec<String>]) -> ColumnRoles {
    let mut roles = ColumnRoles::default();

    for h in headers {
        if matches_any(h, CONTENT_NAMES) {
            roles.content.push(h.clone());
        } else if roles.title.is_none() && matches_any(h, TITLE_NAMES) {
            roles.title = Some(h.clone());
        } else if roles.category.is_none() && matches_any(h, CATEGORY_NAMES) {
            roles.category = Some(h.clone());
        } else if roles.id.is_none() && matches_any(h, ID_NAMES) {
            roles.id = Some(h.clone());
        }
    }

    // No named content column: pick the longest-on-average column, provided
    // it clears the floor. Never fall back for the other roles.
    if roles.content.is_empty() && !sample_rows.is_empty() {
        let mut best: Option<(usize, f64)> = None;
        for (i, h) in headers.iter().enumerate() {
            // Columns already claimed by another role stay out of contention.
            if Some(h) == roles.title.as_ref()
                || Some(h) == roles.category.as_ref()
                || Some(h) == roles.id.as_ref()
            {
                continue;
            }
            let total: usize = sample_rows
                .iter()
                .map(|row| row.get(i).map(|c| c.chars().count()).unwrap_or(0))
                .sum();
            let avg = total as f64 / sample_rows.len() as f64;
            if avg > CONTENT_LENGTH_FLOOR && best.map(|(_, b)| avg > b).unwrap_or(true) {
                best = Some((i, avg));
            }
        }
        if let Some((i, _)) = best {
            roles.content.push(headers[i].clone());
        }
    }

    roles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn named_columns_matched() {
        let roles = detect_columns(&h(&["ID", "Title", "Body", "Category"]), &[]);
        assert_eq!(roles.content, vec!["Body"]);
        assert_eq!(roles.title.as_deref(), Some("Title"));
        assert_eq!(roles.category.as_deref(), Some("Category"));
        assert_eq!(roles.id.as_deref(), Some("ID"));
    }

    #[test]
    fn cjk_columns_matched() {
        let roles = detect_columns(&h(&["番号", "タイトル", "本文", "種別"]), &[]);
        assert_eq!(roles.content, vec!["本文"]);
        assert_eq!(roles.title.as_deref(), Some("タイトル"));
        assert_eq!(roles.category.as_deref(), Some("種別"));
        assert_eq!(roles.id.as_deref(), Some("番号"));
    }

    #[test]
    fn multiple_content_columns_keep_header_order() {
        let roles = detect_columns(&h(&["詳細", "text", "title"]), &[]);
        assert_eq!(roles.content, vec!["詳細", "text"]);
    }

    #[test]
    fn headers_normalized_before_match() {
        let roles = detect_columns(&h(&["  TITLE ", "CONTENT"]), &[]);
        assert_eq!(roles.title.as_deref(), Some("  TITLE "));
        assert_eq!(roles.content, vec!["CONTENT"]);
    }

    #[test]
    fn length_heuristic_picks_longest_column() {
        let headers = h(&["col_a", "col_b"]);
        let long = "x".repeat(80);
        let rows = vec![
            vec!["short".to_string(), long.clone()],
            vec!["tiny".to_string(), long.clone()],
        ];
        let roles = detect_columns(&headers, &rows);
        assert_eq!(roles.content, vec!["col_b"]);
    }

    #[test]
    fn length_heuristic_respects_floor() {
        let headers = h(&["col_a", "col_b"]);
        let rows = vec![vec!["short".to_string(), "also short".to_string()]];
        let roles = detect_columns(&headers, &rows);
        assert!(roles.content.is_empty());
    }

    #[test]
    fn no_guessing_for_title_category_id() {
        let roles = detect_columns(&h(&["alpha", "beta"]), &[]);
        assert!(roles.title.is_none());
        assert!(roles.category.is_none());
        assert!(roles.id.is_none());
    }
}
