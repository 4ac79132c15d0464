//! Markdown reader: YAML front matter for metadata, remainder as content.

use std::collections::BTreeSet;
use std::path::Path;

use crate::document::{Document, SourceType};
use crate::error::{Error, Result};
use crate::readers::parse_date;

/// Read one markdown file into a Document.
///
/// Title resolution order: front-matter `title`, first `# H1`, filename stem.
pub fn read_markdown(path: &Path) -> Result<Document> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let (front, body) = split_front_matter(&raw);
    let meta: serde_yaml::Value = match front {
        Some(f) => serde_yaml::from_str(f)
            .map_err(|e| Error::MetadataExtraction(format!("{}: {e}", path.display())))?,
        None => serde_yaml::Value::Null,
    };

    let content = body.trim();
    if content.is_empty() {
        return Err(Error::Validation(format!("{}: empty content", path.display())));
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("untitled");
    let title = meta_str(&meta, "title")
        .or_else(|| first_h1(content))
        .unwrap_or_else(|| stem.to_string());

    let id = format!("md_{}", crate::readers::sanitize_id_component(stem));
    let mut doc = Document::new(id, title, content, SourceType::Markdown);
    doc.file_path = path.display().to_string();

    if let Some(cat) = meta_str(&meta, "category") {
        doc.category = cat;
    }
    if let Some(author) = meta_str(&meta, "author") {
        doc.author = author;
    }
    if let Some(reference) = meta_str(&meta, "url").or_else(|| meta_str(&meta, "reference")) {
        doc.reference = reference;
    }
    doc.tags = meta_tags(&meta);
    if let Some(ts) = meta_str(&meta, "created_at").and_then(|s| parse_date(&s)) {
        doc.created_at = ts;
    }
    if let Some(ts) = meta_str(&meta, "updated_at").and_then(|s| parse_date(&s)) {
        doc.updated_at = ts;
    }
    if doc.updated_at < doc.created_at {
        doc.updated_at = doc.created_at;
    }

    doc.validate()?;
    Ok(doc)
}

/// Split `---` delimited front matter from the body. Returns (front, body).
fn split_front_matter(raw: &str) -> (Option<&str>, &str) {
    let rest = match raw.strip_prefix("---") {
        Some(r) => r,
        None => return (None, raw),
    };
    // Front matter closes at the next line that is exactly `---`.
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" && offset > 0 {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(front), body);
        }
        offset += line.len();
    }
    (None, raw)
}

fn first_h1(content: &str) -> Option<String> {
    content.lines().find_map(|l| {
        l.strip_prefix("# ").map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
    })
}

fn meta_str(meta: &serde_yaml::Value, key: &str) -> Option<String> {
    match meta.get(key)? {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn meta_tags(meta: &serde_yaml::Value) -> BTreeSet<String> {
    match meta.get("tags") {
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(serde_yaml::Value::String(s)) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => BTreeSet::new(),
    }
}
