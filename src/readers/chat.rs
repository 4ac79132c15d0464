//! Chat-history reader: drains a paginated message feed into Documents,
//! optionally expanding threads into per-reply documents.
//!
//! The platform API lives behind [`ChatHistory`]; tests (and the dry-run
//! path) substitute stubs.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::document::{Document, SourceType};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Platform capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Platform timestamp, seconds with fractional part (e.g. "1714389251.000200").
    pub ts: String,
    pub user: String,
    pub text: String,
    pub bot: bool,
    /// Set when the message heads a thread with replies.
    pub thread_ts: Option<String>,
    pub reply_count: usize,
}

#[derive(Debug, Default)]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<String>,
}

/// Paginated access to a channel's history.
#[async_trait]
pub trait ChatHistory: Send + Sync {
    async fn fetch_page(&self, channel: &str, cursor: Option<&str>) -> Result<MessagePage>;
    async fn fetch_replies(&self, channel: &str, thread_ts: &str) -> Result<Vec<ChatMessage>>;
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChatReaderOptions {
    pub expand_threads: bool,
    /// Messages shorter than this (chars) are dropped.
    pub min_text_len: usize,
    pub include_bots: bool,
}

impl Default for ChatReaderOptions {
    fn default() -> Self {
        Self { expand_threads: true, min_text_len: 10, include_bots: false }
    }
}

/// Drain a channel into Documents, one per message (and per thread reply when
/// expansion is on).
pub async fn read_channel(
    client: &dyn ChatHistory,
    channel: &str,
    opts: &ChatReaderOptions,
) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = client.fetch_page(channel, cursor.as_deref()).await?;
        for msg in &page.messages {
            if let Some(doc) = message_to_doc(channel, msg, opts, false) {
                docs.push(doc);
            }
            if opts.expand_threads && msg.reply_count > 0 {
                if let Some(ref thread_ts) = msg.thread_ts {
                    let replies = client.fetch_replies(channel, thread_ts).await?;
                    for reply in &replies {
                        // The thread head reappears in the replies fetch.
                        if reply.ts == msg.ts {
                            continue;
                        }
                        if let Some(doc) = message_to_doc(channel, reply, opts, true) {
                            docs.push(doc);
                        }
                    }
                }
            }
        }
        match page.next_cursor {
            Some(c) if !c.is_empty() => cursor = Some(c),
            _ => break,
        }
    }

    Ok(docs)
}

fn message_to_doc(
    channel: &str,
    msg: &ChatMessage,
    opts: &ChatReaderOptions,
    thread_reply: bool,
) -> Option<Document> {
    if msg.bot && !opts.include_bots {
        return None;
    }
    let text = msg.text.trim();
    if text.chars().count() < opts.min_text_len {
        return None;
    }

    let title: String = {
        let first = text.lines().next().unwrap_or(text);
        first.chars().take(80).collect()
    };

    let mut doc = Document::new(
        format!("chat-{channel}-{}", msg.ts),
        title,
        text,
        SourceType::Chat,
    );
    doc.author = msg.user.clone();
    doc.category = channel.to_string();
    if let Some(ts) = parse_ts(&msg.ts) {
        doc.created_at = ts;
        doc.updated_at = ts;
    }
    if thread_reply {
        doc.custom_fields.insert("thread_reply".into(), serde_json::json!(true));
    }
    doc.validate().ok()?;
    Some(doc)
}

fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = ts.parse().ok()?;
    Utc.timestamp_opt(secs as i64, ((secs.fract()) * 1e9) as u32).single()
}
