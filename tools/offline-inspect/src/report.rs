//! Text and JSON rendering of store contents.

use albumkit_sw::ReplayQueueEntry;
use chrono::{TimeZone, Utc};
use serde::Serialize;

/// One cache generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub name: String,
    pub entries: usize,
}

/// One mutation waiting for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub method: String,
    pub url: String,
    pub queued_at: String,
    /// Status of the last response seen for this request.
    pub last_status: Option<u16>,
}

impl PendingSummary {
    pub fn from_entry(entry: &ReplayQueueEntry) -> Self {
        Self {
            method: entry.request.method.clone(),
            url: entry.request.url.clone(),
            queued_at: format_millis(entry.queued_at),
            last_status: entry.response.as_ref().map(|r| r.status),
        }
    }
}

pub fn render_generations(summaries: &[GenerationSummary]) -> String {
    if summaries.is_empty() {
        return "No cache generations.".to_string();
    }
    let width = summaries.iter().map(|s| s.name.len()).max().unwrap_or(0);
    summaries
        .iter()
        .map(|s| format!("{:<width$}  {} entries", s.name, s.entries, width = width))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_pending(pending: &[PendingSummary]) -> String {
    if pending.is_empty() {
        return "No pending mutations.".to_string();
    }
    pending
        .iter()
        .map(|p| {
            let last = p
                .last_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            format!("{}  {:<6} {}  (last: {})", p.queued_at, p.method, p.url, last)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_evicted(deleted: &[String], dry_run: bool) -> String {
    let verb = if dry_run { "Would delete" } else { "Deleted" };
    if deleted.is_empty() {
        return "Nothing to evict.".to_string();
    }
    deleted
        .iter()
        .map(|name| format!("{} {}", verb, name))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_millis(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use albumkit_sw::{SerializedRequest, SerializedResponse};
    use std::collections::BTreeMap;

    fn entry(response: Option<u16>) -> ReplayQueueEntry {
        ReplayQueueEntry {
            request: SerializedRequest {
                method: "POST".to_string(),
                url: "https://api.example/classes/Album".to_string(),
                headers: BTreeMap::new(),
                body: Some("{}".to_string()),
                credentials: Default::default(),
                cache: Default::default(),
                redirect: Default::default(),
                referrer: None,
            },
            response: response.map(|status| SerializedResponse {
                headers: BTreeMap::new(),
                status,
                status_text: String::new(),
                body: String::new(),
            }),
            pending: true,
            queued_at: 0,
        }
    }

    #[test]
    fn test_pending_summary() {
        let summary = PendingSummary::from_entry(&entry(Some(201)));
        assert_eq!(summary.queued_at, "1970-01-01T00:00:00Z");
        assert_eq!(summary.last_status, Some(201));

        let text = render_pending(&[summary, PendingSummary::from_entry(&entry(None))]);
        assert!(text.contains("(last: 201)"));
        assert!(text.contains("(last: -)"));
    }

    #[test]
    fn test_render_generations_aligns_names() {
        let text = render_generations(&[
            GenerationSummary {
                name: "album-cache-v7".to_string(),
                entries: 2,
            },
            GenerationSummary {
                name: "x".to_string(),
                entries: 0,
            },
        ]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "album-cache-v7  2 entries");
        assert_eq!(lines[1], "x               0 entries");
    }

    #[test]
    fn test_empty_renders() {
        assert_eq!(render_generations(&[]), "No cache generations.");
        assert_eq!(render_pending(&[]), "No pending mutations.");
        assert_eq!(render_evicted(&[], true), "Nothing to evict.");
        assert_eq!(
            render_evicted(&["album-cache-v6".to_string()], true),
            "Would delete album-cache-v6"
        );
    }
}
