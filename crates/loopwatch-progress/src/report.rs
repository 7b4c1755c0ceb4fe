use chrono::{DateTime, Utc};
use loopwatch_core::event::{value_as_f64, value_as_u64};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

pub const DEFAULT_REPORT_TITLE: &str = "Research Report";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub title: String,
    pub content: String,
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSource {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    pub relevance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub word_count: u64,
    pub sources_count: u64,
    pub generation_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub title: String,
    pub executive_summary: String,
    pub sections: Vec<ReportSection>,
    pub sources: Vec<ReportSource>,
    pub metadata: ReportMetadata,
    pub generated_at: DateTime<Utc>,
}

impl ResearchReport {
    /// Report built from prose alone. A trailing sources block is dropped so
    /// it does not repeat the structured source list.
    pub fn from_text(text: &str, generated_at: DateTime<Utc>) -> Self {
        let body = strip_sources_block(text);
        let (title, body) = split_title(body);
        Self {
            title,
            metadata: ReportMetadata {
                word_count: word_count(body),
                ..ReportMetadata::default()
            },
            executive_summary: body.to_string(),
            sections: Vec::new(),
            sources: Vec::new(),
            generated_at,
        }
    }

    pub fn set_sources(&mut self, sources: Vec<ReportSource>) {
        self.metadata.sources_count = sources.len() as u64;
        self.sources = sources;
    }
}

/// Accepts the report shapes the backend sends: plain text, an object with a
/// `report` string plus `sources`, or a structured report with sections.
pub fn normalize_report(payload: &Value, generated_at: DateTime<Utc>) -> Option<ResearchReport> {
    match payload {
        Value::String(text) if !text.trim().is_empty() => {
            Some(ResearchReport::from_text(text, generated_at))
        }
        Value::Object(map) => {
            if let Some(inner) = map.get("report").filter(|value| value.is_object()) {
                let mut report = normalize_report(inner, generated_at)?;
                if report.sources.is_empty() {
                    if let Some(sources) = map.get("sources") {
                        report.set_sources(normalize_sources(sources));
                    }
                }
                return Some(report);
            }
            let mut report = structured_report(payload, generated_at)
                .or_else(|| {
                    first_text(payload, &["report", "content", "text", "markdown"])
                        .map(|text| ResearchReport::from_text(text, generated_at))
                })?;
            if let Some(title) = first_text(payload, &["title"]) {
                report.title = title.trim().to_string();
            }
            if let Some(sources) = map.get("sources") {
                report.set_sources(normalize_sources(sources));
            }
            if let Some(metadata) = map.get("metadata") {
                apply_metadata(&mut report.metadata, metadata);
            }
            Some(report)
        }
        _ => None,
    }
}

fn structured_report(payload: &Value, generated_at: DateTime<Utc>) -> Option<ResearchReport> {
    let raw_sections = payload.get("sections").and_then(Value::as_array)?;
    let mut sections: Vec<ReportSection> = raw_sections
        .iter()
        .enumerate()
        .filter_map(|(position, section)| {
            let content = first_text(section, &["content", "text", "body"])?.trim().to_string();
            let title = first_text(section, &["title", "heading"])
                .unwrap_or_default()
                .trim()
                .to_string();
            let order = section
                .get("order")
                .and_then(value_as_u64)
                .map(|order| order as u32)
                .unwrap_or(position as u32 + 1);
            Some(ReportSection {
                title,
                content,
                order,
            })
        })
        .collect();
    sections.sort_by_key(|section| section.order);

    let summary = first_text(payload, &["executive_summary", "executiveSummary", "summary"])
        .map(|text| strip_sources_block(text).to_string())
        .unwrap_or_default();
    let words = word_count(&summary)
        + sections
            .iter()
            .map(|section| word_count(&section.content))
            .sum::<u64>();
    Some(ResearchReport {
        title: DEFAULT_REPORT_TITLE.to_string(),
        executive_summary: summary,
        sections,
        sources: Vec::new(),
        metadata: ReportMetadata {
            word_count: words,
            ..ReportMetadata::default()
        },
        generated_at,
    })
}

fn apply_metadata(metadata: &mut ReportMetadata, raw: &Value) {
    if let Some(words) = first_u64(raw, &["word_count", "wordCount"]) {
        metadata.word_count = words;
    }
    if let Some(sources) = first_u64(raw, &["sources_count", "sourcesCount"]) {
        metadata.sources_count = sources;
    }
    if let Some(elapsed) = first_u64(raw, &["generation_time_ms", "generationTimeMs"]) {
        metadata.generation_time_ms = elapsed;
    }
}

fn first_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(value_as_u64))
}

pub fn normalize_sources(raw: &Value) -> Vec<ReportSource> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(position, item)| normalize_source(item, position + 1))
        .collect()
}

fn normalize_source(item: &Value, number: usize) -> Option<ReportSource> {
    let fallback_id = format!("src-{number}");
    match item {
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            let url = if looks_like_url(text) { text } else { "" };
            Some(ReportSource {
                id: fallback_id,
                title: text.to_string(),
                url: url.to_string(),
                kind: "web".to_string(),
                date: None,
                authors: Vec::new(),
                relevance_score: 0.0,
                summary: None,
            })
        }
        Value::Object(_) => {
            let url = first_text(item, &["url", "link", "href"]).unwrap_or_default();
            let title = first_text(item, &["title", "name"]).unwrap_or(url);
            if title.trim().is_empty() {
                return None;
            }
            let authors = match item.get("authors") {
                Some(Value::Array(names)) => names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Some(Value::String(names)) => names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            };
            let id = match item.get("id") {
                Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => fallback_id,
            };
            Some(ReportSource {
                id,
                title: title.trim().to_string(),
                url: url.trim().to_string(),
                kind: first_text(item, &["type", "source_type", "kind"])
                    .unwrap_or("web")
                    .to_string(),
                date: first_text(item, &["date", "published", "published_at"]).map(str::to_string),
                authors,
                relevance_score: ["relevance_score", "relevanceScore", "relevance", "score"]
                    .iter()
                    .find_map(|key| item.get(*key).and_then(value_as_f64))
                    .unwrap_or(0.0),
                summary: first_text(item, &["summary", "snippet", "description"])
                    .map(str::to_string),
            })
        }
        _ => None,
    }
}

fn looks_like_url(text: &str) -> bool {
    text.starts_with("http://") || text.starts_with("https://")
}

fn first_text<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| {
        value
            .get(*key)
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
    })
}

fn sources_heading() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?im)(?:^[ \t]*|[.!?][ \t]+)(?P<head>(?:#{1,6}[ \t]*)?(?:\*\*|__)?sources(?:[ \t]*\(\d+\))?[ \t]*(?:\*\*|__)?[ \t]*(?::[ \t]*(?:\*\*|__)?|$))",
        )
        .expect("valid regex")
    })
}

fn citation_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[ \t]*(?:[-*+][ \t]|\d+[.)][ \t]|\[\d+\]|<?https?://|\[[^\]]*\]\()")
            .expect("valid regex")
    })
}

/// Everything after the heading must read as a citation list.
fn is_citation_tail(tail: &str) -> bool {
    tail.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(|line| citation_line().is_match(line) || sources_heading().is_match(line))
}

/// Cuts a trailing "Sources:" / "Sources (N):" citation block. The heading
/// has to open a line or follow a sentence end; prose that merely mentions
/// sources is left alone.
pub fn strip_sources_block(text: &str) -> &str {
    let cut = sources_heading()
        .captures_iter(text)
        .filter_map(|captures| captures.name("head"))
        .find(|head| is_citation_tail(&text[head.end()..]));
    match cut {
        Some(head) => text[..head.start()].trim(),
        None => text.trim(),
    }
}

pub fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Leading markdown `# Title` line becomes the title.
fn split_title(text: &str) -> (String, &str) {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("# ") {
        let (line, body) = rest.split_once('\n').unwrap_or((rest, ""));
        let title = line.trim();
        if !title.is_empty() {
            return (title.to_string(), body.trim());
        }
    }
    (DEFAULT_REPORT_TITLE.to_string(), text.trim())
}

/// Text accumulated from `report_chunk` events.
#[derive(Debug, Clone, Default)]
pub struct ReportAssembler {
    text: String,
}

impl ReportAssembler {
    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn raw(&self) -> &str {
        &self.text
    }

    pub fn build(&self, generated_at: DateTime<Utc>) -> ResearchReport {
        ResearchReport::from_text(&self.text, generated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_772_359_200_000)
            .single()
            .expect("timestamp")
    }

    #[test]
    fn chunked_text_drops_trailing_sources_block() {
        let mut assembler = ReportAssembler::default();
        assembler.push("Intro text. ");
        assembler.push("More text. Sources: [1] foo");
        let report = assembler.build(ts());
        assert_eq!(report.executive_summary, "Intro text. More text.");
        assert_eq!(report.metadata.word_count, 4);
        assert_eq!(report.title, DEFAULT_REPORT_TITLE);
    }

    #[test]
    fn strips_counted_and_marked_up_headings() {
        assert_eq!(
            strip_sources_block("Body\n\n## Sources (3):\n- a\n- b"),
            "Body"
        );
        assert_eq!(strip_sources_block("Body\n**Sources:** [1] x"), "Body");
        assert_eq!(
            strip_sources_block("Body\n\n### Sources\n* https://a.example"),
            "Body"
        );
        assert_eq!(strip_sources_block("Nothing to cut"), "Nothing to cut");
        assert_eq!(
            strip_sources_block("Open sources: are great.\n\nSources: [1]"),
            "Open sources: are great."
        );
    }

    #[test]
    fn prose_mentioning_sources_is_kept() {
        let text = "Energy sources: coal and gas dominate. The outlook improves over the decade.";
        assert_eq!(strip_sources_block(text), text);
        assert_eq!(
            strip_sources_block("Intro.\n\nSources: vary by region and season."),
            "Intro.\n\nSources: vary by region and season."
        );
        assert_eq!(
            strip_sources_block("Sources of energy vary.\n\nSources:\n- [Grid data](https://a.example)"),
            "Sources of energy vary."
        );
        let report = ResearchReport::from_text(text, ts());
        assert_eq!(report.executive_summary, text);
        assert_eq!(report.metadata.word_count, 12);
    }

    #[test]
    fn free_text_title_comes_from_heading() {
        let report = ResearchReport::from_text("# Rust in 2026\n\nIt grew.", ts());
        assert_eq!(report.title, "Rust in 2026");
        assert_eq!(report.executive_summary, "It grew.");
    }

    #[test]
    fn completion_payload_with_url_sources() {
        let payload = json!({
            "report": "Findings here.\n\nSources:\n1. https://a.example",
            "sources": ["https://a.example", "Internal memo"],
            "iterations": 3,
        });
        let report = normalize_report(&payload, ts()).expect("report");
        assert_eq!(report.executive_summary, "Findings here.");
        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.sources[0].url, "https://a.example");
        assert_eq!(report.sources[1].url, "");
        assert_eq!(report.sources[1].id, "src-2");
        assert_eq!(report.metadata.sources_count, 2);
    }

    #[test]
    fn structured_report_orders_sections() {
        let payload = json!({
            "title": "Survey",
            "executive_summary": "Short answer.",
            "sections": [
                {"title": "Later", "content": "two words", "order": 2},
                {"title": "First", "content": "one", "order": 1},
                {"title": "Empty", "content": "  "}
            ],
            "sources": [{"title": "Paper", "url": "https://p", "relevance_score": 0.8, "authors": "A, B"}],
            "metadata": {"generation_time_ms": 1200}
        });
        let report = normalize_report(&payload, ts()).expect("report");
        assert_eq!(report.title, "Survey");
        assert_eq!(
            report.sections.iter().map(|s| s.title.as_str()).collect::<Vec<_>>(),
            vec!["First", "Later"]
        );
        assert_eq!(report.metadata.word_count, 5);
        assert_eq!(report.metadata.generation_time_ms, 1200);
        assert_eq!(report.sources[0].authors, vec!["A", "B"]);
        assert_eq!(report.sources[0].relevance_score, 0.8);
    }

    #[test]
    fn empty_payloads_are_not_reports() {
        assert!(normalize_report(&json!(""), ts()).is_none());
        assert!(normalize_report(&json!({"iterations": 2}), ts()).is_none());
        assert!(normalize_report(&json!(null), ts()).is_none());
    }
}
