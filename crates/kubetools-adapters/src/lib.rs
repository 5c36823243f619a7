//! Source adapter contract + the markdown table adapter for the kubetools README.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kubetools_core::ToolRecord;
use kubetools_storage::{FetchError, HttpFetcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kubetools-adapters";

pub const KUBETOOLS_README_SOURCE_ID: &str = "kubetools-readme";

/// Substrings that mark a table's column-title row.
pub const HEADER_ROW_LABELS: [&str; 3] = ["Sr No", "Tool Name", "Description"];

const MIN_ROW_FIELDS: usize = 4;
const TABLE_DELIMITER: char = '|';
const SEPARATOR_RUN: &str = "---";
const CATEGORY_PREFIX: &str = "## ";

static INLINE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*?)\]\((.*?)\)").expect("valid inline link regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTarget {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub url: String,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching source document: {0}")]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_document(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &DocumentTarget,
    ) -> Result<FetchedDocument, AdapterError>;

    /// Never fails: malformed rows are dropped or degraded individually.
    fn parse_document(&self, document: &FetchedDocument) -> Vec<ToolRecord>;
}

#[derive(Debug, Clone, Copy)]
struct MarkdownTableAdapter {
    source_id: &'static str,
}

#[async_trait]
impl SourceAdapter for MarkdownTableAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn fetch_document(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &DocumentTarget,
    ) -> Result<FetchedDocument, AdapterError> {
        let resp = http
            .fetch_bytes(ctx.run_id, self.source_id, &target.url)
            .await?;
        Ok(FetchedDocument {
            url: resp.final_url,
            text: String::from_utf8_lossy(&resp.body).into_owned(),
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_document(&self, document: &FetchedDocument) -> Vec<ToolRecord> {
        parse_markdown_tables(&document.text)
    }
}

pub fn kubetools_readme_adapter() -> impl SourceAdapter {
    MarkdownTableAdapter {
        source_id: KUBETOOLS_README_SOURCE_ID,
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        KUBETOOLS_README_SOURCE_ID => Some(Box::new(kubetools_readme_adapter())),
        _ => None,
    }
}

/// How a single line of the document is interpreted.
#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Category(&'a str),
    Row(Vec<&'a str>),
    Ignored,
}

fn classify_line(line: &str) -> Line<'_> {
    if let Some(header) = line.strip_prefix(CATEGORY_PREFIX) {
        return Line::Category(header.trim());
    }

    let Some(rest) = line.strip_prefix(TABLE_DELIMITER) else {
        return Line::Ignored;
    };
    if !rest.contains(TABLE_DELIMITER) || line.contains(SEPARATOR_RUN) {
        return Line::Ignored;
    }
    if HEADER_ROW_LABELS.iter().any(|label| line.contains(label)) {
        return Line::Ignored;
    }

    let fields: Vec<&str> = line
        .split(TABLE_DELIMITER)
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .collect();
    if fields.len() < MIN_ROW_FIELDS {
        return Line::Ignored;
    }
    Line::Row(fields)
}

/// Split a description cell into `(description, url)`.
///
/// The first `[label](target)` wins; without one the whole cell is the description and the url
/// is empty.
pub fn split_inline_link(cell: &str) -> (String, String) {
    let cell = cell.trim();
    match INLINE_LINK.captures(cell) {
        Some(caps) => (caps[1].trim().to_string(), caps[2].trim().to_string()),
        None => (cell.to_string(), String::new()),
    }
}

fn next_record_id(parsed: usize) -> Option<u32> {
    u32::try_from(parsed).ok()?.checked_add(1)
}

#[derive(Debug, Default)]
struct ParseState {
    category: String,
    records: Vec<ToolRecord>,
}

impl ParseState {
    fn step(mut self, line: &str) -> Self {
        match classify_line(line) {
            Line::Category(header) => self.category = header.to_string(),
            Line::Row(fields) => {
                // A document with more rows than `u32` ids can hold stops accumulating.
                let Some(id) = next_record_id(self.records.len()) else {
                    return self;
                };
                let (description, url) = split_inline_link(fields[2]);
                self.records.push(ToolRecord {
                    id,
                    name: fields[1].to_string(),
                    description,
                    url,
                    category: self.category.clone(),
                    stars: 0,
                });
            }
            Line::Ignored => {}
        }
        self
    }
}

/// Parse every tool table row in a markdown document.
///
/// Rows inherit the most recent `## ` header as their category (empty before the first one).
/// Ids start at 1 and increase across the whole document. Stars are left at 0.
pub fn parse_markdown_tables(text: &str) -> Vec<ToolRecord> {
    text.lines()
        .fold(ParseState::default(), ParseState::step)
        .records
}
