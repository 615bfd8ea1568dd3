//! Markdown rendering.
//!
//! One render produces two views of the same document: a self-contained HTML
//! page and the styled line layout the terminal window draws. Both are built
//! from a single event stream so the extension set is applied identically.

mod html;
mod layout;

use std::fs;
use std::path::Path;

use pulldown_cmark::{Event, HeadingLevel, Options, Parser as MdParser, TagEnd};
use ratatui::style::Style;
use syntect::highlighting::{Theme, ThemeSet};
use syntect::parsing::SyntaxSet;

use crate::error::ReadError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyledSegment {
    pub text: String,
    pub style: Style,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderedLine {
    pub segments: Vec<StyledSegment>,
    pub plain: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TocEntry {
    pub level: u8,
    pub title: String,
    pub line: usize,
}

/// The latest render of the watched file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderedDocument {
    /// Complete HTML page, stylesheet included.
    pub html: String,
    pub lines: Vec<RenderedLine>,
    /// h1-h3 headings with their line in `lines`.
    pub toc: Vec<TocEntry>,
}

impl RenderedDocument {
    #[cfg(test)]
    pub fn plain_text(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.plain.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Turns the file at `path` into a document. Implementations hold no state
/// that changes between calls.
pub trait Render {
    fn render(&self, path: &Path) -> Result<RenderedDocument, ReadError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Abbreviation {
    pub name: String,
    pub title: String,
}

pub struct MarkdownRenderer {
    syntax_set: SyntaxSet,
    theme: Theme,
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        let theme_set = ThemeSet::load_defaults();
        Self {
            syntax_set: SyntaxSet::load_defaults_newlines(),
            theme: resolve_theme(&theme_set),
        }
    }

    pub fn render_source(&self, title: &str, source: &str) -> RenderedDocument {
        let (body, abbreviations) = extract_abbreviations(source);
        let events = markdown_events(&body);

        let html = html::render_page(
            title,
            &events,
            &abbreviations,
            &self.syntax_set,
            &self.theme,
        );
        let (lines, toc) = layout::layout(&events, &self.syntax_set, &self.theme);

        RenderedDocument { html, lines, toc }
    }
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Render for MarkdownRenderer {
    fn render(&self, path: &Path) -> Result<RenderedDocument, ReadError> {
        log::debug!("Rendering {}", path.display());
        let source = fs::read_to_string(path).map_err(|source| ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let title = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        Ok(self.render_source(&title, &source))
    }
}

fn resolve_theme(theme_set: &ThemeSet) -> Theme {
    if let Some(theme) = theme_set.themes.get("base16-ocean.dark") {
        return theme.clone();
    }
    theme_set
        .themes
        .values()
        .next()
        .cloned()
        .unwrap_or_default()
}

fn heading_level_u8(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_SMART_PUNCTUATION);
    options.insert(Options::ENABLE_HEADING_ATTRIBUTES);
    options.insert(Options::ENABLE_GFM);
    options.insert(Options::ENABLE_DEFINITION_LIST);
    options.insert(Options::ENABLE_WIKILINKS);
    options
}

/// A paragraph holding only this marker is replaced by a table of contents.
const TOC_MARKER: &str = "[TOC]";

/// Index of the closing `End(Paragraph)` if the paragraph at `start` holds
/// nothing but the `[TOC]` marker.
fn toc_marker_end(events: &[Event<'_>], start: usize) -> Option<usize> {
    let mut text = String::new();
    for (offset, event) in events.iter().enumerate().skip(start + 1) {
        match event {
            Event::Text(part) => text.push_str(part),
            Event::End(TagEnd::Paragraph) => {
                return (text.trim() == TOC_MARKER).then_some(offset);
            }
            _ => return None,
        }
    }
    None
}

/// Parses `body` with the session's extension set. Soft breaks are promoted
/// to hard breaks so every source newline is a line break.
fn markdown_events(body: &str) -> Vec<Event<'_>> {
    MdParser::new_ext(body, markdown_options())
        .map(|event| match event {
            Event::SoftBreak => Event::HardBreak,
            other => other,
        })
        .collect()
}

/// Splits `*[ABBR]: expansion` definition lines out of the source. Lines
/// inside fenced code are left alone.
pub(crate) fn extract_abbreviations(source: &str) -> (String, Vec<Abbreviation>) {
    let mut body = String::with_capacity(source.len());
    let mut abbreviations: Vec<Abbreviation> = Vec::new();
    let mut fence: Option<&str> = None;

    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_start();

        if let Some(marker) = fence {
            if trimmed.starts_with(marker) {
                fence = None;
            }
            body.push_str(line);
            continue;
        }
        if trimmed.starts_with("```") {
            fence = Some("```");
        } else if trimmed.starts_with("~~~") {
            fence = Some("~~~");
        } else if let Some(abbr) = parse_abbreviation(trimmed) {
            match abbreviations.iter_mut().find(|a| a.name == abbr.name) {
                Some(existing) => existing.title = abbr.title,
                None => abbreviations.push(abbr),
            }
            continue;
        }
        body.push_str(line);
    }

    // Longest first so "HTML5" wins over "HTML".
    abbreviations.sort_by(|a, b| b.name.len().cmp(&a.name.len()));
    (body, abbreviations)
}

fn parse_abbreviation(line: &str) -> Option<Abbreviation> {
    let rest = line.strip_prefix("*[")?;
    let (name, title) = rest.split_once("]:")?;
    let name = name.trim();
    if name.is_empty() || name.contains(']') {
        return None;
    }
    Some(Abbreviation {
        name: name.to_string(),
        title: title.trim().to_string(),
    })
}
