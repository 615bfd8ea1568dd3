use std::collections::HashSet;
use std::fmt::Write as _;

use pulldown_cmark::{html, CodeBlockKind, CowStr, Event, Tag, TagEnd};
use syntect::highlighting::Theme;
use syntect::parsing::SyntaxSet;

use super::{heading_level_u8, toc_marker_end, Abbreviation};

const STYLESHEET: &str = r#"body { font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; line-height: 1.5; max-width: 52em; margin: 2em auto; padding: 0 1em; color: #24292f; }
pre { padding: 0.8em; overflow: auto; border-radius: 4px; }
code { font-family: ui-monospace, Menlo, Consolas, monospace; }
:not(pre) > code { background: #eff1f3; padding: 0.1em 0.3em; border-radius: 3px; }
table { border-collapse: collapse; }
th, td { border: 1px solid #d0d7de; padding: 0.3em 0.8em; }
blockquote { margin: 0; padding: 0 1em; color: #57606a; border-left: 0.25em solid #d0d7de; }
blockquote[class^="markdown-alert-"] { color: inherit; }
.markdown-alert-note { border-left-color: #0969da; }
.markdown-alert-tip { border-left-color: #1a7f37; }
.markdown-alert-important { border-left-color: #8250df; }
.markdown-alert-warning { border-left-color: #9a6700; }
.markdown-alert-caution { border-left-color: #cf222e; }
abbr[title] { text-decoration: underline dotted; }
dt { font-weight: 600; }
dd { margin-left: 1.5em; }
nav.toc ul { list-style: none; padding-left: 1.2em; }
.footnote-definition { font-size: 0.9em; }
"#;

struct Heading {
    level: u8,
    text: String,
    id: String,
}

/// Renders the event stream into a complete HTML page.
pub(super) fn render_page(
    title: &str,
    events: &[Event<'_>],
    abbreviations: &[Abbreviation],
    syntax_set: &SyntaxSet,
    theme: &Theme,
) -> String {
    let headings = collect_headings(events);
    let rewritten = rewrite_events(events, &headings, abbreviations, syntax_set, theme);

    let mut body = String::new();
    html::push_html(&mut body, rewritten.into_iter());

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<style>\n{STYLESHEET}</style>\n</head>\n<body>\n{body}</body>\n</html>\n",
        escape_html(title)
    )
}

fn rewrite_events<'a>(
    events: &[Event<'a>],
    headings: &[Heading],
    abbreviations: &[Abbreviation],
    syntax_set: &SyntaxSet,
    theme: &Theme,
) -> Vec<Event<'a>> {
    let mut out = Vec::with_capacity(events.len());
    let mut heading_index = 0;
    let mut in_code_block = false;
    let mut image_depth = 0usize;
    let mut idx = 0;

    while idx < events.len() {
        match &events[idx] {
            Event::Start(Tag::Heading {
                level,
                classes,
                attrs,
                ..
            }) => {
                let id = headings
                    .get(heading_index)
                    .map(|heading| CowStr::from(heading.id.clone()));
                heading_index += 1;
                out.push(Event::Start(Tag::Heading {
                    level: *level,
                    id,
                    classes: classes.clone(),
                    attrs: attrs.clone(),
                }));
            }
            Event::Start(Tag::Paragraph) => {
                if let Some(end) = toc_marker_end(events, idx) {
                    out.push(Event::Html(CowStr::from(toc_html(headings))));
                    idx = end + 1;
                    continue;
                }
                out.push(events[idx].clone());
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                if let Some((highlighted, end)) =
                    highlight_code_block(kind, events, idx, syntax_set, theme)
                {
                    out.push(Event::Html(CowStr::from(highlighted)));
                    idx = end + 1;
                    continue;
                }
                in_code_block = true;
                out.push(events[idx].clone());
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code_block = false;
                out.push(events[idx].clone());
            }
            Event::Start(Tag::Image { .. }) => {
                image_depth += 1;
                out.push(events[idx].clone());
            }
            Event::End(TagEnd::Image) => {
                image_depth = image_depth.saturating_sub(1);
                out.push(events[idx].clone());
            }
            // Alt text is escaped by the writer, so markup cannot go there.
            Event::Text(text)
                if !in_code_block && image_depth == 0 && !abbreviations.is_empty() =>
            {
                out.extend(apply_abbreviations(text, abbreviations));
            }
            other => out.push(other.clone()),
        }
        idx += 1;
    }

    out
}

/// Assigns every heading an id: its explicit `{#id}` or a unique slug of its text.
fn collect_headings(events: &[Event<'_>]) -> Vec<Heading> {
    let mut used: HashSet<String> = events
        .iter()
        .filter_map(|event| match event {
            Event::Start(Tag::Heading { id: Some(id), .. }) => Some(id.to_string()),
            _ => None,
        })
        .collect();

    let mut headings = Vec::new();
    let mut current: Option<(u8, Option<String>, String)> = None;

    for event in events {
        match event {
            Event::Start(Tag::Heading { level, id, .. }) => {
                let explicit = id.as_ref().map(|id| id.to_string());
                current = Some((heading_level_u8(*level), explicit, String::new()));
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, _, buf)) = current.as_mut() {
                    buf.push_str(text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some((level, explicit, text)) = current.take() {
                    let id = explicit.unwrap_or_else(|| unique_slug(&text, &mut used));
                    headings.push(Heading {
                        level,
                        text: text.trim().to_string(),
                        id,
                    });
                }
            }
            _ => {}
        }
    }

    headings
}

fn unique_slug(text: &str, used: &mut HashSet<String>) -> String {
    let base = slugify(text);
    let mut candidate = base.clone();
    let mut n = 1;
    while used.contains(&candidate) {
        candidate = format!("{base}_{n}");
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in text.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_dash {
                slug.push('-');
                pending_dash = false;
            }
            slug.push(c);
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.is_empty() {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("section");
    }
    slug
}

fn toc_html(headings: &[Heading]) -> String {
    let mut out = String::from("<nav class=\"toc\">\n");
    let mut open_levels: Vec<u8> = Vec::new();

    for heading in headings {
        while open_levels.last().is_some_and(|&level| level > heading.level) {
            out.push_str("</li>\n</ul>\n");
            open_levels.pop();
        }
        if open_levels.last() == Some(&heading.level) {
            out.push_str("</li>\n");
        } else {
            out.push_str("<ul>\n");
            open_levels.push(heading.level);
        }
        let _ = write!(
            out,
            "<li><a href=\"#{}\">{}</a>",
            escape_html(&heading.id),
            escape_html(&heading.text)
        );
    }
    while open_levels.pop().is_some() {
        out.push_str("</li>\n</ul>\n");
    }

    out.push_str("</nav>\n");
    out
}

/// Highlights a fenced block with a known language. Returns the HTML and the
/// index of the block's `End` event.
fn highlight_code_block(
    kind: &CodeBlockKind<'_>,
    events: &[Event<'_>],
    start: usize,
    syntax_set: &SyntaxSet,
    theme: &Theme,
) -> Option<(String, usize)> {
    let CodeBlockKind::Fenced(info) = kind else {
        return None;
    };
    let lang = info.split_whitespace().next()?;
    let syntax = syntax_set.find_syntax_by_token(lang)?;

    let mut code = String::new();
    let mut end = None;
    for (offset, event) in events.iter().enumerate().skip(start + 1) {
        match event {
            Event::Text(text) => code.push_str(text),
            Event::End(TagEnd::CodeBlock) => {
                end = Some(offset);
                break;
            }
            _ => {}
        }
    }
    let end = end?;

    match syntect::html::highlighted_html_for_string(&code, syntax_set, syntax, theme) {
        Ok(highlighted) => Some((highlighted, end)),
        Err(err) => {
            log::debug!("Highlighting {lang} block failed: {err}");
            None
        }
    }
}

fn apply_abbreviations<'a>(text: &str, abbreviations: &[Abbreviation]) -> Vec<Event<'a>> {
    let mut events = Vec::new();
    let mut plain_start = 0;
    let mut idx = 0;

    while idx < text.len() {
        let preceded_by_word = text[..idx].chars().next_back().is_some_and(is_word_char);
        let found = if preceded_by_word {
            None
        } else {
            abbreviations.iter().find(|abbr| {
                text[idx..].starts_with(abbr.name.as_str())
                    && !text[idx + abbr.name.len()..]
                        .chars()
                        .next()
                        .is_some_and(is_word_char)
            })
        };

        match found {
            Some(abbr) => {
                if plain_start < idx {
                    events.push(Event::Text(CowStr::from(text[plain_start..idx].to_string())));
                }
                events.push(Event::InlineHtml(CowStr::from(format!(
                    "<abbr title=\"{}\">{}</abbr>",
                    escape_html(&abbr.title),
                    escape_html(&abbr.name)
                ))));
                idx += abbr.name.len();
                plain_start = idx;
            }
            None => {
                idx += text[idx..].chars().next().map_or(1, char::len_utf8);
            }
        }
    }

    if plain_start < text.len() {
        events.push(Event::Text(CowStr::from(text[plain_start..].to_string())));
    }
    events
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
