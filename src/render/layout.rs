//! Styled line layout for the terminal window.

use pulldown_cmark::{Alignment, BlockQuoteKind, CodeBlockKind, Event, Tag, TagEnd};
use ratatui::style::{Color, Modifier, Style};
use syntect::easy::HighlightLines;
use syntect::highlighting::Theme;
use syntect::parsing::SyntaxSet;
use syntect::util::LinesWithEndings;

use super::{heading_level_u8, toc_marker_end, RenderedLine, StyledSegment, TocEntry};

const RULE: &str = "────────────────────────────────────────────────────────────────";

pub(super) fn layout(
    events: &[Event<'_>],
    syntax_set: &SyntaxSet,
    theme: &Theme,
) -> (Vec<RenderedLine>, Vec<TocEntry>) {
    let mut layout = Layout::new(syntax_set, theme);

    // The TOC panel replaces the marker paragraph here.
    let mut idx = 0;
    while idx < events.len() {
        if matches!(events[idx], Event::Start(Tag::Paragraph)) {
            if let Some(end) = toc_marker_end(events, idx) {
                idx = end + 1;
                continue;
            }
        }

        match events[idx].clone() {
            Event::Start(tag) => layout.handle_start(tag),
            Event::End(tag) => layout.handle_end(tag),
            Event::Text(text) => layout.add_text(&text),
            Event::Code(code) => layout.add_inline_code(&code),
            Event::Html(html) | Event::InlineHtml(html) => layout.add_text(&html),
            Event::FootnoteReference(name) => layout.add_text(&format!("[^{name}]")),
            Event::HardBreak => layout.hard_break(),
            Event::Rule => layout.add_rule(),
            Event::TaskListMarker(done) => layout.add_task_marker(done),
            _ => {}
        }
        idx += 1;
    }

    layout.finish()
}

#[derive(Default)]
struct TableState {
    in_head: bool,
    in_row: bool,
    in_cell: bool,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    current_row: Vec<String>,
    current_cell: String,
    alignments: Vec<Alignment>,
}

impl TableState {
    fn new(alignments: Vec<Alignment>) -> Self {
        Self {
            alignments,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct InlineState {
    emphasis: usize,
    strong: usize,
    strikethrough: usize,
    link_depth: usize,
    definition_title: bool,
}

impl InlineState {
    fn style(&self) -> Style {
        let mut style = Style::default();
        if self.emphasis > 0 {
            style = style.add_modifier(Modifier::ITALIC);
        }
        if self.strong > 0 || self.definition_title {
            style = style.add_modifier(Modifier::BOLD);
        }
        if self.strikethrough > 0 {
            style = style.add_modifier(Modifier::CROSSED_OUT);
        }
        if self.link_depth > 0 {
            style = style.fg(Color::Cyan).add_modifier(Modifier::UNDERLINED);
        }
        style
    }
}

#[derive(Clone, Debug)]
struct ListState {
    ordered: bool,
    next_index: u64,
}

struct Layout<'a> {
    syntax_set: &'a SyntaxSet,
    theme: &'a Theme,

    lines: Vec<RenderedLine>,
    toc: Vec<TocEntry>,

    inline: InlineState,
    current_segments: Vec<StyledSegment>,
    current_plain: String,

    image_alt: Option<(String, String)>,

    heading_level: Option<u8>,
    blockquote_depth: usize,
    list_stack: Vec<ListState>,

    code_block_lang: Option<String>,
    code_block_buf: String,

    table: Option<TableState>,
}

fn alert_label(kind: BlockQuoteKind) -> (&'static str, Color) {
    match kind {
        BlockQuoteKind::Note => ("NOTE", Color::LightBlue),
        BlockQuoteKind::Tip => ("TIP", Color::LightGreen),
        BlockQuoteKind::Important => ("IMPORTANT", Color::LightMagenta),
        BlockQuoteKind::Warning => ("WARNING", Color::Yellow),
        BlockQuoteKind::Caution => ("CAUTION", Color::LightRed),
    }
}

impl<'a> Layout<'a> {
    fn new(syntax_set: &'a SyntaxSet, theme: &'a Theme) -> Self {
        Self {
            syntax_set,
            theme,
            lines: Vec::new(),
            toc: Vec::new(),
            inline: InlineState::default(),
            current_segments: Vec::new(),
            current_plain: String::new(),
            image_alt: None,
            heading_level: None,
            blockquote_depth: 0,
            list_stack: Vec::new(),
            code_block_lang: None,
            code_block_buf: String::new(),
            table: None,
        }
    }

    fn finish(mut self) -> (Vec<RenderedLine>, Vec<TocEntry>) {
        self.flush_line(false);
        if self.lines.is_empty() {
            self.lines.push(RenderedLine::default());
        }
        (self.lines, self.toc)
    }

    fn push_text(&mut self, text: &str, style: Style) {
        if text.is_empty() {
            return;
        }
        self.current_plain.push_str(text);
        self.current_segments.push(StyledSegment {
            text: text.to_string(),
            style,
        });
    }

    fn push_styled_plain_text(&mut self, text: &str) {
        let style = match self.heading_level {
            Some(1) => Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
            Some(2) => Style::default()
                .fg(Color::LightMagenta)
                .add_modifier(Modifier::BOLD),
            Some(_) => Style::default()
                .fg(Color::LightCyan)
                .add_modifier(Modifier::BOLD),
            None => self.inline.style(),
        };
        self.push_text(text, style);
    }

    fn push_prefix_if_needed(&mut self) {
        if !self.current_plain.is_empty() {
            return;
        }

        if self.blockquote_depth > 0 {
            let prefix = "> ".repeat(self.blockquote_depth);
            self.push_text(&prefix, Style::default().fg(Color::DarkGray));
        }
    }

    fn flush_line(&mut self, force_empty: bool) {
        if !force_empty && self.current_segments.is_empty() && self.current_plain.is_empty() {
            return;
        }

        self.lines.push(RenderedLine {
            segments: std::mem::take(&mut self.current_segments),
            plain: std::mem::take(&mut self.current_plain),
        });
    }

    fn blank_line(&mut self) {
        if self.lines.last().is_some_and(|line| line.plain.is_empty()) {
            return;
        }
        self.flush_line(true);
    }

    fn handle_start(&mut self, tag: Tag<'_>) {
        if let Some(table) = self.table.as_mut() {
            match tag {
                Tag::TableHead => {
                    table.in_head = true;
                    return;
                }
                Tag::TableRow => {
                    table.in_row = true;
                    table.current_row.clear();
                    return;
                }
                Tag::TableCell => {
                    table.in_cell = true;
                    table.current_cell.clear();
                    return;
                }
                _ => {}
            }
        }

        match tag {
            Tag::Heading { level, .. } => {
                self.flush_line(false);
                self.heading_level = Some(heading_level_u8(level));
            }
            Tag::BlockQuote(kind) => {
                self.flush_line(false);
                self.blockquote_depth = self.blockquote_depth.saturating_add(1);
                if let Some(kind) = kind {
                    let (label, color) = alert_label(kind);
                    self.push_prefix_if_needed();
                    self.push_text(label, Style::default().fg(color).add_modifier(Modifier::BOLD));
                    self.flush_line(false);
                }
            }
            Tag::CodeBlock(kind) => {
                self.flush_line(false);
                let lang = match kind {
                    CodeBlockKind::Fenced(name) => name.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                self.code_block_lang = Some(lang);
                self.code_block_buf.clear();
            }
            Tag::List(start) => {
                self.list_stack.push(ListState {
                    ordered: start.is_some(),
                    next_index: start.unwrap_or(1),
                });
            }
            Tag::Item => {
                self.flush_line(false);
                let depth = self.list_stack.len().saturating_sub(1);
                let indent = "  ".repeat(depth);

                let bullet = match self.list_stack.last_mut() {
                    Some(last) if last.ordered => {
                        let bullet = format!("{}. ", last.next_index);
                        last.next_index = last.next_index.saturating_add(1);
                        bullet
                    }
                    _ => "- ".to_string(),
                };

                self.push_text(
                    &format!("{indent}{bullet}"),
                    Style::default().fg(Color::DarkGray),
                );
            }
            Tag::DefinitionListTitle => {
                self.flush_line(false);
                self.inline.definition_title = true;
            }
            Tag::DefinitionListDefinition => {
                self.flush_line(false);
                self.push_text("  : ", Style::default().fg(Color::DarkGray));
            }
            Tag::FootnoteDefinition(name) => {
                self.flush_line(false);
                self.push_text(&format!("[^{name}]: "), Style::default().fg(Color::DarkGray));
            }
            Tag::Emphasis => self.inline.emphasis = self.inline.emphasis.saturating_add(1),
            Tag::Strong => self.inline.strong = self.inline.strong.saturating_add(1),
            Tag::Strikethrough => {
                self.inline.strikethrough = self.inline.strikethrough.saturating_add(1);
            }
            Tag::Link { .. } => {
                self.inline.link_depth = self.inline.link_depth.saturating_add(1);
            }
            Tag::Image { dest_url, .. } => {
                self.image_alt = Some((dest_url.to_string(), String::new()));
            }
            Tag::Table(alignments) => {
                self.flush_line(false);
                self.table = Some(TableState::new(alignments));
            }
            _ => {}
        }
    }

    fn handle_end(&mut self, tag: TagEnd) {
        if let Some(table) = self.table.as_mut() {
            match tag {
                TagEnd::TableCell => {
                    if table.in_cell {
                        table
                            .current_row
                            .push(table.current_cell.trim().to_string());
                        table.current_cell.clear();
                        table.in_cell = false;
                    }
                    return;
                }
                TagEnd::TableRow => {
                    if table.in_row {
                        let row = std::mem::take(&mut table.current_row);
                        if table.in_head {
                            table.headers = row;
                        } else {
                            table.rows.push(row);
                        }
                        table.in_row = false;
                    }
                    return;
                }
                TagEnd::TableHead => {
                    // Header cells arrive without a TableRow wrapper.
                    if !table.current_row.is_empty() {
                        table.headers = std::mem::take(&mut table.current_row);
                    }
                    table.in_head = false;
                    return;
                }
                TagEnd::Table => {
                    let table_state = self.table.take().unwrap_or_default();
                    self.render_table(&table_state);
                    self.blank_line();
                    return;
                }
                _ => {}
            }
        }

        match tag {
            TagEnd::Paragraph | TagEnd::FootnoteDefinition => {
                self.flush_line(false);
                self.blank_line();
            }
            TagEnd::Heading(level) => {
                self.flush_line(false);
                let line_idx = self.lines.len().saturating_sub(1);
                let title = self
                    .lines
                    .get(line_idx)
                    .map(|line| line.plain.trim().to_string())
                    .unwrap_or_default();

                let level = heading_level_u8(level);
                if level <= 3 && !title.is_empty() {
                    self.toc.push(TocEntry {
                        level,
                        title,
                        line: line_idx,
                    });
                }
                self.heading_level = None;
                self.blank_line();
            }
            TagEnd::BlockQuote { .. } => {
                self.flush_line(false);
                self.blockquote_depth = self.blockquote_depth.saturating_sub(1);
                self.blank_line();
            }
            TagEnd::CodeBlock => {
                let lang = self.code_block_lang.take().unwrap_or_default();
                let code = std::mem::take(&mut self.code_block_buf);
                self.render_code_block(&lang, &code);
                self.blank_line();
            }
            TagEnd::List(_) => {
                self.flush_line(false);
                self.list_stack.pop();
                self.blank_line();
            }
            TagEnd::DefinitionList => {
                self.flush_line(false);
                self.blank_line();
            }
            TagEnd::Item | TagEnd::DefinitionListDefinition => {
                self.flush_line(false);
            }
            TagEnd::DefinitionListTitle => {
                self.flush_line(false);
                self.inline.definition_title = false;
            }
            TagEnd::Emphasis => self.inline.emphasis = self.inline.emphasis.saturating_sub(1),
            TagEnd::Strong => self.inline.strong = self.inline.strong.saturating_sub(1),
            TagEnd::Strikethrough => {
                self.inline.strikethrough = self.inline.strikethrough.saturating_sub(1);
            }
            TagEnd::Link => {
                self.inline.link_depth = self.inline.link_depth.saturating_sub(1);
            }
            TagEnd::Image => {
                if let Some((target, alt)) = self.image_alt.take() {
                    let alt = if alt.trim().is_empty() {
                        "image".to_string()
                    } else {
                        alt.trim().to_string()
                    };
                    let placeholder = format!("[image: {alt}] ({target})");
                    self.push_text(&placeholder, Style::default().fg(Color::LightBlue));
                }
            }
            _ => {}
        }
    }

    fn add_text(&mut self, text: &str) {
        if self.code_block_lang.is_some() {
            self.code_block_buf.push_str(text);
            return;
        }

        if let Some(table) = self.table.as_mut() {
            if table.in_cell {
                table.current_cell.push_str(text);
                return;
            }
        }

        if let Some((_, alt)) = self.image_alt.as_mut() {
            alt.push_str(text);
            return;
        }

        self.push_prefix_if_needed();
        self.push_styled_plain_text(text);
    }

    fn hard_break(&mut self) {
        if self.code_block_lang.is_some() {
            self.code_block_buf.push('\n');
            return;
        }
        if let Some(table) = self.table.as_mut() {
            if table.in_cell {
                table.current_cell.push(' ');
                return;
            }
        }
        self.flush_line(false);
    }

    fn add_inline_code(&mut self, code: &str) {
        if self.code_block_lang.is_some() {
            self.code_block_buf.push_str(code);
            return;
        }
        if let Some(table) = self.table.as_mut() {
            if table.in_cell {
                table.current_cell.push_str(code);
                return;
            }
        }
        self.push_prefix_if_needed();
        let style = Style::default()
            .fg(Color::LightYellow)
            .add_modifier(Modifier::BOLD);
        self.push_text(code, style);
    }

    fn add_rule(&mut self) {
        self.flush_line(false);
        self.push_text(RULE, Style::default().fg(Color::DarkGray));
        self.flush_line(false);
        self.blank_line();
    }

    fn add_task_marker(&mut self, done: bool) {
        self.push_prefix_if_needed();
        let marker = if done { "[x] " } else { "[ ] " };
        self.push_text(marker, Style::default().fg(Color::DarkGray));
    }

    fn render_code_block(&mut self, lang: &str, code: &str) {
        let token = lang.split_whitespace().next().unwrap_or_default();
        let syntax = self
            .syntax_set
            .find_syntax_by_token(token)
            .unwrap_or_else(|| self.syntax_set.find_syntax_plain_text());

        let mut highlighter = HighlightLines::new(syntax, self.theme);

        for line in LinesWithEndings::from(code) {
            let clean = line.trim_end_matches(['\n', '\r']);

            self.push_text("  ", Style::default().fg(Color::DarkGray));

            let highlighted_tokens = highlighter
                .highlight_line(line, self.syntax_set)
                .unwrap_or_default();

            if highlighted_tokens.is_empty() {
                self.push_text(clean, Style::default().fg(Color::LightGreen));
            } else {
                for (syn_style, token) in highlighted_tokens {
                    let style = Style::default()
                        .fg(Color::Rgb(
                            syn_style.foreground.r,
                            syn_style.foreground.g,
                            syn_style.foreground.b,
                        ))
                        .bg(Color::Rgb(
                            syn_style.background.r,
                            syn_style.background.g,
                            syn_style.background.b,
                        ));
                    let token = token.replace(['\n', '\r'], "");
                    self.push_text(&token, style);
                }
            }

            self.flush_line(true);
        }
    }

    fn render_table(&mut self, table: &TableState) {
        let mut rows: Vec<Vec<String>> = Vec::new();
        if !table.headers.is_empty() {
            rows.push(table.headers.clone());
        }
        rows.extend(table.rows.iter().cloned());

        let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
        if col_count == 0 {
            return;
        }

        for row in &mut rows {
            row.resize(col_count, String::new());
        }

        let mut widths = vec![3usize; col_count];
        for row in &rows {
            for (idx, cell) in row.iter().enumerate() {
                widths[idx] = widths[idx].max(cell.chars().count());
            }
        }

        let Some(header) = rows.first() else {
            return;
        };
        let line = format_table_row(header, &widths);
        self.push_text(&line, Style::default().fg(Color::Yellow));
        self.flush_line(false);

        let sep_cells: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(idx, width)| {
                let align = table
                    .alignments
                    .get(idx)
                    .copied()
                    .unwrap_or(Alignment::None);
                match align {
                    Alignment::Left => format!(":{}", "-".repeat(width.saturating_sub(1))),
                    Alignment::Center => format!(":{}:", "-".repeat(width.saturating_sub(2))),
                    Alignment::Right => format!("{}:", "-".repeat(width.saturating_sub(1))),
                    Alignment::None => "-".repeat(*width),
                }
            })
            .collect();
        let sep_line = format_table_row(&sep_cells, &widths);
        self.push_text(&sep_line, Style::default().fg(Color::DarkGray));
        self.flush_line(false);

        for row in rows.iter().skip(1) {
            let row_line = format_table_row(row, &widths);
            self.push_text(&row_line, Style::default());
            self.flush_line(false);
        }
    }
}

fn format_table_row(row: &[String], widths: &[usize]) -> String {
    let mut output = String::from("| ");
    for (cell, width) in row.iter().zip(widths) {
        output.push_str(&format!("{cell:<width$}"));
        output.push_str(" | ");
    }
    output
}
