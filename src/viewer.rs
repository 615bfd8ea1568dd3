//! The display side: the sink contract and the terminal pager implementing it.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::layout::{Constraint, Layout};
use ratatui::prelude::{Color, Rect, Style, Stylize};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::block::Padding;
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph, Wrap};
use ratatui::Frame;

use crate::render::RenderedDocument;

const NO_TOC_HEADINGS_STATUS: &str = "No headings in TOC";

/// Anything that can show a rendered document. Each call replaces whatever
/// was shown before.
pub trait ViewerSink {
    fn display(&mut self, document: RenderedDocument);
}

/// What the event loop should do after a key press.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagerAction {
    None,
    Quit,
    Reload,
    OpenInBrowser,
}

fn inset_rect(area: Rect, horizontal: u16, vertical: u16) -> Rect {
    Rect {
        x: area.x.saturating_add(horizontal),
        y: area.y.saturating_add(vertical),
        width: area.width.saturating_sub(horizontal.saturating_mul(2)),
        height: area.height.saturating_sub(vertical.saturating_mul(2)),
    }
}

fn usize_to_u16_saturating(value: usize) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// Scrollable terminal view of the latest document.
#[derive(Default)]
pub struct Pager {
    doc: RenderedDocument,
    title: String,

    scroll: u16,
    viewport_height: u16,
    toc_open: bool,
    toc_selected: usize,

    search_mode: bool,
    search_query: String,
    search_matches: Vec<usize>,
    current_match: usize,

    status: String,
}

impl ViewerSink for Pager {
    fn display(&mut self, document: RenderedDocument) {
        self.doc = document;
        self.recompute_search_matches();
        self.clamp_scroll();
        self.sync_toc_selected_with_scroll();
    }
}

impl Pager {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            viewport_height: 1,
            ..Self::default()
        }
    }

    pub fn document(&self) -> &RenderedDocument {
        &self.doc
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    fn max_scroll(&self) -> u16 {
        let total = self.doc.lines.len();
        let visible = self.viewport_height.max(1) as usize;
        usize_to_u16_saturating(total.saturating_sub(visible))
    }

    fn set_scroll_and_sync(&mut self, scroll: u16) {
        self.scroll = scroll.min(self.max_scroll());
        self.sync_toc_selected_with_scroll();
    }

    fn set_scroll_to_line(&mut self, line: usize) {
        self.set_scroll_and_sync(usize_to_u16_saturating(line));
    }

    fn clamp_scroll(&mut self) {
        self.scroll = self.scroll.min(self.max_scroll());
    }

    fn sync_toc_selected_with_scroll(&mut self) {
        self.toc_selected = self
            .doc
            .toc
            .iter()
            .rposition(|entry| entry.line <= usize::from(self.scroll))
            .unwrap_or(0);
    }

    fn move_toc_selection(&mut self, reverse: bool) {
        let len = self.doc.toc.len();
        if len == 0 {
            self.toc_selected = 0;
            self.status = NO_TOC_HEADINGS_STATUS.to_string();
            return;
        }
        if reverse {
            self.toc_selected = self.toc_selected.saturating_sub(1);
        } else {
            self.toc_selected = (self.toc_selected + 1).min(len - 1);
        }
    }

    fn jump_to_toc_index(&mut self, index: usize) {
        match self.doc.toc.get(index).map(|e| (e.line, e.title.clone())) {
            Some((line, title)) => {
                self.set_scroll_to_line(line);
                self.toc_selected = index;
                self.status = format!("Jumped to {title}");
            }
            None => self.status = NO_TOC_HEADINGS_STATUS.to_string(),
        }
    }

    fn jump_heading_relative(&mut self, reverse: bool) {
        let toc = &self.doc.toc;
        if toc.is_empty() {
            self.status = NO_TOC_HEADINGS_STATUS.to_string();
            return;
        }

        let line = usize::from(self.scroll);
        let target_index = if reverse {
            toc.iter().rposition(|entry| entry.line < line).unwrap_or(0)
        } else {
            toc.iter()
                .position(|entry| entry.line > line)
                .unwrap_or(toc.len() - 1)
        };

        self.jump_to_toc_index(target_index);
    }

    /// Refreshes match lines for the current document without moving.
    fn recompute_search_matches(&mut self) {
        if self.search_query.is_empty() {
            self.search_matches.clear();
            self.current_match = 0;
            return;
        }

        let needle = self.search_query.to_lowercase();
        self.search_matches = self
            .doc
            .lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.plain.to_lowercase().contains(&needle))
            .map(|(idx, _)| idx)
            .collect();
        self.current_match = self
            .current_match
            .min(self.search_matches.len().saturating_sub(1));
    }

    fn update_search_matches(&mut self) {
        self.recompute_search_matches();
        if let Some(&line) = self.search_matches.get(self.current_match) {
            self.set_scroll_to_line(line);
        }
    }

    fn jump_to_next_match(&mut self, reverse: bool) {
        let len = self.search_matches.len();
        if len == 0 {
            return;
        }
        self.current_match = if reverse {
            (self.current_match + len - 1) % len
        } else {
            (self.current_match + 1) % len
        };
        self.set_scroll_to_line(self.search_matches[self.current_match]);
    }

    fn handle_search_input(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc | KeyCode::Enter => {
                self.search_mode = false;
            }
            KeyCode::Backspace => {
                self.search_query.pop();
                self.current_match = 0;
                self.update_search_matches();
            }
            KeyCode::Char(c)
                if !key
                    .modifiers
                    .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
            {
                self.search_query.push(c);
                self.current_match = 0;
                self.update_search_matches();
            }
            _ => {}
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> PagerAction {
        if self.search_mode {
            self.handle_search_input(key);
            return PagerAction::None;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return PagerAction::Quit,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return PagerAction::Quit
            }
            KeyCode::Char('r') => return PagerAction::Reload,
            KeyCode::Char('o') => return PagerAction::OpenInBrowser,
            KeyCode::Char('j') | KeyCode::Down => {
                if self.toc_open {
                    self.move_toc_selection(false);
                } else {
                    self.set_scroll_and_sync(self.scroll.saturating_add(1));
                }
            }
            KeyCode::Char('k') | KeyCode::Up => {
                if self.toc_open {
                    self.move_toc_selection(true);
                } else {
                    self.set_scroll_and_sync(self.scroll.saturating_sub(1));
                }
            }
            KeyCode::Char('g') | KeyCode::Home => self.set_scroll_and_sync(0),
            KeyCode::Char('G') | KeyCode::End => self.set_scroll_and_sync(self.max_scroll()),
            KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                let delta = self.viewport_height.saturating_div(2).max(1);
                self.set_scroll_and_sync(self.scroll.saturating_add(delta));
            }
            KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                let delta = self.viewport_height.saturating_div(2).max(1);
                self.set_scroll_and_sync(self.scroll.saturating_sub(delta));
            }
            KeyCode::PageDown | KeyCode::Char(' ') => {
                self.set_scroll_and_sync(self.scroll.saturating_add(self.viewport_height));
            }
            KeyCode::PageUp => {
                self.set_scroll_and_sync(self.scroll.saturating_sub(self.viewport_height));
            }
            KeyCode::Char('t') => {
                self.toc_open = !self.toc_open;
                if self.toc_open {
                    self.sync_toc_selected_with_scroll();
                }
            }
            KeyCode::Enter if self.toc_open => self.jump_to_toc_index(self.toc_selected),
            KeyCode::Char(']') => self.jump_heading_relative(false),
            KeyCode::Char('[') => self.jump_heading_relative(true),
            KeyCode::Char('/') => {
                self.search_mode = true;
                self.search_query.clear();
                self.search_matches.clear();
                self.current_match = 0;
            }
            KeyCode::Char('n') => self.jump_to_next_match(false),
            KeyCode::Char('N') => self.jump_to_next_match(true),
            _ => {}
        }

        PagerAction::None
    }

    pub fn draw(&mut self, frame: &mut Frame<'_>, path_label: &str) {
        let root = inset_rect(frame.size(), 1, 0);
        let chunks = Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).split(root);
        let body = chunks[0];
        let status = inset_rect(chunks[1], 1, 0);

        let content_area = if self.toc_open {
            let widths = [
                Constraint::Length(body.width.saturating_div(3).max(24)),
                Constraint::Length(1),
                Constraint::Min(1),
            ];
            let cols = Layout::horizontal(widths).split(body);
            self.draw_toc(frame, cols[0]);
            cols[2]
        } else {
            body
        };

        self.viewport_height = content_area.height.saturating_sub(1).max(1);
        self.clamp_scroll();
        self.draw_content(frame, content_area);
        self.draw_status(frame, status, path_label);
    }

    fn draw_toc(&self, frame: &mut Frame<'_>, area: Rect) {
        let selected = self.toc_selected.min(self.doc.toc.len().saturating_sub(1));

        let items: Vec<ListItem> = self
            .doc
            .toc
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let indent = "  ".repeat(entry.level.saturating_sub(1) as usize);
                let marker = if idx == selected { "> " } else { "  " };
                let mut line = Line::raw(format!("{marker}{indent}{}", entry.title));
                if idx == selected {
                    line = line.fg(Color::Yellow).bold();
                }
                ListItem::new(line)
            })
            .collect();

        let toc = if items.is_empty() {
            List::new(vec![ListItem::new(Line::raw("  (no h1-h3 headings)"))])
        } else {
            List::new(items)
        }
        .block(
            Block::default()
                .title(" TOC ")
                .borders(Borders::TOP)
                .border_style(Style::default().fg(Color::DarkGray))
                .padding(Padding::new(1, 1, 0, 0)),
        );

        frame.render_widget(toc, area);
    }

    fn draw_content(&self, frame: &mut Frame<'_>, area: Rect) {
        let current_match_line = self.search_matches.get(self.current_match).copied();

        let lines: Vec<Line> = self
            .doc
            .lines
            .iter()
            .enumerate()
            .map(|(idx, line)| {
                let is_match = self.search_matches.binary_search(&idx).is_ok();
                let is_current = current_match_line == Some(idx);

                if line.segments.is_empty() {
                    return Line::from(Span::raw(""));
                }
                let spans: Vec<Span> = line
                    .segments
                    .iter()
                    .map(|segment| {
                        let mut style = segment.style;
                        if is_current {
                            style = style.bg(Color::Blue).fg(Color::White);
                        } else if is_match {
                            style = style.bg(Color::Rgb(40, 40, 40));
                        }
                        Span::styled(segment.text.clone(), style)
                    })
                    .collect();
                Line::from(spans)
            })
            .collect();

        let paragraph = Paragraph::new(Text::from(lines))
            .block(
                Block::default()
                    .title(format!(" {} ", self.title))
                    .borders(Borders::TOP)
                    .border_style(Style::default().fg(Color::DarkGray))
                    .padding(Padding::new(1, 1, 0, 0)),
            )
            .scroll((self.scroll, 0))
            .wrap(Wrap { trim: false });

        frame.render_widget(paragraph, area);
    }

    fn draw_status(&self, frame: &mut Frame<'_>, area: Rect, path_label: &str) {
        let search_hint = if self.search_mode {
            format!(" /{}", self.search_query)
        } else if self.search_query.is_empty() {
            String::new()
        } else {
            let position = if self.search_matches.is_empty() {
                0
            } else {
                self.current_match + 1
            };
            format!(
                " search='{}' {position}/{}",
                self.search_query,
                self.search_matches.len()
            )
        };

        let status_text = if self.status.is_empty() {
            format!("{path_label}{search_hint}")
        } else {
            format!("{path_label}{search_hint} | {}", self.status)
        };

        frame.render_widget(
            Paragraph::new(format!(" {status_text}")).style(Style::default().fg(Color::Gray)),
            area,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::MarkdownRenderer;
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;

    fn document(source: &str) -> RenderedDocument {
        MarkdownRenderer::new().render_source("doc.md", source)
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn long_document() -> RenderedDocument {
        let mut source = String::from("# Top\n\n");
        for i in 0..60 {
            source.push_str(&format!("para {i}\n\n"));
        }
        source.push_str("## Bottom\n\nneedle here\n");
        document(&source)
    }

    fn screen(pager: &mut Pager) -> String {
        let mut terminal = Terminal::new(TestBackend::new(60, 12)).unwrap();
        terminal.draw(|frame| pager.draw(frame, "doc.md")).unwrap();
        let buffer = terminal.backend().buffer().clone();
        buffer
            .content
            .chunks(60)
            .map(|row| row.iter().map(|cell| cell.symbol()).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn display_twice_is_same_as_once() {
        let doc = document("# Title\n\nbody\n");

        let mut once = Pager::new("doc.md");
        once.display(doc.clone());
        let mut twice = Pager::new("doc.md");
        twice.display(doc.clone());
        twice.display(doc);

        assert_eq!(screen(&mut once), screen(&mut twice));
        assert_eq!(once.document(), twice.document());
    }

    #[test]
    fn display_replaces_previous_content() {
        let mut pager = Pager::new("doc.md");
        pager.display(document("# First\n"));
        pager.display(document("# Second\n"));

        let shown = screen(&mut pager);
        assert!(shown.contains("Second"));
        assert!(!shown.contains("First"));
    }

    #[test]
    fn redisplay_keeps_scroll_and_reruns_search() {
        let mut pager = Pager::new("doc.md");
        pager.display(long_document());
        screen(&mut pager);

        pager.handle_key(key(KeyCode::Char('/')));
        for c in "needle".chars() {
            pager.handle_key(key(KeyCode::Char(c)));
        }
        pager.handle_key(key(KeyCode::Enter));
        let scrolled = pager.scroll;
        assert!(scrolled > 0);
        assert_eq!(pager.search_matches.len(), 1);

        pager.display(long_document());
        assert_eq!(pager.scroll, scrolled);
        assert_eq!(pager.search_matches.len(), 1);
    }

    #[test]
    fn redisplay_does_not_jump_back_to_match() {
        let mut pager = Pager::new("doc.md");
        pager.display(long_document());
        screen(&mut pager);

        pager.handle_key(key(KeyCode::Char('/')));
        for c in "needle".chars() {
            pager.handle_key(key(KeyCode::Char(c)));
        }
        pager.handle_key(key(KeyCode::Enter));
        assert!(pager.scroll > 0);

        pager.handle_key(key(KeyCode::Char('g')));
        pager.display(long_document());
        assert_eq!(pager.scroll, 0);
        assert_eq!(pager.search_matches.len(), 1);
    }

    #[test]
    fn shorter_document_clamps_scroll() {
        let mut pager = Pager::new("doc.md");
        pager.display(long_document());
        screen(&mut pager);
        pager.handle_key(key(KeyCode::Char('G')));
        assert!(pager.scroll > 0);

        pager.display(document("short\n"));
        assert_eq!(pager.scroll, 0);
    }

    #[test]
    fn heading_jumps_follow_toc() {
        let mut pager = Pager::new("doc.md");
        pager.display(long_document());
        screen(&mut pager);

        pager.handle_key(key(KeyCode::Char(']')));
        assert_eq!(pager.toc_selected, 1);
        assert!(pager.status.contains("Bottom"));

        pager.handle_key(key(KeyCode::Char('[')));
        assert_eq!(pager.scroll, 0);
    }

    #[test]
    fn action_keys_are_reported() {
        let mut pager = Pager::new("doc.md");
        assert_eq!(pager.handle_key(key(KeyCode::Char('q'))), PagerAction::Quit);
        assert_eq!(pager.handle_key(key(KeyCode::Char('r'))), PagerAction::Reload);
        assert_eq!(
            pager.handle_key(key(KeyCode::Char('o'))),
            PagerAction::OpenInBrowser
        );
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(pager.handle_key(ctrl_c), PagerAction::Quit);
    }

    #[test]
    fn status_line_shows_path_and_message() {
        let mut pager = Pager::new("doc.md");
        pager.display(document("x"));
        pager.set_status("Reloaded");
        let shown = screen(&mut pager);
        assert!(shown.contains("doc.md | Reloaded"));
    }
}
