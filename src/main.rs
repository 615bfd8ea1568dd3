mod controller;
mod error;
mod logger;
mod render;
mod viewer;
mod watch;

use std::ffi::OsStr;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::event::{self, Event as CEvent, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::{execute, ExecutableCommand};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use controller::{Update, ViewerController};
use render::{MarkdownRenderer, Render};
use viewer::{Pager, PagerAction};
use watch::{SettleConfig, WatchedPath};

type Session = ViewerController<MarkdownRenderer, Pager>;

#[derive(Debug, Parser)]
#[command(
    name = "mdlive",
    version,
    about = "Live-preview a markdown file, re-rendering it whenever it is saved"
)]
struct Cli {
    /// Markdown file to watch.
    file: PathBuf,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn system_open<S: AsRef<OsStr>>(arg: S) -> Result<()> {
    #[cfg(target_os = "macos")]
    let status = Command::new("open").arg(arg).status()?;

    #[cfg(all(unix, not(target_os = "macos")))]
    let status = Command::new("xdg-open").arg(arg).status()?;

    #[cfg(target_os = "windows")]
    let status = Command::new("cmd")
        .args(["/C", "start", ""])
        .arg(arg)
        .status()?;

    if !status.success() {
        return Err(anyhow!("system open command failed with status {status}"));
    }
    Ok(())
}

/// Writes the current page next to the log file and hands it to the
/// platform opener.
fn open_in_browser(session: &Session) -> Result<PathBuf> {
    let stem = session
        .path()
        .as_path()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let target = std::env::temp_dir().join(format!("mdlive-{stem}.html"));

    fs::write(&target, &session.sink().document().html)
        .with_context(|| format!("failed to write {}", target.display()))?;
    system_open(&target)?;
    Ok(target)
}

fn report(session: &mut Session, update: Update) {
    let status = match update {
        Update::Rendered => "Updated".to_string(),
        Update::ReadFailed(err) => format!("Reload failed: {err}: {}", err.source),
        Update::Dropped => "File removed; showing last render".to_string(),
    };
    session.sink_mut().set_status(status);
}

struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        io::stdout().execute(EnterAlternateScreen)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

fn run_interactive(mut session: Session) -> Result<()> {
    let _guard = TerminalGuard::enter()?;

    let stdout = io::stdout();
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let label = session.path().to_string();

    loop {
        terminal.draw(|frame| session.sink_mut().draw(frame, &label))?;

        if let Some(update) = session.pump() {
            report(&mut session, update);
        }

        if event::poll(Duration::from_millis(120))? {
            match event::read()? {
                CEvent::Key(key) if key.kind == KeyEventKind::Press => {
                    match session.sink_mut().handle_key(key) {
                        PagerAction::Quit => break,
                        PagerAction::Reload => {
                            let update = session.on_settled();
                            report(&mut session, update);
                        }
                        PagerAction::OpenInBrowser => {
                            let status = match open_in_browser(&session) {
                                Ok(path) => format!("Opened {}", path.display()),
                                Err(err) => format!("Open failed: {err:#}"),
                            };
                            session.sink_mut().set_status(status);
                        }
                        PagerAction::None => {}
                    }
                }
                _ => {}
            }
        }
    }

    session.shutdown();
    Ok(())
}

fn print_once(path: &Path) -> Result<()> {
    let document = MarkdownRenderer::new().render(path)?;
    print!("{}", document.html);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let interactive = io::stdout().is_terminal();

    if let Some(log_file) = logger::init(cli.verbose, interactive) {
        log::debug!("Logging to {}", log_file.display());
    }

    if !interactive {
        return print_once(&cli.file);
    }

    let path = WatchedPath::new(&cli.file)
        .with_context(|| format!("failed to resolve {}", cli.file.display()))?;
    let title = path
        .as_path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    let mut session = ViewerController::new(
        path,
        MarkdownRenderer::new(),
        Pager::new(title),
        SettleConfig::default(),
    );
    session.start()?;

    run_interactive(session)
}
