//! Logging setup.
//!
//! The pager owns the terminal, so interactive sessions log to a file in the
//! temp directory, one file per session. One-shot runs log to stderr.

use std::fs::File;
use std::path::{Path, PathBuf};

use simplelog::{
    ColorChoice, Config, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};

/// `mdlive-<timestamp>-<pid>.log` under `dir`.
fn log_file_path(dir: &Path) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    dir.join(format!("mdlive-{timestamp}-{}.log", std::process::id()))
}

/// Installs the global logger. Returns the log file path when logging to a
/// file. Logging problems never stop the viewer; without a log file the
/// session simply runs unlogged.
pub fn init(verbose: bool, interactive: bool) -> Option<PathBuf> {
    if !interactive {
        let level = if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        };
        let _ = TermLogger::init(
            level,
            Config::default(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        );
        return None;
    }

    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_time_offset_to_local()
        .unwrap_or_else(|c| c)
        .build();

    let log_file = log_file_path(&std::env::temp_dir());
    let file = match File::create(&log_file) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("mdlive: logging disabled, cannot create {}: {err}", log_file.display());
            return None;
        }
    };
    WriteLogger::init(level, config, file).ok()?;

    Some(log_file)
}
