//! Print sink: hands files to CUPS `lp`, optionally rasterizing PDFs first.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;

use crate::config::{Config, DEFAULT_PRINTER};

#[derive(Debug, Error)]
pub enum PrintError {
    #[error("No default printer is set ({detail}). Set one with `lpoptions -d <printer>` or name a printer in the `printer` setting")]
    NoDefaultPrinter { detail: String },

    #[error("Printer '{printer}' does not exist ({detail}). Check `lpstat -p` and the `printer` setting")]
    UnknownPrinter { printer: String, detail: String },

    #[error("Could not run `{program}`: {source}. Is CUPS installed?")]
    Unavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Printing '{}' on {printer} failed: {detail}. The printer may be offline or unreachable", file.display())]
    JobFailed {
        file: PathBuf,
        printer: String,
        detail: String,
    },
}

impl PrintError {
    /// Misconfiguration that will fail every job; the caller should stop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PrintError::JobFailed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintOptions {
    /// Destination name, or `default` for the system default.
    pub printer: String,
    /// Extra `lp` arguments, passed through in order.
    pub flags: Vec<String>,
}

impl PrintOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            printer: config.printer.clone(),
            flags: config.print_flags.clone(),
        }
    }

    pub fn uses_default_printer(&self) -> bool {
        self.printer.trim().is_empty() || self.printer == DEFAULT_PRINTER
    }

    /// `[flags…] [-d printer] <file>`
    pub fn lp_args(&self, file: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.flags.iter().map(OsString::from).collect();
        if !self.uses_default_printer() {
            args.push("-d".into());
            args.push(self.printer.clone().into());
        }
        args.push(file.as_os_str().to_os_string());
        args
    }

    fn printer_label(&self) -> String {
        if self.uses_default_printer() {
            "the default printer".to_string()
        } else {
            format!("printer '{}'", self.printer)
        }
    }
}

#[async_trait]
pub trait PrintSink: Send + Sync {
    async fn print(&self, file: &Path) -> Result<(), PrintError>;
}

/// Submits jobs with `lp`.
#[derive(Debug, Clone)]
pub struct LpPrinter {
    options: PrintOptions,
    program: String,
}

impl LpPrinter {
    pub fn new(options: PrintOptions) -> Self {
        Self {
            options,
            program: "lp".to_string(),
        }
    }

}

#[async_trait]
impl PrintSink for LpPrinter {
    async fn print(&self, file: &Path) -> Result<(), PrintError> {
        let args = self.options.lp_args(file);
        debug!("Running {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| PrintError::Unavailable {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            info!(
                "Queued {} on {}{}",
                file.display(),
                self.options.printer_label(),
                match stdout.trim() {
                    "" => String::new(),
                    line => format!(" ({})", line),
                }
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("lp exited with {}", output.status)
        } else {
            stderr
        };
        Err(classify_failure(&self.options, file, detail))
    }
}

/// Maps a failed `lp` run onto a misconfiguration or a per-job failure.
pub fn classify_failure(options: &PrintOptions, file: &Path, detail: String) -> PrintError {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("no default destination") {
        PrintError::NoDefaultPrinter { detail }
    } else if lower.contains("does not exist") || lower.contains("unknown printer") {
        PrintError::UnknownPrinter {
            printer: options.printer.clone(),
            detail,
        }
    } else {
        PrintError::JobFailed {
            file: file.to_path_buf(),
            printer: options.printer_label(),
            detail,
        }
    }
}

#[derive(Debug, Error)]
#[error("Rasterizing '{}' failed: {detail}", file.display())]
pub struct RasterizeError {
    pub file: PathBuf,
    pub detail: String,
}

/// Converts PDFs to 600 dpi PNGs with ImageMagick `convert`.
#[derive(Debug, Clone)]
pub struct Rasterizer {
    program: String,
    density: u32,
}

impl Default for Rasterizer {
    fn default() -> Self {
        Self {
            program: "convert".to_string(),
            density: 600,
        }
    }
}

/// One PNG per page, in page order. The directory holding them is removed
/// on drop.
#[derive(Debug)]
pub struct RasterizedPages {
    _dir: TempDir,
    pages: Vec<PathBuf>,
}

impl RasterizedPages {
    pub fn pages(&self) -> &[PathBuf] {
        &self.pages
    }
}

impl Rasterizer {
    pub fn applies_to(file: &Path) -> bool {
        file.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
    }

    /// Renders every page of `file` into a private directory next to it.
    pub async fn rasterize(&self, file: &Path) -> Result<RasterizedPages, RasterizeError> {
        let fail = |detail: String| RasterizeError {
            file: file.to_path_buf(),
            detail,
        };
        let parent = file.parent().unwrap_or_else(|| Path::new("."));
        let dir = tempfile::Builder::new()
            .prefix("mailprint-pages-")
            .tempdir_in(parent)
            .map_err(|e| fail(e.to_string()))?;

        // `convert` numbers multi-page output through the %d placeholder
        let output = Command::new(&self.program)
            .arg("-density")
            .arg(self.density.to_string())
            .arg(file)
            .arg(dir.path().join("page-%d.png"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| fail(format!("could not run `{}`: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(fail(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let pages = collect_pages(dir.path()).map_err(|e| fail(e.to_string()))?;
        if pages.is_empty() {
            return Err(fail(format!("`{}` produced no pages", self.program)));
        }
        debug!("Rasterized {} into {} page(s)", file.display(), pages.len());
        Ok(RasterizedPages { _dir: dir, pages })
    }
}

/// `page-<n>.png` files in `dir`, ordered by page number.
fn collect_pages(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut pages = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let number = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_prefix("page-"))
            .and_then(|n| n.parse::<u32>().ok());
        let is_png = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
        if let (Some(number), true) = (number, is_png) {
            pages.push((number, path));
        }
    }
    pages.sort_unstable_by_key(|(number, _)| *number);
    Ok(pages.into_iter().map(|(_, path)| path).collect())
}
