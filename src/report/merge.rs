use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::SpiderError;
use crate::timed::{TimedWriter, announce};

/// Pages to concatenate: in the given order, or ordered by label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdfPages {
    List(Vec<PathBuf>),
    Labeled(BTreeMap<String, PathBuf>),
}

impl PdfPages {
    pub fn ordered(&self) -> Vec<&Path> {
        match self {
            PdfPages::List(pages) => pages.iter().map(PathBuf::as_path).collect(),
            PdfPages::Labeled(pages) => pages.values().map(PathBuf::as_path).collect(),
        }
    }
}

impl From<Vec<PathBuf>> for PdfPages {
    fn from(pages: Vec<PathBuf>) -> Self {
        PdfPages::List(pages)
    }
}

impl From<BTreeMap<String, PathBuf>> for PdfPages {
    fn from(pages: BTreeMap<String, PathBuf>) -> Self {
        PdfPages::Labeled(pages)
    }
}

pub fn ghostscript_args(pages: &PdfPages, output: &Path) -> Vec<String> {
    let mut args = vec![
        "-q".to_string(),
        "-sPAPERSIZE=letter".to_string(),
        "-dNOPAUSE".to_string(),
        "-dBATCH".to_string(),
        "-sDEVICE=pdfwrite".to_string(),
        format!("-sOutputFile={}", output.display()),
    ];
    args.extend(pages.ordered().into_iter().map(|page| page.display().to_string()));
    args
}

/// Concatenates single-page PDFs into `output` with ghostscript.
pub fn merge_pdfs(
    pages: &PdfPages,
    output: &Path,
    writer: Option<&TimedWriter>,
) -> Result<PathBuf, SpiderError> {
    announce(writer, "INFO: Concatenate all pdfs pages.");
    if pages.ordered().is_empty() {
        return Err(SpiderError::Report("no pdf pages to merge".to_string()));
    }
    let gs = which::which("gs").map_err(|_| SpiderError::MissingTool("gs".to_string()))?;
    let args = ghostscript_args(pages, output);
    announce(writer, &format!("INFO:saving final PDF: gs {}", args.join(" ")));
    let status = Command::new(gs)
        .args(&args)
        .status()
        .map_err(|err| SpiderError::Command(format!("gs: {err}")))?;
    if !status.success() {
        return Err(SpiderError::Report(format!("gs exited with {status}")));
    }
    Ok(output.to_path_buf())
}
