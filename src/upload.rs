use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{PDF_RESOURCE, SpiderIdentity};
use crate::error::SpiderError;
use crate::fs_util;

pub const READY_FLAG: &str = "READY_TO_UPLOAD.txt";
pub const FAILED_FLAG: &str = "JOB_FAILED.txt";

/// Staging area picked up by the uploader:
/// `<results>/<assessor label>/<RESOURCE>/...` plus a flag file written by
/// [`UploadQueue::done`].
#[derive(Debug)]
pub struct UploadQueue {
    assessor_label: String,
    directory: PathBuf,
    errors: Vec<String>,
    finished: bool,
}

impl UploadQueue {
    pub fn new(
        results_root: &Path,
        proctype: &str,
        identity: &SpiderIdentity,
    ) -> Result<Self, SpiderError> {
        let assessor_label = identity.output_assessor_label(proctype);
        let directory = results_root.join(&assessor_label);
        fs_util::create_dir(&directory)?;
        tracing::debug!(assessor = %assessor_label, dir = %directory.display(), "upload queue ready");
        Ok(Self {
            assessor_label,
            directory,
            errors: Vec::new(),
            finished: false,
        })
    }

    pub fn assessor_label(&self) -> &str {
        &self.assessor_label
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Queues the QC report under the reserved `PDF` resource.
    pub fn add_pdf(&mut self, path: &Path) -> Result<(), SpiderError> {
        self.ensure_open()?;
        let is_pdf = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            let err = SpiderError::InvalidInput(format!("{} is not a pdf", path.display()));
            return Err(self.record(err));
        }
        self.copy_into(path, PDF_RESOURCE, file_target(path))
    }

    pub fn add_file(&mut self, path: &Path, resource: &str) -> Result<(), SpiderError> {
        self.ensure_open()?;
        if !path.is_file() {
            return Err(self.record(SpiderError::UploadPathMissing(path.to_path_buf())));
        }
        self.copy_into(path, resource, file_target(path))
    }

    /// Queues the content of `path` as resource `resource`.
    pub fn add_folder(&mut self, path: &Path, resource: &str) -> Result<(), SpiderError> {
        self.ensure_open()?;
        if !path.exists() {
            return Err(self.record(SpiderError::UploadPathMissing(path.to_path_buf())));
        }
        let target = if path.is_dir() {
            None
        } else {
            file_target(path)
        };
        self.copy_into(path, resource, target)
    }

    /// Writes the terminal flag and closes the queue. Returns the flag path.
    pub fn done(&mut self) -> Result<PathBuf, SpiderError> {
        self.ensure_open()?;
        self.finished = true;
        let (flag, content) = if self.has_errors() {
            (FAILED_FLAG, self.errors.join("\n"))
        } else {
            (READY_FLAG, self.assessor_label.clone())
        };
        let flag_path = self.directory.join(flag);
        fs::write(&flag_path, format!("{content}\n")).map_err(|err| {
            SpiderError::Filesystem(format!("write {}: {err}", flag_path.display()))
        })?;
        if self.has_errors() {
            tracing::warn!(assessor = %self.assessor_label, errors = self.errors.len(), "job flagged as failed");
        } else {
            tracing::info!(assessor = %self.assessor_label, "outputs ready to upload");
        }
        Ok(flag_path)
    }

    /// Removes the job directory once everything was queued cleanly. It is
    /// kept for inspection when any registration failed.
    pub fn clean(&self, jobdir: &Path) -> Result<(), SpiderError> {
        if self.has_errors() {
            tracing::warn!(jobdir = %jobdir.display(), "keeping job directory after upload errors");
            return Ok(());
        }
        if jobdir.exists() {
            fs::remove_dir_all(jobdir).map_err(|err| {
                SpiderError::Filesystem(format!("remove {}: {err}", jobdir.display()))
            })?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SpiderError> {
        if self.finished {
            return Err(SpiderError::QueueClosed);
        }
        Ok(())
    }

    fn copy_into(
        &mut self,
        source: &Path,
        resource: &str,
        file_name: Option<PathBuf>,
    ) -> Result<(), SpiderError> {
        let resource_dir = self.directory.join(resource.to_uppercase());
        let destination = match file_name {
            Some(name) => resource_dir.join(name),
            None => resource_dir,
        };
        match fs_util::copy_tree(source, &destination) {
            Ok(()) => {
                tracing::debug!(
                    source = %source.display(),
                    resource = %resource.to_uppercase(),
                    "queued for upload"
                );
                Ok(())
            }
            Err(err) => Err(self.record(err)),
        }
    }

    fn record(&mut self, err: SpiderError) -> SpiderError {
        tracing::error!(error = %err, "upload registration failed");
        self.errors.push(err.to_string());
        err
    }
}

fn file_target(path: &Path) -> Option<PathBuf> {
    path.file_name().map(PathBuf::from)
}
