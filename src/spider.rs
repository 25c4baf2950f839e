use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use chrono::Local;
use serde_json::Value;

use crate::command::{self, CommandSpec};
use crate::config::{self, Credentials};
use crate::domain::{self, DownloadedData, InputKind, InputSpec, PDF_RESOURCE, SpiderIdentity};
use crate::error::SpiderError;
use crate::fs_util;
use crate::report::{self, ImagesPage, ImagesPageSummary, PdfPages, StatsPage, StatsPageSummary};
use crate::template;
use crate::timed::TimedWriter;
use crate::upload::UploadQueue;
use crate::xnat::{XnatAddress, XnatConnector, XnatHttpConnector, XnatSession};

/// Subdirectory of the job directory that receives declared inputs.
pub const INPUTS_DIR: &str = "inputs";

#[derive(Debug, Clone)]
pub struct SpiderOptions {
    /// Spider name or script path, e.g. `Spider_fMRIQA_v2.0.1`.
    pub spider_path: String,
    pub jobdir: PathBuf,
    pub project: String,
    pub subject: String,
    pub session: String,
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub suffix: Option<String>,
    /// Work in a fresh subdirectory when `jobdir` already has content.
    pub subdir: bool,
    pub skip_finish: bool,
    /// Upload queue root; `UPLOAD_SPIDER_DIR` or the home default when unset.
    pub results_dir: Option<PathBuf>,
}

impl SpiderOptions {
    pub fn new(
        spider_path: impl Into<String>,
        jobdir: impl Into<PathBuf>,
        project: impl Into<String>,
        subject: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            spider_path: spider_path.into(),
            jobdir: jobdir.into(),
            project: project.into(),
            subject: subject.into(),
            session: session.into(),
            host: None,
            user: None,
            password: None,
            suffix: None,
            subdir: true,
            skip_finish: false,
            results_dir: None,
        }
    }
}

/// What to upload for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Single(PathBuf),
    Many(Vec<PathBuf>),
}

impl UploadTarget {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            UploadTarget::Single(path) => vec![path.as_path()],
            UploadTarget::Many(paths) => paths.iter().map(PathBuf::as_path).collect(),
        }
    }

    /// Accepts a path string or a list of path strings.
    pub fn from_json(resource: &str, value: &Value) -> Result<Self, SpiderError> {
        let invalid = || SpiderError::InvalidUploadValue {
            resource: resource.to_string(),
        };
        match value {
            Value::String(path) => Ok(UploadTarget::Single(PathBuf::from(path))),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(PathBuf::from).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(UploadTarget::Many),
            _ => Err(invalid()),
        }
    }
}

/// Parses a `{resource: path | [paths]}` JSON object.
pub fn upload_targets_from_json(value: &Value) -> Result<BTreeMap<String, UploadTarget>, SpiderError> {
    let object = value.as_object().ok_or_else(|| SpiderError::InvalidUploadValue {
        resource: value.to_string(),
    })?;
    object
        .iter()
        .map(|(resource, target)| Ok((resource.clone(), UploadTarget::from_json(resource, target)?)))
        .collect()
}

/// Lifecycle of a processing job. `go` runs the phases in order and skips
/// `finish` when asked to.
pub trait Pipeline {
    /// Downloads and organises inputs.
    fn pre_run(&mut self) -> Result<(), SpiderError>;

    /// Runs the processing itself.
    fn run(&mut self) -> Result<(), SpiderError>;

    /// Queues results for upload.
    fn finish(&mut self) -> Result<(), SpiderError>;

    fn skip_finish(&self) -> bool {
        false
    }

    fn go(&mut self) -> Result<(), SpiderError> {
        self.pre_run()?;
        self.run()?;
        if self.skip_finish() {
            tracing::info!("skipping finish step");
            return Ok(());
        }
        self.finish()
    }
}

/// Shared state of a spider job: where it works, what it is about, how it
/// reaches XNAT and where its outputs go.
pub struct Spider<C: XnatConnector> {
    spider_path: String,
    jobdir: PathBuf,
    identity: SpiderIdentity,
    credentials: Credentials,
    suffix: String,
    skip_finish: bool,
    results_dir: Option<PathBuf>,
    connector: C,
    inputs: Vec<InputSpec>,
    data: Vec<DownloadedData>,
    queue: Option<UploadQueue>,
    writer: TimedWriter,
}

impl Spider<XnatHttpConnector> {
    pub fn session(options: SpiderOptions) -> Result<Self, SpiderError> {
        let credentials = resolve_credentials(&options)?;
        let connector = XnatHttpConnector::new(&credentials)?;
        let identity = SpiderIdentity::session(&options.project, &options.subject, &options.session);
        Self::build(options, identity, credentials, connector)
    }

    pub fn scan(options: SpiderOptions, scan_id: impl Into<String>) -> Result<Self, SpiderError> {
        let credentials = resolve_credentials(&options)?;
        let connector = XnatHttpConnector::new(&credentials)?;
        let identity = SpiderIdentity::scan(
            &options.project,
            &options.subject,
            &options.session,
            scan_id,
        );
        Self::build(options, identity, credentials, connector)
    }
}

impl<C: XnatConnector> Spider<C> {
    pub fn session_with(options: SpiderOptions, connector: C) -> Result<Self, SpiderError> {
        let credentials = resolve_credentials(&options)?;
        let identity = SpiderIdentity::session(&options.project, &options.subject, &options.session);
        Self::build(options, identity, credentials, connector)
    }

    pub fn scan_with(
        options: SpiderOptions,
        scan_id: impl Into<String>,
        connector: C,
    ) -> Result<Self, SpiderError> {
        let credentials = resolve_credentials(&options)?;
        let identity = SpiderIdentity::scan(
            &options.project,
            &options.subject,
            &options.session,
            scan_id,
        );
        Self::build(options, identity, credentials, connector)
    }

    fn build(
        options: SpiderOptions,
        identity: SpiderIdentity,
        credentials: Credentials,
        connector: C,
    ) -> Result<Self, SpiderError> {
        let jobdir = prepare_jobdir(&options.jobdir, options.subdir)?;
        let suffix = domain::sanitize_suffix(options.suffix.as_deref().unwrap_or_default());
        tracing::debug!(jobdir = %jobdir.display(), suffix = %suffix, "spider initialised");
        Ok(Self {
            spider_path: options.spider_path,
            jobdir,
            identity,
            credentials,
            suffix,
            skip_finish: options.skip_finish,
            results_dir: options.results_dir,
            connector,
            inputs: Vec::new(),
            data: Vec::new(),
            queue: None,
            writer: TimedWriter::with_date(),
        })
    }

    pub fn spider_path(&self) -> &str {
        &self.spider_path
    }

    pub fn jobdir(&self) -> &Path {
        &self.jobdir
    }

    pub fn identity(&self) -> &SpiderIdentity {
        &self.identity
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn skip_finish(&self) -> bool {
        self.skip_finish
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn writer(&self) -> &TimedWriter {
        &self.writer
    }

    pub fn inputs(&self) -> &[InputSpec] {
        &self.inputs
    }

    pub fn data(&self) -> &[DownloadedData] {
        &self.data
    }

    pub fn upload_queue(&self) -> Option<&UploadQueue> {
        self.queue.as_ref()
    }

    /// Processing type of the produced assessor, e.g. `fMRIQA_v2_test`.
    pub fn proctype(&self) -> String {
        domain::proctype_for(&self.spider_path, &self.suffix)
    }

    pub fn declare_inputs(&mut self, inputs: Vec<InputSpec>) {
        self.inputs = inputs;
    }

    pub fn add_input(&mut self, input: InputSpec) {
        self.inputs.push(input);
    }

    /// Label under which an input is stored and reported. Project, subject
    /// and session inputs default to the identity component.
    pub fn input_label(&self, input: &InputSpec) -> String {
        if let Some(label) = input.label() {
            return label.to_string();
        }
        match input.kind() {
            InputKind::Project => self.identity.project.clone(),
            InputKind::Subject => self.identity.subject.clone(),
            _ => self.identity.session.clone(),
        }
    }

    pub fn assessor_label(&self, label: &str, scan: Option<&str>) -> String {
        self.identity.assessor_label(label, scan)
    }

    /// Address of the resource an input points at.
    pub fn xnat_address(&self, input: &InputSpec) -> XnatAddress {
        let identity = &self.identity;
        let mut address = XnatAddress::new().with("project", identity.project.as_str());
        if input.kind() != InputKind::Project {
            address = address.with("subject", identity.subject.as_str());
        }
        match input.kind() {
            InputKind::Project | InputKind::Subject => {}
            InputKind::Session => {
                address = address.with("experiment", identity.session.as_str());
            }
            InputKind::Scan => {
                address = address
                    .with("experiment", identity.session.as_str())
                    .with("scan", input.label().unwrap_or_default());
            }
            InputKind::Assessor => {
                let label = self.assessor_label(input.label().unwrap_or_default(), input.scan_id());
                address = address
                    .with("experiment", identity.session.as_str())
                    .with("assessor", label);
            }
        }
        if input.kind() == InputKind::Assessor {
            address.with("out/resource", input.resource())
        } else {
            address.with("resource", input.resource())
        }
    }

    /// Downloads every declared input into `inputs/<dir or label>/` over a
    /// single XNAT session.
    pub fn download_inputs(&mut self) -> Result<&[DownloadedData], SpiderError> {
        if self.inputs.is_empty() {
            return Err(SpiderError::NoInputs);
        }
        let input_dir = self.jobdir.join(INPUTS_DIR);
        let session = self.connector.connect()?;
        for input in self.inputs.clone() {
            let label = self.input_label(&input);
            let folder = input_dir.join(input.dir().unwrap_or(&label));
            self.writer.print(&format!(
                " downloading {} for {} into {}",
                input.resource(),
                label,
                folder.display()
            ));
            fs_util::create_dir(&folder)?;
            let address = self.xnat_address(&input);
            let resource_dir = session.download_resource(&address.rest_path(), &folder)?;
            fs_util::flatten_into_parent(&resource_dir)?;
            let files = fs_util::list_files(&folder)?;
            self.merge_data(label, files);
        }
        Ok(&self.data)
    }

    fn merge_data(&mut self, label: String, files: BTreeSet<PathBuf>) {
        match self.data.iter_mut().find(|entry| entry.label == label) {
            Some(entry) => entry.files.extend(files),
            None => self.data.push(DownloadedData { label, files }),
        }
    }

    /// Finds `label` as a scan, then as an assessor, holding `resource`.
    pub fn select_obj<S: XnatSession>(
        &self,
        session: &S,
        label: &str,
        resource: &str,
    ) -> Result<XnatAddress, SpiderError> {
        let base = XnatAddress::new()
            .with("project", self.identity.project.as_str())
            .with("subject", self.identity.subject.as_str())
            .with("experiment", self.identity.session.as_str());
        let scan = base.clone().with("scan", label).with("resource", resource);
        if session.exists(&scan.rest_path())? {
            return Ok(scan);
        }
        let assessor = base
            .clone()
            .with("assessor", label)
            .with("out/resource", resource);
        if session.exists(&assessor.rest_path())? {
            return Ok(assessor);
        }
        Err(SpiderError::NotOnXnat(format!(
            "{base} (scan or assessor: {label} / resource: {resource})"
        )))
    }

    /// Downloads one scan or assessor resource into `folder` and returns the
    /// files it now holds.
    pub fn download(
        &self,
        label: &str,
        resource: &str,
        folder: &Path,
    ) -> Result<BTreeSet<PathBuf>, SpiderError> {
        let session = self.connector.connect()?;
        let address = self.select_obj(&session, label, resource)?;
        let resource_dir = session.download_resource(&address.rest_path(), folder)?;
        fs_util::flatten_into_parent(&resource_dir)?;
        fs_util::list_files(folder)
    }

    fn queue_mut(&mut self) -> Result<&mut UploadQueue, SpiderError> {
        let queue = match self.queue.take() {
            Some(queue) => queue,
            None => {
                let root = match &self.results_dir {
                    Some(dir) => dir.clone(),
                    None => config::results_root()?.into_std_path_buf(),
                };
                UploadQueue::new(&root, &self.proctype(), &self.identity)?
            }
        };
        Ok(self.queue.insert(queue))
    }

    /// Queues a file or folder as `resource` of the produced assessor. A
    /// missing path is recorded as a failure of the job.
    pub fn upload(&mut self, path: &Path, resource: &str) -> Result<(), SpiderError> {
        if path.is_file() && resource == PDF_RESOURCE {
            self.queue_pdf(path)
        } else if path.is_file() {
            self.queue_file(path, resource)
        } else {
            self.queue_folder(path, resource)
        }
    }

    pub fn queue_pdf(&mut self, path: &Path) -> Result<(), SpiderError> {
        self.queue_mut()?.add_pdf(path)
    }

    pub fn queue_file(&mut self, path: &Path, resource: &str) -> Result<(), SpiderError> {
        self.queue_mut()?.add_file(path, resource)
    }

    pub fn queue_folder(&mut self, path: &Path, resource: &str) -> Result<(), SpiderError> {
        self.queue_mut()?.add_folder(path, resource)
    }

    pub fn upload_dict(&mut self, files: &BTreeMap<String, UploadTarget>) -> Result<(), SpiderError> {
        for (resource, target) in files {
            for path in target.paths() {
                self.upload(path, resource)?;
            }
        }
        Ok(())
    }

    /// Closes the upload queue, removes the job directory when everything
    /// was queued and logs the closing time.
    pub fn end(&mut self) -> Result<(), SpiderError> {
        let jobdir = self.jobdir.clone();
        let queue = self.queue_mut()?;
        queue.done()?;
        queue.clean(&jobdir)?;
        self.print_end();
        Ok(())
    }

    /// Runs `exe opt value ...` through the shell with the XNAT credentials
    /// in its environment.
    pub fn run_cmd_args(&self, spec: &CommandSpec) -> Result<ExitStatus, SpiderError> {
        ensure_exe(spec)?;
        let cmd = spec.render();
        self.writer.print(&format!("Running command: {cmd}"));
        command::run_system_cmd(&cmd, &self.credentials.child_env())
    }

    /// Renders `template` with each argument's value bound to its option
    /// name, writes `run_matlab_cmd[_<suffix>].m` into the job directory and
    /// runs it with MATLAB.
    pub fn run_matlab_cmd_args(
        &self,
        spec: &CommandSpec,
        template: &str,
        suffix: &str,
    ) -> Result<ExitStatus, SpiderError> {
        ensure_exe(spec)?;
        let script = template::render(template, &spec.template_values())?;
        let name = if suffix.is_empty() {
            "run_matlab_cmd.m".to_string()
        } else {
            format!("run_matlab_cmd_{suffix}.m")
        };
        let path = self.jobdir.join(name);
        fs::write(&path, script)
            .map_err(|err| SpiderError::Filesystem(format!("write {}: {err}", path.display())))?;
        self.writer
            .print(&format!("Running matlab script: {}", path.display()));
        command::run_matlab(&path, &self.credentials.child_env())
    }

    /// Resolves an executable (see [`command::check_executable`]) and logs
    /// its version.
    pub fn check_executable(&self, executable: &str, name: &str) -> Result<PathBuf, SpiderError> {
        let info = command::check_executable(executable, name)?;
        self.writer
            .print(&format!("{name} version: {}", info.version));
        Ok(info.path)
    }

    pub fn print_init(&self, args: &BTreeMap<String, String>, author: &str, email: &str) {
        self.print_info(author, email);
        self.writer.print("-------- Spider starts --------");
        self.writer.print(&format!(
            "Date and Time at the beginning of the Spider: {}",
            Local::now()
        ));
        self.writer.print("INFO: Arguments");
        self.print_args(args);
    }

    pub fn print_info(&self, author: &str, email: &str) {
        self.print_msg(&format!("Running spider : {}", self.spider_path));
        self.print_msg(&format!("Spider Author: {author}"));
        self.print_msg(&format!("Author Email:  {email}"));
    }

    pub fn print_args(&self, args: &BTreeMap<String, String>) {
        self.writer.print("-- Arguments given to the spider --");
        for (name, value) in args {
            self.writer.print(&format!("{name} : {value}"));
        }
        self.writer.print("-----------------------------------");
    }

    pub fn print_msg(&self, message: &str) {
        self.writer.print(message);
    }

    pub fn print_err(&self, message: &str) {
        self.writer.eprint(message);
    }

    pub fn print_end(&self) {
        self.writer
            .print(&format!("Time at the end of the Spider: {}", Local::now()));
    }

    pub fn plot_images_page(&self, request: &ImagesPage) -> Result<ImagesPageSummary, SpiderError> {
        report::plot_images(request, Some(&self.writer))
    }

    pub fn plot_stats_page(&self, request: &StatsPage) -> Result<StatsPageSummary, SpiderError> {
        report::plot_stats(request, Some(&self.writer))
    }

    pub fn merge_pdf(&self, pages: &PdfPages, output: &Path) -> Result<PathBuf, SpiderError> {
        report::merge_pdfs(pages, output, Some(&self.writer))
    }
}

impl<C: XnatConnector> fmt::Display for Spider<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Spider information:")?;
        writeln!(f, "  -- General --")?;
        writeln!(f, "    path:    {}", self.spider_path)?;
        writeln!(f, "    jobdir:  {}", self.jobdir.display())?;
        writeln!(f, "    suffix:  {}", self.suffix)?;
        writeln!(f, "  -- XNAT --")?;
        writeln!(f, "    host:    {}", self.credentials.host)?;
        writeln!(f, "    user:    {}", self.credentials.user)?;
        writeln!(f, "    project: {}", self.identity.project)?;
        writeln!(f, "    subject: {}", self.identity.subject)?;
        writeln!(f, "    session: {}", self.identity.session)?;
        if let Some(scan) = &self.identity.scan {
            writeln!(f, "    scan:    {scan}")?;
        }
        writeln!(f, "  -- Extra --")?;
        if !self.inputs.is_empty() {
            writeln!(f, "    Inputs:")?;
            for input in &self.inputs {
                writeln!(
                    f,
                    "        type: {} - label: {} - res: {}",
                    input.kind(),
                    self.input_label(input),
                    input.resource()
                )?;
            }
        }
        if !self.data.is_empty() {
            writeln!(f, "    Data:")?;
            for entry in &self.data {
                writeln!(
                    f,
                    "        label: {} - files: {}",
                    entry.label,
                    entry.files.len()
                )?;
            }
        }
        Ok(())
    }
}

fn resolve_credentials(options: &SpiderOptions) -> Result<Credentials, SpiderError> {
    Credentials::resolve(
        options.host.as_deref(),
        options.user.as_deref(),
        options.password.as_deref(),
    )
}

fn ensure_exe(spec: &CommandSpec) -> Result<(), SpiderError> {
    if spec.exe.trim().is_empty() {
        return Err(SpiderError::Configuration(
            "command has no executable".to_string(),
        ));
    }
    Ok(())
}

/// Makes the job directory absolute and creates it. A non-empty existing
/// directory is replaced by a fresh `TempDir_<date>_*` inside it when
/// `subdir` is set.
pub fn prepare_jobdir(jobdir: &Path, subdir: bool) -> Result<PathBuf, SpiderError> {
    let jobdir = fs_util::absolute(jobdir)?;
    if !jobdir.exists() {
        fs_util::create_dir(&jobdir)?;
        return Ok(jobdir);
    }
    if subdir && !fs_util::is_empty_dir(&jobdir)? {
        let prefix = format!("TempDir_{}_", Local::now().format("%Y%m%d"));
        let fresh = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&jobdir)
            .map_err(|err| SpiderError::Filesystem(format!("create job subdirectory: {err}")))?;
        return Ok(fresh.keep());
    }
    Ok(jobdir)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn jobdir_created_or_nested() {
        let temp = tempfile::tempdir().unwrap();
        let fresh = temp.path().join("job");
        assert_eq!(prepare_jobdir(&fresh, true).unwrap(), fresh);
        assert!(fresh.is_dir());

        // empty existing dir is reused
        assert_eq!(prepare_jobdir(&fresh, true).unwrap(), fresh);

        fs::write(fresh.join("old.txt"), b"x").unwrap();
        let nested = prepare_jobdir(&fresh, true).unwrap();
        assert_eq!(nested.parent(), Some(fresh.as_path()));
        let name = nested.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("TempDir_"));
        assert!(nested.is_dir());

        assert_eq!(prepare_jobdir(&fresh, false).unwrap(), fresh);
    }

    #[test]
    fn upload_targets_parse() {
        let parsed = upload_targets_from_json(&json!({
            "PDF": "/job/report.pdf",
            "STATS": ["/job/a.txt", "/job/b.txt"]
        }))
        .unwrap();
        assert_eq!(parsed["PDF"], UploadTarget::Single(PathBuf::from("/job/report.pdf")));
        assert_eq!(parsed["STATS"].paths().len(), 2);

        assert_matches!(
            upload_targets_from_json(&json!({"DATA": 3})),
            Err(SpiderError::InvalidUploadValue { ref resource }) if resource == "DATA"
        );
        assert_matches!(
            upload_targets_from_json(&json!({"DATA": ["/a", 1]})),
            Err(SpiderError::InvalidUploadValue { .. })
        );
    }

    struct Steps {
        calls: Vec<&'static str>,
        skip: bool,
    }

    impl Pipeline for Steps {
        fn pre_run(&mut self) -> Result<(), SpiderError> {
            self.calls.push("pre_run");
            Ok(())
        }

        fn run(&mut self) -> Result<(), SpiderError> {
            self.calls.push("run");
            Ok(())
        }

        fn finish(&mut self) -> Result<(), SpiderError> {
            self.calls.push("finish");
            Ok(())
        }

        fn skip_finish(&self) -> bool {
            self.skip
        }
    }

    #[test]
    fn go_runs_phases_in_order() {
        let mut steps = Steps {
            calls: Vec::new(),
            skip: false,
        };
        steps.go().unwrap();
        assert_eq!(steps.calls, ["pre_run", "run", "finish"]);

        let mut skipping = Steps {
            calls: Vec::new(),
            skip: true,
        };
        skipping.go().unwrap();
        assert_eq!(skipping.calls, ["pre_run", "run"]);
    }
}
