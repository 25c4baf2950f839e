use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cli::AutoInvocation;
use crate::command;
use crate::domain::{OutputKind, OutputSpec, PDF_RESOURCE, ParamSpec};
use crate::error::SpiderError;
use crate::fs_util;
use crate::spider::{Pipeline, Spider};
use crate::template;
use crate::xnat::{XnatConnector, XnatHttpConnector, XnatSession, XnatUri};

/// Staged copies of FILE/DIR parameters.
pub const INPUT_DIR: &str = "INPUT";
/// Rendered script location.
pub const SCRIPT_DIR: &str = "SCRIPT";

/// Names bound by the spider itself or taken by its command line;
/// parameters may not reuse them.
pub const RESERVED_NAMES: [&str; 11] = [
    "proj_label",
    "subj_label",
    "sess_label",
    "temp_dir",
    "suffix",
    "host",
    "user",
    "skipfinish",
    "skip_finish",
    "scan_label",
    "help",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    #[default]
    Session,
    Scan,
}

/// A spider described entirely by data: its parameters, expected outputs
/// and the script template run with the staged parameter values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSpiderDefinition {
    pub name: String,
    pub datatype: Datatype,
    pub params: Vec<ParamSpec>,
    pub outputs: Vec<OutputSpec>,
    pub template: String,
}

impl AutoSpiderDefinition {
    /// Parameter names must be unique identifiers usable as template
    /// placeholders and must not shadow the spider's own bindings.
    pub fn validate(&self) -> Result<(), SpiderError> {
        let mut seen = BTreeSet::new();
        for param in &self.params {
            let name = param.name.as_str();
            let valid = name
                .chars()
                .next()
                .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
                && name.chars().all(|ch| ch == '_' || ch.is_ascii_alphanumeric());
            if !valid {
                return Err(SpiderError::ManifestParse(format!(
                    "parameter name '{name}' is not a valid identifier"
                )));
            }
            if RESERVED_NAMES.contains(&name) {
                return Err(SpiderError::ManifestParse(format!(
                    "parameter name '{name}' is reserved"
                )));
            }
            if !seen.insert(name) {
                return Err(SpiderError::ManifestParse(format!(
                    "parameter '{name}' declared twice"
                )));
            }
        }
        Ok(())
    }

    fn staged_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|param| param.kind.is_staged())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Python,
    Matlab,
    Shell,
}

impl ScriptKind {
    fn detect(template: &str) -> Self {
        if template.starts_with("#PYTHON") {
            ScriptKind::Python
        } else if template.starts_with("%MATLAB") {
            ScriptKind::Matlab
        } else {
            ScriptKind::Shell
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            ScriptKind::Python => "script.py",
            ScriptKind::Matlab => "script.m",
            ScriptKind::Shell => "script.sh",
        }
    }
}

pub struct AutoSpider<C: XnatConnector> {
    spider: Spider<C>,
    definition: AutoSpiderDefinition,
    src_inputs: BTreeMap<String, String>,
    run_inputs: BTreeMap<String, String>,
    input_dir: PathBuf,
    script_dir: PathBuf,
}

impl<C: XnatConnector> fmt::Debug for AutoSpider<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoSpider")
            .field("name", &self.definition.name)
            .field("src_inputs", &self.src_inputs)
            .field("run_inputs", &self.run_inputs)
            .field("input_dir", &self.input_dir)
            .field("script_dir", &self.script_dir)
            .finish_non_exhaustive()
    }
}

impl AutoSpider<XnatHttpConnector> {
    pub fn new(
        definition: AutoSpiderDefinition,
        invocation: AutoInvocation,
    ) -> Result<Self, SpiderError> {
        let options = invocation.args.options(&definition.name);
        let spider = match definition.datatype {
            Datatype::Session => Spider::session(options)?,
            Datatype::Scan => Spider::scan(options, scan_label(&invocation)?)?,
        };
        Self::from_spider(spider, definition, invocation.params)
    }
}

impl<C: XnatConnector> AutoSpider<C> {
    pub fn with_connector(
        definition: AutoSpiderDefinition,
        invocation: AutoInvocation,
        connector: C,
    ) -> Result<Self, SpiderError> {
        let options = invocation.args.options(&definition.name);
        let spider = match definition.datatype {
            Datatype::Session => Spider::session_with(options, connector)?,
            Datatype::Scan => Spider::scan_with(options, scan_label(&invocation)?, connector)?,
        };
        Self::from_spider(spider, definition, invocation.params)
    }

    /// Wraps an already constructed spider; `params` must hold a value
    /// for every declared parameter.
    pub fn from_spider(
        spider: Spider<C>,
        definition: AutoSpiderDefinition,
        params: BTreeMap<String, String>,
    ) -> Result<Self, SpiderError> {
        definition.validate()?;
        for param in &definition.params {
            if !params.contains_key(&param.name) {
                return Err(SpiderError::Configuration(format!(
                    "missing value for parameter --{}",
                    param.name
                )));
            }
        }

        let jobdir = utf8(spider.jobdir())?;
        let identity = spider.identity();
        let mut src_inputs = BTreeMap::from([
            ("proj_label".to_string(), identity.project.clone()),
            ("subj_label".to_string(), identity.subject.clone()),
            ("sess_label".to_string(), identity.session.clone()),
            ("temp_dir".to_string(), jobdir.to_string()),
            ("suffix".to_string(), spider.suffix().to_string()),
            ("host".to_string(), spider.credentials().host.clone()),
            ("user".to_string(), spider.credentials().user.clone()),
        ]);
        if let Some(scan) = &identity.scan {
            src_inputs.insert("scan_label".to_string(), scan.clone());
        }
        src_inputs.extend(params);

        let input_dir = spider.jobdir().join(INPUT_DIR);
        let script_dir = spider.jobdir().join(SCRIPT_DIR);
        Ok(Self {
            spider,
            definition,
            run_inputs: src_inputs.clone(),
            src_inputs,
            input_dir,
            script_dir,
        })
    }

    pub fn spider(&self) -> &Spider<C> {
        &self.spider
    }

    pub fn spider_mut(&mut self) -> &mut Spider<C> {
        &mut self.spider
    }

    pub fn definition(&self) -> &AutoSpiderDefinition {
        &self.definition
    }

    /// Values bound on the command line, plus the spider's own bindings.
    pub fn src_inputs(&self) -> &BTreeMap<String, String> {
        &self.src_inputs
    }

    /// Values the template is rendered with: `src_inputs` with FILE/DIR
    /// parameters replaced by their staged copies once `copy_inputs` ran.
    pub fn run_inputs(&self) -> &BTreeMap<String, String> {
        &self.run_inputs
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    /// Stages every FILE/DIR parameter under `INPUT/<param>_<i>/`. A value
    /// may list several comma-separated sources; the staged paths are
    /// joined back with commas. Stops at the first failure, leaving what was
    /// already copied in place.
    pub fn copy_inputs(&mut self) -> Result<&BTreeMap<String, String>, SpiderError> {
        self.run_inputs = self.src_inputs.clone();
        fs_util::create_dir(&self.input_dir)?;

        let staged_params = self
            .definition
            .staged_params()
            .map(|param| param.name.clone())
            .collect::<Vec<_>>();
        for name in staged_params {
            let raw = self.src_inputs.get(&name).cloned().unwrap_or_default();
            let mut staged = Vec::new();
            for (index, source) in raw.split(',').enumerate() {
                let input_name = format!("{name}_{index}");
                match self.copy_input(source.trim(), &input_name) {
                    Ok(path) => staged.push(utf8(&path)?.to_string()),
                    Err(err) => {
                        tracing::error!(input = %source, error = %err, "copying inputs failed");
                        return Err(err);
                    }
                }
            }
            self.run_inputs.insert(name, staged.join(","));
        }
        Ok(&self.run_inputs)
    }

    pub fn copy_input(&self, source: &str, input_name: &str) -> Result<PathBuf, SpiderError> {
        if XnatUri::is_xnat_uri(source) {
            tracing::debug!(source, "copying xnat input");
            let uri = XnatUri::parse(source, self.spider.identity())?;
            self.copy_xnat_input(&uri, input_name)
        } else {
            tracing::debug!(source, "copying local input");
            self.copy_local_input(Path::new(source), input_name)
        }
    }

    pub fn copy_xnat_input(&self, uri: &XnatUri, input_name: &str) -> Result<PathBuf, SpiderError> {
        let stage = self.input_dir.join(input_name);
        fs_util::create_dir(&stage)?;
        match uri {
            XnatUri::File { resource, file } => {
                let relative = Path::new(file);
                let inside = relative
                    .components()
                    .all(|component| matches!(component, Component::Normal(_)));
                if !inside || file.is_empty() {
                    return Err(staging(file, "file path leaves the input directory"));
                }
                let destination = stage.join(relative);
                self.download_xnat_file(resource, file, &destination)
            }
            XnatUri::Resource { path } => self.download_xnat_resource(path, &stage),
        }
    }

    pub fn copy_local_input(&self, source: &Path, input_name: &str) -> Result<PathBuf, SpiderError> {
        let stage = self.input_dir.join(input_name);
        fs_util::create_dir(&stage)?;
        let Some(name) = source.file_name() else {
            return Err(staging(source.display(), "input has no file name"));
        };
        if !source.exists() {
            return Err(staging(source.display(), "input does not exist"));
        }
        let destination = stage.join(name);
        fs_util::copy_tree(source, &destination)
            .map_err(|err| staging(source.display(), err))?;
        Ok(destination)
    }

    /// Downloads one file over a fresh session.
    pub fn download_xnat_file(
        &self,
        resource: &str,
        file: &str,
        destination: &Path,
    ) -> Result<PathBuf, SpiderError> {
        let source = format!("{resource}/files/{file}");
        tracing::debug!(%source, destination = %destination.display(), "downloading from XNAT");
        let session = self
            .spider
            .connector()
            .connect()
            .map_err(|err| staging(&source, format!("failed to get XNAT connection: {err}")))?;
        session
            .download_file(resource, file, destination)
            .map_err(|err| staging(&source, err))
    }

    /// Downloads and extracts a whole resource into `destination` over a
    /// fresh session.
    pub fn download_xnat_resource(&self, path: &str, destination: &Path) -> Result<PathBuf, SpiderError> {
        tracing::debug!(source = %path, destination = %destination.display(), "downloading from XNAT");
        let session = self
            .spider
            .connector()
            .connect()
            .map_err(|err| staging(path, format!("failed to get XNAT connection: {err}")))?;
        session
            .download_resource(path, destination)
            .map_err(|err| staging(path, err))?;
        Ok(destination.to_path_buf())
    }

    fn queue_outputs(&mut self) -> Result<(), SpiderError> {
        let jobdir = self.spider.jobdir().to_path_buf();
        let outputs = if self.definition.outputs.is_empty() {
            let mut entries = fs::read_dir(&jobdir)
                .map_err(|err| SpiderError::Filesystem(format!("read {}: {err}", jobdir.display())))?
                .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
            entries.sort();
            entries
                .into_iter()
                .map(|name| OutputSpec {
                    path: name.clone(),
                    kind: OutputKind::Dir,
                    resource: name,
                })
                .collect()
        } else {
            self.definition.outputs.clone()
        };

        for output in outputs {
            let path = jobdir.join(&output.path);
            let result = match output.kind {
                OutputKind::File if output.resource == PDF_RESOURCE => {
                    self.spider.queue_pdf(&path)
                }
                OutputKind::File => self.spider.queue_file(&path, &output.resource),
                OutputKind::Dir => self.spider.queue_folder(&path, &output.resource),
            };
            // other failures are recorded by the queue, which flags the job as failed
            if let Err(SpiderError::QueueClosed) = result {
                return Err(SpiderError::QueueClosed);
            }
        }
        Ok(())
    }
}

impl<C: XnatConnector> Pipeline for AutoSpider<C> {
    fn pre_run(&mut self) -> Result<(), SpiderError> {
        self.copy_inputs()?;
        Ok(())
    }

    fn run(&mut self) -> Result<(), SpiderError> {
        fs_util::create_dir(&self.script_dir)?;
        let kind = ScriptKind::detect(&self.definition.template);
        let script = template::render(&self.definition.template, &self.run_inputs)?;
        let path = self.script_dir.join(kind.file_name());
        fs::write(&path, script)
            .map_err(|err| SpiderError::Filesystem(format!("write {}: {err}", path.display())))?;

        let env = self.spider.credentials().child_env();
        let status = match kind {
            ScriptKind::Python => command::run_python_script(&path, &env)?,
            ScriptKind::Matlab => command::run_matlab(&path, &env)?,
            ScriptKind::Shell => command::run_shell_script(&path, &env)?,
        };
        tracing::info!(script = %path.display(), %status, "script finished");
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SpiderError> {
        self.queue_outputs()?;
        self.spider.end()
    }

    fn skip_finish(&self) -> bool {
        self.spider.skip_finish()
    }
}

fn scan_label(invocation: &AutoInvocation) -> Result<String, SpiderError> {
    invocation
        .scan_label
        .clone()
        .ok_or_else(|| SpiderError::Configuration("scan spider requires a scan label (-c)".to_string()))
}

fn utf8(path: &Path) -> Result<Utf8PathBuf, SpiderError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|path| {
        SpiderError::Filesystem(format!("path is not valid UTF-8: {}", path.display()))
    })
}

fn staging(input: impl std::fmt::Display, reason: impl std::fmt::Display) -> SpiderError {
    SpiderError::Staging {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}
