use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SpiderError;

/// Separator between the components of a composite assessor label.
pub const ASSESSOR_SEPARATOR: &str = "-x-";

/// Resource name reserved for the QC report.
pub const PDF_RESOURCE: &str = "PDF";

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());
static SPIDER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Spider_(?P<name>.+)_v(?P<version>[0-9A-Za-z.]+?)(\.py)?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpiderIdentity {
    pub project: String,
    pub subject: String,
    pub session: String,
    pub scan: Option<String>,
}

impl SpiderIdentity {
    pub fn session(
        project: impl Into<String>,
        subject: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            subject: subject.into(),
            session: session.into(),
            scan: None,
        }
    }

    pub fn scan(
        project: impl Into<String>,
        subject: impl Into<String>,
        session: impl Into<String>,
        scan: impl Into<String>,
    ) -> Self {
        Self {
            scan: Some(scan.into()),
            ..Self::session(project, subject, session)
        }
    }

    pub fn is_scan_level(&self) -> bool {
        self.scan.is_some()
    }

    /// Resolves an assessor label: a label that already contains the
    /// composite separator is used verbatim, otherwise it is treated as a
    /// proctype and joined to the identity parts (and scan, when given).
    pub fn assessor_label(&self, label: &str, scan: Option<&str>) -> String {
        if label.contains(ASSESSOR_SEPARATOR) {
            return label.to_string();
        }
        let mut parts = vec![
            self.project.as_str(),
            self.subject.as_str(),
            self.session.as_str(),
        ];
        if let Some(scan) = scan.filter(|scan| !scan.is_empty()) {
            parts.push(scan);
        }
        parts.push(label);
        parts.join(ASSESSOR_SEPARATOR)
    }

    /// Label of the assessor this spider produces.
    pub fn output_assessor_label(&self, proctype: &str) -> String {
        self.assessor_label(proctype, self.scan.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Project,
    Subject,
    Session,
    Scan,
    Assessor,
}

impl InputKind {
    pub fn requires_label(self) -> bool {
        matches!(self, InputKind::Scan | InputKind::Assessor)
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            InputKind::Project => "project",
            InputKind::Subject => "subject",
            InputKind::Session => "session",
            InputKind::Scan => "scan",
            InputKind::Assessor => "assessor",
        };
        f.write_str(value)
    }
}

impl FromStr for InputKind {
    type Err = SpiderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "project" => Ok(InputKind::Project),
            "subject" => Ok(InputKind::Subject),
            "session" => Ok(InputKind::Session),
            "scan" => Ok(InputKind::Scan),
            "assessor" => Ok(InputKind::Assessor),
            other => Err(SpiderError::InvalidInput(format!("unknown input type '{other}'"))),
        }
    }
}

/// One remote resource the spider downloads before running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSpec {
    kind: InputKind,
    label: Option<String>,
    resource: String,
    dir: Option<String>,
    scan: Option<String>,
}

impl InputSpec {
    pub fn new(
        kind: InputKind,
        label: Option<String>,
        resource: impl Into<String>,
    ) -> Result<Self, SpiderError> {
        let resource = resource.into();
        if resource.trim().is_empty() {
            return Err(SpiderError::InvalidInput(format!(
                "{kind} input is missing a resource"
            )));
        }
        let label = label.filter(|label| !label.trim().is_empty());
        if kind.requires_label() && label.is_none() {
            return Err(SpiderError::InvalidInput(format!(
                "{kind} input for resource {resource} is missing a label"
            )));
        }
        Ok(Self {
            kind,
            label,
            resource,
            dir: None,
            scan: None,
        })
    }

    pub fn project(resource: impl Into<String>) -> Result<Self, SpiderError> {
        Self::new(InputKind::Project, None, resource)
    }

    pub fn subject(resource: impl Into<String>) -> Result<Self, SpiderError> {
        Self::new(InputKind::Subject, None, resource)
    }

    pub fn session(resource: impl Into<String>) -> Result<Self, SpiderError> {
        Self::new(InputKind::Session, None, resource)
    }

    pub fn scan(label: impl Into<String>, resource: impl Into<String>) -> Result<Self, SpiderError> {
        Self::new(InputKind::Scan, Some(label.into()), resource)
    }

    pub fn assessor(
        label: impl Into<String>,
        resource: impl Into<String>,
    ) -> Result<Self, SpiderError> {
        Self::new(InputKind::Assessor, Some(label.into()), resource)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Scan id used when the assessor label is a bare proctype.
    pub fn with_scan(mut self, scan: impl Into<String>) -> Self {
        self.scan = Some(scan.into());
        self
    }

    pub fn kind(&self) -> InputKind {
        self.kind
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn dir(&self) -> Option<&str> {
        self.dir.as_deref()
    }

    pub fn scan_id(&self) -> Option<&str> {
        self.scan.as_deref()
    }

    /// Builds an input from a JSON object with the keys `type`, `label`,
    /// `resource`, `dir` and `scan`.
    pub fn from_json(value: &Value) -> Result<Self, SpiderError> {
        let object = value
            .as_object()
            .ok_or_else(|| SpiderError::InvalidInput(format!("input is not an object: {value}")))?;
        let text = |key: &str| -> Result<Option<String>, SpiderError> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(text)) => Ok(Some(text.clone())),
                Some(other) => Err(SpiderError::InvalidInput(format!(
                    "input key '{key}' must be a string, got {other}"
                ))),
            }
        };
        let kind: InputKind = text("type")?
            .ok_or_else(|| SpiderError::InvalidInput(format!("input has no 'type': {value}")))?
            .parse()?;
        let resource = text("resource")?.unwrap_or_default();
        let mut input = Self::new(kind, text("label")?, resource)?;
        input.dir = text("dir")?;
        input.scan = text("scan")?;
        Ok(input)
    }
}

/// Parses the inputs declaration: a JSON array of input objects.
pub fn inputs_from_json(value: &Value) -> Result<Vec<InputSpec>, SpiderError> {
    let items = value
        .as_array()
        .ok_or_else(|| SpiderError::InvalidInput(format!("inputs is not a list: {value}")))?;
    items.iter().map(InputSpec::from_json).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedData {
    pub label: String,
    pub files: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputKind {
    File,
    Dir,
}

impl FromStr for OutputKind {
    type Err = SpiderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "FILE" => Ok(OutputKind::File),
            "DIR" => Ok(OutputKind::Dir),
            other => Err(SpiderError::ManifestParse(format!("unknown output type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub path: String,
    pub kind: OutputKind,
    pub resource: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParamKind {
    File,
    Dir,
    Value,
}

impl ParamKind {
    pub fn is_staged(self) -> bool {
        matches!(self, ParamKind::File | ParamKind::Dir)
    }
}

impl FromStr for ParamKind {
    type Err = SpiderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "FILE" => Ok(ParamKind::File),
            "DIR" => Ok(ParamKind::Dir),
            "VALUE" => Ok(ParamKind::Value),
            other => Err(SpiderError::ManifestParse(format!("unknown param type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub help: String,
}

/// Normalizes an assessor suffix: every run of non-alphanumeric characters
/// becomes one underscore, a trailing underscore is dropped and a leading
/// one is guaranteed. Empty input stays empty.
pub fn sanitize_suffix(suffix: &str) -> String {
    let replaced = NON_ALNUM.replace_all(suffix, "_");
    let trimmed = replaced.trim_end_matches('_');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('_') {
        trimmed.to_string()
    } else {
        format!("_{trimmed}")
    }
}

/// `X.Y.Z` with three purely numeric components.
pub fn is_good_version(version: &str) -> bool {
    let parts = version.split('.').collect::<Vec<_>>();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()))
}

/// Name and version parsed from a spider name of the form
/// `Spider_<name>_v<X.Y.Z>` (an optional `.py` extension is ignored).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiderName {
    pub name: String,
    pub version: String,
}

impl SpiderName {
    /// Processing type used for the assessor label, e.g. `fMRIQA_v2`.
    pub fn proctype(&self, suffix: &str) -> String {
        let major = self.version.split('.').next().unwrap_or("1");
        format!("{}_v{}{}", self.name, major, suffix)
    }
}

impl FromStr for SpiderName {
    type Err = SpiderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let file_name = value.rsplit(['/', '\\']).next().unwrap_or(value);
        let captures = SPIDER_NAME
            .captures(file_name)
            .ok_or_else(|| SpiderError::InvalidSpiderName(value.to_string()))?;
        let version = captures["version"].to_string();
        if !is_good_version(&version) {
            return Err(SpiderError::InvalidSpiderName(format!(
                "{value} (version must be X.Y.Z)"
            )));
        }
        Ok(Self {
            name: captures["name"].to_string(),
            version,
        })
    }
}

/// Proctype for a spider: parsed from `Spider_<name>_v<X.Y.Z>` when the name
/// follows that convention, otherwise the plain name plus suffix.
pub fn proctype_for(spider_name: &str, suffix: &str) -> String {
    match spider_name.parse::<SpiderName>() {
        Ok(parsed) => parsed.proctype(suffix),
        Err(_) => format!("{spider_name}{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn sanitize_examples() {
        assert_eq!(sanitize_suffix(""), "");
        assert_eq!(sanitize_suffix("test"), "_test");
        assert_eq!(sanitize_suffix("my suffix!!"), "_my_suffix");
        assert_eq!(sanitize_suffix("__a--b__"), "_a_b");
        assert_eq!(sanitize_suffix("!!!"), "");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in ["a b c", "_x_", "v1.0-beta", "__", "ok", "-lead"] {
            let once = sanitize_suffix(raw);
            assert_eq!(sanitize_suffix(&once), once);
            assert!(!once.ends_with('_'));
            assert!(!once.contains("__"));
            assert!(once.is_empty() || once.starts_with('_'));
            assert!(once.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'));
        }
    }

    #[test]
    fn version_validator() {
        assert!(is_good_version("1.2.3"));
        assert!(!is_good_version("1.2"));
        assert!(!is_good_version("1.a.3"));
        assert!(!is_good_version("v1.2.3"));
        assert!(!is_good_version("1..3"));
    }

    #[test]
    fn assessor_label_synthesis() {
        let identity = SpiderIdentity::session("P", "S", "E");
        assert_eq!(identity.assessor_label("L", None), "P-x-S-x-E-x-L");
        assert_eq!(identity.assessor_label("L", Some("C")), "P-x-S-x-E-x-C-x-L");
        assert_eq!(
            identity.assessor_label("A-x-B-x-C-x-FS", Some("C")),
            "A-x-B-x-C-x-FS"
        );
    }

    #[test]
    fn spider_name_proctype() {
        let parsed: SpiderName = "Spider_fMRIQA_v2.0.1.py".parse().unwrap();
        assert_eq!(parsed.name, "fMRIQA");
        assert_eq!(parsed.proctype("_test"), "fMRIQA_v2_test");
        assert_eq!(proctype_for("/opt/spiders/Spider_dtiQA_v3.1.0.py", ""), "dtiQA_v3");
        assert_eq!(proctype_for("my_pipeline", "_x"), "my_pipeline_x");
        assert_matches!(
            "Spider_bad_v1.2".parse::<SpiderName>(),
            Err(SpiderError::InvalidSpiderName(_))
        );
    }

    #[test]
    fn input_requires_label_for_scan() {
        let err = InputSpec::new(InputKind::Scan, None, "NIFTI").unwrap_err();
        assert_matches!(err, SpiderError::InvalidInput(_));
        let input = InputSpec::session("DATA").unwrap();
        assert_eq!(input.kind(), InputKind::Session);
        assert_eq!(input.label(), None);
    }

    #[test]
    fn inputs_json_validation() {
        let parsed = inputs_from_json(&json!([
            {"type": "scan", "label": "301", "resource": "NIFTI", "dir": "t1"},
            {"type": "assessor", "label": "FS", "resource": "STATS", "scan": "301"}
        ]))
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].dir(), Some("t1"));
        assert_eq!(parsed[1].scan_id(), Some("301"));

        assert_matches!(
            inputs_from_json(&json!({"type": "scan"})),
            Err(SpiderError::InvalidInput(_))
        );
        assert_matches!(
            inputs_from_json(&json!(["scan"])),
            Err(SpiderError::InvalidInput(_))
        );
        assert_matches!(
            inputs_from_json(&json!([{"type": "volume", "resource": "R"}])),
            Err(SpiderError::InvalidInput(_))
        );
    }
}
