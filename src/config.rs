use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::Deserialize;

use crate::auto::{AutoSpiderDefinition, Datatype};
use crate::domain::{OutputKind, OutputSpec, ParamKind, ParamSpec};
use crate::error::SpiderError;

pub const ENV_HOST: &str = "XNAT_HOST";
pub const ENV_USER: &str = "XNAT_USER";
pub const ENV_PASS: &str = "XNAT_PASS";
pub const ENV_RESULTS_DIR: &str = "UPLOAD_SPIDER_DIR";
const DEFAULT_RESULTS_DIR: &str = "RESULTS_XNAT_SPIDER";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

pub trait PasswordPrompt {
    fn prompt(&self, user: &str, host: &str) -> Result<String, SpiderError>;
}

/// Reads the password from the terminal without echo.
pub struct TerminalPrompt;

impl PasswordPrompt for TerminalPrompt {
    fn prompt(&self, user: &str, host: &str) -> Result<String, SpiderError> {
        if !std::io::stdin().is_terminal() {
            return Err(SpiderError::MissingCredential {
                name: ENV_PASS,
                flag: "pass",
            });
        }
        let message = format!("Enter the password for user '{user}' on your XNAT -- {host} :");
        rpassword::prompt_password(message).map_err(|err| {
            SpiderError::Configuration(format!("failed to read password from terminal: {err}"))
        })
    }
}

impl Credentials {
    /// Resolves host, user and password from explicit values, then the
    /// process environment, prompting for the password as a last resort.
    pub fn resolve(
        host: Option<&str>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, SpiderError> {
        Self::resolve_with(
            host,
            user,
            password,
            |name| std::env::var(name).ok(),
            &TerminalPrompt,
        )
    }

    pub fn resolve_with<E>(
        host: Option<&str>,
        user: Option<&str>,
        password: Option<&str>,
        env: E,
        prompt: &dyn PasswordPrompt,
    ) -> Result<Self, SpiderError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let host = default_value(host, ENV_HOST, "host", &env)?;
        let user_given = user.is_some_and(|value| !value.is_empty());
        let user = default_value(user, ENV_USER, "user", &env)?;

        let password = match non_empty(password) {
            Some(value) => value,
            None => match non_empty(env(ENV_PASS).as_deref()) {
                Some(value) => value,
                None if user_given => prompt.prompt(&user, &host)?,
                None => {
                    return Err(SpiderError::MissingCredential {
                        name: ENV_PASS,
                        flag: "pass",
                    });
                }
            },
        };

        Ok(Self {
            host,
            user,
            password,
        })
    }

    /// Environment handed to child processes so downstream tools can reach
    /// the same server.
    pub fn child_env(&self) -> [(&'static str, &str); 3] {
        [
            (ENV_HOST, self.host.as_str()),
            (ENV_USER, self.user.as_str()),
            (ENV_PASS, self.password.as_str()),
        ]
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn default_value<E>(
    value: Option<&str>,
    env_name: &'static str,
    flag: &'static str,
    env: &E,
) -> Result<String, SpiderError>
where
    E: Fn(&str) -> Option<String>,
{
    non_empty(value)
        .or_else(|| non_empty(env(env_name).as_deref()))
        .ok_or(SpiderError::MissingCredential {
            name: env_name,
            flag,
        })
}

/// Root of the upload queue: `UPLOAD_SPIDER_DIR`, or `~/RESULTS_XNAT_SPIDER`.
pub fn results_root() -> Result<Utf8PathBuf, SpiderError> {
    if let Some(dir) = non_empty(std::env::var(ENV_RESULTS_DIR).ok().as_deref()) {
        return Ok(Utf8PathBuf::from(dir));
    }
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(DEFAULT_RESULTS_DIR)).ok()
        })
        .ok_or_else(|| SpiderError::Filesystem("unable to resolve results directory".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub datatype: Option<Datatype>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub template_file: Option<PathBuf>,
}

pub struct ManifestLoader;

impl ManifestLoader {
    pub fn load(path: &Path) -> Result<AutoSpiderDefinition, SpiderError> {
        let content =
            fs::read_to_string(path).map_err(|_| SpiderError::ManifestRead(path.to_path_buf()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|err| SpiderError::ManifestParse(err.to_string()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::resolve_manifest(manifest, base_dir)
    }

    pub fn resolve_manifest(
        manifest: Manifest,
        base_dir: &Path,
    ) -> Result<AutoSpiderDefinition, SpiderError> {
        let template = match (manifest.template, manifest.template_file) {
            (Some(template), None) => template,
            (None, Some(file)) => load_template(&base_dir.join(file))?,
            (Some(_), Some(_)) => {
                return Err(SpiderError::ManifestParse(
                    "set either template or template_file, not both".to_string(),
                ));
            }
            (None, None) => {
                return Err(SpiderError::ManifestParse(
                    "manifest has no template".to_string(),
                ));
            }
        };
        Ok(AutoSpiderDefinition {
            name: manifest.name,
            datatype: manifest.datatype.unwrap_or(Datatype::Session),
            params: manifest.params,
            outputs: manifest.outputs,
            template,
        })
    }
}

/// Parameter list from a `name,TYPE,help` CSV file.
pub fn load_inputs(path: &Path) -> Result<Vec<ParamSpec>, SpiderError> {
    read_records(path)?
        .into_iter()
        .map(|record| {
            let [name, kind, help] = take_fields::<3>(&record, path)?;
            Ok(ParamSpec {
                name,
                kind: kind.parse::<ParamKind>()?,
                help,
            })
        })
        .collect()
}

/// Output list from a `path,TYPE,RESOURCE` CSV file.
pub fn load_outputs(path: &Path) -> Result<Vec<OutputSpec>, SpiderError> {
    read_records(path)?
        .into_iter()
        .map(|record| {
            let [path_field, kind, resource] = take_fields::<3>(&record, path)?;
            Ok(OutputSpec {
                path: path_field,
                kind: kind.parse::<OutputKind>()?,
                resource,
            })
        })
        .collect()
}

pub fn load_template(path: &Path) -> Result<String, SpiderError> {
    fs::read_to_string(path).map_err(|_| SpiderError::ManifestRead(path.to_path_buf()))
}

fn read_records(path: &Path) -> Result<Vec<Vec<String>>, SpiderError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|_| SpiderError::ManifestRead(path.to_path_buf()))?;
    reader
        .records()
        .map(|record| {
            let record = record
                .map_err(|err| SpiderError::ManifestParse(format!("{}: {err}", path.display())))?;
            Ok(record.iter().map(str::to_string).collect())
        })
        .collect()
}

fn take_fields<const N: usize>(record: &[String], path: &Path) -> Result<[String; N], SpiderError> {
    <[String; N]>::try_from(record.to_vec()).map_err(|_| {
        SpiderError::ManifestParse(format!(
            "{}: expected {N} fields, got {} in '{}'",
            path.display(),
            record.len(),
            record.join(",")
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::cell::Cell;

    use assert_matches::assert_matches;

    use super::*;

    struct FixedPrompt {
        calls: Cell<usize>,
    }

    impl PasswordPrompt for FixedPrompt {
        fn prompt(&self, _user: &str, _host: &str) -> Result<String, SpiderError> {
            self.calls.set(self.calls.get() + 1);
            Ok("typed".to_string())
        }
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn explicit_values_win() {
        let prompt = FixedPrompt { calls: Cell::new(0) };
        let creds = Credentials::resolve_with(
            Some("https://xnat.example.org"),
            Some("alice"),
            Some("secret"),
            env_from(&[(ENV_HOST, "https://other"), (ENV_PASS, "envpass")]),
            &prompt,
        )
        .unwrap();
        assert_eq!(creds.host, "https://xnat.example.org");
        assert_eq!(creds.user, "alice");
        assert_eq!(creds.password, "secret");
        assert_eq!(prompt.calls.get(), 0);
    }

    #[test]
    fn environment_fallback() {
        let prompt = FixedPrompt { calls: Cell::new(0) };
        let creds = Credentials::resolve_with(
            None,
            None,
            None,
            env_from(&[
                (ENV_HOST, "https://xnat"),
                (ENV_USER, "bob"),
                (ENV_PASS, "envpass"),
            ]),
            &prompt,
        )
        .unwrap();
        assert_eq!(creds.user, "bob");
        assert_eq!(creds.password, "envpass");
    }

    #[test]
    fn prompt_only_when_user_given() {
        let prompt = FixedPrompt { calls: Cell::new(0) };
        let creds = Credentials::resolve_with(
            None,
            Some("carol"),
            None,
            env_from(&[(ENV_HOST, "https://xnat")]),
            &prompt,
        )
        .unwrap();
        assert_eq!(creds.password, "typed");
        assert_eq!(prompt.calls.get(), 1);

        let err = Credentials::resolve_with(
            None,
            None,
            None,
            env_from(&[(ENV_HOST, "https://xnat"), (ENV_USER, "carol")]),
            &prompt,
        )
        .unwrap_err();
        assert_matches!(err, SpiderError::MissingCredential { name: ENV_PASS, .. });
    }

    #[test]
    fn missing_host_is_configuration_error() {
        let prompt = FixedPrompt { calls: Cell::new(0) };
        let err = Credentials::resolve_with(None, None, None, env_from(&[(ENV_HOST, "")]), &prompt)
            .unwrap_err();
        assert_matches!(err, SpiderError::MissingCredential { name: ENV_HOST, .. });
        assert!(err.is_configuration());
    }

    #[test]
    fn csv_loaders() {
        let temp = tempfile::tempdir().unwrap();
        let inputs = temp.path().join("inputs.csv");
        fs::write(
            &inputs,
            "t1,FILE,T1 image\n\n# comment\nthreshold,VALUE,\"cut-off,  in mm \"\"max\"\"\"\n",
        )
        .unwrap();
        let params = load_inputs(&inputs).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].kind, ParamKind::File);
        assert_eq!(params[1].help, "cut-off,  in mm \"max\"");

        fs::write(&inputs, "threshold,VALUE,cut-off, in mm\n").unwrap();
        assert_matches!(load_inputs(&inputs), Err(SpiderError::ManifestParse(_)));

        let outputs = temp.path().join("outputs.csv");
        fs::write(&outputs, "report.pdf,FILE,PDF\nstats,DIR,STATS\n").unwrap();
        let parsed = load_outputs(&outputs).unwrap();
        assert_eq!(parsed[1].kind, OutputKind::Dir);
        assert_eq!(parsed[0].resource, "PDF");

        fs::write(&outputs, "report.pdf,PDF\n").unwrap();
        assert_matches!(load_outputs(&outputs), Err(SpiderError::ManifestParse(_)));
    }

    #[test]
    fn manifest_with_template_file() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("run.sh"), "echo $t1\n").unwrap();
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "name": "Spider_Demo_v1.0.0",
                "datatype": "scan",
                "params": [{"name": "t1", "kind": "FILE", "help": "T1"}],
                "outputs": [{"path": "report.pdf", "kind": "FILE", "resource": "PDF"}],
                "template_file": "run.sh"
            }"#,
        )
        .unwrap();
        let definition = ManifestLoader::resolve_manifest(manifest, temp.path()).unwrap();
        assert_eq!(definition.datatype, Datatype::Scan);
        assert_eq!(definition.template, "echo $t1\n");
        assert_eq!(definition.outputs.len(), 1);
    }
}
