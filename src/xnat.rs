use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;

use crate::config::Credentials;
use crate::domain::SpiderIdentity;
use crate::error::SpiderError;
use crate::fs_util;

pub const XNAT_URI_PREFIX: &str = "xnat:/";
const SESSION_PLACEHOLDER: &str = "{session}";

/// Ordered `key/value` address of an XNAT object, e.g.
/// `/project/P/subject/S/experiment/E/scan/C/resource/R`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XnatAddress {
    segments: Vec<(&'static str, String)>,
}

impl XnatAddress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.segments.push((key, value.into()));
        self
    }

    pub fn segments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.segments
            .iter()
            .map(|(key, value)| (*key, value.as_str()))
    }

    /// Path in select syntax. Segments with an empty value are skipped.
    pub fn select_str(&self) -> String {
        self.segments()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("/{key}/{value}"))
            .collect()
    }

    /// Path in REST syntax (plural collections), relative to `<host>/data`.
    pub fn rest_path(&self) -> String {
        self.segments()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("/{}/{value}", rest_collection(key)))
            .collect()
    }
}

impl fmt::Display for XnatAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.select_str())
    }
}

fn rest_collection(key: &str) -> String {
    match key {
        "out/resource" => "out/resources".to_string(),
        other if other.ends_with('s') => other.to_string(),
        other => format!("{other}s"),
    }
}

/// An open, authenticated connection. Dropping the session logs it out.
pub trait XnatSession {
    fn exists(&self, path: &str) -> Result<bool, SpiderError>;

    /// Downloads every file of the resource at `path` and extracts it into
    /// `destination/<resource name>/`, which is returned.
    fn download_resource(&self, path: &str, destination: &Path) -> Result<PathBuf, SpiderError>;

    fn download_file(
        &self,
        resource_path: &str,
        file: &str,
        destination: &Path,
    ) -> Result<PathBuf, SpiderError>;
}

pub trait XnatConnector {
    type Session: XnatSession;

    fn connect(&self) -> Result<Self::Session, SpiderError>;
}

#[derive(Clone)]
pub struct XnatHttpConnector {
    client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl XnatHttpConnector {
    pub fn new(credentials: &Credentials) -> Result<Self, SpiderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dax-spider/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SpiderError::XnatHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| SpiderError::XnatHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: format!("{}/data", credentials.host.trim_end_matches('/')),
            user: credentials.user.clone(),
            password: credentials.password.clone(),
        })
    }
}

impl XnatConnector for XnatHttpConnector {
    type Session = XnatHttpSession;

    fn connect(&self) -> Result<XnatHttpSession, SpiderError> {
        let url = format!("{}/JSESSION", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .map_err(|err| SpiderError::XnatHttp(err.to_string()))?;
        let response = handle_status(response)?;
        let jsession = response
            .text()
            .map_err(|err| SpiderError::XnatHttp(err.to_string()))?
            .trim()
            .to_string();
        if jsession.is_empty() || jsession.contains('<') {
            return Err(SpiderError::XnatHttp(
                "login did not return a session id".to_string(),
            ));
        }
        tracing::debug!(base = %self.base_url, "opened XNAT session");
        Ok(XnatHttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            jsession,
        })
    }
}

pub struct XnatHttpSession {
    client: Client,
    base_url: String,
    jsession: String,
}

impl XnatHttpSession {
    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .header(COOKIE, format!("JSESSIONID={}", self.jsession))
    }

    fn write_response_to_file(
        &self,
        response: Response,
        destination: &Path,
    ) -> Result<(), SpiderError> {
        let mut response = handle_status(response)?;
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        }
        let mut file =
            File::create(destination).map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| SpiderError::XnatHttp(err.to_string()))?;
        Ok(())
    }
}

impl XnatSession for XnatHttpSession {
    fn exists(&self, path: &str) -> Result<bool, SpiderError> {
        let response = self
            .get(path)
            .query(&[("format", "json")])
            .send()
            .map_err(|err| SpiderError::XnatHttp(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => handle_status(response).map(|_| true),
        }
    }

    fn download_resource(&self, path: &str, destination: &Path) -> Result<PathBuf, SpiderError> {
        let label = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|label| !label.is_empty())
            .ok_or_else(|| SpiderError::NotOnXnat(path.to_string()))?;
        std::fs::create_dir_all(destination)
            .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        let archive = tempfile::Builder::new()
            .prefix("xnat-resource")
            .suffix(".zip")
            .tempfile_in(destination)
            .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        let response = self
            .get(&format!("{path}/files"))
            .query(&[("format", "zip")])
            .send()
            .map_err(|err| SpiderError::XnatHttp(err.to_string()))?;
        self.write_response_to_file(response, archive.path())?;

        let resource_dir = destination.join(label);
        fs_util::extract_zip_with(archive.path(), &resource_dir, strip_to_files)?;
        Ok(resource_dir)
    }

    fn download_file(
        &self,
        resource_path: &str,
        file: &str,
        destination: &Path,
    ) -> Result<PathBuf, SpiderError> {
        let response = self
            .get(&format!("{resource_path}/files/{file}"))
            .send()
            .map_err(|err| SpiderError::XnatHttp(err.to_string()))?;
        self.write_response_to_file(response, destination)?;
        Ok(destination.to_path_buf())
    }
}

impl Drop for XnatHttpSession {
    fn drop(&mut self) {
        let result = self
            .client
            .delete(format!("{}/JSESSION", self.base_url))
            .header(COOKIE, format!("JSESSIONID={}", self.jsession))
            .send();
        match result {
            Ok(_) => tracing::debug!(base = %self.base_url, "closed XNAT session"),
            Err(err) => tracing::warn!(error = %err, "failed to close XNAT session"),
        }
    }
}

fn handle_status(response: Response) -> Result<Response, SpiderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "XNAT request failed".to_string());
    Err(SpiderError::XnatStatus { status, message })
}

/// Zip entries from XNAT are nested as `<label>/.../resources/<R>/files/<path>`;
/// keep only what follows `files/`.
fn strip_to_files(entry: &Path) -> PathBuf {
    let components = entry
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    match components.iter().position(|part| part == "files") {
        Some(index) if index + 1 < components.len() => components[index + 1..].iter().collect(),
        _ => entry.to_path_buf(),
    }
}

/// A reference to remote data inside an `xnat:/` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XnatUri {
    File { resource: String, file: String },
    Resource { path: String },
}

impl XnatUri {
    pub fn is_xnat_uri(value: &str) -> bool {
        value.starts_with(XNAT_URI_PREFIX)
    }

    /// Expands `{session}` to the identity's experiment path and classifies
    /// the reference as a single file (`/files/`) or a whole resource
    /// (`/resources/`).
    pub fn parse(uri: &str, identity: &SpiderIdentity) -> Result<Self, SpiderError> {
        let rest = uri
            .strip_prefix(XNAT_URI_PREFIX)
            .ok_or_else(|| SpiderError::InvalidXnatUri(uri.to_string()))?;
        let session_path = format!(
            "/projects/{}/subjects/{}/experiments/{}",
            identity.project, identity.subject, identity.session
        );
        let expanded = rest.replace(SESSION_PLACEHOLDER, &session_path);
        let path = if expanded.starts_with('/') {
            expanded
        } else {
            format!("/{expanded}")
        };

        let invalid = || SpiderError::InvalidXnatUri(uri.to_string());
        if let Some((resource, file)) = path.split_once("/files/") {
            if !plain_segments(resource.trim_start_matches('/')) || !plain_segments(file) {
                return Err(invalid());
            }
            return Ok(XnatUri::File {
                resource: resource.to_string(),
                file: file.to_string(),
            });
        }
        if path.contains("/resources/") && plain_segments(path.trim_start_matches('/')) {
            return Ok(XnatUri::Resource { path });
        }
        Err(invalid())
    }
}

/// True when every `/`-separated segment is a non-empty name other than
/// `.` or `..`.
fn plain_segments(path: &str) -> bool {
    path.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}
