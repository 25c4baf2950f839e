#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dax_spider::error::SpiderError;
use dax_spider::spider::SpiderOptions;
use dax_spider::xnat::{XnatConnector, XnatSession};

pub const SPIDER_NAME: &str = "Spider_Demo_v1.2.0";

/// In-memory XNAT: every resource holds `a.txt` and `b.txt`, and only the
/// paths listed in `existing` are reported by `exists`.
#[derive(Clone, Default)]
pub struct StubConnector {
    state: Arc<StubState>,
}

#[derive(Default)]
struct StubState {
    existing: BTreeSet<String>,
    calls: Mutex<Vec<String>>,
    connections: Mutex<usize>,
}

impl StubConnector {
    pub fn with_existing<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(StubState {
                existing: paths.into_iter().map(Into::into).collect(),
                ..StubState::default()
            }),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        *self.state.connections.lock().unwrap()
    }
}

pub struct StubSession {
    state: Arc<StubState>,
}

impl XnatConnector for StubConnector {
    type Session = StubSession;

    fn connect(&self) -> Result<StubSession, SpiderError> {
        *self.state.connections.lock().unwrap() += 1;
        Ok(StubSession {
            state: Arc::clone(&self.state),
        })
    }
}

impl XnatSession for StubSession {
    fn exists(&self, path: &str) -> Result<bool, SpiderError> {
        self.record(format!("exists {path}"));
        Ok(self.state.existing.contains(path))
    }

    fn download_resource(&self, path: &str, destination: &Path) -> Result<PathBuf, SpiderError> {
        self.record(format!("download_resource {path}"));
        let label = path.rsplit('/').next().unwrap_or("resource");
        let resource_dir = destination.join(label);
        fs::create_dir_all(&resource_dir).unwrap();
        fs::write(resource_dir.join("a.txt"), b"a").unwrap();
        fs::write(resource_dir.join("b.txt"), b"b").unwrap();
        Ok(resource_dir)
    }

    fn download_file(
        &self,
        resource_path: &str,
        file: &str,
        destination: &Path,
    ) -> Result<PathBuf, SpiderError> {
        self.record(format!("download_file {resource_path} {file}"));
        if file.starts_with("missing") {
            return Err(SpiderError::XnatStatus {
                status: 404,
                message: format!("{resource_path}/files/{file}"),
            });
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(destination, file.as_bytes()).unwrap();
        Ok(destination.to_path_buf())
    }
}

impl StubSession {
    fn record(&self, call: String) {
        self.state.calls.lock().unwrap().push(call);
    }
}

/// Options with explicit credentials and a private upload root.
pub fn options(jobdir: &Path, results: &Path) -> SpiderOptions {
    let mut options = SpiderOptions::new(SPIDER_NAME, jobdir, "PROJ", "SUBJ", "SESS");
    options.host = Some("https://xnat.example.org".to_string());
    options.user = Some("admin".to_string());
    options.password = Some("secret".to_string());
    options.results_dir = Some(results.to_path_buf());
    options
}

/// Writes an uncompressed little-endian float32 NIfTI-1 file with `dims`
/// (3 or 4 extents). `value(frame, voxel)` fills each frame in file order.
pub fn write_nifti(path: &Path, dims: &[u16], value: impl Fn(usize, usize) -> f32) {
    let mut bytes = vec![0u8; 352];
    bytes[0..4].copy_from_slice(&348i32.to_le_bytes());
    let mut dim = [1i16; 8];
    dim[0] = dims.len() as i16;
    for (slot, &extent) in dim[1..].iter_mut().zip(dims) {
        *slot = extent as i16;
    }
    for (index, extent) in dim.iter().enumerate() {
        bytes[40 + 2 * index..42 + 2 * index].copy_from_slice(&extent.to_le_bytes());
    }
    bytes[70..72].copy_from_slice(&16i16.to_le_bytes());
    bytes[72..74].copy_from_slice(&32i16.to_le_bytes());
    for index in 0..8 {
        bytes[76 + 4 * index..80 + 4 * index].copy_from_slice(&1f32.to_le_bytes());
    }
    bytes[108..112].copy_from_slice(&352f32.to_le_bytes());
    bytes[112..116].copy_from_slice(&1f32.to_le_bytes());
    bytes[344..348].copy_from_slice(b"n+1\0");

    let voxels = dims[..3].iter().map(|&extent| extent as usize).product::<usize>();
    let frames = dims.get(3).copied().unwrap_or(1) as usize;
    for frame in 0..frames {
        for voxel in 0..voxels {
            bytes.extend_from_slice(&value(frame, voxel).to_le_bytes());
        }
    }
    fs::write(path, bytes).unwrap();
}
