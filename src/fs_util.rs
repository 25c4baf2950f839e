use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::SpiderError;

/// Extracts an archive, passing every entry path through `map` before it
/// is joined to `target_dir`.
pub fn extract_zip_with<F>(zip_path: &Path, target_dir: &Path, map: F) -> Result<(), SpiderError>
where
    F: Fn(&Path) -> PathBuf,
{
    let file = fs::File::open(zip_path).map_err(|err| {
        SpiderError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| SpiderError::Filesystem(err.to_string()))?;
    fs::create_dir_all(target_dir).map_err(|err| SpiderError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(map(&path)),
            None => {
                return Err(SpiderError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Copies a file, or a directory recursively, to `destination`.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<(), SpiderError> {
    if source.is_file() {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        }
        fs::copy(source, destination).map_err(|err| {
            SpiderError::Filesystem(format!("copy {}: {err}", source.display()))
        })?;
        return Ok(());
    }

    fs::create_dir_all(destination).map_err(|err| SpiderError::Filesystem(err.to_string()))?;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Moves every entry of `nested` into its parent directory and removes
/// `nested`.
pub fn flatten_into_parent(nested: &Path) -> Result<(), SpiderError> {
    let parent = nested
        .parent()
        .ok_or_else(|| SpiderError::Filesystem(format!("{} has no parent", nested.display())))?;
    let name = nested
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    // moved aside first: the folder may contain an entry with its own name
    let staging = parent.join(format!(".{name}.flatten"));
    fs::rename(nested, &staging).map_err(|err| {
        SpiderError::Filesystem(format!("move {}: {err}", nested.display()))
    })?;
    let entries = fs::read_dir(&staging).map_err(|err| {
        SpiderError::Filesystem(format!("read {}: {err}", staging.display()))
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        let source = entry.path();
        let target = parent.join(entry.file_name());
        if fs::rename(&source, &target).is_err() {
            // rename fails across devices or onto an existing directory
            copy_tree(&source, &target)?;
        }
    }
    fs::remove_dir_all(&staging).map_err(|err| SpiderError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Absolute paths of all regular files below `root`.
pub fn list_files(root: &Path) -> Result<BTreeSet<PathBuf>, SpiderError> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        if entry.file_type().is_file() {
            files.insert(absolute(entry.path())?);
        }
    }
    Ok(files)
}

pub fn absolute(path: &Path) -> Result<PathBuf, SpiderError> {
    std::path::absolute(path).map_err(|err| SpiderError::Filesystem(err.to_string()))
}

pub fn is_empty_dir(path: &Path) -> Result<bool, SpiderError> {
    let mut entries =
        fs::read_dir(path).map_err(|err| SpiderError::Filesystem(err.to_string()))?;
    Ok(entries.next().is_none())
}

pub fn create_dir(path: &Path) -> Result<(), SpiderError> {
    fs::create_dir_all(path)
        .map_err(|err| SpiderError::Filesystem(format!("create {}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    #[test]
    fn flatten_moves_entries_up() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("DATA");
        fs::create_dir_all(nested.join("sub")).unwrap();
        fs::write(nested.join("a.txt"), b"a").unwrap();
        fs::write(nested.join("sub").join("b.txt"), b"b").unwrap();

        flatten_into_parent(&nested).unwrap();

        assert!(!nested.exists());
        assert!(temp.path().join("a.txt").is_file());
        assert!(temp.path().join("sub").join("b.txt").is_file());
        assert_eq!(list_files(temp.path()).unwrap().len(), 2);
    }

    #[test]
    fn copy_tree_copies_directories() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(source.join("deep")).unwrap();
        fs::write(source.join("deep").join("x.nii"), b"x").unwrap();

        let destination = temp.path().join("dst");
        copy_tree(&source, &destination).unwrap();
        assert!(destination.join("deep").join("x.nii").is_file());
    }

    #[test]
    fn extract_with_mapping() {
        let temp = tempfile::tempdir().unwrap();
        let zip_path = temp.path().join("res.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("E1/resources/DATA/files/a.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"hello").unwrap();
            writer.finish().unwrap();
        }
        let out = temp.path().join("out");
        extract_zip_with(&zip_path, &out, |path| {
            path.file_name().map(PathBuf::from).unwrap_or_default()
        })
        .unwrap();
        assert_eq!(fs::read_to_string(out.join("a.txt")).unwrap(), "hello");
    }
}
