//! Image datasets backed by a temporary random-access index file.
//!
//! The index lists every image path once. Loader workers look paths up by
//! position instead of each holding a copy of the full list.
//!
//! Layout: `MAGIC`, `count: u64`, `count + 1` byte offsets (`u64`, relative to
//! the start of the path block), then the UTF-8 path block. All integers are
//! little endian.

use crate::error::{TrainingError, TrainingResult};
use crate::transform::MethodTransform;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::borrow::Cow;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

const MAGIC: &[u8; 8] = b"LUMIDX01";
const HEADER_LEN: u64 = MAGIC.len() as u64 + 8;

pub const INDEX_FILE_PREFIX: &str = "lumen-index-";

pub const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"];

/// Stable identifier for a dataset (content hash of its index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One path or a list of paths. Each path is an image file or a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataSource {
    Single(PathBuf),
    Many(Vec<PathBuf>),
}

impl DataSource {
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            Self::Single(path) => std::slice::from_ref(path),
            Self::Many(paths) => paths,
        }
    }
}

impl From<PathBuf> for DataSource {
    fn from(path: PathBuf) -> Self {
        Self::Single(path)
    }
}

impl From<&str> for DataSource {
    fn from(path: &str) -> Self {
        Self::Single(PathBuf::from(path))
    }
}

/// Derived from the dataset and the epoch count. Read-only once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScalingInfo {
    pub dataset_size: usize,
    pub epochs: usize,
}

#[must_use]
pub fn get_scaling_info(dataset: &ImageDataset, epochs: usize) -> ScalingInfo {
    ScalingInfo { dataset_size: dataset.len(), epochs }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Raw bytes of `path` as stored in the index.
///
/// Unix paths are stored verbatim. Elsewhere only UTF-8 paths can be stored.
#[cfg(unix)]
fn path_bytes(path: &Path) -> Option<Cow<'_, [u8]>> {
    use std::os::unix::ffi::OsStrExt;
    Some(Cow::Borrowed(path.as_os_str().as_bytes()))
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Option<Cow<'_, [u8]>> {
    path.to_str().map(|s| Cow::Borrowed(s.as_bytes()))
}

#[cfg(unix)]
fn path_from_bytes(bytes: Vec<u8>) -> Option<PathBuf> {
    use std::os::unix::ffi::OsStringExt;
    Some(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: Vec<u8>) -> Option<PathBuf> {
    String::from_utf8(bytes).ok().map(PathBuf::from)
}

fn push_image(files: &mut Vec<PathBuf>, path: PathBuf) {
    if path_bytes(&path).is_some() {
        files.push(path);
    } else {
        warn!(path = %path.display(), "skipping image with a path that cannot be indexed");
    }
}

/// List the image files under `source`, sorted and without duplicates.
pub fn list_image_files(source: &DataSource) -> TrainingResult<Vec<PathBuf>> {
    if source.paths().is_empty() {
        return Err(TrainingError::config("data", "must name at least one file or directory"));
    }

    let mut files = Vec::new();
    for root in source.paths() {
        if root.is_file() {
            if !is_image(root) {
                return Err(TrainingError::Dataset(format!(
                    "unsupported file `{}`, expected one of: {}",
                    root.display(),
                    IMAGE_EXTENSIONS.join(", ")
                )));
            }
            push_image(&mut files, root.clone());
        } else if root.is_dir() {
            for entry in WalkDir::new(root).follow_links(true) {
                let entry = entry.map_err(|e| TrainingError::Dataset(format!("failed to walk {}: {e}", root.display())))?;
                if entry.file_type().is_file() && is_image(entry.path()) {
                    push_image(&mut files, entry.into_path());
                }
            }
        } else {
            return Err(TrainingError::Dataset(format!("data path does not exist: {}", root.display())));
        }
    }

    files.sort();
    files.dedup();
    if files.is_empty() {
        return Err(TrainingError::Dataset("no images found in the given data paths".to_string()));
    }
    Ok(files)
}

/// Run-scoped temporary index file.
///
/// Call [`TempIndexFile::release`] on the success path to surface deletion
/// errors. Every other path deletes the file on drop.
#[derive(Debug)]
pub struct TempIndexFile {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl TempIndexFile {
    /// Write `paths` into a fresh temp file under the system temp dir.
    pub fn create(paths: &[PathBuf]) -> TrainingResult<Self> {
        Self::create_in(&std::env::temp_dir(), paths)
    }

    /// Write `paths` into a fresh temp file under `dir`.
    pub fn create_in(dir: &Path, paths: &[PathBuf]) -> TrainingResult<Self> {
        let file = tempfile::Builder::new()
            .prefix(INDEX_FILE_PREFIX)
            .suffix(".idx")
            .tempfile_in(dir)
            .map_err(|e| TrainingError::Resource(format!("failed to create temporary index file: {e}")))?;
        write_index(file.as_file(), paths)
            .map_err(|e| TrainingError::Resource(format!("failed to write temporary index file: {e}")))?;

        let path = file.path().to_path_buf();
        debug!(path = %path.display(), entries = paths.len(), "created dataset index");
        Ok(Self { file: Some(file), path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now.
    pub fn release(mut self) -> TrainingResult<()> {
        match self.file.take() {
            Some(file) => file.close().map_err(|e| {
                TrainingError::Resource(format!("failed to delete temporary index file {}: {e}", self.path.display()))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for TempIndexFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.close() {
                warn!(path = %self.path.display(), error = %e, "failed to delete temporary index file");
            }
        }
    }
}

fn write_index(file: &File, paths: &[PathBuf]) -> std::io::Result<()> {
    let encoded: Vec<Cow<'_, [u8]>> = paths
        .iter()
        .map(|p| {
            path_bytes(p).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("path cannot be indexed: {}", p.display()))
            })
        })
        .collect::<std::io::Result<_>>()?;

    let mut out = BufWriter::new(file);
    out.write_all(MAGIC)?;
    out.write_all(&(encoded.len() as u64).to_le_bytes())?;
    let mut offset = 0u64;
    out.write_all(&offset.to_le_bytes())?;
    for path in &encoded {
        offset += path.len() as u64;
        out.write_all(&offset.to_le_bytes())?;
    }
    for path in &encoded {
        out.write_all(path)?;
    }
    out.flush()
}

/// Random-access reader over an index file.
#[derive(Debug)]
pub struct IndexReader {
    file: File,
    count: usize,
}

impl IndexReader {
    pub fn open(path: &Path) -> TrainingResult<Self> {
        let mut file = File::open(path)?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|e| TrainingError::Dataset(format!("index file {} is truncated: {e}", path.display())))?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(TrainingError::Dataset(format!("{} is not a dataset index file", path.display())));
        }
        let count = read_u64(&header[MAGIC.len()..])?;
        let count = usize::try_from(count).map_err(|_| TrainingError::Dataset("index entry count overflows".to_string()))?;
        Ok(Self { file, count })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&mut self, index: usize) -> TrainingResult<PathBuf> {
        if index >= self.count {
            return Err(TrainingError::Dataset(format!("index {index} out of range for {} images", self.count)));
        }
        let mut bounds = [0u8; 16];
        self.file.seek(SeekFrom::Start(HEADER_LEN + 8 * index as u64))?;
        self.file.read_exact(&mut bounds)?;
        let (start, end) = (read_u64(&bounds[..8])?, read_u64(&bounds[8..])?);
        if end < start {
            return Err(TrainingError::Dataset(format!("corrupt index entry {index}")));
        }

        let data_start = HEADER_LEN + 8 * (self.count as u64 + 1);
        let mut buf = vec![0u8; (end - start) as usize];
        self.file.seek(SeekFrom::Start(data_start + start))?;
        self.file.read_exact(&mut buf)?;
        path_from_bytes(buf).ok_or_else(|| TrainingError::Dataset(format!("index entry {index} is not a valid path")))
    }
}

fn read_u64(bytes: &[u8]) -> TrainingResult<u64> {
    let array: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TrainingError::Dataset("index file is truncated".to_string()))?;
    Ok(u64::from_le_bytes(array))
}

/// One sample as seen by the method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetItem {
    pub index: usize,
    pub path: PathBuf,
}

/// Dataset of image paths read through an index file.
#[derive(Debug)]
pub struct ImageDataset {
    reader: Mutex<IndexReader>,
    index_path: PathBuf,
    len: usize,
    transform: MethodTransform,
    id: DatasetId,
}

impl ImageDataset {
    /// Open the dataset over an index written by [`TempIndexFile::create`].
    pub fn new(index_path: &Path, transform: MethodTransform) -> TrainingResult<Self> {
        let reader = IndexReader::open(index_path)?;
        if reader.is_empty() {
            return Err(TrainingError::Dataset("dataset is empty".to_string()));
        }
        let id = compute_dataset_id(index_path)?;
        let len = reader.len();
        Ok(Self { reader: Mutex::new(reader), index_path: index_path.to_path_buf(), len, transform, id })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index file backing the dataset. Only valid while the run holds it.
    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    #[must_use]
    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    #[must_use]
    pub fn transform(&self) -> &MethodTransform {
        &self.transform
    }

    pub fn get(&self, index: usize) -> TrainingResult<DatasetItem> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| TrainingError::Dataset("dataset index reader lock poisoned".to_string()))?;
        Ok(DatasetItem { index, path: reader.get(index)? })
    }
}

pub fn compute_dataset_id(index_path: &Path) -> TrainingResult<DatasetId> {
    let mut file = File::open(index_path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(DatasetId(hex::encode(hasher.finalize())))
}
