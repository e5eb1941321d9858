//! Named persistence for trained models.
//!
//! Two kinds of location satisfy the same [`ModelStore`] contract:
//! `local://<name>` is the persistent slot the session reloads on start-up,
//! `downloads://<name>` is an on-demand export for the user to take away.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::network::ConvNet;

/// Bumped whenever the serialized layout changes.
pub const FORMAT_VERSION: u32 = 1;

const LOCAL_SCHEME: &str = "local://";
const DOWNLOAD_SCHEME: &str = "downloads://";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelLocation {
    Local(String),
    Download(String),
}

impl ModelLocation {
    pub fn local(name: &str) -> Result<Self, StoreError> {
        validate_name(name)?;
        Ok(Self::Local(name.to_string()))
    }

    pub fn download(name: &str) -> Result<Self, StoreError> {
        validate_name(name)?;
        Ok(Self::Download(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Local(name) | Self::Download(name) => name,
        }
    }
}

impl FromStr for ModelLocation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(LOCAL_SCHEME) {
            Self::local(name)
        } else if let Some(name) = s.strip_prefix(DOWNLOAD_SCHEME) {
            Self::download(name)
        } else {
            Err(StoreError::InvalidLocation(s.to_string()))
        }
    }
}

impl fmt::Display for ModelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(name) => write!(f, "{LOCAL_SCHEME}{name}"),
            Self::Download(name) => write!(f, "{DOWNLOAD_SCHEME}{name}"),
        }
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidLocation(name.to_string()))
    }
}

/// Topology and weights as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub network: ConvNet,
}

impl ModelArtifact {
    pub fn new(network: ConvNet) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            network,
        }
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(location: &ModelLocation, json: &str) -> Result<Self, StoreError> {
        Self::from_bytes(location, json.as_bytes())
    }

    /// Decode and sanity-check an artifact read from `location`. Bytes that
    /// are not valid JSON, UTF-8 included, are reported as corrupt.
    pub fn from_bytes(location: &ModelLocation, bytes: &[u8]) -> Result<Self, StoreError> {
        let artifact: ModelArtifact =
            serde_json::from_slice(bytes).map_err(|e| StoreError::corrupt(location, e))?;

        if artifact.format_version != FORMAT_VERSION {
            return Err(StoreError::corrupt(
                location,
                format!("unsupported format version {}", artifact.format_version),
            ));
        }
        artifact
            .network
            .check_shapes()
            .map_err(|e| StoreError::corrupt(location, e))?;

        Ok(artifact)
    }
}

pub trait ModelStore {
    fn save(&mut self, location: &ModelLocation, artifact: &ModelArtifact) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] when nothing is stored and
    /// [`StoreError::Corrupt`] when the stored bytes cannot be decoded.
    fn load(&self, location: &ModelLocation) -> Result<ModelArtifact, StoreError>;
}

/// JSON files on disk: `<root>/<name>.json` for local slots and
/// `<downloads>/<name>.json` for exports.
#[derive(Debug, Clone)]
pub struct FileModelStore {
    root: PathBuf,
    downloads: PathBuf,
}

impl FileModelStore {
    pub fn new(root: impl Into<PathBuf>, downloads: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            downloads: downloads.into(),
        }
    }

    pub fn path_for(&self, location: &ModelLocation) -> PathBuf {
        let dir = match location {
            ModelLocation::Local(_) => &self.root,
            ModelLocation::Download(_) => &self.downloads,
        };
        dir.join(format!("{}.json", location.name()))
    }
}

impl ModelStore for FileModelStore {
    fn save(&mut self, location: &ModelLocation, artifact: &ModelArtifact) -> Result<(), StoreError> {
        let path = self.path_for(location);
        let json = artifact.to_json()?;
        write_atomically(&path, |file| file.write_all(json.as_bytes()))?;
        debug!(path = %path.display(), "model written");

        Ok(())
    }

    fn load(&self, location: &ModelLocation) -> Result<ModelArtifact, StoreError> {
        let path = self.path_for(location);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(location.to_string()))
            }
            Err(source) => return Err(io_error(&path, source)),
        };
        ModelArtifact::from_bytes(location, &bytes)
    }
}

/// Write through a temp file in the target's directory and rename it into
/// place. The previous file survives any failure before the rename.
fn write_atomically<F>(path: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| io_error(dir, source))?;
    write(tmp.as_file_mut()).map_err(|source| io_error(tmp.path(), source))?;
    tmp.as_file().sync_all().map_err(|source| io_error(tmp.path(), source))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;

    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// In-process store. Artifacts are kept serialized so loads exercise the
/// same decoding path as the file store.
#[derive(Debug, Clone, Default)]
pub struct MemoryModelStore {
    entries: HashMap<ModelLocation, String>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, location: &ModelLocation) -> bool {
        self.entries.contains_key(location)
    }

    /// Store raw text at a location, bypassing encoding.
    pub fn insert_raw(&mut self, location: ModelLocation, json: impl Into<String>) {
        self.entries.insert(location, json.into());
    }
}

impl ModelStore for MemoryModelStore {
    fn save(&mut self, location: &ModelLocation, artifact: &ModelArtifact) -> Result<(), StoreError> {
        self.entries.insert(location.clone(), artifact.to_json()?);
        Ok(())
    }

    fn load(&self, location: &ModelLocation) -> Result<ModelArtifact, StoreError> {
        let json = self
            .entries
            .get(location)
            .ok_or_else(|| StoreError::NotFound(location.to_string()))?;
        ModelArtifact::from_json(location, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Topology, WindowShape};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn artifact() -> ModelArtifact {
        let topology = Topology::for_window(WindowShape::new(2, 6, 1), 2, 0.01).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        ModelArtifact::new(ConvNet::new(topology, &mut rng).unwrap())
    }

    fn assert_same_model(a: &ModelArtifact, b: &ModelArtifact) {
        assert_eq!(a.format_version, b.format_version);
        assert_eq!(a.network.topology(), b.network.topology());
        let diff = a.network.max_weight_difference(&b.network).unwrap();
        assert!(diff < 1e-6, "weights drifted by {diff}");
    }

    #[test]
    fn location_round_trips_through_text() {
        let local: ModelLocation = "local://my-model".parse().unwrap();
        assert_eq!(local, ModelLocation::Local("my-model".into()));
        assert_eq!(local.to_string(), "local://my-model");

        let download: ModelLocation = "downloads://export_1.v2".parse().unwrap();
        assert_eq!(download.name(), "export_1.v2");
        assert_eq!(download.to_string(), "downloads://export_1.v2");
    }

    #[test]
    fn rejects_bad_locations() {
        assert!("indexeddb://my-model".parse::<ModelLocation>().is_err());
        assert!("local://".parse::<ModelLocation>().is_err());
        assert!("local://../escape".parse::<ModelLocation>().is_err());
        assert!("local://a/b".parse::<ModelLocation>().is_err());
        assert!("local://..".parse::<ModelLocation>().is_err());
    }

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryModelStore::new();
        let location = ModelLocation::local("slot").unwrap();
        let original = artifact();

        store.save(&location, &original).unwrap();
        assert!(store.contains(&location));
        assert_same_model(&store.load(&location).unwrap(), &original);
    }

    #[test]
    fn missing_entry_is_not_found() {
        let store = MemoryModelStore::new();
        let location = ModelLocation::local("nothing").unwrap();
        assert!(matches!(store.load(&location), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn garbage_is_corrupt() {
        let mut store = MemoryModelStore::new();
        let location = ModelLocation::local("junk").unwrap();
        store.insert_raw(location.clone(), "{not json");
        assert!(matches!(store.load(&location), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn future_format_is_corrupt() {
        let mut store = MemoryModelStore::new();
        let location = ModelLocation::local("future").unwrap();
        let mut newer = artifact();
        newer.format_version = FORMAT_VERSION + 1;
        store.insert_raw(location.clone(), newer.to_json().unwrap());

        let err = store.load(&location).unwrap_err();
        assert!(err.to_string().contains("unsupported format version"));
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileModelStore::new(dir.path().join("models"), dir.path().join("downloads"));
        let original = artifact();

        let local = ModelLocation::local("my-model").unwrap();
        let export = ModelLocation::download("my-model").unwrap();
        store.save(&local, &original).unwrap();
        store.save(&export, &original).unwrap();

        assert!(dir.path().join("models/my-model.json").exists());
        assert!(dir.path().join("downloads/my-model.json").exists());
        assert_same_model(&store.load(&local).unwrap(), &original);
        assert_same_model(&store.load(&export).unwrap(), &original);
    }

    #[test]
    fn file_store_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(dir.path(), dir.path());
        let location = ModelLocation::local("absent").unwrap();
        assert!(matches!(store.load(&location), Err(StoreError::NotFound(_))));

        fs::write(store.path_for(&location), "[]").unwrap();
        assert!(matches!(store.load(&location), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn file_store_non_utf8_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(dir.path(), dir.path());
        let location = ModelLocation::local("binary").unwrap();
        fs::write(store.path_for(&location), [0xff, 0xfe, 0x00, 0x7b]).unwrap();

        let err = store.load(&location).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.is_load_failure());
    }

    #[test]
    fn failed_write_keeps_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileModelStore::new(dir.path(), dir.path());
        let location = ModelLocation::local("slot").unwrap();
        let original = artifact();
        store.save(&location, &original).unwrap();

        let path = store.path_for(&location);
        let err = write_atomically(&path, |file| {
            file.write_all(b"{\"format_version\": 1, \"netw")?;
            Err(io::Error::new(ErrorKind::Other, "disk full"))
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));

        assert_same_model(&store.load(&location).unwrap(), &original);
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "temp file was not cleaned up");
    }

    #[test]
    fn save_replaces_existing_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileModelStore::new(dir.path(), dir.path());
        let location = ModelLocation::local("slot").unwrap();
        store.save(&location, &artifact()).unwrap();

        let topology = Topology::for_window(WindowShape::new(2, 6, 1), 3, 0.01).unwrap();
        let mut rng = StdRng::seed_from_u64(10);
        let replacement = ModelArtifact::new(ConvNet::new(topology, &mut rng).unwrap());
        store.save(&location, &replacement).unwrap();

        assert_same_model(&store.load(&location).unwrap(), &replacement);
    }
}
