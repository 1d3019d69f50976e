//! Seams to the host application: file sharing, the local score library,
//! and persisted settings.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Settings key holding the active role (`none`, `conductor`, `performer`).
pub const KEY_COLLABORATION_MODE: &str = "collaboration_mode";
/// Settings key holding the last conductor address a performer used.
pub const KEY_LAST_SERVER_ADDRESS: &str = "last_server_address";

/// Makes score files downloadable by performers.
pub trait FileDistributor: Send {
    fn add_file(&mut self, name: &str, path: &Path) -> bool;
    fn remove_file(&mut self, name: &str) -> bool;
    fn clear_files(&mut self);
    /// Base URL performers fetch files from, if a file server is running.
    fn base_url(&self) -> Option<String>;
}

/// The performer's local collection of score files.
pub trait FileLibrary: Send + Sync {
    fn contains(&self, file: &str) -> bool;
}

/// Small persistent key/value store.
pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> io::Result<()>;
}

/// Name → path index of shared files. `base_url` is whatever the host's
/// file server reports; `None` when nothing is serving.
#[derive(Debug, Default)]
pub struct FileIndex {
    files: HashMap<String, PathBuf>,
    base_url: Option<String>,
}

impl FileIndex {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            files: HashMap::new(),
            base_url,
        }
    }

    pub fn path(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FileDistributor for FileIndex {
    fn add_file(&mut self, name: &str, path: &Path) -> bool {
        if !path.is_file() {
            log::warn!("not sharing {}: {} is not a file", name, path.display());
            return false;
        }
        self.files.insert(name.to_string(), path.to_path_buf());
        true
    }

    fn remove_file(&mut self, name: &str) -> bool {
        self.files.remove(name).is_some()
    }

    fn clear_files(&mut self) {
        self.files.clear();
    }

    fn base_url(&self) -> Option<String> {
        self.base_url.clone()
    }
}

/// Score files stored flat in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryLibrary {
    root: PathBuf,
}

impl DirectoryLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileLibrary for DirectoryLibrary {
    fn contains(&self, file: &str) -> bool {
        // Logical names only; anything with a separator is not ours.
        !file.is_empty() && !file.contains(['/', '\\']) && self.root.join(file).is_file()
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    values: HashMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings kept as a pretty-printed JSON object on disk.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileSettings {
    /// Open `path`, starting empty if it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                log::warn!("ignoring malformed settings {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                log::warn!("could not read settings {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self { path, values }
    }

    /// `<config dir>/podium/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("podium").join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.values)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, json)
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_settings_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = JsonFileSettings::open(&path);
        assert_eq!(settings.get(KEY_COLLABORATION_MODE), None);
        settings.set(KEY_COLLABORATION_MODE, "performer").unwrap();
        settings.set(KEY_LAST_SERVER_ADDRESS, "192.168.1.20:9090").unwrap();

        let reopened = JsonFileSettings::open(&path);
        assert_eq!(reopened.get(KEY_COLLABORATION_MODE).as_deref(), Some("performer"));
        assert_eq!(
            reopened.get(KEY_LAST_SERVER_ADDRESS).as_deref(),
            Some("192.168.1.20:9090")
        );
    }

    #[test]
    fn malformed_settings_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(JsonFileSettings::open(&path).get(KEY_COLLABORATION_MODE), None);
    }

    #[test]
    fn file_index_tracks_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let score = dir.path().join("bach.pdf");
        fs::write(&score, b"%PDF").unwrap();

        let mut index = FileIndex::new(Some("http://10.0.0.2:8090".into()));
        assert!(index.add_file("bach.pdf", &score));
        assert!(!index.add_file("ghost.pdf", &dir.path().join("ghost.pdf")));
        assert_eq!(index.path("bach.pdf"), Some(score.as_path()));
        assert!(index.remove_file("bach.pdf"));
        assert!(index.is_empty());
        assert_eq!(index.base_url().as_deref(), Some("http://10.0.0.2:8090"));
    }

    #[test]
    fn directory_library_rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mozart.pdf"), b"%PDF").unwrap();
        let library = DirectoryLibrary::new(dir.path());
        assert!(library.contains("mozart.pdf"));
        assert!(!library.contains("haydn.pdf"));
        assert!(!library.contains("../mozart.pdf"));
    }
}
