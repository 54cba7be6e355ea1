//! Layout providers and the shared read-mostly layout cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use super::{Layout, LayoutLoadError};

/// Read-only source of validated layouts.
pub trait LayoutStore: Send + Sync {
    /// Resolve `id` to a validated layout.
    fn load(&self, id: &str) -> Result<Layout, LayoutLoadError>;

    /// Identifiers this store can resolve, sorted.
    fn list_available(&self) -> Vec<String>;
}

/// Layouts stored as `<root>/<id>.json`.
#[derive(Debug, Clone)]
pub struct DirLayoutStore {
    root: PathBuf,
}

impl DirLayoutStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !id.starts_with('.');
        valid.then(|| self.root.join(format!("{id}.json")))
    }
}

impl LayoutStore for DirLayoutStore {
    fn load(&self, id: &str) -> Result<Layout, LayoutLoadError> {
        let path = self
            .path_for(id)
            .ok_or_else(|| LayoutLoadError::NotFound(id.to_string()))?;
        tracing::info!(id, path = %path.display(), "loading layout");
        let data = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LayoutLoadError::NotFound(id.to_string())
            } else {
                LayoutLoadError::Io {
                    id: id.to_string(),
                    source,
                }
            }
        })?;
        let layout = Layout::from_json_str(id, &data)?;
        if layout.template_id != id {
            tracing::warn!(
                file_id = id,
                content_id = %layout.template_id,
                "layout id mismatch between file name and content"
            );
        }
        Ok(layout)
    }

    fn list_available(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            tracing::warn!(root = %self.root.display(), "layout directory not readable");
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        ids.sort();
        ids
    }
}

/// Lazily populated identifier → layout cache.
///
/// Entries are inserted on first request and shared as `Arc<Layout>`; a
/// cached layout is never mutated. [`LayoutCache::reload`] and
/// [`LayoutCache::clear`] take the write lock.
pub struct LayoutCache {
    store: Box<dyn LayoutStore>,
    entries: RwLock<HashMap<String, Arc<Layout>>>,
}

impl LayoutCache {
    pub fn new(store: impl LayoutStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached layout for `id`, loading it on first use.
    pub fn get(&self, id: &str) -> Result<Arc<Layout>, LayoutLoadError> {
        if let Some(layout) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            tracing::debug!(id, "layout served from cache");
            return Ok(Arc::clone(layout));
        }
        let loaded = Arc::new(self.store.load(id)?);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Another worker may have populated the entry meanwhile; keep the first.
        let entry = entries.entry(id.to_string()).or_insert(loaded);
        Ok(Arc::clone(entry))
    }

    /// Bypass the cache, load `id` again and replace the entry.
    pub fn reload(&self, id: &str) -> Result<Arc<Layout>, LayoutLoadError> {
        let loaded = Arc::new(self.store.load(id)?);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), Arc::clone(&loaded));
        tracing::info!(id, "layout reloaded");
        Ok(loaded)
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("layout cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_available(&self) -> Vec<String> {
        self.store.list_available()
    }
}

impl std::fmt::Debug for LayoutCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutCache")
            .field("cached", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_layout;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        loads: Arc<AtomicUsize>,
    }

    impl LayoutStore for CountingStore {
        fn load(&self, id: &str) -> Result<Layout, LayoutLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if id == "form_test" {
                Ok(sample_layout(600, 800))
            } else {
                Err(LayoutLoadError::NotFound(id.to_string()))
            }
        }

        fn list_available(&self) -> Vec<String> {
            vec!["form_test".to_string()]
        }
    }

    #[test]
    fn cache_loads_once_and_reloads_on_request() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cache = LayoutCache::new(CountingStore {
            loads: Arc::clone(&loads),
        });
        let a = cache.get("form_test").unwrap();
        let b = cache.get("form_test").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let c = cache.reload("form_test").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        cache.clear();
        assert!(cache.is_empty());
        cache.get("form_test").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failed_loads_are_not_cached() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cache = LayoutCache::new(CountingStore {
            loads: Arc::clone(&loads),
        });
        assert!(matches!(cache.get("nope"), Err(LayoutLoadError::NotFound(_))));
        assert!(cache.get("nope").is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn dir_store_reads_and_lists_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = sample_layout(600, 800);
        std::fs::write(
            dir.path().join("form_test.json"),
            serde_json::to_string_pretty(&layout).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = DirLayoutStore::new(dir.path());
        assert_eq!(store.list_available(), vec!["form_test".to_string()]);
        assert_eq!(store.load("form_test").unwrap(), layout);
        assert!(matches!(store.load("missing"), Err(LayoutLoadError::NotFound(_))));
        assert!(matches!(store.load("../etc/passwd"), Err(LayoutLoadError::NotFound(_))));
    }

    #[test]
    fn dir_store_reports_invalid_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{\"template_id\": 3}").unwrap();
        let store = DirLayoutStore::new(dir.path());
        assert!(matches!(store.load("broken"), Err(LayoutLoadError::Parse { .. })));
    }
}
