use std::fs::{self, File};
use std::hash::Hash;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bincode::config;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ElementMapper, EnvelopeFn, MapperState, SpatialElement};
use crate::envelope::Envelope;
use crate::rtree::{ElementId, SpatialError, SpatialResult};

/// Magic number of a mapper side file ("RMAP")
const MAPPER_MAGIC: u32 = 0x524D_4150;

/// Side file format version
const MAPPER_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a, E> {
    magic: u32,
    version: u32,
    next_id: ElementId,
    entries: Vec<(ElementId, &'a E)>,
}

#[derive(Deserialize)]
struct Snapshot<E> {
    magic: u32,
    version: u32,
    next_id: ElementId,
    entries: Vec<(ElementId, E)>,
}

/// Element mapper persisted to a side file next to the index.
///
/// The whole mapping is rewritten on `flush`/`close` (to `<path>.tmp`, then
/// renamed over `<path>`), and loaded back by [`open`](Self::open). Ids
/// therefore stay stable across process restarts as long as the caller
/// flushes after mutating the index.
pub struct FileElementMapper<E> {
    path: PathBuf,
    state: RwLock<MapperState<E>>,
    envelope_fn: EnvelopeFn<E>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl<E> FileElementMapper<E>
where
    E: SpatialElement + Serialize + DeserializeOwned + Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Opens the side file at `path`, starting empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> SpatialResult<Self> {
        Self::open_with_envelope_fn(path, |element: &E| Ok(element.envelope()))
    }
}

impl<E> FileElementMapper<E>
where
    E: Serialize + DeserializeOwned + Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn open_with_envelope_fn<F>(path: impl AsRef<Path>, envelope_fn: F) -> SpatialResult<Self>
    where
        F: Fn(&E) -> SpatialResult<Envelope> + Send + Sync + 'static,
    {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            load_snapshot(&path)?
        } else {
            MapperState::new()
        };

        log::debug!(
            "Opened element mapper at {:?} with {} elements",
            path,
            state.len()
        );

        Ok(Self {
            path,
            state: RwLock::new(state),
            envelope_fn: Arc::new(envelope_fn),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> SpatialResult<()> {
        if self.is_closed() {
            Err(SpatialError::Closed)
        } else {
            Ok(())
        }
    }

    fn write_snapshot(&self) -> SpatialResult<()> {
        let state = self.state.read();
        let snapshot = SnapshotRef {
            magic: MAPPER_MAGIC,
            version: MAPPER_VERSION,
            next_id: state.next_id(),
            entries: state.entries(),
        };
        let bytes = bincode::serde::encode_to_vec(&snapshot, config::legacy())
            .map_err(|e| SpatialError::Serialization(e.to_string()))?;

        let tmp = temp_path(&self.path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn load_snapshot<E>(path: &Path) -> SpatialResult<MapperState<E>>
where
    E: DeserializeOwned + Clone + Eq + Hash,
{
    let bytes = fs::read(path)?;
    let (snapshot, _): (Snapshot<E>, usize) =
        bincode::serde::decode_from_slice(&bytes, config::legacy())
            .map_err(|e| SpatialError::Serialization(format!("mapper file {:?}: {}", path, e)))?;

    if snapshot.magic != MAPPER_MAGIC {
        return Err(SpatialError::BadMagic(snapshot.magic));
    }
    if snapshot.version != MAPPER_VERSION {
        return Err(SpatialError::UnsupportedVersion {
            found: snapshot.version,
            expected: MAPPER_VERSION,
        });
    }
    Ok(MapperState::from_entries(snapshot.next_id, snapshot.entries))
}

impl<E> ElementMapper for FileElementMapper<E>
where
    E: Serialize + DeserializeOwned + Clone + Eq + Hash + Send + Sync + 'static,
{
    type Element = E;

    fn id_of(&self, element: &E) -> SpatialResult<ElementId> {
        self.ensure_open()?;
        if let Some(id) = self.state.read().find_id(element) {
            return Ok(id);
        }
        let (id, assigned) = self.state.write().id_of(element);
        if assigned {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(id)
    }

    fn find_id(&self, element: &E) -> SpatialResult<Option<ElementId>> {
        self.ensure_open()?;
        Ok(self.state.read().find_id(element))
    }

    fn element_of(&self, id: ElementId) -> SpatialResult<E> {
        self.ensure_open()?;
        self.state
            .read()
            .element_of(id)
            .cloned()
            .ok_or_else(|| SpatialError::NotFound(format!("no element with id {}", id)))
    }

    fn envelope_of(&self, element: &E) -> SpatialResult<Envelope> {
        self.ensure_open()?;
        (self.envelope_fn)(element)
    }

    /// Rewrites the side file if anything changed since the last flush.
    fn flush(&self) -> SpatialResult<()> {
        self.ensure_open()?;
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.write_snapshot() {
                self.dirty.store(true, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    fn close(&self) -> SpatialResult<()> {
        self.flush()?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SpatialError::Closed);
        }
        log::debug!("Closed element mapper at {:?}", self.path);
        Ok(())
    }
}

impl<E> Drop for FileElementMapper<E> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) && self.dirty.load(Ordering::Acquire) {
            log::warn!(
                "Element mapper at {:?} dropped with unflushed ids",
                self.path
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    struct Site {
        code: String,
        x: i64,
        y: i64,
    }

    impl SpatialElement for Site {
        fn envelope(&self) -> Envelope {
            Envelope::point(vec![self.x as f64, self.y as f64]).unwrap()
        }
    }

    fn site(code: &str, x: i64, y: i64) -> Site {
        Site {
            code: code.to_string(),
            x,
            y,
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sites.map");

        let (id_a, id_b) = {
            let mapper = FileElementMapper::<Site>::open(&path).unwrap();
            let a = mapper.id_of(&site("A", 1, 2)).unwrap();
            let b = mapper.id_of(&site("B", 3, 4)).unwrap();
            mapper.close().unwrap();
            (a, b)
        };
        assert!(path.exists());
        assert!(!temp_path(&path).exists());

        let mapper = FileElementMapper::<Site>::open(&path).unwrap();
        assert_eq!(mapper.len(), 2);
        assert_eq!(mapper.element_of(id_a).unwrap(), site("A", 1, 2));
        assert_eq!(mapper.find_id(&site("B", 3, 4)).unwrap(), Some(id_b));

        // New ids continue after the persisted ones.
        let c = mapper.id_of(&site("C", 0, 0)).unwrap();
        assert!(c > id_b);
        assert_eq!(mapper.element_of(c).unwrap().code, "C");
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let mapper = FileElementMapper::<Site>::open(dir.path().join("none.map")).unwrap();
        assert!(mapper.is_empty());
        // Nothing assigned: flush writes nothing.
        mapper.flush().unwrap();
        assert!(!mapper.path().exists());
    }

    #[test]
    fn test_find_id_never_assigns() {
        let dir = tempdir().unwrap();
        let mapper = FileElementMapper::<Site>::open(dir.path().join("lookup.map")).unwrap();
        assert_eq!(mapper.find_id(&site("Q", 5, 5)).unwrap(), None);
        assert!(mapper.is_empty());
        mapper.flush().unwrap();
        assert!(!mapper.path().exists());

        let id = mapper.id_of(&site("Q", 5, 5)).unwrap();
        assert_eq!(mapper.find_id(&site("Q", 5, 5)).unwrap(), Some(id));
        assert_eq!(mapper.len(), 1);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreign.map");
        let bytes = bincode::serde::encode_to_vec(
            (0xDEAD_BEEFu32, 1u32, 1u64, Vec::<(u64, Site)>::new()),
            config::legacy(),
        )
        .unwrap();
        fs::write(&path, bytes).unwrap();

        let result = FileElementMapper::<Site>::open(&path);
        assert!(matches!(result, Err(SpatialError::BadMagic(0xDEAD_BEEF))));

        fs::write(&path, b"xx").unwrap();
        let result = FileElementMapper::<Site>::open(&path);
        assert!(matches!(result, Err(SpatialError::Serialization(_))));
    }

    #[test]
    fn test_closed_mapper() {
        let dir = tempdir().unwrap();
        let mapper = FileElementMapper::<Site>::open(dir.path().join("m.map")).unwrap();
        mapper.close().unwrap();
        assert!(matches!(mapper.close(), Err(SpatialError::Closed)));
        assert!(matches!(mapper.element_of(1), Err(SpatialError::Closed)));
        assert!(matches!(
            mapper.envelope_of(&site("A", 0, 0)),
            Err(SpatialError::Closed)
        ));
    }
}
