//! Object Store Abstraction
//!
//! Blocking, trait-based access to an object store whose only atomic
//! primitive is whole-object creation. Uploads stay open (unsealed) until
//! closed; bytes become durable on `flush`, and a writer dropped without
//! flushing loses whatever it still had pending.
//!
//! Implementations:
//! - `InMemoryObjectStore`: for unit tests and DST
//! - `LocalFsObjectStore`: files on disk plus a JSON metadata sidecar
//! - `SimulatedObjectStore` (in `simulated_store`): fault injection

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::{Error as IoError, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Error type for object store operations
#[derive(Debug)]
pub enum StoreError {
    /// Object not found
    NotFound(String),
    /// I/O error
    Io(IoError),
    /// Operation needs a sealed object
    NotFinalized(String),
    /// Object or writer is already sealed
    Closed(String),
    /// Other errors
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(name) => write!(f, "Object not found: {}", name),
            StoreError::Io(e) => write!(f, "I/O error: {}", e),
            StoreError::NotFinalized(name) => write!(f, "Object not finalized: {}", name),
            StoreError::Closed(name) => write!(f, "Object already closed: {}", name),
            StoreError::Other(msg) => write!(f, "Object store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<IoError> for StoreError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            _ => StoreError::Io(e),
        }
    }
}

/// How `ObjectStore::open` treats an existing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the object, replacing any existing one
    Create,
    /// Continue an unsealed upload at its durable end
    Append,
    /// Continue an unsealed upload at a known offset, dropping durable
    /// bytes past it
    Resume { offset: u64 },
}

/// Attributes applied when an object is created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    pub content_type: Option<String>,
    pub acl: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    /// Durable size in bytes
    pub size: u64,
    /// True once the upload was closed
    pub sealed: bool,
    pub content_type: Option<String>,
    pub acl: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Handle to one open upload
pub trait ObjectWriter: Send {
    fn name(&self) -> &str;
    /// Buffer bytes; nothing is durable until `flush`
    fn write(&mut self, data: &[u8]) -> Result<(), StoreError>;
    /// Make all written bytes durable
    fn flush(&mut self) -> Result<(), StoreError>;
    /// Flush and seal the object. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), StoreError>;
    /// Logical offset: durable bytes plus pending bytes
    fn tell(&self) -> u64;
    fn is_closed(&self) -> bool;
}

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    type Writer: ObjectWriter;

    fn open(
        &self,
        name: &str,
        mode: OpenMode,
        options: &CreateOptions,
    ) -> Result<Self::Writer, StoreError>;

    /// Durable bytes of an object, sealed or not
    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    /// Up to `len` durable bytes starting at `offset`; empty past the end
    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>, StoreError>;

    fn stat(&self, name: &str) -> Result<ObjectMeta, StoreError>;

    /// Server-side copy of a sealed object. `metadata` replaces the source's
    /// metadata when given. Copying an object onto itself rewrites metadata.
    fn copy(
        &self,
        src: &str,
        dst: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), StoreError>;

    /// Remove an object; `NotFound` when it does not exist
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Names starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

#[derive(Debug, Clone, Default)]
struct StoredObject {
    /// Durable bytes only; pending bytes live in the writer
    data: Vec<u8>,
    sealed: bool,
    options: CreateOptions,
}

impl StoredObject {
    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: name.to_string(),
            size: self.data.len() as u64,
            sealed: self.sealed,
            content_type: self.options.content_type.clone(),
            acl: self.options.acl.clone(),
            metadata: self.options.metadata.clone(),
        }
    }
}

type ObjectMap = Arc<RwLock<HashMap<String, StoredObject>>>;

/// In-memory object store for unit tests and deterministic simulation
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    objects: ObjectMap,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored objects (for testing)
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Overwrite durable bytes of an object (for crash simulation)
    pub fn set_object_data(&self, name: &str, data: Vec<u8>) {
        if let Some(obj) = self.objects.write().get_mut(name) {
            obj.data = data;
        }
    }
}

/// Writer over an in-memory object
pub struct InMemoryObjectWriter {
    name: String,
    objects: ObjectMap,
    pending: Vec<u8>,
    /// Durable offset this writer continues from
    offset: u64,
    append: bool,
    closed: bool,
}

impl ObjectWriter for InMemoryObjectWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        let mut objects = self.objects.write();
        let obj = objects
            .get_mut(&self.name)
            .ok_or_else(|| StoreError::NotFound(self.name.clone()))?;
        if obj.sealed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        if !self.append {
            obj.data.truncate(self.offset as usize);
        }
        obj.data.extend_from_slice(&self.pending);
        self.pending.clear();
        self.offset = obj.data.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        let mut objects = self.objects.write();
        let obj = objects
            .get_mut(&self.name)
            .ok_or_else(|| StoreError::NotFound(self.name.clone()))?;
        obj.sealed = true;
        self.closed = true;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.offset + self.pending.len() as u64
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ObjectStore for InMemoryObjectStore {
    type Writer = InMemoryObjectWriter;

    fn open(
        &self,
        name: &str,
        mode: OpenMode,
        options: &CreateOptions,
    ) -> Result<Self::Writer, StoreError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let mut objects = self.objects.write();
        let offset = match mode {
            OpenMode::Create => {
                objects.insert(
                    name.to_string(),
                    StoredObject {
                        data: Vec::new(),
                        sealed: false,
                        options: options.clone(),
                    },
                );
                0
            }
            OpenMode::Append | OpenMode::Resume { .. } => {
                let obj = objects
                    .get_mut(name)
                    .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
                if obj.sealed {
                    return Err(StoreError::Closed(name.to_string()));
                }
                let durable = obj.data.len() as u64;
                match mode {
                    OpenMode::Resume { offset } if offset > durable => {
                        return Err(StoreError::Other(format!(
                            "resume offset {} beyond durable end {} of {}",
                            offset, durable, name
                        )));
                    }
                    OpenMode::Resume { offset } => {
                        obj.data.truncate(offset as usize);
                        offset
                    }
                    _ => durable,
                }
            }
        };

        Ok(InMemoryObjectWriter {
            name: name.to_string(),
            objects: Arc::clone(&self.objects),
            pending: Vec::new(),
            offset,
            append: mode == OpenMode::Append,
            closed: false,
        })
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .get(name)
            .map(|obj| obj.data.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.read();
        let obj = objects
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let start = (offset as usize).min(obj.data.len());
        let end = start.saturating_add(len).min(obj.data.len());
        Ok(obj.data[start..end].to_vec())
    }

    fn stat(&self, name: &str) -> Result<ObjectMeta, StoreError> {
        self.objects
            .read()
            .get(name)
            .map(|obj| obj.meta(name))
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn copy(
        &self,
        src: &str,
        dst: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), StoreError> {
        let mut objects = self.objects.write();
        let source = objects
            .get(src)
            .ok_or_else(|| StoreError::NotFound(src.to_string()))?;
        if !source.sealed {
            return Err(StoreError::NotFinalized(src.to_string()));
        }
        let mut copied = source.clone();
        if let Some(metadata) = metadata {
            copied.options.metadata = metadata;
        }
        objects.insert(dst.to_string(), copied);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.objects
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

const META_SUFFIX: &str = ".meta";

/// Sidecar persisted next to each object file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sidecar {
    sealed: bool,
    #[serde(default)]
    options: CreateOptions,
}

/// Local filesystem object store. Object `/bucket/a/b` lives at
/// `<base>/bucket/a/b` with its sidecar at `<base>/bucket/a/b.meta`.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&base_path)?;
        Ok(LocalFsObjectStore { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name.trim_start_matches('/'))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(META_SUFFIX);
        PathBuf::from(os)
    }

    fn load_sidecar(path: &Path, name: &str) -> Result<Sidecar, StoreError> {
        match std::fs::read(Self::sidecar_path(path)) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Other(format!("bad sidecar for {}: {}", name, e))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn store_sidecar(path: &Path, sidecar: &Sidecar) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(sidecar)
            .map_err(|e| StoreError::Other(format!("sidecar encode: {}", e)))?;
        std::fs::write(Self::sidecar_path(path), raw)?;
        Ok(())
    }

    fn collect(dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let child = format!("{}/{}", rel, file_name);
            if entry.file_type()?.is_dir() {
                Self::collect(&entry.path(), &child, out)?;
            } else if !file_name.ends_with(META_SUFFIX) {
                out.push(child);
            }
        }
        Ok(())
    }
}

/// Writer over a local file
pub struct LocalFsObjectWriter {
    name: String,
    path: PathBuf,
    pending: Vec<u8>,
    /// Durable offset this writer continues from
    offset: u64,
    /// Append at the file's current end instead of at `offset`
    append: bool,
    closed: bool,
}

impl ObjectWriter for LocalFsObjectWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        let sidecar = LocalFsObjectStore::load_sidecar(&self.path, &self.name)?;
        if sidecar.sealed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        if self.append {
            let mut file = OpenOptions::new().append(true).open(&self.path)?;
            file.write_all(&self.pending)?;
            file.sync_all()?;
            self.offset = file.metadata()?.len();
        } else {
            let mut file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(self.offset)?;
            file.seek(SeekFrom::Start(self.offset))?;
            file.write_all(&self.pending)?;
            file.sync_all()?;
            self.offset += self.pending.len() as u64;
        }
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        let mut sidecar = LocalFsObjectStore::load_sidecar(&self.path, &self.name)?;
        sidecar.sealed = true;
        LocalFsObjectStore::store_sidecar(&self.path, &sidecar)?;
        self.closed = true;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.offset + self.pending.len() as u64
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ObjectStore for LocalFsObjectStore {
    type Writer = LocalFsObjectWriter;

    fn open(
        &self,
        name: &str,
        mode: OpenMode,
        options: &CreateOptions,
    ) -> Result<Self::Writer, StoreError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let path = self.full_path(name);
        let offset = match mode {
            OpenMode::Create => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::File::create(&path)?;
                Self::store_sidecar(
                    &path,
                    &Sidecar {
                        sealed: false,
                        options: options.clone(),
                    },
                )?;
                0
            }
            OpenMode::Append | OpenMode::Resume { .. } => {
                let sidecar = Self::load_sidecar(&path, name)?;
                if sidecar.sealed {
                    return Err(StoreError::Closed(name.to_string()));
                }
                let durable = std::fs::metadata(&path)?.len();
                match mode {
                    OpenMode::Resume { offset } if offset > durable => {
                        return Err(StoreError::Other(format!(
                            "resume offset {} beyond durable end {} of {}",
                            offset, durable, name
                        )));
                    }
                    OpenMode::Resume { offset } => {
                        OpenOptions::new().write(true).open(&path)?.set_len(offset)?;
                        offset
                    }
                    _ => durable,
                }
            }
        };

        Ok(LocalFsObjectWriter {
            name: name.to_string(),
            path,
            pending: Vec::new(),
            offset,
            append: mode == OpenMode::Append,
            closed: false,
        })
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.full_path(name);
        Self::load_sidecar(&path, name)?;
        Ok(std::fs::read(&path)?)
    }

    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        let path = self.full_path(name);
        Self::load_sidecar(&path, name)?;
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut data)?;
        Ok(data)
    }

    fn stat(&self, name: &str) -> Result<ObjectMeta, StoreError> {
        let path = self.full_path(name);
        let sidecar = Self::load_sidecar(&path, name)?;
        let size = std::fs::metadata(&path)?.len();
        Ok(ObjectMeta {
            name: name.to_string(),
            size,
            sealed: sidecar.sealed,
            content_type: sidecar.options.content_type,
            acl: sidecar.options.acl,
            metadata: sidecar.options.metadata,
        })
    }

    fn copy(
        &self,
        src: &str,
        dst: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), StoreError> {
        let src_path = self.full_path(src);
        let mut sidecar = Self::load_sidecar(&src_path, src)?;
        if !sidecar.sealed {
            return Err(StoreError::NotFinalized(src.to_string()));
        }
        if let Some(metadata) = metadata {
            sidecar.options.metadata = metadata;
        }
        let dst_path = self.full_path(dst);
        if dst_path != src_path {
            if let Some(parent) = dst_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src_path, &dst_path)?;
        }
        Self::store_sidecar(&dst_path, &sidecar)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.full_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
        match std::fs::remove_file(Self::sidecar_path(&path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        Self::collect(&self.base_path, "", &mut names)?;
        names.retain(|n| n.starts_with(prefix));
        names.sort();
        Ok(names)
    }
}
