//! Storage behind the SFTP server.
//!
//! Paths handed to a [`FileSystem`] are virtual, slash separated and already
//! passed through [`normalize_path`]; a backend never sees `.` or `..`.

use super::multipart::MultipartTransfer;
use super::types::{FileAttributes, NameEntry, OpenFlags, SftpError, SftpResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// An open file.
#[async_trait]
pub trait OpenFile: Send + Sync {
    /// Reads up to `len` bytes at `offset`. An empty result means EOF.
    async fn read(&self, offset: u64, len: usize) -> SftpResult<Vec<u8>>;

    /// Writes `data` at `offset`.
    async fn write(&self, offset: u64, data: &[u8]) -> SftpResult<()>;

    /// Current attributes.
    async fn stat(&self) -> SftpResult<FileAttributes>;

    /// Applies attributes.
    async fn setstat(&self, attrs: &FileAttributes) -> SftpResult<()>;

    /// Flushes and releases the file.
    async fn close(&self) -> SftpResult<()> {
        Ok(())
    }
}

/// A file tree served over SFTP.
#[async_trait]
pub trait FileSystem: Send + Sync + 'static {
    /// Opens or creates a file.
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: &FileAttributes,
    ) -> SftpResult<Box<dyn OpenFile>>;

    /// Attributes, following links.
    async fn stat(&self, path: &str) -> SftpResult<FileAttributes>;

    /// Attributes of the entry itself.
    async fn lstat(&self, path: &str) -> SftpResult<FileAttributes> {
        self.stat(path).await
    }

    /// Applies attributes to a path.
    async fn setstat(&self, path: &str, attrs: &FileAttributes) -> SftpResult<()>;

    /// Lists a directory.
    async fn read_dir(&self, path: &str) -> SftpResult<Vec<NameEntry>>;

    /// Removes a file.
    async fn remove(&self, path: &str) -> SftpResult<()>;

    /// Creates a directory.
    async fn mkdir(&self, path: &str, attrs: &FileAttributes) -> SftpResult<()>;

    /// Removes an empty directory.
    async fn rmdir(&self, path: &str) -> SftpResult<()>;

    /// Canonical form of an existing path.
    async fn realpath(&self, path: &str) -> SftpResult<String> {
        self.stat(path).await?;
        Ok(path.to_string())
    }

    /// Renames a file or directory. Fails if `to` exists.
    async fn rename(&self, from: &str, to: &str) -> SftpResult<()>;

    /// Target of a symbolic link.
    async fn readlink(&self, _path: &str) -> SftpResult<String> {
        Err(SftpError::Unsupported("symbolic links".to_string()))
    }

    /// Creates a symbolic link at `link` pointing to `target`.
    async fn symlink(&self, _link: &str, _target: &str) -> SftpResult<()> {
        Err(SftpError::Unsupported("symbolic links".to_string()))
    }

    /// Whether multipart uploads may target `path`.
    fn supports_multipart(&self, _path: &str) -> bool {
        false
    }

    /// Opens storage for one part. Offsets written are relative to the part.
    async fn open_part(&self, _transfer: &str, _part: &str) -> SftpResult<Box<dyn OpenFile>> {
        Err(SftpError::Unsupported("multipart".to_string()))
    }

    /// Writes the concatenation of all parts to the target and discards them.
    async fn combine_parts(&self, _transfer: &MultipartTransfer) -> SftpResult<()> {
        Err(SftpError::Unsupported("multipart".to_string()))
    }

    /// Drops all part data of a transfer.
    async fn discard_parts(&self, _transfer: &MultipartTransfer) -> SftpResult<()> {
        Ok(())
    }
}

/// Resolves `.` and `..` and makes the path absolute. `..` never climbs
/// above `/`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FileData {
    content: Vec<u8>,
    perm: u32,
    times: (u32, u32),
}

type SharedFile = Arc<Mutex<FileData>>;

#[derive(Debug, Clone)]
enum Node {
    File(SharedFile),
    Dir { perm: u32, times: (u32, u32) },
}

impl Node {
    fn attrs(&self) -> FileAttributes {
        match self {
            Node::File(file) => {
                let file = file.lock();
                let mut attrs = FileAttributes::file(file.content.len() as u64, file.perm);
                attrs.times = Some(file.times);
                attrs
            }
            Node::Dir { perm, times } => {
                let mut attrs = FileAttributes::directory(*perm);
                attrs.times = Some(*times);
                attrs
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<String, Node>,
    parts: HashMap<(String, String), SharedFile>,
}

/// In-memory tree. Supports multipart uploads; has no symbolic links.
#[derive(Debug, Clone)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<MemoryState>>,
    multipart: bool,
}

impl MemoryFileSystem {
    /// An empty tree containing only `/`.
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        state.nodes.insert(
            "/".to_string(),
            Node::Dir {
                perm: 0o755,
                times: (0, 0),
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
            multipart: true,
        }
    }

    /// Enables or disables multipart uploads.
    pub fn with_multipart(mut self, enabled: bool) -> Self {
        self.multipart = enabled;
        self
    }

    /// Creates or replaces a file, creating missing parent directories.
    pub fn insert_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let path = normalize_path(path);
        let mut state = self.state.lock();
        let mut dir = parent_of(&path).to_string();
        let mut missing = Vec::new();
        while !state.nodes.contains_key(&dir) {
            missing.push(dir.clone());
            dir = parent_of(&dir).to_string();
        }
        for dir in missing {
            state.nodes.insert(
                dir,
                Node::Dir {
                    perm: 0o755,
                    times: (0, 0),
                },
            );
        }
        let now = unix_now();
        state.nodes.insert(
            path,
            Node::File(Arc::new(Mutex::new(FileData {
                content: content.into(),
                perm: 0o644,
                times: (now, now),
            }))),
        );
    }

    /// Contents of a file.
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(&normalize_path(path)) {
            Some(Node::File(file)) => Some(file.lock().content.clone()),
            _ => None,
        }
    }

    /// Number of part buffers currently held.
    pub fn part_count(&self) -> usize {
        self.state.lock().parts.len()
    }

    fn node(&self, path: &str) -> SftpResult<Node> {
        self.state
            .lock()
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| SftpError::NotFound(path.to_string()))
    }
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_parent_dir(nodes: &BTreeMap<String, Node>, path: &str) -> SftpResult<()> {
    match nodes.get(parent_of(path)) {
        Some(Node::Dir { .. }) => Ok(()),
        Some(Node::File(_)) => Err(SftpError::Failure(format!(
            "{} is not a directory",
            parent_of(path)
        ))),
        None => Err(SftpError::NotFound(parent_of(path).to_string())),
    }
}

fn apply_file_attrs(file: &mut FileData, attrs: &FileAttributes) {
    if let Some(size) = attrs.size {
        file.content.resize(size as usize, 0);
    }
    if let Some(perm) = attrs.permissions {
        file.perm = perm & 0o7777;
    }
    if let Some(times) = attrs.times {
        file.times = times;
    }
}

struct MemoryFile {
    data: SharedFile,
    flags: OpenFlags,
}

#[async_trait]
impl OpenFile for MemoryFile {
    async fn read(&self, offset: u64, len: usize) -> SftpResult<Vec<u8>> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(SftpError::PermissionDenied("not opened for reading".to_string()));
        }
        let data = self.data.lock();
        let size = data.content.len() as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = (offset + len as u64).min(size);
        Ok(data.content[offset as usize..end as usize].to_vec())
    }

    async fn write(&self, offset: u64, bytes: &[u8]) -> SftpResult<()> {
        if !self.flags.contains(OpenFlags::WRITE) && !self.flags.contains(OpenFlags::APPEND) {
            return Err(SftpError::PermissionDenied("not opened for writing".to_string()));
        }
        let mut data = self.data.lock();
        let offset = if self.flags.contains(OpenFlags::APPEND) {
            data.content.len()
        } else {
            usize::try_from(offset)
                .map_err(|_| SftpError::Failure("offset too large".to_string()))?
        };
        let end = offset + bytes.len();
        if data.content.len() < end {
            data.content.resize(end, 0);
        }
        data.content[offset..end].copy_from_slice(bytes);
        data.times.1 = unix_now();
        Ok(())
    }

    async fn stat(&self) -> SftpResult<FileAttributes> {
        Ok(Node::File(self.data.clone()).attrs())
    }

    async fn setstat(&self, attrs: &FileAttributes) -> SftpResult<()> {
        apply_file_attrs(&mut self.data.lock(), attrs);
        Ok(())
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: &FileAttributes,
    ) -> SftpResult<Box<dyn OpenFile>> {
        let mut state = self.state.lock();
        let data = match state.nodes.get(path) {
            Some(Node::Dir { .. }) => {
                return Err(SftpError::Failure(format!("{} is a directory", path)))
            }
            Some(Node::File(_)) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) => {
                return Err(SftpError::Failure(format!("{} already exists", path)))
            }
            Some(Node::File(file)) => {
                if flags.contains(OpenFlags::TRUNCATE) {
                    file.lock().content.clear();
                }
                file.clone()
            }
            None if flags.contains(OpenFlags::CREATE) => {
                ensure_parent_dir(&state.nodes, path)?;
                let now = unix_now();
                let mut data = FileData {
                    content: Vec::new(),
                    perm: 0o644,
                    times: (now, now),
                };
                apply_file_attrs(&mut data, attrs);
                let file = Arc::new(Mutex::new(data));
                state.nodes.insert(path.to_string(), Node::File(file.clone()));
                file
            }
            None => return Err(SftpError::NotFound(path.to_string())),
        };
        Ok(Box::new(MemoryFile { data, flags }))
    }

    async fn stat(&self, path: &str) -> SftpResult<FileAttributes> {
        Ok(self.node(path)?.attrs())
    }

    async fn setstat(&self, path: &str, attrs: &FileAttributes) -> SftpResult<()> {
        let mut state = self.state.lock();
        match state.nodes.get_mut(path) {
            Some(Node::File(file)) => apply_file_attrs(&mut file.lock(), attrs),
            Some(Node::Dir { perm, times }) => {
                if let Some(p) = attrs.permissions {
                    *perm = p & 0o7777;
                }
                if let Some(t) = attrs.times {
                    *times = t;
                }
            }
            None => return Err(SftpError::NotFound(path.to_string())),
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> SftpResult<Vec<NameEntry>> {
        let state = self.state.lock();
        match state.nodes.get(path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File(_)) => {
                return Err(SftpError::Failure(format!("{} is not a directory", path)))
            }
            None => return Err(SftpError::NotFound(path.to_string())),
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && parent_of(p) == path)
            .map(|(p, node)| NameEntry::new(file_name(p), node.attrs()))
            .collect())
    }

    async fn remove(&self, path: &str) -> SftpResult<()> {
        let mut state = self.state.lock();
        match state.nodes.get(path) {
            Some(Node::File(_)) => {
                state.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(SftpError::Failure(format!("{} is a directory", path))),
            None => Err(SftpError::NotFound(path.to_string())),
        }
    }

    async fn mkdir(&self, path: &str, attrs: &FileAttributes) -> SftpResult<()> {
        let mut state = self.state.lock();
        if state.nodes.contains_key(path) {
            return Err(SftpError::Failure(format!("{} already exists", path)));
        }
        ensure_parent_dir(&state.nodes, path)?;
        let now = unix_now();
        state.nodes.insert(
            path.to_string(),
            Node::Dir {
                perm: attrs.permissions.map(|p| p & 0o7777).unwrap_or(0o755),
                times: (now, now),
            },
        );
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> SftpResult<()> {
        let mut state = self.state.lock();
        match state.nodes.get(path) {
            Some(Node::Dir { .. }) if path == "/" => {
                Err(SftpError::PermissionDenied("cannot remove /".to_string()))
            }
            Some(Node::Dir { .. }) => {
                if state.nodes.keys().any(|p| p != "/" && parent_of(p) == path) {
                    return Err(SftpError::Failure(format!("{} is not empty", path)));
                }
                state.nodes.remove(path);
                Ok(())
            }
            Some(Node::File(_)) => Err(SftpError::Failure(format!("{} is not a directory", path))),
            None => Err(SftpError::NotFound(path.to_string())),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> SftpResult<()> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(from) {
            return Err(SftpError::NotFound(from.to_string()));
        }
        if state.nodes.contains_key(to) {
            return Err(SftpError::Failure(format!("{} already exists", to)));
        }
        if from == "/" || to.starts_with(&format!("{}/", from)) {
            return Err(SftpError::Failure(format!("cannot move {} into itself", from)));
        }
        ensure_parent_dir(&state.nodes, to)?;
        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|p| p.as_str() == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = state.nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                state.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn supports_multipart(&self, _path: &str) -> bool {
        self.multipart
    }

    async fn open_part(&self, transfer: &str, part: &str) -> SftpResult<Box<dyn OpenFile>> {
        if !self.multipart {
            return Err(SftpError::Unsupported("multipart".to_string()));
        }
        let data = self
            .state
            .lock()
            .parts
            .entry((transfer.to_string(), part.to_string()))
            .or_insert_with(|| {
                Arc::new(Mutex::new(FileData {
                    content: Vec::new(),
                    perm: 0o600,
                    times: (0, 0),
                }))
            })
            .clone();
        Ok(Box::new(MemoryFile {
            data,
            flags: OpenFlags::READ | OpenFlags::WRITE,
        }))
    }

    async fn combine_parts(&self, transfer: &MultipartTransfer) -> SftpResult<()> {
        let mut state = self.state.lock();
        ensure_parent_dir(&state.nodes, transfer.path())?;
        if let Some(Node::Dir { .. }) = state.nodes.get(transfer.path()) {
            return Err(SftpError::Failure(format!("{} is a directory", transfer.path())));
        }
        let mut content = Vec::with_capacity(transfer.total_length() as usize);
        for part in transfer.parts() {
            let key = (transfer.id().to_string(), part.id().to_string());
            let data = state.parts.remove(&key);
            let mut bytes = data.map(|d| std::mem::take(&mut d.lock().content)).unwrap_or_default();
            bytes.resize(part.length() as usize, 0);
            content.extend_from_slice(&bytes);
        }
        let now = unix_now();
        state.nodes.insert(
            transfer.path().to_string(),
            Node::File(Arc::new(Mutex::new(FileData {
                content,
                perm: 0o644,
                times: (now, now),
            }))),
        );
        Ok(())
    }

    async fn discard_parts(&self, transfer: &MultipartTransfer) -> SftpResult<()> {
        self.state.lock().parts.retain(|(id, _), _| id != transfer.id());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Local directory
// ---------------------------------------------------------------------------

/// Hidden directory under the root holding part files.
pub const PARTS_DIR: &str = ".kestrel-parts";

/// Serves a directory of the local file system as `/`.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    /// Serves `root`, which must be an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> SftpResult<Self> {
        let root = std::fs::canonicalize(root.into())?;
        if !root.is_dir() {
            return Err(SftpError::Failure(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Directory served as `/`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let virtual_path = normalize_path(path);
        let relative = virtual_path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    fn is_reserved(&self, path: &str) -> bool {
        normalize_path(path)
            .trim_start_matches('/')
            .split('/')
            .next()
            .map_or(false, |first| first == PARTS_DIR)
    }

    fn check_visible(&self, path: &str) -> SftpResult<()> {
        if self.is_reserved(path) {
            Err(SftpError::PermissionDenied(path.to_string()))
        } else {
            Ok(())
        }
    }

    fn transfer_dir(&self, transfer: &str) -> PathBuf {
        self.root.join(PARTS_DIR).join(hex::encode(transfer.as_bytes()))
    }

    fn part_path(&self, transfer: &str, part: &str) -> PathBuf {
        self.transfer_dir(transfer).join(hex::encode(part.as_bytes()))
    }
}

fn metadata_attrs(meta: &std::fs::Metadata) -> FileAttributes {
    let to_secs = |t: std::io::Result<SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    };
    let mut attrs = FileAttributes::new();
    attrs.size = Some(meta.len());
    attrs.times = Some((to_secs(meta.accessed()), to_secs(meta.modified())));
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        attrs.uid_gid = Some((meta.uid(), meta.gid()));
        attrs.permissions = Some(meta.mode());
    }
    #[cfg(not(unix))]
    {
        use super::types::mode;
        let kind = if meta.is_dir() {
            mode::S_IFDIR | 0o755
        } else if meta.file_type().is_symlink() {
            mode::S_IFLNK | 0o777
        } else {
            mode::S_IFREG | 0o644
        };
        attrs.permissions = Some(if meta.permissions().readonly() {
            kind & !0o222
        } else {
            kind
        });
    }
    attrs
}

async fn apply_local_attrs(path: &Path, attrs: &FileAttributes) -> SftpResult<()> {
    if let Some(size) = attrs.size {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(size).await?;
    }
    #[cfg(unix)]
    if let Some(perm) = attrs.permissions {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(perm & 0o7777)).await?;
    }
    if let Some((atime, mtime)) = attrs.times {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let times = std::fs::FileTimes::new()
                .set_accessed(UNIX_EPOCH + Duration::from_secs(atime as u64))
                .set_modified(UNIX_EPOCH + Duration::from_secs(mtime as u64));
            std::fs::OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_times(times)
        })
        .await
        .map_err(|e| SftpError::Failure(e.to_string()))??;
    }
    Ok(())
}

struct LocalFile {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    flags: OpenFlags,
}

#[async_trait]
impl OpenFile for LocalFile {
    async fn read(&self, offset: u64, len: usize) -> SftpResult<Vec<u8>> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(SftpError::PermissionDenied("not opened for reading".to_string()));
        }
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> SftpResult<()> {
        if !self.flags.contains(OpenFlags::WRITE) && !self.flags.contains(OpenFlags::APPEND) {
            return Err(SftpError::PermissionDenied("not opened for writing".to_string()));
        }
        let mut file = self.file.lock().await;
        if !self.flags.contains(OpenFlags::APPEND) {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn stat(&self) -> SftpResult<FileAttributes> {
        let meta = self.file.lock().await.metadata().await?;
        Ok(metadata_attrs(&meta))
    }

    async fn setstat(&self, attrs: &FileAttributes) -> SftpResult<()> {
        self.file.lock().await.flush().await?;
        apply_local_attrs(&self.path, attrs).await
    }

    async fn close(&self) -> SftpResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        if self.flags.contains(OpenFlags::WRITE) || self.flags.contains(OpenFlags::APPEND) {
            file.sync_data().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: &FileAttributes,
    ) -> SftpResult<Box<dyn OpenFile>> {
        self.check_visible(path)?;
        let local = self.resolve(path);
        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(flags.contains(OpenFlags::READ))
            .write(flags.contains(OpenFlags::WRITE))
            .append(flags.contains(OpenFlags::APPEND));
        if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
            options.create_new(true);
        } else if flags.contains(OpenFlags::CREATE) {
            options.create(true);
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            options.truncate(true);
        }
        #[cfg(unix)]
        if let Some(perm) = attrs.permissions {
            options.mode(perm & 0o7777);
        }
        #[cfg(not(unix))]
        let _ = attrs;
        let file = options.open(&local).await?;
        Ok(Box::new(LocalFile {
            path: local,
            file: tokio::sync::Mutex::new(file),
            flags,
        }))
    }

    async fn stat(&self, path: &str) -> SftpResult<FileAttributes> {
        self.check_visible(path)?;
        Ok(metadata_attrs(&tokio::fs::metadata(self.resolve(path)).await?))
    }

    async fn lstat(&self, path: &str) -> SftpResult<FileAttributes> {
        self.check_visible(path)?;
        Ok(metadata_attrs(
            &tokio::fs::symlink_metadata(self.resolve(path)).await?,
        ))
    }

    async fn setstat(&self, path: &str, attrs: &FileAttributes) -> SftpResult<()> {
        self.check_visible(path)?;
        apply_local_attrs(&self.resolve(path), attrs).await
    }

    async fn read_dir(&self, path: &str) -> SftpResult<Vec<NameEntry>> {
        self.check_visible(path)?;
        let at_root = normalize_path(path) == "/";
        let mut dir = tokio::fs::read_dir(self.resolve(path)).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if at_root && name == PARTS_DIR {
                continue;
            }
            let meta = tokio::fs::symlink_metadata(entry.path()).await?;
            entries.push(NameEntry::new(name, metadata_attrs(&meta)));
        }
        Ok(entries)
    }

    async fn remove(&self, path: &str) -> SftpResult<()> {
        self.check_visible(path)?;
        Ok(tokio::fs::remove_file(self.resolve(path)).await?)
    }

    async fn mkdir(&self, path: &str, attrs: &FileAttributes) -> SftpResult<()> {
        self.check_visible(path)?;
        let local = self.resolve(path);
        tokio::fs::create_dir(&local).await?;
        if attrs.permissions.is_some() {
            apply_local_attrs(&local, attrs).await?;
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> SftpResult<()> {
        self.check_visible(path)?;
        if normalize_path(path) == "/" {
            return Err(SftpError::PermissionDenied("cannot remove /".to_string()));
        }
        Ok(tokio::fs::remove_dir(self.resolve(path)).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> SftpResult<()> {
        self.check_visible(from)?;
        self.check_visible(to)?;
        let target = self.resolve(to);
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(SftpError::Failure(format!("{} already exists", to)));
        }
        Ok(tokio::fs::rename(self.resolve(from), target).await?)
    }

    async fn readlink(&self, path: &str) -> SftpResult<String> {
        self.check_visible(path)?;
        let target = tokio::fs::read_link(self.resolve(path)).await?;
        let target = match target.strip_prefix(&self.root) {
            Ok(inside) => format!("/{}", inside.to_string_lossy()),
            Err(_) => target.to_string_lossy().into_owned(),
        };
        Ok(target)
    }

    #[cfg(unix)]
    async fn symlink(&self, link: &str, target: &str) -> SftpResult<()> {
        self.check_visible(link)?;
        self.check_visible(target)?;
        Ok(tokio::fs::symlink(self.resolve(target), self.resolve(link)).await?)
    }

    fn supports_multipart(&self, path: &str) -> bool {
        !self.is_reserved(path)
    }

    async fn open_part(&self, transfer: &str, part: &str) -> SftpResult<Box<dyn OpenFile>> {
        let dir = self.transfer_dir(transfer);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.part_path(transfer, part);
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;
        Ok(Box::new(LocalFile {
            path,
            file: tokio::sync::Mutex::new(file),
            flags: OpenFlags::READ | OpenFlags::WRITE,
        }))
    }

    async fn combine_parts(&self, transfer: &MultipartTransfer) -> SftpResult<()> {
        self.check_visible(transfer.path())?;
        let mut target = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(transfer.path()))
            .await?;
        for part in transfer.parts() {
            let path = self.part_path(transfer.id(), part.id());
            let source = tokio::fs::File::open(&path).await?;
            let copied = tokio::io::copy(&mut source.take(part.length()), &mut target).await?;
            if copied != part.length() {
                return Err(SftpError::Failure(format!(
                    "part {} holds {} of {} bytes",
                    part.id(),
                    copied,
                    part.length()
                )));
            }
        }
        target.flush().await?;
        target.sync_all().await?;
        self.discard_parts(transfer).await
    }

    async fn discard_parts(&self, transfer: &MultipartTransfer) -> SftpResult<()> {
        match tokio::fs::remove_dir_all(self.transfer_dir(transfer.id())).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::sftp::multipart::{MultipartRegistry, PartSpec};
    use crate::ssh::sftp::types::FileType;
    use kestrel_platform::system_clock;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("."), "/");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a/./b/../c/"), "/a/c");
        assert_eq!(normalize_path("/../../etc"), "/etc");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
    }

    #[tokio::test]
    async fn test_memory_open_read_write() {
        let fs = MemoryFileSystem::new();
        let file = fs
            .open("/hello.txt", OpenFlags::create_truncate(), &FileAttributes::new())
            .await
            .unwrap();
        file.write(0, b"hello").await.unwrap();
        file.write(5, b" world").await.unwrap();
        assert_eq!(fs.file_contents("/hello.txt").unwrap(), b"hello world");

        let reader = fs
            .open("/hello.txt", OpenFlags::READ, &FileAttributes::new())
            .await
            .unwrap();
        assert_eq!(reader.read(6, 100).await.unwrap(), b"world");
        assert!(reader.read(11, 10).await.unwrap().is_empty());
        assert!(reader.write(0, b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_open_flags() {
        let fs = MemoryFileSystem::new();
        fs.insert_file("/f", b"data".to_vec());
        assert!(matches!(
            fs.open("/missing", OpenFlags::READ, &FileAttributes::new()).await,
            Err(SftpError::NotFound(_))
        ));
        assert!(fs
            .open(
                "/f",
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
                &FileAttributes::new()
            )
            .await
            .is_err());
        assert!(fs
            .open("/nodir/f", OpenFlags::create_truncate(), &FileAttributes::new())
            .await
            .is_err());

        let appender = fs
            .open("/f", OpenFlags::APPEND, &FileAttributes::new())
            .await
            .unwrap();
        appender.write(0, b"!").await.unwrap();
        assert_eq!(fs.file_contents("/f").unwrap(), b"data!");
    }

    #[tokio::test]
    async fn test_memory_directories() {
        let fs = MemoryFileSystem::new();
        fs.mkdir("/docs", &FileAttributes::new()).await.unwrap();
        fs.insert_file("/docs/a.txt", b"a".to_vec());
        fs.insert_file("/docs/sub/b.txt", b"b".to_vec());

        let mut names: Vec<String> = fs
            .read_dir("/docs")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.filename)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "sub"]);

        assert!(fs.rmdir("/docs").await.is_err());
        fs.rename("/docs", "/papers").await.unwrap();
        assert_eq!(fs.file_contents("/papers/sub/b.txt").unwrap(), b"b");
        assert!(fs.stat("/docs").await.is_err());
        assert_eq!(
            fs.stat("/papers/sub").await.unwrap().file_type(),
            FileType::Directory
        );
        assert!(matches!(
            fs.symlink("/l", "/papers").await,
            Err(SftpError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_combine_parts() {
        let fs = MemoryFileSystem::new();
        let registry = MultipartRegistry::new(0, system_clock());
        let id = registry
            .create(
                "/out.bin",
                vec![PartSpec::new("A", 0, 3), PartSpec::new("B", 3, 2)],
            )
            .unwrap();
        fs.open_part(&id, "B").await.unwrap().write(0, b"de").await.unwrap();
        fs.open_part(&id, "A").await.unwrap().write(0, b"abc").await.unwrap();
        assert_eq!(fs.part_count(), 2);

        let transfer = registry.get(&id).unwrap();
        fs.combine_parts(&transfer).await.unwrap();
        assert_eq!(fs.file_contents("/out.bin").unwrap(), b"abcde");
        assert_eq!(fs.part_count(), 0);
    }

    #[tokio::test]
    async fn test_local_file_system() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new(dir.path()).unwrap();

        fs.mkdir("/sub", &FileAttributes::new()).await.unwrap();
        let file = fs
            .open("/sub/x.txt", OpenFlags::create_truncate(), &FileAttributes::new())
            .await
            .unwrap();
        file.write(0, b"local bytes").await.unwrap();
        file.close().await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("sub/x.txt")).unwrap(),
            b"local bytes"
        );
        assert_eq!(fs.stat("/sub/x.txt").await.unwrap().size, Some(11));
        assert!(fs.stat("/sub/../../../etc/passwd").await.is_err());

        let entries = fs.read_dir("/sub").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "x.txt");

        fs.rename("/sub/x.txt", "/y.txt").await.unwrap();
        fs.remove("/y.txt").await.unwrap();
        fs.rmdir("/sub").await.unwrap();
        assert!(fs.read_dir("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_combine_parts() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new(dir.path()).unwrap();
        let registry = MultipartRegistry::new(0, system_clock());
        let id = registry
            .create(
                "/joined",
                vec![PartSpec::new("one", 0, 4), PartSpec::new("two", 4, 4)],
            )
            .unwrap();
        fs.open_part(&id, "two").await.unwrap().write(0, b"5678").await.unwrap();
        fs.open_part(&id, "one").await.unwrap().write(0, b"1234").await.unwrap();

        // Part storage stays out of listings.
        assert!(fs.read_dir("/").await.unwrap().is_empty());
        assert!(fs.stat(&format!("/{}", PARTS_DIR)).await.is_err());

        fs.combine_parts(&registry.get(&id).unwrap()).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("joined")).unwrap(), b"12345678");
        assert!(!fs.transfer_dir(&id).exists());
    }

    #[tokio::test]
    async fn test_local_write_visible_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new(dir.path()).unwrap();
        let file = fs
            .open("/open.txt", OpenFlags::create_truncate(), &FileAttributes::new())
            .await
            .unwrap();
        file.write(0, b"not closed").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("open.txt")).unwrap(), b"not closed");

        let registry = MultipartRegistry::new(0, system_clock());
        let id = registry
            .create("/early", vec![PartSpec::new("only", 0, 6)])
            .unwrap();
        let part = fs.open_part(&id, "only").await.unwrap();
        part.write(0, b"abcdef").await.unwrap();

        // Combined while the part handle is still held.
        fs.combine_parts(&registry.get(&id).unwrap()).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("early")).unwrap(), b"abcdef");
        drop(part);
        drop(file);
    }
}
