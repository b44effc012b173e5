//! SFTP server.
//!
//! Each session channel gets its own [`SftpContext`] (handle table) and a
//! handler that frames inbound requests and runs them as tasks, at most
//! [`SftpConfig::max_concurrent_requests`] at a time. Requests naming the
//! same handle run in arrival order; everything else may complete out of
//! order. Multipart transfers are shared by all sessions of one
//! [`SftpServer`].

use super::extensions::{default_extensions, SftpExtension};
use super::filesystem::{normalize_path, FileSystem, OpenFile};
use super::message::{Framer, Request, Response, SFTP_VERSION};
use super::multipart::MultipartRegistry;
use super::types::{FileAttributes, NameEntry, SftpError, SftpResult};
use super::{SftpConfig, SFTP_SUBSYSTEM};
use crate::ssh::connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
use crate::ssh::logging;
use crate::ssh::session::{
    ChannelHandle, ChannelHandler, ChannelOpener, ConnectionHandle, OpenRejection,
};
use async_trait::async_trait;
use kestrel_platform::{system_clock, Clock, KestrelError, KestrelResult};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

/// What a handle refers to.
pub(crate) enum HandleEntry {
    File {
        path: String,
        file: Arc<dyn OpenFile>,
    },
    Dir {
        path: String,
        pending: Mutex<VecDeque<NameEntry>>,
    },
    Part {
        transfer: String,
        part: String,
        length: u64,
        file: Arc<dyn OpenFile>,
    },
}

/// Per-session server state handed to extensions.
pub struct SftpContext {
    fs: Arc<dyn FileSystem>,
    multipart: Arc<MultipartRegistry>,
    config: SftpConfig,
    handles: Mutex<HashMap<Vec<u8>, Arc<HandleEntry>>>,
    next_handle: AtomicU64,
}

impl SftpContext {
    fn new(fs: Arc<dyn FileSystem>, multipart: Arc<MultipartRegistry>, config: SftpConfig) -> Self {
        Self {
            fs,
            multipart,
            config,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Backing file system.
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Multipart transfers of the server.
    pub fn multipart(&self) -> &MultipartRegistry {
        &self.multipart
    }

    /// Server limits.
    pub fn config(&self) -> &SftpConfig {
        &self.config
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// File behind a file or part handle.
    pub fn file(&self, handle: &[u8]) -> SftpResult<Arc<dyn OpenFile>> {
        match &*self.entry(handle)? {
            HandleEntry::File { file, .. } | HandleEntry::Part { file, .. } => Ok(file.clone()),
            HandleEntry::Dir { .. } => Err(SftpError::InvalidHandle),
        }
    }

    pub(crate) fn entry(&self, handle: &[u8]) -> SftpResult<Arc<HandleEntry>> {
        self.handles
            .lock()
            .get(handle)
            .cloned()
            .ok_or(SftpError::InvalidHandle)
    }

    pub(crate) fn insert(&self, entry: HandleEntry) -> SftpResult<Vec<u8>> {
        let mut handles = self.handles.lock();
        if handles.len() >= self.config.max_handles {
            return Err(SftpError::Failure(format!(
                "too many open handles (limit {})",
                self.config.max_handles
            )));
        }
        let mut handle = Vec::with_capacity(12);
        handle.extend_from_slice(&self.next_handle.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        let mut salt = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut salt);
        handle.extend_from_slice(&salt);
        handles.insert(handle.clone(), Arc::new(entry));
        Ok(handle)
    }

    fn remove(&self, handle: &[u8]) -> SftpResult<Arc<HandleEntry>> {
        self.handles
            .lock()
            .remove(handle)
            .ok_or(SftpError::InvalidHandle)
    }

    async fn close_all(&self) {
        let entries: Vec<Arc<HandleEntry>> =
            self.handles.lock().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            if let HandleEntry::File { file, .. } | HandleEntry::Part { file, .. } = &*entry {
                if let Err(err) = file.close().await {
                    debug!(error = %err, "Closing handle on session end failed");
                }
            }
        }
    }
}

/// Serves one [`FileSystem`] to any number of SFTP sessions.
#[derive(Clone)]
pub struct SftpServer {
    fs: Arc<dyn FileSystem>,
    multipart: Arc<MultipartRegistry>,
    config: SftpConfig,
    extensions: Arc<Vec<Arc<dyn SftpExtension>>>,
}

impl SftpServer {
    /// Creates a server with the built-in extensions.
    pub fn new(fs: Arc<dyn FileSystem>, config: SftpConfig) -> Self {
        Self::with_clock(fs, config, system_clock())
    }

    /// Like [`new`](Self::new) with the clock used to age multipart transfers.
    pub fn with_clock(fs: Arc<dyn FileSystem>, config: SftpConfig, clock: Arc<dyn Clock>) -> Self {
        let multipart = Arc::new(MultipartRegistry::new(config.min_part_size, clock));
        Self {
            fs,
            multipart,
            config,
            extensions: Arc::new(default_extensions()),
        }
    }

    /// Adds or replaces an extension.
    pub fn with_extension(mut self, extension: Arc<dyn SftpExtension>) -> Self {
        let mut extensions: Vec<_> = self
            .extensions
            .iter()
            .filter(|e| e.name() != extension.name())
            .cloned()
            .collect();
        extensions.push(extension);
        self.extensions = Arc::new(extensions);
        self
    }

    /// Limits in effect.
    pub fn config(&self) -> &SftpConfig {
        &self.config
    }

    /// Multipart transfers shared by all sessions.
    pub fn multipart(&self) -> &Arc<MultipartRegistry> {
        &self.multipart
    }

    /// Names advertised in VERSION.
    pub fn extension_names(&self) -> Vec<String> {
        self.extensions.iter().map(|e| e.name().to_string()).collect()
    }

    /// Drops transfers at least `max_age` old together with their part
    /// data. Returns how many were reclaimed.
    pub async fn reclaim_stale_transfers(&self, max_age: Duration) -> usize {
        let stale = self.multipart.reclaim_older_than(max_age);
        for transfer in &stale {
            if let Err(err) = self.fs.discard_parts(transfer).await {
                warn!(transfer = transfer.id(), error = %err, "Discarding stale parts failed");
            }
        }
        stale.len()
    }

    /// Handler for one session channel.
    pub fn handler(&self) -> Arc<dyn ChannelHandler> {
        Arc::new(SftpSession {
            ctx: Arc::new(SftpContext::new(
                self.fs.clone(),
                self.multipart.clone(),
                self.config.clone(),
            )),
            extensions: self.extensions.clone(),
            limit: Arc::new(Semaphore::new(self.config.max_concurrent_requests)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            state: Mutex::new(SessionState {
                subsystem: false,
                initialized: false,
                framer: Framer::new(self.config.max_packet_len),
                lanes: HashMap::new(),
            }),
        })
    }

    /// Channel opener accepting `session` channels for SFTP.
    pub fn opener(&self) -> Arc<dyn ChannelOpener> {
        let server = self.clone();
        Arc::new(
            move |channel_type: &ChannelType,
                  _connection: &ConnectionHandle|
                  -> Result<Arc<dyn ChannelHandler>, OpenRejection> {
                match channel_type {
                    ChannelType::Session => Ok(server.handler()),
                    other => Err(OpenRejection::new(
                        ChannelOpenFailureReason::UnknownChannelType,
                        format!("{} channels are not served", other.name()),
                    )),
                }
            },
        )
    }
}

impl std::fmt::Debug for SftpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpServer")
            .field("config", &self.config)
            .field("extensions", &self.extension_names())
            .field("transfers", &self.multipart.len())
            .finish()
    }
}

struct SessionState {
    subsystem: bool,
    initialized: bool,
    framer: Framer,
    /// Completion of the last request queued per handle.
    lanes: HashMap<Vec<u8>, oneshot::Receiver<()>>,
}

struct SftpSession {
    ctx: Arc<SftpContext>,
    extensions: Arc<Vec<Arc<dyn SftpExtension>>>,
    limit: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<u32>>>,
    state: Mutex<SessionState>,
}

enum Admission {
    Reply(Response),
    Run {
        id: u32,
        request: Request,
        after: Option<oneshot::Receiver<()>>,
        done: Option<oneshot::Sender<()>>,
    },
}

impl SftpSession {
    fn admit(&self, body: &[u8]) -> KestrelResult<Option<Admission>> {
        let request = match Request::parse(body) {
            Ok(request) => request,
            Err(err) => {
                // Answer with BAD_MESSAGE when the id is readable.
                if body.len() >= 5 && body[0] != 1 {
                    let id = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
                    warn!(request_id = id, error = %err, "Malformed SFTP request");
                    return Ok(Some(Admission::Reply(Response::error(
                        id,
                        &SftpError::BadMessage(err.to_string()),
                    ))));
                }
                return Err(err);
            }
        };

        let mut state = self.state.lock();
        let Some(id) = request.id() else {
            if let Request::Init { version, .. } = request {
                debug!(client_version = version, "SFTP INIT");
                state.initialized = true;
                return Ok(Some(Admission::Reply(Response::Version {
                    version: SFTP_VERSION,
                    extensions: self
                        .extensions
                        .iter()
                        .map(|e| (e.name().to_string(), e.version_data()))
                        .collect(),
                })));
            }
            return Ok(None);
        };
        if !state.initialized {
            return Ok(Some(Admission::Reply(Response::error(
                id,
                &SftpError::Failure("SFTP session not initialised".to_string()),
            ))));
        }
        if !self.in_flight.lock().insert(id) {
            return Ok(Some(Admission::Reply(Response::error(
                id,
                &SftpError::Failure("request id in use".to_string()),
            ))));
        }

        let (after, done) = match request.handle() {
            Some(handle) => {
                if state.lanes.len() >= self.ctx.config.max_handles * 2 {
                    state.lanes.retain(|_, rx| {
                        !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed))
                    });
                }
                let (tx, rx) = oneshot::channel();
                (state.lanes.insert(handle.to_vec(), rx), Some(tx))
            }
            None => (None, None),
        };
        Ok(Some(Admission::Run {
            id,
            request,
            after,
            done,
        }))
    }

    fn spawn(
        &self,
        channel: &ChannelHandle,
        id: u32,
        request: Request,
        after: Option<oneshot::Receiver<()>>,
        done: Option<oneshot::Sender<()>>,
    ) {
        let ctx = self.ctx.clone();
        let extensions = self.extensions.clone();
        let limit = self.limit.clone();
        let in_flight = self.in_flight.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Some(after) = after {
                let _ = after.await;
            }
            let response = match limit.acquire_owned().await {
                Ok(_permit) => dispatch(&ctx, &extensions, request).await,
                Err(_) => Response::error(id, &SftpError::Failure("server shutting down".into())),
            };
            drop(done);
            in_flight.lock().remove(&id);
            if let Response::Status {
                id, code, message, ..
            } = &response
            {
                logging::log_sftp_status(*id, *code, message);
            }
            if let Err(err) = channel.send(&response.to_bytes()).await {
                debug!(request_id = id, error = %err, "SFTP reply not delivered");
            }
        });
    }
}

#[async_trait]
impl ChannelHandler for SftpSession {
    async fn on_request(&self, channel: &ChannelHandle, request: &ChannelRequestType) -> bool {
        match request {
            ChannelRequestType::Subsystem { name } if name == SFTP_SUBSYSTEM => {
                let mut state = self.state.lock();
                if state.subsystem {
                    return false;
                }
                state.subsystem = true;
                info!(local_id = channel.id(), "SFTP subsystem started");
                true
            }
            _ => false,
        }
    }

    async fn on_data(&self, channel: &ChannelHandle, data: Vec<u8>) -> KestrelResult<()> {
        {
            let mut state = self.state.lock();
            if !state.subsystem {
                return Err(KestrelError::Protocol(
                    "data before the sftp subsystem was started".to_string(),
                ));
            }
            state.framer.push(&data);
        }
        loop {
            let packet = self.state.lock().framer.next_packet()?;
            let Some(body) = packet else {
                return Ok(());
            };
            match self.admit(&body)? {
                Some(Admission::Reply(response)) => channel.send(&response.to_bytes()).await?,
                Some(Admission::Run {
                    id,
                    request,
                    after,
                    done,
                }) => self.spawn(channel, id, request, after, done),
                None => {}
            }
        }
    }

    async fn on_close(&self, channel: &ChannelHandle) {
        debug!(
            local_id = channel.id(),
            handles = self.ctx.open_handles(),
            "SFTP session closed"
        );
        self.ctx.close_all().await;
    }
}

/// Executes one request and builds its reply.
pub(crate) async fn dispatch(
    ctx: &SftpContext,
    extensions: &[Arc<dyn SftpExtension>],
    request: Request,
) -> Response {
    let id = request.id().unwrap_or(0);
    match execute(ctx, extensions, request).await {
        Ok(response) => response,
        Err(err) => Response::error(id, &err),
    }
}

async fn execute(
    ctx: &SftpContext,
    extensions: &[Arc<dyn SftpExtension>],
    request: Request,
) -> SftpResult<Response> {
    let fs = ctx.fs();
    Ok(match request {
        Request::Init { .. } => {
            return Err(SftpError::BadMessage("unexpected INIT".to_string()));
        }
        Request::Open {
            id,
            path,
            flags,
            attrs,
        } => {
            let path = normalize_path(&path);
            let file: Arc<dyn OpenFile> = Arc::from(fs.open(&path, flags, &attrs).await?);
            match ctx.insert(HandleEntry::File {
                path,
                file: file.clone(),
            }) {
                Ok(handle) => Response::Handle { id, handle },
                Err(err) => {
                    let _ = file.close().await;
                    return Err(err);
                }
            }
        }
        Request::Close { id, handle } => {
            match &*ctx.remove(&handle)? {
                HandleEntry::File { file, .. } | HandleEntry::Part { file, .. } => {
                    file.close().await?
                }
                HandleEntry::Dir { .. } => {}
            }
            Response::ok(id)
        }
        Request::Read {
            id,
            handle,
            offset,
            len,
        } => {
            let file = match &*ctx.entry(&handle)? {
                HandleEntry::File { file, .. } => file.clone(),
                _ => return Err(SftpError::InvalidHandle),
            };
            let len = len.min(ctx.config().max_read_len) as usize;
            let data = file.read(offset, len).await?;
            if data.is_empty() && len > 0 {
                return Err(SftpError::Eof);
            }
            Response::Data { id, data }
        }
        Request::Write {
            id,
            handle,
            offset,
            data,
        } => {
            match &*ctx.entry(&handle)? {
                HandleEntry::File { file, .. } => file.write(offset, &data).await?,
                HandleEntry::Part {
                    transfer,
                    part,
                    length,
                    file,
                } => {
                    let fits = offset
                        .checked_add(data.len() as u64)
                        .map_or(false, |end| end <= *length);
                    if !fits {
                        return Err(SftpError::Failure(format!(
                            "write of {} bytes at {} exceeds part {} length {}",
                            data.len(),
                            offset,
                            part,
                            length
                        )));
                    }
                    file.write(offset, &data).await?;
                    ctx.multipart()
                        .record_write(transfer, part, offset, data.len() as u64)?;
                }
                HandleEntry::Dir { .. } => return Err(SftpError::InvalidHandle),
            }
            Response::ok(id)
        }
        Request::Lstat { id, path } => Response::Attrs {
            id,
            attrs: fs.lstat(&normalize_path(&path)).await?,
        },
        Request::Stat { id, path } => Response::Attrs {
            id,
            attrs: fs.stat(&normalize_path(&path)).await?,
        },
        Request::Fstat { id, handle } => {
            let attrs = match &*ctx.entry(&handle)? {
                HandleEntry::File { file, .. } | HandleEntry::Part { file, .. } => {
                    file.stat().await?
                }
                HandleEntry::Dir { path, .. } => fs.stat(path).await?,
            };
            Response::Attrs { id, attrs }
        }
        Request::Setstat { id, path, attrs } => {
            fs.setstat(&normalize_path(&path), &attrs).await?;
            Response::ok(id)
        }
        Request::Fsetstat { id, handle, attrs } => {
            match &*ctx.entry(&handle)? {
                HandleEntry::File { file, .. } => file.setstat(&attrs).await?,
                HandleEntry::Dir { path, .. } => fs.setstat(path, &attrs).await?,
                HandleEntry::Part { .. } => {
                    return Err(SftpError::Unsupported("setstat on a part".to_string()))
                }
            }
            Response::ok(id)
        }
        Request::Opendir { id, path } => {
            let path = normalize_path(&path);
            let listing = fs.read_dir(&path).await?;
            let handle = ctx.insert(HandleEntry::Dir {
                path,
                pending: Mutex::new(listing.into()),
            })?;
            Response::Handle { id, handle }
        }
        Request::Readdir { id, handle } => {
            let entries: Vec<NameEntry> = match &*ctx.entry(&handle)? {
                HandleEntry::Dir { pending, .. } => {
                    let mut pending = pending.lock();
                    let take = pending.len().min(ctx.config().readdir_batch);
                    pending.drain(..take).collect()
                }
                _ => return Err(SftpError::InvalidHandle),
            };
            if entries.is_empty() {
                return Err(SftpError::Eof);
            }
            Response::Name { id, entries }
        }
        Request::Remove { id, path } => {
            fs.remove(&normalize_path(&path)).await?;
            Response::ok(id)
        }
        Request::Mkdir { id, path, attrs } => {
            fs.mkdir(&normalize_path(&path), &attrs).await?;
            Response::ok(id)
        }
        Request::Rmdir { id, path } => {
            fs.rmdir(&normalize_path(&path)).await?;
            Response::ok(id)
        }
        Request::Realpath { id, path } => {
            let path = fs.realpath(&normalize_path(&path)).await?;
            let attrs = fs.stat(&path).await.unwrap_or_default();
            Response::Name {
                id,
                entries: vec![NameEntry {
                    longname: path.clone(),
                    filename: path,
                    attrs,
                }],
            }
        }
        Request::Rename {
            id,
            old_path,
            new_path,
        } => {
            fs.rename(&normalize_path(&old_path), &normalize_path(&new_path))
                .await?;
            Response::ok(id)
        }
        Request::Readlink { id, path } => {
            let target = fs.readlink(&normalize_path(&path)).await?;
            Response::Name {
                id,
                entries: vec![NameEntry {
                    longname: target.clone(),
                    filename: target,
                    attrs: FileAttributes::new(),
                }],
            }
        }
        Request::Symlink {
            id,
            link_path,
            target_path,
        } => {
            fs.symlink(&normalize_path(&link_path), &normalize_path(&target_path))
                .await?;
            Response::ok(id)
        }
        Request::Extended { id, name, data } => {
            let extension = extensions
                .iter()
                .find(|e| e.name() == name)
                .ok_or_else(|| SftpError::Unsupported(format!("extension {}", name)))?;
            extension.handle(ctx, id, &data).await?
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::sftp::filesystem::MemoryFileSystem;
    use crate::ssh::sftp::types::OpenFlags;

    fn context() -> (SftpContext, MemoryFileSystem) {
        let fs = MemoryFileSystem::new();
        let ctx = SftpContext::new(
            Arc::new(fs.clone()),
            Arc::new(MultipartRegistry::new(0, system_clock())),
            SftpConfig::default().with_max_handles(4),
        );
        (ctx, fs)
    }

    async fn run(ctx: &SftpContext, request: Request) -> Response {
        dispatch(ctx, &default_extensions(), request).await
    }

    fn expect_handle(response: Response) -> Vec<u8> {
        match response {
            Response::Handle { handle, .. } => handle,
            other => panic!("expected handle, got {:?}", other),
        }
    }

    fn status_code(response: &Response) -> u32 {
        match response {
            Response::Status { code, .. } => *code,
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (ctx, fs) = context();
        let handle = expect_handle(
            run(
                &ctx,
                Request::Open {
                    id: 1,
                    path: "notes.txt".to_string(),
                    flags: OpenFlags::create_truncate() | OpenFlags::READ,
                    attrs: FileAttributes::new(),
                },
            )
            .await,
        );
        assert_eq!(handle.len(), 12);
        let written = run(
            &ctx,
            Request::Write {
                id: 2,
                handle: handle.clone(),
                offset: 0,
                data: b"abcdef".to_vec(),
            },
        )
        .await;
        assert_eq!(status_code(&written), 0);
        assert_eq!(fs.file_contents("/notes.txt").unwrap(), b"abcdef");

        let read = run(
            &ctx,
            Request::Read {
                id: 3,
                handle: handle.clone(),
                offset: 4,
                len: 100,
            },
        )
        .await;
        assert_eq!(
            read,
            Response::Data {
                id: 3,
                data: b"ef".to_vec()
            }
        );
        let eof = run(
            &ctx,
            Request::Read {
                id: 4,
                handle,
                offset: 6,
                len: 100,
            },
        )
        .await;
        assert_eq!(status_code(&eof), 1);
    }

    #[tokio::test]
    async fn test_closed_handle_is_invalid() {
        let (ctx, fs) = context();
        fs.insert_file("/f", b"data".to_vec());
        let handle = expect_handle(
            run(
                &ctx,
                Request::Open {
                    id: 1,
                    path: "/f".to_string(),
                    flags: OpenFlags::READ,
                    attrs: FileAttributes::new(),
                },
            )
            .await,
        );
        let closed = run(
            &ctx,
            Request::Close {
                id: 2,
                handle: handle.clone(),
            },
        )
        .await;
        assert_eq!(status_code(&closed), 0);

        let read = run(
            &ctx,
            Request::Read {
                id: 3,
                handle,
                offset: 0,
                len: 4,
            },
        )
        .await;
        match read {
            Response::Status { code, message, .. } => {
                assert_eq!(code, 4);
                assert_eq!(message, "invalid handle");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_limit() {
        let (ctx, fs) = context();
        fs.insert_file("/f", b"x".to_vec());
        for id in 0..4 {
            expect_handle(
                run(
                    &ctx,
                    Request::Opendir {
                        id,
                        path: "/".to_string(),
                    },
                )
                .await,
            );
        }
        let over = run(
            &ctx,
            Request::Open {
                id: 9,
                path: "/f".to_string(),
                flags: OpenFlags::READ,
                attrs: FileAttributes::new(),
            },
        )
        .await;
        assert_eq!(status_code(&over), 4);
        assert_eq!(ctx.open_handles(), 4);
    }

    #[tokio::test]
    async fn test_readdir_batches_then_eof() {
        let (ctx, fs) = context();
        fs.insert_file("/d/a", b"".to_vec());
        fs.insert_file("/d/b", b"".to_vec());
        let handle = expect_handle(
            run(
                &ctx,
                Request::Opendir {
                    id: 1,
                    path: "/d".to_string(),
                },
            )
            .await,
        );
        match run(
            &ctx,
            Request::Readdir {
                id: 2,
                handle: handle.clone(),
            },
        )
        .await
        {
            Response::Name { entries, .. } => assert_eq!(entries.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        let eof = run(&ctx, Request::Readdir { id: 3, handle }).await;
        assert_eq!(status_code(&eof), 1);
    }

    #[tokio::test]
    async fn test_realpath_and_unknown_extension() {
        let (ctx, _) = context();
        match run(
            &ctx,
            Request::Realpath {
                id: 1,
                path: "/a/../.".to_string(),
            },
        )
        .await
        {
            Response::Name { entries, .. } => assert_eq!(entries[0].filename, "/"),
            other => panic!("unexpected {:?}", other),
        }
        let unknown = run(
            &ctx,
            Request::Extended {
                id: 2,
                name: "nope@example.com".to_string(),
                data: vec![],
            },
        )
        .await;
        assert_eq!(status_code(&unknown), 8);
    }

    #[tokio::test]
    async fn test_symlink_unsupported_on_memory() {
        let (ctx, _) = context();
        let response = run(
            &ctx,
            Request::Symlink {
                id: 1,
                link_path: "/l".to_string(),
                target_path: "/t".to_string(),
            },
        )
        .await;
        assert_eq!(status_code(&response), 8);
    }
}
