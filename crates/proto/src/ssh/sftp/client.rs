//! SFTP client.
//!
//! Requests are pipelined: every call allocates a fresh request id, parks a
//! oneshot in the pending map and sends its packet; a reader task routes
//! each reply to the matching waiter, whatever order they arrive in. When
//! the channel goes away every waiter fails with `CONNECTION_LOST`.

use super::extensions::{
    encode_check_file, encode_create_multipart, encode_md5_hash, encode_transfer, HashAlgorithm,
    CANCEL_MULTIPART_FILE, CHECK_FILE_HANDLE, CHECK_FILE_NAME, COMBINE_MULTIPART_FILE,
    CREATE_MULTIPART_FILE, MD5_HASH, MD5_HASH_HANDLE, OPEN_PART_FILE,
};
use super::message::{Framer, Request, Response, DEFAULT_MAX_PACKET_LEN, SFTP_VERSION};
use super::multipart::PartSpec;
use super::types::{
    FileAttributes, NameEntry, OpenFlags, SftpError, SftpResult, StatusCode,
};
use super::SFTP_SUBSYSTEM;
use crate::ssh::session::{ChannelEvent, ChannelEvents, ChannelHandle, ConnectionHandle};
use crate::ssh::wire::Reader;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bytes per READ/WRITE issued by the whole-file helpers.
pub const TRANSFER_CHUNK: u32 = 32 * 1024;

type Pending = Arc<Mutex<Option<HashMap<u32, oneshot::Sender<Response>>>>>;

/// Handle to a remote file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHandle(Vec<u8>);

impl RemoteHandle {
    /// Raw handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// SFTP session over one channel.
#[derive(Debug)]
pub struct SftpClient {
    channel: ChannelHandle,
    pending: Pending,
    next_id: AtomicU32,
    version: u32,
    extensions: Vec<(String, Vec<u8>)>,
    reader: JoinHandle<()>,
}

impl SftpClient {
    /// Opens a session channel, starts the `sftp` subsystem and performs
    /// the INIT/VERSION exchange.
    pub async fn open(connection: &ConnectionHandle) -> SftpResult<Self> {
        let (channel, mut events) = connection.open_session().await?;
        if !channel.request_subsystem(SFTP_SUBSYSTEM).await? {
            let _ = channel.close().await;
            return Err(SftpError::Unsupported(
                "server refused the sftp subsystem".to_string(),
            ));
        }

        let init = Request::Init {
            version: SFTP_VERSION,
            extensions: Vec::new(),
        };
        channel.send(&init.to_bytes()).await?;

        let mut framer = Framer::new(DEFAULT_MAX_PACKET_LEN);
        let (version, extensions) = loop {
            if let Some(body) = framer.next_packet()? {
                match Response::parse(&body)? {
                    Response::Version {
                        version,
                        extensions,
                    } => break (version, extensions),
                    other => {
                        return Err(SftpError::BadMessage(format!(
                            "expected VERSION, got {:?}",
                            other
                        )))
                    }
                }
            }
            match events.recv().await {
                Some(ChannelEvent::Data(data)) => framer.push(&data),
                Some(ChannelEvent::Eof) | Some(ChannelEvent::Closed) | None => {
                    return Err(connection_lost())
                }
                Some(_) => {}
            }
        };
        info!(
            version,
            extensions = extensions.len(),
            local_id = channel.id(),
            "SFTP session established"
        );

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(read_replies(events, framer, pending.clone()));
        Ok(Self {
            channel,
            pending,
            next_id: AtomicU32::new(1),
            version,
            extensions,
            reader,
        })
    }

    /// Version the server answered with.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Extensions the server advertised.
    pub fn extensions(&self) -> &[(String, Vec<u8>)] {
        &self.extensions
    }

    /// Whether the server advertised `name`.
    pub fn supports(&self, name: &str) -> bool {
        self.extensions.iter().any(|(n, _)| n == name)
    }

    /// Sends the request built for a fresh id and waits for its reply.
    pub async fn request(&self, build: impl FnOnce(u32) -> Request) -> SftpResult<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            let map = pending.as_mut().ok_or_else(connection_lost)?;
            map.insert(id, tx);
        }
        let request = build(id);
        if let Err(err) = self.channel.send(&request.to_bytes()).await {
            if let Some(map) = self.pending.lock().as_mut() {
                map.remove(&id);
            }
            return Err(err.into());
        }
        rx.await.map_err(|_| connection_lost())
    }

    /// Opens a file.
    pub async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: FileAttributes,
    ) -> SftpResult<RemoteHandle> {
        let response = self
            .request(|id| Request::Open {
                id,
                path: path.to_string(),
                flags,
                attrs,
            })
            .await?;
        expect_handle(response)
    }

    /// Closes a handle.
    pub async fn close(&self, handle: &RemoteHandle) -> SftpResult<()> {
        let handle = handle.0.clone();
        expect_ok(self.request(|id| Request::Close { id, handle }).await?)
    }

    /// Reads up to `len` bytes; `None` at end of file.
    pub async fn read(
        &self,
        handle: &RemoteHandle,
        offset: u64,
        len: u32,
    ) -> SftpResult<Option<Vec<u8>>> {
        let handle = handle.0.clone();
        match self
            .request(|id| Request::Read {
                id,
                handle,
                offset,
                len,
            })
            .await?
        {
            Response::Data { data, .. } => Ok(Some(data)),
            response => match expect_ok(response) {
                Err(SftpError::Eof) => Ok(None),
                Err(err) => Err(err),
                Ok(()) => Err(unexpected("DATA")),
            },
        }
    }

    /// Writes `data` at `offset`.
    pub async fn write(&self, handle: &RemoteHandle, offset: u64, data: &[u8]) -> SftpResult<()> {
        let handle = handle.0.clone();
        let data = data.to_vec();
        expect_ok(
            self.request(|id| Request::Write {
                id,
                handle,
                offset,
                data,
            })
            .await?,
        )
    }

    /// Attributes of a path, following links.
    pub async fn stat(&self, path: &str) -> SftpResult<FileAttributes> {
        let path = path.to_string();
        expect_attrs(self.request(|id| Request::Stat { id, path }).await?)
    }

    /// Attributes of a path itself.
    pub async fn lstat(&self, path: &str) -> SftpResult<FileAttributes> {
        let path = path.to_string();
        expect_attrs(self.request(|id| Request::Lstat { id, path }).await?)
    }

    /// Attributes of an open handle.
    pub async fn fstat(&self, handle: &RemoteHandle) -> SftpResult<FileAttributes> {
        let handle = handle.0.clone();
        expect_attrs(self.request(|id| Request::Fstat { id, handle }).await?)
    }

    /// Applies attributes to a path.
    pub async fn setstat(&self, path: &str, attrs: FileAttributes) -> SftpResult<()> {
        let path = path.to_string();
        expect_ok(self.request(|id| Request::Setstat { id, path, attrs }).await?)
    }

    /// Applies attributes to an open handle.
    pub async fn fsetstat(&self, handle: &RemoteHandle, attrs: FileAttributes) -> SftpResult<()> {
        let handle = handle.0.clone();
        expect_ok(
            self.request(|id| Request::Fsetstat { id, handle, attrs })
                .await?,
        )
    }

    /// Opens a directory for listing.
    pub async fn opendir(&self, path: &str) -> SftpResult<RemoteHandle> {
        let path = path.to_string();
        expect_handle(self.request(|id| Request::Opendir { id, path }).await?)
    }

    /// Next batch of entries; `None` once the listing is exhausted.
    pub async fn readdir(&self, handle: &RemoteHandle) -> SftpResult<Option<Vec<NameEntry>>> {
        let handle = handle.0.clone();
        match self.request(|id| Request::Readdir { id, handle }).await? {
            Response::Name { entries, .. } => Ok(Some(entries)),
            response => match expect_ok(response) {
                Err(SftpError::Eof) => Ok(None),
                Err(err) => Err(err),
                Ok(()) => Err(unexpected("NAME")),
            },
        }
    }

    /// Lists a whole directory.
    pub async fn read_dir(&self, path: &str) -> SftpResult<Vec<NameEntry>> {
        let handle = self.opendir(path).await?;
        let mut entries = Vec::new();
        let listed = loop {
            match self.readdir(&handle).await {
                Ok(Some(batch)) => entries.extend(batch),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.close(&handle).await?;
        listed.map(|_| entries)
    }

    /// Removes a file.
    pub async fn remove(&self, path: &str) -> SftpResult<()> {
        let path = path.to_string();
        expect_ok(self.request(|id| Request::Remove { id, path }).await?)
    }

    /// Creates a directory.
    pub async fn mkdir(&self, path: &str, attrs: FileAttributes) -> SftpResult<()> {
        let path = path.to_string();
        expect_ok(self.request(|id| Request::Mkdir { id, path, attrs }).await?)
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, path: &str) -> SftpResult<()> {
        let path = path.to_string();
        expect_ok(self.request(|id| Request::Rmdir { id, path }).await?)
    }

    /// Canonical absolute form of a path.
    pub async fn realpath(&self, path: &str) -> SftpResult<String> {
        let path = path.to_string();
        expect_single_name(self.request(|id| Request::Realpath { id, path }).await?)
    }

    /// Renames a file or directory.
    pub async fn rename(&self, from: &str, to: &str) -> SftpResult<()> {
        let (old_path, new_path) = (from.to_string(), to.to_string());
        expect_ok(
            self.request(|id| Request::Rename {
                id,
                old_path,
                new_path,
            })
            .await?,
        )
    }

    /// Target of a symbolic link.
    pub async fn readlink(&self, path: &str) -> SftpResult<String> {
        let path = path.to_string();
        expect_single_name(self.request(|id| Request::Readlink { id, path }).await?)
    }

    /// Creates a symbolic link at `link` pointing to `target`.
    pub async fn symlink(&self, link: &str, target: &str) -> SftpResult<()> {
        let (link_path, target_path) = (link.to_string(), target.to_string());
        expect_ok(
            self.request(|id| Request::Symlink {
                id,
                link_path,
                target_path,
            })
            .await?,
        )
    }

    /// Sends an SSH_FXP_EXTENDED request and returns the raw reply.
    pub async fn extended(&self, name: &str, data: Vec<u8>) -> SftpResult<Response> {
        let name = name.to_string();
        self.request(|id| Request::Extended { id, name, data }).await
    }

    /// Hashes a range of a remote file by name.
    pub async fn check_file_name(
        &self,
        path: &str,
        algorithms: &str,
        start: u64,
        length: u64,
        block_size: u32,
    ) -> SftpResult<(HashAlgorithm, Vec<u8>)> {
        let data = encode_check_file(path.as_bytes(), algorithms, start, length, block_size);
        parse_check_file(self.extended(CHECK_FILE_NAME, data).await?)
    }

    /// Hashes a range of an open remote file.
    pub async fn check_file_handle(
        &self,
        handle: &RemoteHandle,
        algorithms: &str,
        start: u64,
        length: u64,
        block_size: u32,
    ) -> SftpResult<(HashAlgorithm, Vec<u8>)> {
        let data = encode_check_file(&handle.0, algorithms, start, length, block_size);
        parse_check_file(self.extended(CHECK_FILE_HANDLE, data).await?)
    }

    /// MD5 of a range of a remote file by name. Empty when `quick_check` is
    /// non-empty and does not match the start of the range.
    pub async fn md5_hash_name(
        &self,
        path: &str,
        start: u64,
        length: u64,
        quick_check: &[u8],
    ) -> SftpResult<Vec<u8>> {
        let data = encode_md5_hash(path.as_bytes(), start, length, quick_check);
        parse_md5_hash(self.extended(MD5_HASH, data).await?)
    }

    /// MD5 of a range of an open remote file.
    pub async fn md5_hash_handle(
        &self,
        handle: &RemoteHandle,
        start: u64,
        length: u64,
        quick_check: &[u8],
    ) -> SftpResult<Vec<u8>> {
        let data = encode_md5_hash(&handle.0, start, length, quick_check);
        parse_md5_hash(self.extended(MD5_HASH_HANDLE, data).await?)
    }

    /// Declares a multipart upload; returns the transfer id and the
    /// server's minimum part size.
    pub async fn create_multipart(
        &self,
        path: &str,
        parts: &[PartSpec],
    ) -> SftpResult<(String, u32)> {
        let data = encode_create_multipart(path, parts);
        match self.extended(CREATE_MULTIPART_FILE, data).await? {
            Response::ExtendedReply { data, .. } => {
                let mut r = Reader::new(&data);
                let uuid = r.read_utf8()?;
                let min_part = r.read_u32()?;
                Ok((uuid, min_part))
            }
            response => expect_ok(response).and(Err(unexpected("EXTENDED_REPLY"))),
        }
    }

    /// Opens one part for writing at part-relative offsets.
    pub async fn open_part(&self, uuid: &str, part: &str) -> SftpResult<RemoteHandle> {
        expect_handle(
            self.extended(OPEN_PART_FILE, encode_transfer(uuid, Some(part)))
                .await?,
        )
    }

    /// Writes a whole part: open, write, close.
    pub async fn upload_part(&self, uuid: &str, part: &str, data: &[u8]) -> SftpResult<()> {
        let handle = self.open_part(uuid, part).await?;
        let written = self.write_all(&handle, 0, data).await;
        let closed = self.close(&handle).await;
        written.and(closed)
    }

    /// Assembles a completed transfer into its target.
    pub async fn combine_multipart(&self, uuid: &str) -> SftpResult<()> {
        expect_ok(
            self.extended(COMBINE_MULTIPART_FILE, encode_transfer(uuid, None))
                .await?,
        )
    }

    /// Abandons a transfer.
    pub async fn cancel_multipart(&self, uuid: &str) -> SftpResult<()> {
        expect_ok(
            self.extended(CANCEL_MULTIPART_FILE, encode_transfer(uuid, None))
                .await?,
        )
    }

    async fn write_all(&self, handle: &RemoteHandle, start: u64, data: &[u8]) -> SftpResult<()> {
        let mut offset = start;
        for chunk in data.chunks(TRANSFER_CHUNK as usize) {
            self.write(handle, offset, chunk).await?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    /// Reads a whole remote file.
    pub async fn read_file(&self, path: &str) -> SftpResult<Vec<u8>> {
        let handle = self
            .open_file(path, OpenFlags::READ, FileAttributes::new())
            .await?;
        let mut out = Vec::new();
        let result = loop {
            match self.read(&handle, out.len() as u64, TRANSFER_CHUNK).await {
                Ok(Some(data)) => out.extend_from_slice(&data),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.close(&handle).await?;
        result.map(|_| out)
    }

    /// Creates or replaces a remote file with `data`.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> SftpResult<()> {
        let handle = self
            .open_file(path, OpenFlags::create_truncate(), FileAttributes::new())
            .await?;
        let written = self.write_all(&handle, 0, data).await;
        let closed = self.close(&handle).await;
        written.and(closed)
    }

    /// Copies a local file to `remote`.
    pub async fn upload(&self, local: impl AsRef<Path>, remote: &str) -> SftpResult<u64> {
        let mut file = tokio::fs::File::open(local.as_ref()).await?;
        let handle = self
            .open_file(remote, OpenFlags::create_truncate(), FileAttributes::new())
            .await?;
        let mut buf = vec![0u8; TRANSFER_CHUNK as usize];
        let mut offset = 0u64;
        let copied = loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break Ok(offset),
                Ok(n) => n,
                Err(err) => break Err(err.into()),
            };
            if let Err(err) = self.write(&handle, offset, &buf[..n]).await {
                break Err(err);
            }
            offset += n as u64;
        };
        self.close(&handle).await?;
        debug!(remote, bytes = offset, "Upload finished");
        copied
    }

    /// Copies `remote` to a local file.
    pub async fn download(&self, remote: &str, local: impl AsRef<Path>) -> SftpResult<u64> {
        let handle = self
            .open_file(remote, OpenFlags::READ, FileAttributes::new())
            .await?;
        let copied = async {
            let mut file = tokio::fs::File::create(local.as_ref()).await?;
            let mut offset = 0u64;
            while let Some(data) = self.read(&handle, offset, TRANSFER_CHUNK).await? {
                file.write_all(&data).await?;
                offset += data.len() as u64;
            }
            file.flush().await?;
            Ok::<u64, SftpError>(offset)
        }
        .await;
        self.close(&handle).await?;
        debug!(remote, "Download finished");
        copied
    }

    /// Closes the channel. Pending requests fail.
    pub async fn shutdown(self) -> SftpResult<()> {
        self.channel.close().await?;
        Ok(())
    }
}

impl Drop for SftpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(mut events: ChannelEvents, mut framer: Framer, pending: Pending) {
    'events: while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(data) => {
                framer.push(&data);
                loop {
                    let body = match framer.next_packet() {
                        Ok(Some(body)) => body,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "Unreadable SFTP reply stream");
                            break 'events;
                        }
                    };
                    let response = match Response::parse(&body) {
                        Ok(response) => response,
                        Err(err) => {
                            warn!(error = %err, "Dropping malformed SFTP reply");
                            continue;
                        }
                    };
                    let Some(id) = response.id() else {
                        continue;
                    };
                    let waiter = pending.lock().as_mut().and_then(|map| map.remove(&id));
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!(request_id = id, "SFTP reply for unknown request"),
                    }
                }
            }
            ChannelEvent::Eof | ChannelEvent::Closed => break,
            _ => {}
        }
    }
    // Dropping the senders fails every waiter.
    pending.lock().take();
}

fn connection_lost() -> SftpError {
    SftpError::from_status(StatusCode::ConnectionLost as u32, "connection lost")
}

fn unexpected(wanted: &str) -> SftpError {
    SftpError::BadMessage(format!("expected {} reply", wanted))
}

fn expect_ok(response: Response) -> SftpResult<()> {
    match response {
        Response::Status { code: 0, .. } => Ok(()),
        Response::Status { code, message, .. } => Err(SftpError::from_status(code, message)),
        _ => Err(unexpected("STATUS")),
    }
}

fn expect_handle(response: Response) -> SftpResult<RemoteHandle> {
    match response {
        Response::Handle { handle, .. } => Ok(RemoteHandle(handle)),
        response => expect_ok(response).and(Err(unexpected("HANDLE"))),
    }
}

fn expect_attrs(response: Response) -> SftpResult<FileAttributes> {
    match response {
        Response::Attrs { attrs, .. } => Ok(attrs),
        response => expect_ok(response).and(Err(unexpected("ATTRS"))),
    }
}

fn expect_single_name(response: Response) -> SftpResult<String> {
    match response {
        Response::Name { mut entries, .. } if entries.len() == 1 => Ok(entries.remove(0).filename),
        response => expect_ok(response).and(Err(unexpected("NAME"))),
    }
}

fn parse_check_file(response: Response) -> SftpResult<(HashAlgorithm, Vec<u8>)> {
    match response {
        Response::ExtendedReply { data, .. } => {
            let mut r = Reader::new(&data);
            let name = r.read_utf8()?;
            let algorithm = HashAlgorithm::from_name(&name)
                .ok_or_else(|| SftpError::BadMessage(format!("unknown hash {}", name)))?;
            Ok((algorithm, r.read_rest().to_vec()))
        }
        response => expect_ok(response).and(Err(unexpected("EXTENDED_REPLY"))),
    }
}

fn parse_md5_hash(response: Response) -> SftpResult<Vec<u8>> {
    match response {
        Response::ExtendedReply { data, .. } => {
            let mut r = Reader::new(&data);
            let name = r.read_utf8()?;
            if name != MD5_HASH {
                return Err(SftpError::BadMessage(format!("unexpected reply {}", name)));
            }
            let hash = r.read_string()?.to_vec();
            r.finish()?;
            Ok(hash)
        }
        response => expect_ok(response).and(Err(unexpected("EXTENDED_REPLY"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_ok_maps_status() {
        assert!(expect_ok(Response::ok(1)).is_ok());
        let err = expect_ok(Response::error(1, &SftpError::NotFound("/x".into()))).unwrap_err();
        assert_eq!(err, SftpError::NotFound("/x".into()));
        assert!(matches!(
            expect_ok(Response::Data { id: 1, data: vec![] }),
            Err(SftpError::BadMessage(_))
        ));
    }

    #[test]
    fn test_expect_handle_propagates_status() {
        let err = expect_handle(Response::error(2, &SftpError::InvalidHandle)).unwrap_err();
        assert_eq!(err, SftpError::InvalidHandle);
        // A bare OK where a handle was expected is a protocol error.
        assert!(matches!(
            expect_handle(Response::ok(2)),
            Err(SftpError::BadMessage(_))
        ));
    }

    #[test]
    fn test_connection_lost_code() {
        assert_eq!(connection_lost().code(), StatusCode::ConnectionLost as u32);
    }
}
