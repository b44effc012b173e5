//! SSH_FXP_EXTENDED requests, dispatched by name.
//!
//! Built in:
//!
//! | Name | Request | Reply |
//! |------|---------|-------|
//! | `check-file-name` | `string path, string algs, uint64 start, uint64 len, uint32 block` | `string alg, byte[] hashes` |
//! | `check-file-handle` | same with a handle | same |
//! | `create-multipart-file@sshtools.com` | `string path, uint32 n, n * (string id, uint64 start, uint64 len)` | `string uuid, uint32 min-part` |
//! | `open-part-file@sshtools.com` | `string uuid, string part-id` | HANDLE |
//! | `combine-multipart-file@sshtools.com` | `string uuid` | STATUS |
//! | `cancel-multipart-file@sshtools.com` | `string uuid` | STATUS |
//! | `md5-hash` | `string path, uint64 start, uint64 len, string quick-check` | `string "md5-hash", string hash` |
//! | `md5-hash-handle` | same with a handle | same |
//!
//! A `len` of 0 hashes to end of file; a `block` of 0 hashes the whole range
//! at once, otherwise one hash per block is returned back to back.
//!
//! A non-empty `quick-check` is compared with the MD5 of the first
//! [`QUICK_CHECK_LEN`] bytes of the range; on a mismatch the hash is empty.

use super::filesystem::{normalize_path, OpenFile};
use super::message::Response;
use super::multipart::PartSpec;
use super::server::{HandleEntry, SftpContext};
use super::types::{FileAttributes, OpenFlags, SftpError, SftpResult};
use crate::ssh::wire::{put_string, Reader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use md5::Md5;
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use tracing::{info, warn};

/// Hash a named file range.
pub const CHECK_FILE_NAME: &str = "check-file-name";
/// Hash a range of an open file.
pub const CHECK_FILE_HANDLE: &str = "check-file-handle";
/// Declare a multipart upload.
pub const CREATE_MULTIPART_FILE: &str = "create-multipart-file@sshtools.com";
/// Open one part for writing.
pub const OPEN_PART_FILE: &str = "open-part-file@sshtools.com";
/// Assemble the parts into the target.
pub const COMBINE_MULTIPART_FILE: &str = "combine-multipart-file@sshtools.com";
/// Abandon a multipart upload.
pub const CANCEL_MULTIPART_FILE: &str = "cancel-multipart-file@sshtools.com";
/// MD5 of a named file range.
pub const MD5_HASH: &str = "md5-hash";
/// MD5 of a range of an open file.
pub const MD5_HASH_HANDLE: &str = "md5-hash-handle";

/// Bytes covered by an md5-hash quick check.
pub const QUICK_CHECK_LEN: u64 = 2048;

/// Smallest non-zero block size for check-file.
pub const MIN_CHECK_BLOCK: u32 = 256;

const HASH_CHUNK: usize = 32 * 1024;

/// A named SSH_FXP_EXTENDED operation.
#[async_trait]
pub trait SftpExtension: Send + Sync {
    /// Name matched against the request and advertised in VERSION.
    fn name(&self) -> &str;

    /// Data advertised next to the name in VERSION.
    fn version_data(&self) -> Vec<u8> {
        b"1".to_vec()
    }

    /// Executes the request.
    async fn handle(&self, ctx: &SftpContext, id: u32, data: &[u8]) -> SftpResult<Response>;
}

/// The extensions every server speaks.
pub fn default_extensions() -> Vec<Arc<dyn SftpExtension>> {
    vec![
        Arc::new(CheckFile { by_handle: false }),
        Arc::new(CheckFile { by_handle: true }),
        Arc::new(CreateMultipart),
        Arc::new(OpenPart),
        Arc::new(CombineMultipart),
        Arc::new(CancelMultipart),
        Arc::new(Md5Hash { by_handle: false }),
        Arc::new(Md5Hash { by_handle: true }),
    ]
}

/// Digests available to check-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// First supported entry of a comma separated preference list.
    pub fn choose(list: &str) -> Option<Self> {
        list.split(',').map(str::trim).find_map(Self::from_name)
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn md5() -> Self {
        Hasher::Md5(Md5::new())
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finish_into(self, out: &mut Vec<u8>) {
        match self {
            Hasher::Md5(h) => out.extend_from_slice(&h.finalize()),
            Hasher::Sha256(h) => out.extend_from_slice(&h.finalize()),
            Hasher::Sha512(h) => out.extend_from_slice(&h.finalize()),
        }
    }
}

/// Hashes `[start, start + length)` of `file` (`length` 0 = to EOF), one
/// digest per `block_size` bytes or a single digest when `block_size` is 0.
pub async fn hash_range(
    file: &dyn OpenFile,
    algorithm: HashAlgorithm,
    start: u64,
    length: u64,
    block_size: u32,
) -> SftpResult<Vec<u8>> {
    if block_size != 0 && block_size < MIN_CHECK_BLOCK {
        return Err(SftpError::Failure(format!(
            "block size {} below {}",
            block_size, MIN_CHECK_BLOCK
        )));
    }
    hash_blocks(file, || Hasher::new(algorithm), start, length, block_size).await
}

/// MD5 of `[start, start + length)` of `file` (`length` 0 = to EOF).
pub async fn md5_range(file: &dyn OpenFile, start: u64, length: u64) -> SftpResult<Vec<u8>> {
    hash_blocks(file, Hasher::md5, start, length, 0).await
}

async fn hash_blocks(
    file: &dyn OpenFile,
    fresh: impl Fn() -> Hasher + Send,
    start: u64,
    length: u64,
    block_size: u32,
) -> SftpResult<Vec<u8>> {
    let end = if length == 0 {
        None
    } else {
        Some(start.saturating_add(length))
    };
    let mut out = Vec::new();
    let mut hasher = fresh();
    let mut in_block = 0u64;
    let mut offset = start;
    loop {
        let mut want = HASH_CHUNK as u64;
        if let Some(end) = end {
            want = want.min(end - offset);
        }
        if block_size != 0 {
            want = want.min(block_size as u64 - in_block);
        }
        if want == 0 {
            break;
        }
        let data = file.read(offset, want as usize).await?;
        if data.is_empty() {
            break;
        }
        hasher.update(&data);
        offset += data.len() as u64;
        in_block += data.len() as u64;
        if block_size != 0 && in_block == block_size as u64 {
            std::mem::replace(&mut hasher, fresh()).finish_into(&mut out);
            in_block = 0;
        }
    }
    if block_size == 0 || in_block > 0 || out.is_empty() {
        hasher.finish_into(&mut out);
    }
    Ok(out)
}

/// Payload of a check-file request.
pub fn encode_check_file(
    target: &[u8],
    algorithms: &str,
    start: u64,
    length: u64,
    block_size: u32,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, target);
    put_string(&mut buf, algorithms.as_bytes());
    buf.put_u64(start);
    buf.put_u64(length);
    buf.put_u32(block_size);
    buf.to_vec()
}

/// Payload of an md5-hash request.
pub fn encode_md5_hash(target: &[u8], start: u64, length: u64, quick_check: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, target);
    buf.put_u64(start);
    buf.put_u64(length);
    put_string(&mut buf, quick_check);
    buf.to_vec()
}

/// Payload of a create-multipart request.
pub fn encode_create_multipart(path: &str, parts: &[PartSpec]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, path.as_bytes());
    buf.put_u32(parts.len() as u32);
    for part in parts {
        put_string(&mut buf, part.id.as_bytes());
        buf.put_u64(part.start);
        buf.put_u64(part.length);
    }
    buf.to_vec()
}

/// Payload naming a transfer and optionally one of its parts.
pub fn encode_transfer(uuid: &str, part: Option<&str>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, uuid.as_bytes());
    if let Some(part) = part {
        put_string(&mut buf, part.as_bytes());
    }
    buf.to_vec()
}

struct CheckFile {
    by_handle: bool,
}

#[async_trait]
impl SftpExtension for CheckFile {
    fn name(&self) -> &str {
        if self.by_handle {
            CHECK_FILE_HANDLE
        } else {
            CHECK_FILE_NAME
        }
    }

    async fn handle(&self, ctx: &SftpContext, id: u32, data: &[u8]) -> SftpResult<Response> {
        let mut r = Reader::new(data);
        let target = r.read_string()?.to_vec();
        let algorithms = r.read_utf8()?;
        let start = r.read_u64()?;
        let length = r.read_u64()?;
        let block_size = r.read_u32()?;
        r.finish()?;

        let algorithm = HashAlgorithm::choose(&algorithms)
            .ok_or_else(|| SftpError::Unsupported(format!("hash algorithms {}", algorithms)))?;

        let (file, opened) = open_target(ctx, self.by_handle, &target).await?;
        let hashes = hash_range(file.as_ref(), algorithm, start, length, block_size).await;
        if opened {
            let _ = file.close().await;
        }

        let mut reply = BytesMut::new();
        put_string(&mut reply, algorithm.name().as_bytes());
        reply.extend_from_slice(&hashes?);
        Ok(Response::ExtendedReply {
            id,
            data: reply.to_vec(),
        })
    }
}

/// Resolves a handle, or opens a path for reading. The flag is set when the
/// caller has to close the file.
async fn open_target(
    ctx: &SftpContext,
    by_handle: bool,
    target: &[u8],
) -> SftpResult<(Arc<dyn OpenFile>, bool)> {
    if by_handle {
        return Ok((ctx.file(target)?, false));
    }
    let path = normalize_path(&String::from_utf8_lossy(target));
    let file = ctx
        .fs()
        .open(&path, OpenFlags::READ, &FileAttributes::new())
        .await?;
    Ok((Arc::from(file), true))
}

struct Md5Hash {
    by_handle: bool,
}

#[async_trait]
impl SftpExtension for Md5Hash {
    fn name(&self) -> &str {
        if self.by_handle {
            MD5_HASH_HANDLE
        } else {
            MD5_HASH
        }
    }

    async fn handle(&self, ctx: &SftpContext, id: u32, data: &[u8]) -> SftpResult<Response> {
        let mut r = Reader::new(data);
        let target = r.read_string()?.to_vec();
        let start = r.read_u64()?;
        let length = r.read_u64()?;
        let quick_check = r.read_string()?.to_vec();
        r.finish()?;

        let (file, opened) = open_target(ctx, self.by_handle, &target).await?;
        let hash = md5_with_quick_check(file.as_ref(), start, length, &quick_check).await;
        if opened {
            let _ = file.close().await;
        }

        let mut reply = BytesMut::new();
        put_string(&mut reply, MD5_HASH.as_bytes());
        put_string(&mut reply, &hash?);
        Ok(Response::ExtendedReply {
            id,
            data: reply.to_vec(),
        })
    }
}

async fn md5_with_quick_check(
    file: &dyn OpenFile,
    start: u64,
    length: u64,
    quick_check: &[u8],
) -> SftpResult<Vec<u8>> {
    if !quick_check.is_empty() {
        let head = if length == 0 {
            QUICK_CHECK_LEN
        } else {
            length.min(QUICK_CHECK_LEN)
        };
        if md5_range(file, start, head).await? != quick_check {
            return Ok(Vec::new());
        }
    }
    md5_range(file, start, length).await
}

struct CreateMultipart;

#[async_trait]
impl SftpExtension for CreateMultipart {
    fn name(&self) -> &str {
        CREATE_MULTIPART_FILE
    }

    async fn handle(&self, ctx: &SftpContext, id: u32, data: &[u8]) -> SftpResult<Response> {
        let mut r = Reader::new(data);
        let path = normalize_path(&r.read_utf8()?);
        let count = r.read_u32()?;
        // Each part needs at least 20 bytes on the wire.
        if count as usize > r.remaining() / 20 {
            return Err(SftpError::BadMessage(format!(
                "part count {} exceeds request",
                count
            )));
        }
        let mut parts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            parts.push(PartSpec {
                id: r.read_utf8()?,
                start: r.read_u64()?,
                length: r.read_u64()?,
            });
        }
        r.finish()?;

        if !ctx.fs().supports_multipart(&path) {
            return Err(SftpError::Unsupported(format!(
                "multipart uploads to {}",
                path
            )));
        }
        let uuid = ctx.multipart().create(&path, parts)?;
        let mut reply = BytesMut::new();
        put_string(&mut reply, uuid.as_bytes());
        reply.put_u32(ctx.multipart().min_part_size().min(u32::MAX as u64) as u32);
        Ok(Response::ExtendedReply {
            id,
            data: reply.to_vec(),
        })
    }
}

struct OpenPart;

#[async_trait]
impl SftpExtension for OpenPart {
    fn name(&self) -> &str {
        OPEN_PART_FILE
    }

    async fn handle(&self, ctx: &SftpContext, id: u32, data: &[u8]) -> SftpResult<Response> {
        let mut r = Reader::new(data);
        let transfer = r.read_utf8()?;
        let part = r.read_utf8()?;
        r.finish()?;

        let (_, length) = ctx.multipart().part_bounds(&transfer, &part)?;
        let file: Arc<dyn OpenFile> = Arc::from(ctx.fs().open_part(&transfer, &part).await?);
        let handle = ctx.insert(HandleEntry::Part {
            transfer,
            part,
            length,
            file,
        })?;
        Ok(Response::Handle { id, handle })
    }
}

struct CombineMultipart;

#[async_trait]
impl SftpExtension for CombineMultipart {
    fn name(&self) -> &str {
        COMBINE_MULTIPART_FILE
    }

    async fn handle(&self, ctx: &SftpContext, id: u32, data: &[u8]) -> SftpResult<Response> {
        let mut r = Reader::new(data);
        let uuid = r.read_utf8()?;
        r.finish()?;

        // Stays registered until the parts are combined, so a failed
        // combine can be retried or cancelled.
        let transfer = ctx.multipart().complete(&uuid)?;
        if let Err(err) = ctx.fs().combine_parts(&transfer).await {
            warn!(transfer = %uuid, error = %err, "Combining parts failed");
            return Err(err);
        }
        ctx.multipart().remove(&uuid);
        info!(
            transfer = %uuid,
            path = transfer.path(),
            length = transfer.total_length(),
            "Multipart transfer combined"
        );
        Ok(Response::ok(id))
    }
}

struct CancelMultipart;

#[async_trait]
impl SftpExtension for CancelMultipart {
    fn name(&self) -> &str {
        CANCEL_MULTIPART_FILE
    }

    async fn handle(&self, ctx: &SftpContext, id: u32, data: &[u8]) -> SftpResult<Response> {
        let mut r = Reader::new(data);
        let uuid = r.read_utf8()?;
        r.finish()?;

        let transfer = ctx
            .multipart()
            .remove(&uuid)
            .ok_or_else(|| SftpError::NotFound(format!("no multipart transfer {}", uuid)))?;
        ctx.fs().discard_parts(&transfer).await?;
        info!(transfer = %uuid, "Multipart transfer cancelled");
        Ok(Response::ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::sftp::filesystem::{FileSystem, MemoryFileSystem};

    async fn memory_file(content: &[u8]) -> Box<dyn OpenFile> {
        let fs = MemoryFileSystem::new();
        fs.insert_file("/f", content.to_vec());
        fs.open("/f", OpenFlags::READ, &FileAttributes::new())
            .await
            .unwrap()
    }

    #[test]
    fn test_choose_algorithm() {
        assert_eq!(HashAlgorithm::choose("md5,sha512,sha256"), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::choose("md5"), None);
        assert_eq!(HashAlgorithm::Sha256.output_len(), 32);
    }

    #[tokio::test]
    async fn test_hash_whole_file() {
        let content = vec![7u8; 100_000];
        let file = memory_file(&content).await;
        let hash = hash_range(file.as_ref(), HashAlgorithm::Sha256, 0, 0, 0)
            .await
            .unwrap();
        assert_eq!(hash, Sha256::digest(&content).to_vec());
    }

    #[tokio::test]
    async fn test_hash_range_and_blocks() {
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let file = memory_file(&content).await;

        let ranged = hash_range(file.as_ref(), HashAlgorithm::Sha512, 100, 200, 0)
            .await
            .unwrap();
        assert_eq!(ranged, Sha512::digest(&content[100..300]).to_vec());

        let blocks = hash_range(file.as_ref(), HashAlgorithm::Sha256, 0, 0, 400)
            .await
            .unwrap();
        let mut expected = Vec::new();
        for chunk in content.chunks(400) {
            expected.extend_from_slice(&Sha256::digest(chunk));
        }
        assert_eq!(blocks, expected);
        assert!(hash_range(file.as_ref(), HashAlgorithm::Sha256, 0, 0, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_md5_quick_check() {
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
        let file = memory_file(&content).await;

        let full = md5_range(file.as_ref(), 0, 0).await.unwrap();
        assert_eq!(full, Md5::digest(&content).to_vec());
        assert_eq!(full.len(), 16);

        let head = Md5::digest(&content[..QUICK_CHECK_LEN as usize]);
        let checked = md5_with_quick_check(file.as_ref(), 0, 0, &head).await.unwrap();
        assert_eq!(checked, full);

        let mismatch = md5_with_quick_check(file.as_ref(), 0, 0, &[0u8; 16]).await.unwrap();
        assert!(mismatch.is_empty());

        // Short ranges check only their own bytes.
        let short = Md5::digest(&content[10..110]);
        let ranged = md5_with_quick_check(file.as_ref(), 10, 100, &short).await.unwrap();
        assert_eq!(ranged, short.to_vec());
    }

    #[test]
    fn test_payload_encoding() {
        let data = encode_create_multipart("/f", &[PartSpec::new("A", 0, 5)]);
        let mut r = Reader::new(&data);
        assert_eq!(r.read_utf8().unwrap(), "/f");
        assert_eq!(r.read_u32().unwrap(), 1);
        assert_eq!(r.read_utf8().unwrap(), "A");
        assert_eq!(r.read_u64().unwrap(), 0);
        assert_eq!(r.read_u64().unwrap(), 5);
        assert!(r.is_empty());

        let data = encode_transfer("uuid", Some("part"));
        let mut r = Reader::new(&data);
        assert_eq!(r.read_utf8().unwrap(), "uuid");
        assert_eq!(r.read_utf8().unwrap(), "part");
    }
}
