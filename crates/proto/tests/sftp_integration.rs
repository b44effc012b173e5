//! SFTP client and server talking over a real SSH session.

use kestrel_proto::ssh::auth::StaticAuthenticator;
use kestrel_proto::ssh::hostkey::{AcceptAnyHostKey, Ed25519HostKey, HostKey};
use kestrel_proto::ssh::session::{
    ChannelEvent, ClientSession, ConnectionHandle, ServerSession, SessionConfig,
};
use kestrel_proto::ssh::sftp::{
    FileAttributes, FileSystem, Framer, HashAlgorithm, LocalFileSystem, MemoryFileSystem,
    OpenFlags, PartSpec, Request, Response, SftpClient, SftpConfig, SftpError, SftpServer,
    SFTP_VERSION,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Fixture {
    client: ConnectionHandle,
    _server: ConnectionHandle,
    sftp: SftpServer,
}

async fn start(fs: Arc<dyn FileSystem>, config: SftpConfig) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let sftp = SftpServer::new(fs, config);
    let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
    let server = ServerSession::new(
        SessionConfig::default(),
        vec![host_key],
        Arc::new(StaticAuthenticator::new().with_password("alice", "secret")),
    )
    .with_opener("session", sftp.opener());

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server_conn = server.accept(server_io).unwrap();
    let client = timeout(
        TIMEOUT,
        ClientSession::new(SessionConfig::default(), Arc::new(AcceptAnyHostKey)).connect(client_io),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(client.authenticate_password("alice", "secret").await.unwrap());
    Fixture {
        client,
        _server: server_conn,
        sftp,
    }
}

async fn memory() -> (Fixture, MemoryFileSystem, SftpClient) {
    let fs = MemoryFileSystem::new();
    let fixture = start(Arc::new(fs.clone()), SftpConfig::default()).await;
    let sftp = SftpClient::open(&fixture.client).await.unwrap();
    (fixture, fs, sftp)
}

#[tokio::test]
async fn test_version_lists_extensions() {
    let (_fixture, _fs, sftp) = memory().await;
    assert_eq!(sftp.version(), SFTP_VERSION);
    for name in [
        "create-multipart-file@sshtools.com",
        "open-part-file@sshtools.com",
        "combine-multipart-file@sshtools.com",
        "cancel-multipart-file@sshtools.com",
        "check-file-name",
        "check-file-handle",
        "md5-hash",
        "md5-hash-handle",
    ] {
        assert!(sftp.supports(name), "missing {}", name);
    }
}

#[tokio::test]
async fn test_file_operations() {
    let (_fixture, fs, sftp) = memory().await;

    sftp.mkdir("/docs", FileAttributes::new()).await.unwrap();
    sftp.write_file("/docs/readme.txt", b"kestrel sftp").await.unwrap();
    assert_eq!(fs.file_contents("/docs/readme.txt").unwrap(), b"kestrel sftp");
    assert_eq!(sftp.read_file("/docs/readme.txt").await.unwrap(), b"kestrel sftp");

    let attrs = sftp.stat("/docs/readme.txt").await.unwrap();
    assert_eq!(attrs.size, Some(12));
    assert!(sftp.lstat("/docs").await.unwrap().is_dir());
    assert_eq!(sftp.realpath("/docs/./../docs").await.unwrap(), "/docs");

    sftp.rename("/docs/readme.txt", "/docs/README").await.unwrap();
    let names: Vec<String> = sftp
        .read_dir("/docs")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.filename)
        .collect();
    assert_eq!(names, vec!["README"]);

    assert!(matches!(
        sftp.rmdir("/docs").await,
        Err(SftpError::Failure(_))
    ));
    sftp.remove("/docs/README").await.unwrap();
    sftp.rmdir("/docs").await.unwrap();
    assert!(matches!(
        sftp.stat("/docs").await,
        Err(SftpError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_large_file_round_trip() {
    let (_fixture, _fs, sftp) = memory().await;
    let content: Vec<u8> = (0..1_000_000u32).map(|i| (i % 241) as u8).collect();
    sftp.write_file("/big.bin", &content).await.unwrap();
    assert_eq!(sftp.read_file("/big.bin").await.unwrap(), content);
}

#[tokio::test]
async fn test_handle_invalid_after_close() {
    let (_fixture, fs, sftp) = memory().await;
    fs.insert_file("/f", b"data".to_vec());

    let handle = sftp
        .open_file("/f", OpenFlags::READ, FileAttributes::new())
        .await
        .unwrap();
    assert_eq!(sftp.read(&handle, 0, 4).await.unwrap().unwrap(), b"data");
    assert_eq!(sftp.fstat(&handle).await.unwrap().size, Some(4));
    sftp.close(&handle).await.unwrap();

    assert_eq!(
        sftp.read(&handle, 0, 4).await.unwrap_err(),
        SftpError::InvalidHandle
    );
    assert_eq!(sftp.close(&handle).await.unwrap_err(), SftpError::InvalidHandle);
}

#[tokio::test]
async fn test_pipelined_requests() {
    let (_fixture, fs, sftp) = memory().await;
    for i in 0..20 {
        fs.insert_file(&format!("/f{}", i), vec![0u8; i]);
    }
    let sftp = Arc::new(sftp);
    let mut tasks = Vec::new();
    for i in 0..20usize {
        let sftp = sftp.clone();
        tasks.push(tokio::spawn(async move {
            let attrs = sftp.stat(&format!("/f{}", i)).await.unwrap();
            assert_eq!(attrs.size, Some(i as u64));
        }));
    }
    for task in tasks {
        timeout(TIMEOUT, task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_multipart_upload() {
    let (fixture, fs, sftp) = memory().await;
    let parts = [
        PartSpec::new("A", 0, 100),
        PartSpec::new("B", 100, 50),
        PartSpec::new("C", 150, 75),
    ];
    let (uuid, min_part) = sftp.create_multipart("/joined.bin", &parts).await.unwrap();
    assert_eq!(min_part, 0);

    // Parts arrive out of order.
    sftp.upload_part(&uuid, "C", &[b'c'; 75]).await.unwrap();
    sftp.upload_part(&uuid, "A", &[b'a'; 100]).await.unwrap();
    assert!(sftp.combine_multipart(&uuid).await.is_err());
    sftp.upload_part(&uuid, "B", &[b'b'; 50]).await.unwrap();

    sftp.combine_multipart(&uuid).await.unwrap();
    let combined = fs.file_contents("/joined.bin").unwrap();
    assert_eq!(combined.len(), 225);
    assert_eq!(&combined[..100], &[b'a'; 100][..]);
    assert_eq!(&combined[100..150], &[b'b'; 50][..]);
    assert_eq!(&combined[150..], &[b'c'; 75][..]);
    assert!(fixture.sftp.multipart().is_empty());
    assert_eq!(fs.part_count(), 0);
}

#[tokio::test]
async fn test_failed_combine_can_be_retried() {
    let (fixture, fs, sftp) = memory().await;
    let (uuid, _) = sftp
        .create_multipart("/target", &[PartSpec::new("A", 0, 3), PartSpec::new("B", 3, 3)])
        .await
        .unwrap();
    sftp.upload_part(&uuid, "A", b"abc").await.unwrap();
    sftp.upload_part(&uuid, "B", b"def").await.unwrap();

    // A directory in the way makes the combine fail.
    fs.mkdir("/target", &FileAttributes::new()).await.unwrap();
    assert!(sftp.combine_multipart(&uuid).await.is_err());
    assert_eq!(fixture.sftp.multipart().len(), 1);
    assert_eq!(fs.part_count(), 2);

    fs.rmdir("/target").await.unwrap();
    sftp.combine_multipart(&uuid).await.unwrap();
    assert_eq!(fs.file_contents("/target").unwrap(), b"abcdef");
    assert!(fixture.sftp.multipart().is_empty());
    assert_eq!(fs.part_count(), 0);
}

#[tokio::test]
async fn test_multipart_rejects_gaps_and_overlaps() {
    let (fixture, _fs, sftp) = memory().await;
    let err = sftp
        .create_multipart(
            "/bad.bin",
            &[PartSpec::new("A", 0, 100), PartSpec::new("B", 90, 50)],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), 4);
    assert!(fixture.sftp.multipart().is_empty());
}

#[tokio::test]
async fn test_part_writes_are_bounded() {
    let (_fixture, _fs, sftp) = memory().await;
    let (uuid, _) = sftp
        .create_multipart("/f", &[PartSpec::new("only", 0, 10)])
        .await
        .unwrap();
    let handle = sftp.open_part(&uuid, "only").await.unwrap();
    assert!(sftp.write(&handle, 8, b"xyz").await.is_err());
    sftp.write(&handle, 0, b"0123456789").await.unwrap();
    sftp.close(&handle).await.unwrap();
    assert!(matches!(
        sftp.open_part(&uuid, "missing").await,
        Err(SftpError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_multipart_cancel_discards_parts() {
    let (fixture, fs, sftp) = memory().await;
    let (uuid, _) = sftp
        .create_multipart("/f", &[PartSpec::new("A", 0, 4), PartSpec::new("B", 4, 4)])
        .await
        .unwrap();
    sftp.upload_part(&uuid, "A", b"1234").await.unwrap();
    assert_eq!(fs.part_count(), 1);

    sftp.cancel_multipart(&uuid).await.unwrap();
    assert_eq!(fs.part_count(), 0);
    assert!(fixture.sftp.multipart().is_empty());
    assert!(fs.file_contents("/f").is_none());
    assert!(sftp.combine_multipart(&uuid).await.is_err());
}

#[tokio::test]
async fn test_multipart_unsupported_target() {
    let fs = MemoryFileSystem::new().with_multipart(false);
    let fixture = start(Arc::new(fs), SftpConfig::default()).await;
    let sftp = SftpClient::open(&fixture.client).await.unwrap();
    let err = sftp
        .create_multipart("/f", &[PartSpec::new("A", 0, 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, SftpError::Unsupported(_)));
}

#[tokio::test]
async fn test_stale_transfers_reclaimed() {
    let (fixture, fs, sftp) = memory().await;
    let (uuid, _) = sftp
        .create_multipart("/f", &[PartSpec::new("A", 0, 4)])
        .await
        .unwrap();
    sftp.upload_part(&uuid, "A", b"abcd").await.unwrap();

    assert_eq!(fixture.sftp.reclaim_stale_transfers(Duration::from_secs(3600)).await, 0);
    assert_eq!(fixture.sftp.reclaim_stale_transfers(Duration::ZERO).await, 1);
    assert_eq!(fs.part_count(), 0);
}

#[tokio::test]
async fn test_check_file_hashes() {
    let (_fixture, fs, sftp) = memory().await;
    let content: Vec<u8> = (0..5000u32).map(|i| (i % 7) as u8).collect();
    fs.insert_file("/h.bin", content.clone());

    let (algorithm, hash) = sftp
        .check_file_name("/h.bin", "md5,sha256", 0, 0, 0)
        .await
        .unwrap();
    assert_eq!(algorithm, HashAlgorithm::Sha256);
    assert_eq!(hash, Sha256::digest(&content).to_vec());

    let handle = sftp
        .open_file("/h.bin", OpenFlags::READ, FileAttributes::new())
        .await
        .unwrap();
    let (_, ranged) = sftp
        .check_file_handle(&handle, "sha256", 1000, 500, 0)
        .await
        .unwrap();
    assert_eq!(ranged, Sha256::digest(&content[1000..1500]).to_vec());

    assert!(matches!(
        sftp.check_file_name("/h.bin", "md5", 0, 0, 0).await,
        Err(SftpError::Unsupported(_))
    ));
    let reply = sftp
        .extended("no-such-extension@example.com", Vec::new())
        .await
        .unwrap();
    assert!(matches!(reply, Response::Status { code: 8, .. }));
}

#[tokio::test]
async fn test_md5_hash() {
    let (_fixture, fs, sftp) = memory().await;
    let content: Vec<u8> = (0..6000u32).map(|i| (i % 11) as u8).collect();
    fs.insert_file("/m.bin", content.clone());

    let hash = sftp.md5_hash_name("/m.bin", 0, 0, &[]).await.unwrap();
    assert_eq!(hash, md5::Md5::digest(&content).to_vec());

    let handle = sftp
        .open_file("/m.bin", OpenFlags::READ, FileAttributes::new())
        .await
        .unwrap();
    let ranged = sftp.md5_hash_handle(&handle, 1000, 3000, &[]).await.unwrap();
    assert_eq!(ranged, md5::Md5::digest(&content[1000..4000]).to_vec());

    let head = md5::Md5::digest(&content[1000..3048]);
    let checked = sftp.md5_hash_handle(&handle, 1000, 3000, &head).await.unwrap();
    assert_eq!(checked, ranged);
    let stale = sftp.md5_hash_handle(&handle, 1000, 3000, b"nope").await.unwrap();
    assert!(stale.is_empty());

    assert!(matches!(
        sftp.md5_hash_name("/missing", 0, 0, &[]).await,
        Err(SftpError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_duplicate_request_id_rejected() {
    let fs = MemoryFileSystem::new();
    let fixture = start(Arc::new(fs), SftpConfig::default()).await;

    let (channel, mut events) = fixture.client.open_session().await.unwrap();
    assert!(channel.request_subsystem("sftp").await.unwrap());
    let init = Request::Init {
        version: SFTP_VERSION,
        extensions: Vec::new(),
    };
    channel.send(&init.to_bytes()).await.unwrap();

    // Two requests with the same id in one write.
    let stat = Request::Stat {
        id: 5,
        path: "/".to_string(),
    };
    let mut burst = stat.to_bytes().to_vec();
    burst.extend_from_slice(&stat.to_bytes());
    channel.send(&burst).await.unwrap();

    let mut framer = Framer::default();
    let mut replies = Vec::new();
    while replies.len() < 3 {
        if let Some(body) = framer.next_packet().unwrap() {
            replies.push(Response::parse(&body).unwrap());
            continue;
        }
        match timeout(TIMEOUT, events.recv()).await.unwrap() {
            Some(ChannelEvent::Data(data)) => framer.push(&data),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(matches!(replies[0], Response::Version { .. }));
    assert!(replies.iter().any(|r| matches!(r, Response::Attrs { id: 5, .. })));
    assert!(replies.iter().any(|r| matches!(
        r,
        Response::Status { id: 5, code: 4, message, .. } if message == "request id in use"
    )));
}

#[tokio::test]
async fn test_local_file_system_transfer() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let fs = LocalFileSystem::new(root.path()).unwrap();
    let fixture = start(Arc::new(fs), SftpConfig::default()).await;
    let sftp = SftpClient::open(&fixture.client).await.unwrap();

    let source = scratch.path().join("source.bin");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 199) as u8).collect();
    std::fs::write(&source, &content).unwrap();

    assert_eq!(sftp.upload(&source, "/uploaded.bin").await.unwrap(), 200_000);
    assert_eq!(std::fs::read(root.path().join("uploaded.bin")).unwrap(), content);

    let target = scratch.path().join("downloaded.bin");
    assert_eq!(sftp.download("/uploaded.bin", &target).await.unwrap(), 200_000);
    assert_eq!(std::fs::read(&target).unwrap(), content);

    // Paths cannot climb out of the root.
    assert!(sftp.stat("/../../../../etc/hostname").await.is_err());

    let (uuid, _) = sftp
        .create_multipart("/parts.bin", &[PartSpec::new("1", 0, 3), PartSpec::new("2", 3, 3)])
        .await
        .unwrap();
    sftp.upload_part(&uuid, "2", b"def").await.unwrap();
    sftp.upload_part(&uuid, "1", b"abc").await.unwrap();
    sftp.combine_multipart(&uuid).await.unwrap();
    assert_eq!(std::fs::read(root.path().join("parts.bin")).unwrap(), b"abcdef");
}
