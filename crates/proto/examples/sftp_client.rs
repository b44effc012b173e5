//! SFTP Client Example
//!
//! Uploads a local file as a multipart transfer, verifies it with
//! `check-file-name` and downloads it back.
//!
//! Usage:
//!   cargo run --example sftp_client <host:port> <username> <password> <local_file>
//!
//! Example:
//!   cargo run --example sftp_client 127.0.0.1:2222 testuser testpass ./Cargo.toml

use kestrel_proto::ssh::hostkey::HostKeyInfo;
use kestrel_proto::ssh::message::DisconnectReason;
use kestrel_proto::ssh::session::{ClientSession, SessionConfig};
use kestrel_proto::ssh::sftp::{PartSpec, SftpClient};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const PARTS: u64 = 4;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 {
        eprintln!("Usage: {} <host:port> <username> <password> <local_file>", args[0]);
        std::process::exit(1);
    }
    let (addr, username, password, local) = (&args[1], &args[2], &args[3], &args[4]);

    let stream = tokio::net::TcpStream::connect(addr).await?;
    let verifier = |key: &HostKeyInfo| {
        println!("Host key {} {}", key.algorithm, key.fingerprint);
        true
    };
    let config = SessionConfig::default().with_keepalive_interval(Some(Duration::from_secs(30)));
    let connection = ClientSession::new(config, Arc::new(verifier))
        .connect(stream)
        .await?;

    if !connection.authenticate_password(username, password).await? {
        eprintln!("Authentication failed");
        std::process::exit(1);
    }
    let info = connection.info().await?;
    println!("Connected: {:?}", info.negotiated);

    let sftp = SftpClient::open(&connection).await?;
    println!("SFTP version {}, {} extensions", sftp.version(), sftp.extensions().len());

    let content = tokio::fs::read(local).await?;
    let name = std::path::Path::new(local)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());
    let remote = format!("/{}", name);

    // Split the file into contiguous parts; the server accepts them in any order.
    let total = content.len() as u64;
    let step = total.div_ceil(PARTS).max(1);
    let mut specs = Vec::new();
    let mut start = 0;
    while start < total || specs.is_empty() {
        let length = step.min(total - start);
        specs.push(PartSpec::new(format!("part-{}", specs.len()), start, length));
        start += length;
    }
    let (uuid, _min_part) = sftp.create_multipart(&remote, &specs).await?;

    for spec in specs.iter().rev() {
        let range = spec.start as usize..(spec.start + spec.length) as usize;
        sftp.upload_part(&uuid, &spec.id, &content[range]).await?;
    }
    sftp.combine_multipart(&uuid).await?;
    println!("Uploaded {} in {} parts", remote, specs.len());

    let (algorithm, hash) = sftp.check_file_name(&remote, "sha256", 0, 0, 0).await?;
    let local_hash = Sha256::digest(&content);
    println!(
        "{} {} ({})",
        algorithm.name(),
        hex::encode(&hash),
        if hash == local_hash.as_slice() { "match" } else { "MISMATCH" }
    );

    let copy = std::env::temp_dir().join(format!("{}.download", name));
    let bytes = sftp.download(&remote, &copy).await?;
    println!("Downloaded {} bytes to {}", bytes, copy.display());

    sftp.shutdown().await?;
    connection
        .disconnect(DisconnectReason::ByApplication, "bye")
        .await;
    Ok(())
}

