//! SFTP Server Example
//!
//! Serves a local directory over SFTP, with multipart uploads and idle
//! connection supervision.
//!
//! Usage:
//!   cargo run --example sftp_server [bind_address] [root_dir]
//!
//! Example:
//!   cargo run --example sftp_server 127.0.0.1:2222 /tmp/sftp-root
//!
//! Then connect with:
//!   cargo run --example sftp_client 127.0.0.1:2222 testuser testpass ./some-file

use kestrel_proto::ssh::auth::StaticAuthenticator;
use kestrel_proto::ssh::hostkey::{fingerprint_sha256, Ed25519HostKey, HostKey};
use kestrel_proto::ssh::session::{ServerSession, SessionConfig};
use kestrel_proto::ssh::sftp::{LocalFileSystem, SftpConfig, SftpServer};
use kestrel_proto::ssh::supervisor::{IdleSupervisor, SupervisorConfig, SupervisorTask};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let bind_addr = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:2222");
    let root = args.get(2).map(String::as_str).unwrap_or(".");

    // Generated per run; a real server loads a persistent key.
    let host_key = Arc::new(Ed25519HostKey::generate()?);
    println!("Host key: {}", fingerprint_sha256(&host_key.public_key_blob()));

    let fs = LocalFileSystem::new(root)?;
    println!("Serving {}", fs.root().display());

    let sftp = SftpServer::new(Arc::new(fs), SftpConfig::default());
    let authenticator = StaticAuthenticator::new()
        .with_password("testuser", "testpass")
        .with_password("admin", "secret");
    let host_keys: Vec<Arc<dyn HostKey>> = vec![host_key];
    let server = ServerSession::new(SessionConfig::default(), host_keys, Arc::new(authenticator))
        .with_opener("session", sftp.opener());

    // Five idle minutes, then three keepalives, then disconnect.
    let supervision = SupervisorConfig::default();
    let supervisor = Arc::new(IdleSupervisor::from_config(&supervision)?);
    let _sweeper = SupervisorTask::spawn(supervisor.clone(), supervision.poll_interval);

    // Abandoned multipart uploads are dropped after an hour.
    {
        let sftp = sftp.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                sftp.reclaim_stale_transfers(Duration::from_secs(3600)).await;
            }
        });
    }

    let listener = TcpListener::bind(bind_addr).await?;
    println!("Listening on {} (testuser/testpass, admin/secret)", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        match server.accept_from(stream, Some(peer.to_string())) {
            Ok(connection) => {
                supervisor.watch_connection(connection.clone(), supervision.keepalives_before_disconnect);
                tokio::spawn(async move {
                    let reason = connection.closed().await;
                    info!(peer = %peer, reason = %reason.description, "Connection finished");
                });
            }
            Err(e) => warn!(peer = %peer, error = %e, "Rejected connection"),
        }
    }
}
