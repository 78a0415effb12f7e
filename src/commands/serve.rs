use std::path::PathBuf;

use log::{info, warn};

use crate::config::Config;
use crate::errors::{ErrorKind, Result, VaultError};
use crate::server::{FileServer, FileServerOpts};
use crate::transport::{nop_handshake, TcpTransport, TcpTransportOpts};

/// Run a storage node until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    if !config.encryption_enabled {
        warn!("encryption_enabled=false is not supported; replication is always encrypted");
    }

    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: config.listen_addr.clone(),
        handshake: nop_handshake,
        max_connections: config.max_connections,
        write_timeout: config.write_timeout(),
    });

    let server = FileServer::new(
        FileServerOpts {
            id: String::new(),
            enc_key: config.encryption_key()?,
            storage_root: PathBuf::from(&config.storage_root),
            bootstrap_nodes: config.bootstrap_nodes.clone(),
            read_timeout: config.read_timeout(),
        },
        transport,
    );

    info!(
        "starting node: listen={} storage={} bootstrap_nodes={}",
        config.listen_addr,
        config.storage_root,
        config.bootstrap_nodes.len()
    );

    let runner = server.clone();
    let mut handle = tokio::spawn(async move { runner.start().await });

    tokio::select! {
        // The server returning before a signal means startup failed or the
        // transport died; surface that.
        result = &mut handle => {
            return match result {
                Ok(result) => result,
                Err(e) => Err(VaultError::wrap(e, ErrorKind::Internal, "server task failed")),
            };
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| {
                VaultError::wrap(e, ErrorKind::Internal, "failed to listen for shutdown signal")
            })?;
            info!("received shutdown signal, stopping server");
        }
    }

    server.stop();
    match handle.await {
        Ok(result) => result?,
        Err(e) => return Err(VaultError::wrap(e, ErrorKind::Internal, "server task failed")),
    }
    info!("server stopped gracefully");
    Ok(())
}
