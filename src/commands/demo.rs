use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::crypto;
use crate::errors::Result;
use crate::server::{FileServer, FileServerOpts};
use crate::transport::{nop_handshake, TcpTransport, TcpTransportOpts};
use crate::KEY_SIZE;

/// Run a three-node cluster on localhost: store files round-robin, then read
/// each one back from a different node than stored it.
pub async fn run() -> Result<()> {
    println!("peervault demo: three-node replication");
    println!("======================================");

    let roots: Vec<PathBuf> = (1..=3)
        .map(|i| std::env::temp_dir().join(format!("peervault_demo_node{i}")))
        .collect();
    for root in &roots {
        let _ = std::fs::remove_dir_all(root);
    }

    // One cluster key, so every node can decrypt every replica.
    let cluster_key = crypto::new_encryption_key();

    println!("\nstarting nodes...");
    let node1 = start_node(cluster_key, roots[0].clone(), Vec::new()).await;
    let node2 = start_node(cluster_key, roots[1].clone(), vec![node1.addr()]).await;
    let node3 = start_node(cluster_key, roots[2].clone(), vec![node1.addr(), node2.addr()]).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let nodes = [&node1, &node2, &node3];
    for (i, node) in nodes.iter().enumerate() {
        println!("  node {} on {} ({})", i + 1, node.addr(), node.id());
    }

    let files: Vec<(&str, Vec<u8>)> = vec![
        ("readme.txt", b"Welcome to the distributed file storage system!".to_vec()),
        ("config.json", br#"{"version": "1.0", "nodes": 3}"#.to_vec()),
        ("data.csv", b"name,age,city\nAlice,30,NYC\nBob,25,LA".to_vec()),
        ("image.jpg", b"JPEG_DATA".repeat(100)),
        ("document.pdf", b"PDF_CONTENT".repeat(200)),
    ];

    println!("\nstoring files round-robin...");
    for (i, (name, content)) in files.iter().enumerate() {
        let node_index = i % nodes.len();
        println!("  storing '{}' on node {} ({} bytes)", name, node_index + 1, content.len());
        nodes[node_index].store(name, &mut &content[..]).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("\nretrieving files from different nodes...");
    for (i, (name, content)) in files.iter().enumerate() {
        let node_index = (i + 1) % nodes.len();
        print!("  retrieving '{}' from node {}: ", name, node_index + 1);
        match nodes[node_index].get(name).await {
            Ok((size, mut file)) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data).await.map_err(|e| {
                    crate::VaultError::wrap(e, crate::ErrorKind::Storage, "failed to read blob")
                })?;
                let ok = data == *content;
                println!("{} bytes {}", size, if ok { "(verified)" } else { "(MISMATCH)" });
            }
            Err(e) => println!("error: {e}"),
        }
    }

    println!("\nshutting down...");
    for node in nodes {
        node.stop();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    for root in &roots {
        let _ = std::fs::remove_dir_all(root);
    }

    println!("demo complete");
    Ok(())
}

async fn start_node(
    enc_key: [u8; KEY_SIZE],
    storage_root: PathBuf,
    bootstrap_nodes: Vec<String>,
) -> Arc<FileServer> {
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: "127.0.0.1:0".to_string(),
        handshake: nop_handshake,
        ..TcpTransportOpts::default()
    });

    let server = FileServer::new(
        FileServerOpts {
            id: String::new(),
            enc_key,
            storage_root,
            bootstrap_nodes,
            read_timeout: Duration::from_secs(30),
        },
        transport,
    );

    let runner = server.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.start().await {
            eprintln!("node error: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    server
}
