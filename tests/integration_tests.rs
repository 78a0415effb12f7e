// Integration tests for the peervault storage network.
// These validate end-to-end behavior: local store/get, replication between
// nodes, cross-node reads, and network fetches on a local miss.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use peervault::crypto::new_encryption_key;
use peervault::errors::ErrorKind;
use peervault::server::{FileServer, FileServerOpts};
use peervault::store::cas_path_transform;
use peervault::transport::{TcpTransport, TcpTransportOpts};
use peervault::KEY_SIZE;

async fn start_node(
    enc_key: [u8; KEY_SIZE],
    storage_root: PathBuf,
    bootstrap_nodes: Vec<String>,
) -> Arc<FileServer> {
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: "127.0.0.1:0".to_string(),
        ..TcpTransportOpts::default()
    });
    let server = FileServer::new(
        FileServerOpts {
            id: String::new(),
            enc_key,
            storage_root,
            bootstrap_nodes,
            read_timeout: Duration::from_secs(5),
        },
        transport,
    );

    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.start().await;
    });
    // Give the listener and bootstrap dials a moment to come up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    server
}

async fn read_back(server: &FileServer, key: &str) -> Vec<u8> {
    let (_, mut file) = server.get(key).await.expect("get should succeed");
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await.unwrap();
    contents
}

// ============================================================================
// Single-node scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_store_and_get() {
    let dir = TempDir::new().unwrap();
    let node = start_node(new_encryption_key(), dir.path().to_path_buf(), Vec::new()).await;

    let content = b"Hello, distributed file system!";
    node.store("test_file.txt", &mut &content[..]).await.unwrap();

    let read = read_back(&node, "test_file.txt").await;
    assert_eq!(read.len(), 31);
    assert_eq!(read, content);

    // The blob sits at the content-addressed path under the node's namespace.
    let path_key = cas_path_transform("test_file.txt");
    let blob_path = dir
        .path()
        .join(node.id())
        .join(&path_key.dir)
        .join(&path_key.filename);
    assert!(blob_path.exists(), "expected blob at {}", blob_path.display());

    node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_without_peers_is_a_network_error() {
    let dir = TempDir::new().unwrap();
    let node = start_node(new_encryption_key(), dir.path().to_path_buf(), Vec::new()).await;

    let err = node.get("nope.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);

    node.stop();
}

// ============================================================================
// Replication scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_node_replication_and_cross_read() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let cluster_key = new_encryption_key();

    let node_a = start_node(cluster_key, dir_a.path().to_path_buf(), Vec::new()).await;
    let node_b =
        start_node(cluster_key, dir_b.path().to_path_buf(), vec![node_a.addr()]).await;

    let content = b"Content of file 1";
    node_a.store("file1.txt", &mut &content[..]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(read_back(&node_a, "file1.txt").await, content);
    assert_eq!(read_back(&node_b, "file1.txt").await, content);

    node_a.stop();
    node_b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_fanout() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let cluster_key = new_encryption_key();

    let node_a = start_node(cluster_key, dirs[0].path().to_path_buf(), Vec::new()).await;
    let node_b =
        start_node(cluster_key, dirs[1].path().to_path_buf(), vec![node_a.addr()]).await;
    let node_c = start_node(
        cluster_key,
        dirs[2].path().to_path_buf(),
        vec![node_a.addr(), node_b.addr()],
    )
    .await;

    let nodes = [&node_a, &node_b, &node_c];
    let files: Vec<(String, Vec<u8>)> = (1..=3)
        .map(|i| (format!("file{i}.txt"), format!("Content of file {i}").into_bytes()))
        .collect();

    for (i, (name, content)) in files.iter().enumerate() {
        nodes[i % nodes.len()].store(name, &mut &content[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in &nodes {
        for (name, content) in &files {
            assert_eq!(&read_back(node, name).await, content, "{name} from {}", node.addr());
        }
    }

    for node in nodes {
        node.stop();
    }
}

// ============================================================================
// Network fetch scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_fetches_over_the_network() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let dir_c = TempDir::new().unwrap();
    let cluster_key = new_encryption_key();

    let node_a = start_node(cluster_key, dir_a.path().to_path_buf(), Vec::new()).await;
    let node_b =
        start_node(cluster_key, dir_b.path().to_path_buf(), vec![node_a.addr()]).await;

    // Stored while only A and B are connected; B ends up with the replica.
    let content = b"bytes that C never saw locally";
    node_a.store("shared.bin", &mut &content[..]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // C joins later, knowing only B, and must pull the blob off the wire.
    let node_c =
        start_node(cluster_key, dir_c.path().to_path_buf(), vec![node_b.addr()]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(read_back(&node_c, "shared.bin").await, content);

    // The fetched copy is now local; a second get does not need the network.
    assert_eq!(read_back(&node_c, "shared.bin").await, content);

    node_a.stop();
    node_b.stop();
    node_c.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_of_unknown_key_fails_cleanly() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let cluster_key = new_encryption_key();

    let node_a = start_node(cluster_key, dir_a.path().to_path_buf(), Vec::new()).await;
    let node_b =
        start_node(cluster_key, dir_b.path().to_path_buf(), vec![node_a.addr()]).await;

    let err = node_b.get("never_stored.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);

    node_a.stop();
    node_b.stop();
}

// ============================================================================
// Overwrite semantics
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restore_overwrites_previous_content() {
    let dir = TempDir::new().unwrap();
    let node = start_node(new_encryption_key(), dir.path().to_path_buf(), Vec::new()).await;

    node.store("doc.txt", &mut &b"first draft"[..]).await.unwrap();
    node.store("doc.txt", &mut &b"final"[..]).await.unwrap();

    assert_eq!(read_back(&node, "doc.txt").await, b"final");

    node.stop();
}
