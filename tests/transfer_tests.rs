//! End-to-end transfer scenarios over localhost sockets.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::task::JoinHandle;

use depot::transfer::part_path;
use depot::wire::{self, RecordType, UploadOpen};
use depot::{Client, ClientConfig, ErrorCode, Server, ServerConfig};

/// Deterministic pseudo-random content.
fn xorshift64(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

struct TestServer {
    addr: std::net::SocketAddr,
    share_root: PathBuf,
    _share_dir: TempDir,
    _config_dir: TempDir,
    task: JoinHandle<depot::Result<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_server(tweak: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let share_dir = tempdir().unwrap();
    let config_dir = tempdir().unwrap();

    let mut config = ServerConfig::new(share_dir.path());
    config.listen_addr = "127.0.0.1".to_string();
    config.listen_port = 0;
    config.config_dir = Some(config_dir.path().to_path_buf());
    config.passphrase = Some("test-passphrase".to_string());
    tweak(&mut config);

    let server = Arc::new(Server::new(config).unwrap());
    let listener = server.listen().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(Arc::clone(&server).serve(listener));

    TestServer {
        addr,
        share_root: share_dir.path().to_path_buf(),
        _share_dir: share_dir,
        _config_dir: config_dir,
        task,
    }
}

struct TestClient {
    config: ClientConfig,
    _config_dir: TempDir,
}

fn client_for(server: &TestServer) -> TestClient {
    let config_dir = tempdir().unwrap();
    let mut config = ClientConfig::new("127.0.0.1");
    config.port = server.addr.port();
    config.config_dir = Some(config_dir.path().to_path_buf());
    TestClient {
        config,
        _config_dir: config_dir,
    }
}

fn write_tree(base: &Path, files: &[(&str, u64, usize)]) {
    for (rel, seed, len) in files {
        let path = base.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, xorshift64(*seed, *len)).unwrap();
    }
}

#[tokio::test]
async fn single_file_upload() {
    let server = spawn_server(|_| {}).await;
    let test_client = client_for(&server);

    let local_dir = tempdir().unwrap();
    let content = xorshift64(42, 1_048_699);
    let local = local_dir.path().join("alpha.bin");
    std::fs::write(&local, &content).unwrap();
    let local_mtime = std::fs::metadata(&local).unwrap().modified().unwrap();

    let mut client = Client::connect(&test_client.config).await.unwrap();
    let summary = client.send_many(&[local], "").await.unwrap();
    client.close().await.unwrap();

    assert_eq!(summary.files_sent, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.bytes_moved, 1_048_699);

    let dest = server.share_root.join("alpha.bin");
    assert_eq!(std::fs::read(&dest).unwrap(), content);
    assert!(!part_path(&dest).exists());

    // Best-effort mtime preservation (second granularity)
    let dest_mtime = std::fs::metadata(&dest).unwrap().modified().unwrap();
    let drift = dest_mtime
        .duration_since(local_mtime)
        .unwrap_or_else(|e| e.duration());
    assert!(drift <= Duration::from_secs(1), "mtime drifted by {drift:?}");
}

#[tokio::test]
async fn upload_into_remote_directory_and_reject_duplicate() {
    let server = spawn_server(|_| {}).await;
    let test_client = client_for(&server);

    let local_dir = tempdir().unwrap();
    let local = local_dir.path().join("report.pdf");
    std::fs::write(&local, xorshift64(7, 9_000)).unwrap();

    let mut client = Client::connect(&test_client.config).await.unwrap();
    let summary = client.send_many(&[local.clone()], "inbox").await.unwrap();
    assert_eq!(summary.files_sent, 1);
    assert!(server.share_root.join("inbox/report.pdf").exists());

    // Overwrite is disabled by default: the duplicate fails per-item,
    // twice, and leaves no staging residue.
    for _ in 0..2 {
        let summary = client.send_many(&[local.clone()], "inbox").await.unwrap();
        assert_eq!(summary.files_sent, 0);
        assert_eq!(summary.failed, 1);
    }
    assert!(!part_path(&server.share_root.join("inbox/report.pdf")).exists());

    // With skip-existing the same situation counts as a skip
    let mut skipping = test_client.config.clone();
    skipping.skip_existing = true;
    let mut client = Client::connect(&skipping).await.unwrap();
    let summary = client.send_many(&[local], "inbox").await.unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 1);
}

#[tokio::test]
async fn download_with_skip_existing() {
    let server = spawn_server(|_| {}).await;
    write_tree(&server.share_root, &[("beta.dat", 99, 524_295)]);

    let dest = tempdir().unwrap();
    let test_client = client_for(&server);

    // First pass: the file arrives
    let mut client = Client::connect(&test_client.config).await.unwrap();
    let summary = client
        .recv_many(&["beta.dat".to_string()], dest.path())
        .await
        .unwrap();
    client.close().await.unwrap();
    assert_eq!(summary.files_received, 1);
    assert_eq!(
        std::fs::metadata(dest.path().join("beta.dat")).unwrap().len(),
        524_295
    );

    // Second pass with skip=true: unchanged, one skip
    let mut skipping = test_client.config.clone();
    skipping.skip_existing = true;
    let mut client = Client::connect(&skipping).await.unwrap();
    let summary = client
        .recv_many(&["beta.dat".to_string()], dest.path())
        .await
        .unwrap();
    assert_eq!(summary.files_received, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        std::fs::metadata(dest.path().join("beta.dat")).unwrap().len(),
        524_295
    );

    // And without skip, the existing file is a per-item failure
    let mut client = Client::connect(&test_client.config).await.unwrap();
    let summary = client
        .recv_many(&["beta.dat".to_string()], dest.path())
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn mixed_multi_item_download() {
    let server = spawn_server(|_| {}).await;
    write_tree(
        &server.share_root,
        &[
            ("gamma.bin", 777, 131_075),
            ("mixdir/child/a.bin", 101, 65_537),
            ("mixdir/child/b.bin", 202, 204_805),
        ],
    );

    let dest = tempdir().unwrap();
    let test_client = client_for(&server);
    let mut client = Client::connect(&test_client.config).await.unwrap();
    let summary = client
        .recv_many(
            &["gamma.bin".to_string(), "mixdir".to_string()],
            dest.path(),
        )
        .await
        .unwrap();

    assert_eq!(summary.files_received, 3);
    assert_eq!(summary.failed, 0);
    for (rel, seed, len) in [
        ("gamma.bin", 777u64, 131_075usize),
        ("mixdir/child/a.bin", 101, 65_537),
        ("mixdir/child/b.bin", 202, 204_805),
    ] {
        let data = std::fs::read(dest.path().join(rel)).unwrap();
        assert_eq!(data.len(), len, "{rel}");
        assert_eq!(data, xorshift64(seed, len), "{rel}");
    }
}

#[tokio::test]
async fn round_trip_preserves_bytes() {
    let server = spawn_server(|_| {}).await;
    let test_client = client_for(&server);

    let local_dir = tempdir().unwrap();
    write_tree(
        local_dir.path(),
        &[
            ("tree/a.bin", 11, 70_000),
            ("tree/sub/b.bin", 22, 1_500_000),
            ("tree/sub/deeper/c.bin", 33, 17),
        ],
    );

    let mut client = Client::connect(&test_client.config).await.unwrap();
    let summary = client
        .send_many(&[local_dir.path().join("tree")], "")
        .await
        .unwrap();
    assert_eq!(summary.files_sent, 3);

    let dest = tempdir().unwrap();
    let summary = client
        .recv_many(&["tree".to_string()], dest.path())
        .await
        .unwrap();
    client.close().await.unwrap();
    assert_eq!(summary.files_received, 3);

    for rel in ["tree/a.bin", "tree/sub/b.bin", "tree/sub/deeper/c.bin"] {
        assert_eq!(
            std::fs::read(dest.path().join(rel)).unwrap(),
            std::fs::read(local_dir.path().join(rel)).unwrap(),
            "{rel}"
        );
    }
}

#[tokio::test]
async fn zero_byte_file_round_trip() {
    let server = spawn_server(|_| {}).await;
    let test_client = client_for(&server);

    let local_dir = tempdir().unwrap();
    let local = local_dir.path().join("empty.bin");
    std::fs::write(&local, b"").unwrap();

    let mut client = Client::connect(&test_client.config).await.unwrap();
    let summary = client.send_many(&[local], "").await.unwrap();
    assert_eq!(summary.files_sent, 1);
    assert_eq!(
        std::fs::metadata(server.share_root.join("empty.bin")).unwrap().len(),
        0
    );

    let dest = tempdir().unwrap();
    let summary = client
        .recv_many(&["empty.bin".to_string()], dest.path())
        .await
        .unwrap();
    client.close().await.unwrap();
    assert_eq!(summary.files_received, 1);
    assert_eq!(std::fs::metadata(dest.path().join("empty.bin")).unwrap().len(), 0);
}

#[tokio::test]
async fn corrupt_checksum_is_rejected() {
    let server = spawn_server(|_| {}).await;
    let test_client = client_for(&server);
    let mut client = Client::connect(&test_client.config).await.unwrap();

    // Speak the upload protocol directly, closing the stream with a
    // digest that does not match the data.
    let session = client.session_mut();
    let open = UploadOpen {
        path: "poisoned.bin".to_string(),
        mtime_unix: 1_700_000_000,
        perms: vec![],
    };
    session
        .send(RecordType::UploadOpen, &open.encode())
        .await
        .unwrap();
    assert_eq!(
        session.recv().await.unwrap().rtype,
        RecordType::UploadOk
    );

    session
        .send(RecordType::FileData, &xorshift64(5, 4096))
        .await
        .unwrap();
    session
        .send(RecordType::FileClose, &[0xeeu8; 32])
        .await
        .unwrap();

    let reply = session.recv().await.unwrap();
    assert_eq!(reply.rtype, RecordType::ErrorRec);
    assert_eq!(ErrorCode::from_wire(reply.payload[0]), ErrorCode::Checksum);

    let dest = server.share_root.join("poisoned.bin");
    assert!(!dest.exists());
    assert!(!part_path(&dest).exists());
}

#[tokio::test]
async fn path_traversal_is_rejected() {
    let server = spawn_server(|_| {}).await;
    let test_client = client_for(&server);
    let mut client = Client::connect(&test_client.config).await.unwrap();

    let session = client.session_mut();
    session
        .send(
            RecordType::DownloadOpen,
            &wire::encode_path_payload("../etc/passwd"),
        )
        .await
        .unwrap();

    let reply = session.recv().await.unwrap();
    assert_eq!(reply.rtype, RecordType::ErrorRec);
    assert_eq!(
        ErrorCode::from_wire(reply.payload[0]),
        ErrorCode::UnsafePath
    );

    // The session survives a per-item rejection
    session
        .send(
            RecordType::DownloadOpen,
            &wire::encode_path_payload("/etc/passwd"),
        )
        .await
        .unwrap();
    let reply = session.recv().await.unwrap();
    assert_eq!(ErrorCode::from_wire(reply.payload[0]), ErrorCode::Absolute);
}

#[tokio::test]
async fn rekey_across_file_boundaries() {
    let server = spawn_server(|_| {}).await;
    let test_client = client_for(&server);

    let local_dir = tempdir().unwrap();
    write_tree(
        local_dir.path(),
        &[
            ("one.bin", 1, 40_000),
            ("two.bin", 2, 40_000),
            ("three.bin", 3, 40_000),
        ],
    );

    let mut config = test_client.config.clone();
    config.rekey_interval_ms = 50;
    let mut client = Client::connect(&config).await.unwrap();

    for name in ["one.bin", "two.bin", "three.bin"] {
        let summary = client
            .send_many(&[local_dir.path().join(name)], "")
            .await
            .unwrap();
        assert_eq!(summary.files_sent, 1, "{name}");
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    assert!(
        client.stats().rekeys >= 1,
        "expected at least one rekey, saw {}",
        client.stats().rekeys
    );
    assert_eq!(client.session_mut().epoch() as u64, client.stats().rekeys);
    client.close().await.unwrap();

    for (name, seed) in [("one.bin", 1u64), ("two.bin", 2), ("three.bin", 3)] {
        assert_eq!(
            std::fs::read(server.share_root.join(name)).unwrap(),
            xorshift64(seed, 40_000),
            "{name}"
        );
    }
}

#[tokio::test]
async fn listing_files_and_directories() {
    let server = spawn_server(|_| {}).await;
    write_tree(
        &server.share_root,
        &[("docs/readme.txt", 4, 1_234), ("docs/deep/nested.bin", 5, 99)],
    );

    let test_client = client_for(&server);
    let mut client = Client::connect(&test_client.config).await.unwrap();

    let entries = client.list("docs").await.unwrap();
    let mut names: Vec<_> = entries
        .iter()
        .map(|e| (e.path.as_str(), e.kind, e.size))
        .collect();
    names.sort_by(|a, b| a.0.cmp(b.0));
    assert_eq!(
        names,
        vec![
            ("deep", depot::wire::EntryKind::Dir, 0),
            ("readme.txt", depot::wire::EntryKind::File, 1_234),
        ]
    );

    // Listing a single file yields one entry
    let entries = client.list("docs/readme.txt").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "readme.txt");
    assert_eq!(entries[0].size, 1_234);

    // Listing nonsense is a coded per-item failure
    let err = client.list("nope").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    client.close().await.unwrap();
}

#[tokio::test]
async fn psk_gate_end_to_end() {
    let server = spawn_server(|config| {
        config.require_psk = true;
        config.psk = Some("sesame".to_string());
    })
    .await;
    let test_client = client_for(&server);

    // No PSK configured: refused before any key exchange
    let err = Client::connect(&test_client.config).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Auth);

    // Matching PSK: transfers work
    let mut config = test_client.config.clone();
    config.psk = Some("sesame".to_string());
    let local_dir = tempdir().unwrap();
    let local = local_dir.path().join("gated.bin");
    std::fs::write(&local, xorshift64(12, 2_048)).unwrap();

    let mut client = Client::connect(&config).await.unwrap();
    let summary = client.send_many(&[local], "").await.unwrap();
    assert_eq!(summary.files_sent, 1);
    client.close().await.unwrap();
}

#[tokio::test]
async fn server_identity_is_pinned() {
    let server = spawn_server(|_| {}).await;
    let test_client = client_for(&server);

    // First connection pins the key
    let client = Client::connect(&test_client.config).await.unwrap();
    client.close().await.unwrap();

    // Corrupt the pin; the next connection must refuse the server
    let trust_dir = test_client._config_dir.path().join("trust");
    let pin = std::fs::read_dir(&trust_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    std::fs::write(&pin, b"someone else's key").unwrap();

    let err = Client::connect(&test_client.config).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Auth);
}
