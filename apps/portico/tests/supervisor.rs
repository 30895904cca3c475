//! Reconciliation behavior against a stubbed config source.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tempfile::TempDir;

use portico::browser::{Browser, BrowserScope};
use portico::flatpak::NoopFixer;
use portico::manifest::{ManifestFile, NativeManifest};
use portico::server::{ConfigSource, ServerKey, Supervisor};

struct StubConfigs {
    files: Mutex<Vec<ManifestFile>>,
}

impl StubConfigs {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, files: Vec<ManifestFile>) {
        *self.files.lock() = files;
    }
}

impl ConfigSource for StubConfigs {
    fn enabled_configs(&self, _scope: BrowserScope) -> Result<Vec<ManifestFile>> {
        Ok(self.files.lock().clone())
    }
}

fn config(name: &str, extensions: &[&str]) -> ManifestFile {
    ManifestFile {
        path: PathBuf::from(format!("/tmp/portico-test/{name}")),
        browser: Browser::Firefox,
        manifest: NativeManifest {
            name: name.trim_end_matches(".json").to_string(),
            description: String::new(),
            executable: PathBuf::from("/bin/true"),
            kind: "stdio".into(),
            allowed_extensions: extensions.iter().map(|s| s.to_string()).collect(),
            allowed_origins: Vec::new(),
        },
    }
}

fn key(file: &ManifestFile, extension: &str) -> ServerKey {
    ServerKey {
        browser: file.browser,
        manifest_path: file.path.clone(),
        extension: extension.to_string(),
    }
}

fn test_supervisor(dir: &TempDir, configs: Arc<StubConfigs>) -> Arc<Supervisor> {
    Supervisor::with_socket_root(
        configs,
        Arc::new(NoopFixer),
        Some(dir.path().to_path_buf()),
    )
}

async fn wait_for_server_count(supervisor: &Supervisor, expected: usize) {
    for _ in 0..100 {
        if supervisor.running_keys().len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} running servers, found {:?}",
        supervisor.running_keys()
    );
}

#[tokio::test]
async fn reconciliation_tracks_the_enabled_set() {
    let dir = tempfile::tempdir().unwrap();
    let configs = StubConfigs::new();
    let supervisor = test_supervisor(&dir, Arc::clone(&configs));

    // Config A enabled for two extensions, config B not enabled.
    let a = config("a.json", &["e1@example.org", "e2@example.org"]);
    configs.set(vec![a.clone()]);
    supervisor.reconcile(BrowserScope::All, false).await.unwrap();

    let mut keys = supervisor.running_keys();
    keys.sort_by(|left, right| left.extension.cmp(&right.extension));
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], key(&a, "e1@example.org"));
    assert_eq!(keys[1], key(&a, "e2@example.org"));

    let e1_before = supervisor.server(&key(&a, "e1@example.org")).unwrap();

    // Enabling B adds one server without touching the existing two.
    let b = config("b.json", &["e3@example.org"]);
    configs.set(vec![a.clone(), b.clone()]);
    supervisor.reconcile(BrowserScope::All, false).await.unwrap();

    assert_eq!(supervisor.running_keys().len(), 3);
    let e1_after = supervisor.server(&key(&a, "e1@example.org")).unwrap();
    assert!(Arc::ptr_eq(&e1_before, &e1_after));

    // Disabling A drains its two servers and leaves only B's.
    configs.set(vec![b.clone()]);
    supervisor.reconcile(BrowserScope::All, false).await.unwrap();
    wait_for_server_count(&supervisor, 1).await;
    assert_eq!(supervisor.running_keys(), vec![key(&b, "e3@example.org")]);

    supervisor.stop_all().await;
    wait_for_server_count(&supervisor, 0).await;
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let configs = StubConfigs::new();
    let supervisor = test_supervisor(&dir, Arc::clone(&configs));

    let a = config("a.json", &["e1@example.org"]);
    configs.set(vec![a.clone()]);
    supervisor.reconcile(BrowserScope::All, false).await.unwrap();
    let first = supervisor.server(&key(&a, "e1@example.org")).unwrap();

    supervisor.reconcile(BrowserScope::All, false).await.unwrap();
    let second = supervisor.server(&key(&a, "e1@example.org")).unwrap();

    assert_eq!(supervisor.running_keys().len(), 1);
    assert!(
        Arc::ptr_eq(&first, &second),
        "an unchanged pass must not restart servers"
    );

    supervisor.stop_all().await;
}

#[tokio::test]
async fn empty_enabled_set_stops_everything_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let configs = StubConfigs::new();
    let supervisor = test_supervisor(&dir, Arc::clone(&configs));

    configs.set(vec![config("a.json", &["e1@example.org"])]);
    supervisor.reconcile(BrowserScope::All, false).await.unwrap();
    assert_eq!(supervisor.running_keys().len(), 1);

    configs.set(Vec::new());
    supervisor.reconcile(BrowserScope::All, false).await.unwrap();
    assert!(supervisor.running_keys().is_empty());
}

#[tokio::test]
async fn stop_all_with_no_servers_returns_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = test_supervisor(&dir, StubConfigs::new());

    tokio::time::timeout(Duration::from_secs(1), supervisor.stop_all())
        .await
        .expect("stop_all with nothing running must not hang");
}

#[tokio::test]
async fn stop_all_fires_the_broadcast_for_every_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let configs = StubConfigs::new();
    let supervisor = test_supervisor(&dir, Arc::clone(&configs));

    configs.set(vec![config("a.json", &["e1@example.org"])]);
    supervisor.reconcile(BrowserScope::All, false).await.unwrap();

    let mut first = supervisor.subscribe_all_exited();
    let mut second = supervisor.subscribe_all_exited();
    supervisor.stop_all().await;

    tokio::time::timeout(Duration::from_secs(1), first.recv())
        .await
        .expect("first waiter must be notified")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), second.recv())
        .await
        .expect("second waiter must be notified")
        .unwrap();
}

#[tokio::test]
async fn failing_config_source_is_survivable() {
    struct FailingConfigs;
    impl ConfigSource for FailingConfigs {
        fn enabled_configs(&self, _scope: BrowserScope) -> Result<Vec<ManifestFile>> {
            anyhow::bail!("settings store on fire")
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::with_socket_root(
        Arc::new(FailingConfigs),
        Arc::new(NoopFixer),
        Some(dir.path().to_path_buf()),
    );
    let result = supervisor.reconcile(BrowserScope::All, false).await;
    assert!(result.is_err());
    assert!(supervisor.running_keys().is_empty());
}
