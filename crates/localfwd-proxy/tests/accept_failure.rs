//! Listener failure drives a session into the `error` state
//!
//! Kept in its own test binary: it exhausts the process file descriptor table,
//! which would break any test running alongside it.

use localfwd_proxy::{ProxyManager, ProxyState, ProxyTarget};
use std::fs::File;
use std::time::Duration;
use tokio::net::TcpStream;

/// Stop short of exhausting very large descriptor limits
const MAX_HELD_FILES: usize = 200_000;

/// Open `/dev/null` until the process runs out of descriptors, returning the
/// held files or `None` when the limit is too high to reach.
fn exhaust_fds() -> Option<Vec<File>> {
    let mut held = Vec::new();
    while held.len() < MAX_HELD_FILES {
        match File::open("/dev/null") {
            Ok(file) => held.push(file),
            Err(_) => return Some(held),
        }
    }
    None
}

#[tokio::test(flavor = "multi_thread")]
async fn test_accept_failure_marks_session_error() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();

    let manager = ProxyManager::new();
    let proxy = manager
        .start_proxy(ProxyTarget::new("demo", "db"), 0, "127.0.0.1", 9)
        .await
        .unwrap();

    let Some(mut held) = exhaust_fds() else {
        eprintln!("descriptor limit above {}, skipping", MAX_HELD_FILES);
        manager.stop_all_proxies().await.unwrap();
        return;
    };

    // Free exactly one descriptor for the client; the proxy's accept then
    // has none left.
    held.pop();
    let client = TcpStream::connect(("127.0.0.1", proxy.local_port)).await;

    let mut failed = None;
    for _ in 0..250 {
        let status = manager.get_proxy_status(&proxy.proxy_id).await.unwrap();
        if status.status() == ProxyState::Error {
            failed = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    drop(held);
    drop(client);

    let status = failed.expect("session never entered the error state");
    let error = status.error.as_deref().unwrap_or_default();
    assert!(
        error.contains("accept"),
        "unexpected error message: {:?}",
        error
    );

    // A failed session stays registered, keeps its state and is still stoppable
    let listed = manager.list_proxies().await;
    assert!(listed.ids().contains(&proxy.proxy_id.as_str()));
    assert_eq!(
        manager
            .get_proxy_status(&proxy.proxy_id)
            .await
            .unwrap()
            .status(),
        ProxyState::Error
    );

    manager.stop_proxy(&proxy.proxy_id).await.unwrap();
    assert!(manager.is_empty().await);
}
