//! End-to-end tests: two managers, an in-process signaling server, and real
//! data channels over loopback.

mod common;

use anyhow::Result;
use common::TestSignalServer;
use openpull::{ConnectionInfo, LogEntry, Manager, ManagerOptions, Role, Severity};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const KEY: &str = "deadbeef";
const TOKEN: &str = "T";

fn info(role: Role) -> ConnectionInfo {
    ConnectionInfo {
        host: "127.0.0.1".to_string(),
        role,
        key: KEY.to_string(),
        public_token: Some(TOKEN.to_string()),
    }
}

fn options() -> ManagerOptions {
    ManagerOptions {
        // Loopback tests connect over host candidates.
        stun_servers: vec![],
        ..Default::default()
    }
}

async fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn collect_messages(manager: &Manager) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    // Subscriptions stay registered when the handle is dropped.
    manager.on_log(move |entry| {
        sink.lock().unwrap().push(entry.message.clone());
    });
    seen
}

#[tokio::test]
async fn late_reader_receives_buffered_entries_in_order() -> Result<()> {
    let server = TestSignalServer::start(&["p0", "p1"], KEY, TOKEN).await;

    let appender =
        Manager::connect_endpoint(&server.endpoint(), info(Role::Appender), options()).await?;
    assert_eq!(appender.peer_id().as_deref(), Some("p0"));

    for i in 0..3 {
        appender.send_log(LogEntry::new(Severity::Info, format!("entry-{i}")));
    }

    let reader =
        Manager::connect_endpoint(&server.endpoint(), info(Role::Reader), options()).await?;
    let seen = collect_messages(&reader);

    // The buffered backlog must arrive before anything submitted later.
    assert!(
        wait_for(|| seen.lock().unwrap().len() >= 3, Duration::from_secs(30)).await,
        "reader never received the replayed backlog"
    );
    assert_eq!(
        seen.lock().unwrap()[..3],
        ["entry-0", "entry-1", "entry-2"]
    );

    appender.send_log(LogEntry::new(Severity::Info, "entry-3"));
    assert!(
        wait_for(|| seen.lock().unwrap().len() >= 4, Duration::from_secs(10)).await,
        "reader never received the live entry"
    );
    assert_eq!(seen.lock().unwrap()[3], "entry-3");

    appender.disconnect();
    reader.disconnect();
    Ok(())
}

#[tokio::test]
async fn reader_initiated_channel_also_replays() -> Result<()> {
    // Id assignment makes the reader the lexicographically smaller peer, so
    // the reader creates the channel and the appender answers.
    let server = TestSignalServer::start(&["z9", "a1"], KEY, TOKEN).await;

    let appender =
        Manager::connect_endpoint(&server.endpoint(), info(Role::Appender), options()).await?;
    appender.send_log(LogEntry::new(Severity::Warning, "before-reader"));

    let reader =
        Manager::connect_endpoint(&server.endpoint(), info(Role::Reader), options()).await?;
    assert_eq!(reader.peer_id().as_deref(), Some("a1"));
    let seen = collect_messages(&reader);

    assert!(
        wait_for(|| !seen.lock().unwrap().is_empty(), Duration::from_secs(30)).await,
        "reader never received the buffered entry"
    );
    assert_eq!(seen.lock().unwrap()[0], "before-reader");

    appender.disconnect();
    reader.disconnect();
    Ok(())
}

#[tokio::test]
async fn entries_older_than_the_retention_window_are_not_replayed() -> Result<()> {
    let server = TestSignalServer::start(&["p0", "p1"], KEY, TOKEN).await;

    let appender = Manager::connect_endpoint(
        &server.endpoint(),
        info(Role::Appender),
        ManagerOptions {
            retention: Duration::from_secs(1),
            ..options()
        },
    )
    .await?;
    appender.send_log(LogEntry::new(Severity::Info, "expires"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let reader =
        Manager::connect_endpoint(&server.endpoint(), info(Role::Reader), options()).await?;
    let seen = collect_messages(&reader);

    let connected = Arc::new(Mutex::new(false));
    let flag = connected.clone();
    reader.on_connection(move |_, up| {
        if up {
            *flag.lock().unwrap() = true;
        }
    });

    assert!(
        wait_for(|| *connected.lock().unwrap(), Duration::from_secs(30)).await,
        "reader channel never opened"
    );
    // Give a wrongly replayed entry time to arrive before asserting.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(seen.lock().unwrap().is_empty());

    appender.disconnect();
    reader.disconnect();
    Ok(())
}

#[tokio::test]
async fn same_role_peers_never_connect() -> Result<()> {
    let server = TestSignalServer::start(&["p0", "p1"], KEY, TOKEN).await;

    let first =
        Manager::connect_endpoint(&server.endpoint(), info(Role::Appender), options()).await?;
    let second =
        Manager::connect_endpoint(&server.endpoint(), info(Role::Appender), options()).await?;

    let connected = Arc::new(Mutex::new(false));
    for manager in [&first, &second] {
        let flag = connected.clone();
        manager.on_connection(move |_, up| {
            if up {
                *flag.lock().unwrap() = true;
            }
        });
    }

    // Past discovery plus the election settle delay.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!*connected.lock().unwrap());
    assert_eq!(first.connection_count(), 0);
    assert_eq!(second.connection_count(), 0);

    first.disconnect();
    second.disconnect();
    Ok(())
}

#[tokio::test]
async fn rejected_handshake_fails_connect() {
    let server = TestSignalServer::start_rejecting(&["p0"], KEY, TOKEN).await;

    let err = Manager::connect_endpoint(&server.endpoint(), info(Role::Appender), options())
        .await
        .expect_err("handshake should be rejected");
    assert!(err.to_string().contains("authentication failed"));
}

#[tokio::test]
async fn wrong_key_fails_connect() {
    let server = TestSignalServer::start(&["p0"], KEY, TOKEN).await;

    let mut bad = info(Role::Appender);
    bad.key = "0badc0de".to_string();
    let err = Manager::connect_endpoint(&server.endpoint(), bad, options())
        .await
        .expect_err("proof should not verify");
    assert!(err.to_string().contains("authentication failed"));
}
