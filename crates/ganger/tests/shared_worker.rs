//! Shared-worker runtime driven in process: a real reactor on a helper
//! thread, real unix sockets, and the public client API on this side.

use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use ganger::{
    BootstrapProfile, EventedWorkerImpl, KillSwitch, Message, MessageChannel, PeerHandle,
    RunnerOptions, SharedWorker, SharedWorkerImpl, SocketAddress, WorkerCounter, WorkerError,
    WorkerRunner, WorkerStatus,
};

/// Counts messages and answers each with the running total. Queries report
/// the total and whether the asker was privileged.
#[derive(Default)]
struct Counting {
    messages: u64,
}

impl EventedWorkerImpl for Counting {
    fn on_message(&mut self, _message: Message, peer: &PeerHandle) -> ganger::Result<()> {
        self.messages += 1;
        peer.send_message(Message::data(json!({ "seen": self.messages })))
    }
}

impl SharedWorkerImpl for Counting {
    fn on_query(&mut self, privileged: bool) -> WorkerStatus {
        let text = if privileged { "privileged" } else { "anonymous" };
        WorkerStatus::new(
            Some(text.to_owned()),
            vec![WorkerCounter::new("messages", self.messages as f64)],
        )
    }
}

fn unix_address(dir: &TempDir, name: &str) -> SocketAddress {
    SocketAddress::new(format!("unix://{}", dir.path().join(name).display()))
}

fn spawn_counting_worker(
    address: SocketAddress,
    options: RunnerOptions,
) -> JoinHandle<ganger::Result<()>> {
    std::thread::spawn(move || {
        let runner = WorkerRunner::new(options)?;
        runner.run_shared(Box::new(Counting::default()), &address)
    })
}

fn cookie_options(cookie: &str) -> RunnerOptions {
    RunnerOptions {
        admin_cookie: Some(cookie.to_owned()),
        ..RunnerOptions::default()
    }
}

fn cookie_profile(cookie: &str) -> BootstrapProfile {
    let mut profile = BootstrapProfile::new();
    profile.set_admin_cookie(Some(cookie.to_owned()));
    profile
}

async fn connect_with_retry(address: &SocketAddress, profile: &BootstrapProfile) -> SharedWorker {
    for _ in 0..250 {
        match SharedWorker::connect(address.clone(), profile).await {
            Ok(worker) => return worker,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("worker at {address} never started listening");
}

async fn wait_until_stopped(address: &SocketAddress, profile: &BootstrapProfile) {
    for _ in 0..250 {
        match SharedWorker::connect(address.clone(), profile).await {
            Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(_) => return,
        }
    }
    panic!("worker at {address} never stopped listening");
}

#[tokio::test]
async fn test_privileged_stop_shuts_the_worker_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = unix_address(&dir, "stop.sock");
    let handle = spawn_counting_worker(address.clone(), cookie_options("hunter2"));

    let profile = cookie_profile("hunter2");
    let mut client = connect_with_retry(&address, &profile).await;

    client
        .send_message(Message::data(json!("work")))
        .await
        .expect("send");
    assert_eq!(
        client.receive_message().await.expect("recv"),
        Message::data(json!({ "seen": 1 }))
    );

    client.stop().await.expect("stop");
    wait_until_stopped(&address, &profile).await;

    // The connection that sent the stop is still served.
    client
        .send_message(Message::data(json!("more work")))
        .await
        .expect("send after stop");
    assert_eq!(
        client.receive_message().await.expect("recv after stop"),
        Message::data(json!({ "seen": 2 }))
    );

    drop(client);
    handle.join().expect("worker thread").expect("worker run");
    assert!(
        !address.socket_file().expect("socket file").exists(),
        "socket file must be removed on shutdown"
    );
}

#[tokio::test]
async fn test_wrong_cookie_leaves_the_worker_listening() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = unix_address(&dir, "wrong.sock");
    let handle = spawn_counting_worker(address.clone(), cookie_options("right"));

    let right = cookie_profile("right");
    let wrong = cookie_profile("wrong");
    let client = connect_with_retry(&address, &right).await;

    // Delivered, but the worker must ignore it.
    assert!(
        SharedWorker::stop_worker(&address, &wrong)
            .await
            .expect("stop with wrong cookie")
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let probe = SharedWorker::connect(address.clone(), &right)
        .await
        .expect("still listening");
    drop(probe);

    assert!(
        SharedWorker::stop_worker(&address, &right)
            .await
            .expect("stop with right cookie")
    );
    wait_until_stopped(&address, &right).await;
    drop(client);
    handle.join().expect("worker thread").expect("worker run");
}

#[tokio::test]
async fn test_query_reports_privilege_and_counters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = unix_address(&dir, "query.sock");
    let handle = spawn_counting_worker(address.clone(), cookie_options("s3cret"));

    let profile = cookie_profile("s3cret");
    let mut client = connect_with_retry(&address, &profile).await;
    client
        .send_message(Message::data(json!("work")))
        .await
        .expect("send");
    let _ = client.receive_message().await.expect("recv");

    let status = SharedWorker::query_worker(&address, &profile)
        .await
        .expect("privileged query");
    assert_eq!(status.text_status.as_deref(), Some("privileged"));
    let messages = status
        .counters
        .iter()
        .find(|counter| counter.name.as_deref() == Some("messages"))
        .expect("messages counter");
    assert_eq!(messages.value, Some(1.0));

    // A query carrying no cookie is still answered, as unprivileged.
    let stream = ganger::socket::create_client_socket(&address, None, None)
        .await
        .expect("raw connect");
    let mut raw = MessageChannel::new(stream, ganger::Encoding::Framed);
    raw.send(ganger::admin::query_message(None)).await.expect("send query");
    let reply = raw.recv().await.expect("status reply");
    let status = ganger::admin::status_reply(&reply).expect("status payload");
    assert_eq!(status.text_status.as_deref(), Some("anonymous"));
    drop(raw);

    client.stop().await.expect("stop");
    wait_until_stopped(&address, &profile).await;
    drop(client);
    handle.join().expect("worker thread").expect("worker run");
}

#[tokio::test]
async fn test_kill_switch_prevents_the_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = unix_address(&dir, "killed.sock");
    let switch_path = dir.path().join("kill.json");

    let mut switch = KillSwitch::load(&switch_path);
    switch.add_address(&address);
    switch.save().expect("save kill switch");

    let options = RunnerOptions {
        kill_switch_path: Some(switch_path),
        ..RunnerOptions::default()
    };
    let handle = spawn_counting_worker(address.clone(), options);
    let err = handle
        .join()
        .expect("worker thread")
        .expect_err("start must be refused");
    assert!(matches!(err, WorkerError::Runtime(_)));
    assert!(err.to_string().contains("kill switch"), "got: {err}");

    let connect = SharedWorker::connect(address, &BootstrapProfile::new()).await;
    assert!(connect.is_err(), "nothing may be listening");
}

#[tokio::test]
async fn test_kill_switch_scoped_to_another_address_does_not_block() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = unix_address(&dir, "allowed.sock");
    let switch_path = dir.path().join("kill.json");

    let mut switch = KillSwitch::load(&switch_path);
    switch.add_address(&unix_address(&dir, "other.sock"));
    switch.save().expect("save kill switch");

    let options = RunnerOptions {
        admin_cookie: Some("c".to_owned()),
        kill_switch_path: Some(switch_path),
        ..RunnerOptions::default()
    };
    let handle = spawn_counting_worker(address.clone(), options);

    let profile = cookie_profile("c");
    let mut client = connect_with_retry(&address, &profile).await;
    client.stop().await.expect("stop");
    wait_until_stopped(&address, &profile).await;
    drop(client);
    handle.join().expect("worker thread").expect("worker run");
}

#[tokio::test]
async fn test_stale_socket_file_is_recovered_at_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = unix_address(&dir, "stale.sock");
    let path = address.socket_file().expect("socket file");

    // A previous owner that died without unlinking.
    let dead = std::os::unix::net::UnixListener::bind(&path).expect("first bind");
    drop(dead);
    assert!(path.exists());

    let handle = spawn_counting_worker(address.clone(), cookie_options("c"));
    let profile = cookie_profile("c");
    let mut client = connect_with_retry(&address, &profile).await;

    client
        .send_message(Message::data(json!("work")))
        .await
        .expect("send");
    assert_eq!(
        client.receive_message().await.expect("recv"),
        Message::data(json!({ "seen": 1 }))
    );

    client.stop().await.expect("stop");
    wait_until_stopped(&address, &profile).await;
    drop(client);
    handle.join().expect("worker thread").expect("worker run");
    assert!(!path.exists());
}
