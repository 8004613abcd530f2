//! Shared worker client: connect to a daemon, or launch it and connect.
//!
//! The connect-or-launch protocol: try once with the default timeout; on a
//! connection failure, launch the daemon (refusing to launch anything for a
//! non-local address) and retry every 200ms for up to 10 seconds, then make
//! one final attempt that fails normally. Administrative operations require
//! the profile's admin cookie; there is no anonymous stop or query.
//!
//! Received messages can be pushed back into a lookahead queue with
//! [`SharedWorker::unreceive_message`]; [`SharedWorker::receive_message`]
//! drains that queue before touching the wire.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info};

use ganger_wire::{Message, MessageChannel};

use crate::address::SocketAddress;
use crate::admin;
use crate::bootstrap::{BootstrapProfile, CompiledScript};
use crate::client::worker::remove_script;
use crate::error::{Result, WorkerError};
use crate::socket::create_client_socket;
use crate::status::WorkerStatus;

const CONNECT_ATTEMPTS: u32 = 50;
const RETRY_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// A connection to a shared worker daemon.
pub struct SharedWorker {
    address: SocketAddress,
    admin_cookie: Option<String>,
    channel: MessageChannel,
    unreceived: VecDeque<Message>,
    process_id: Option<Option<u32>>,
}

impl SharedWorker {
    /// Connects to the worker listening on `address`; never launches one.
    pub async fn connect(address: SocketAddress, profile: &BootstrapProfile) -> Result<Self> {
        Self::connect_with(address, profile, None).await
    }

    /// Connects to the worker on `address`, launching a `type_name` daemon
    /// there first if nothing answers.
    pub async fn connect_or_launch(
        address: SocketAddress,
        profile: &BootstrapProfile,
        type_name: &str,
    ) -> Result<Self> {
        let expression = profile.generate_expression(type_name);
        Self::connect_with(address, profile, Some(&expression)).await
    }

    pub async fn connect_or_launch_with_expression(
        address: SocketAddress,
        profile: &BootstrapProfile,
        expression: &str,
    ) -> Result<Self> {
        Self::connect_with(address, profile, Some(expression)).await
    }

    async fn connect_with(
        address: SocketAddress,
        profile: &BootstrapProfile,
        launch_expression: Option<&str>,
    ) -> Result<Self> {
        let channel = match open_channel(&address, profile, None).await {
            Ok(channel) => channel,
            Err(err) if err.is_connect() => match launch_expression {
                Some(expression) => {
                    launch(&address, profile, expression, Some(err)).await?;
                    reconnect(&address, profile).await?
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        };
        Ok(Self {
            address,
            admin_cookie: profile.admin_cookie().map(str::to_owned),
            channel,
            unreceived: VecDeque::new(),
            process_id: None,
        })
    }

    /// Launches the daemon without connecting to it.
    pub async fn start(
        address: &SocketAddress,
        profile: &BootstrapProfile,
        type_name: &str,
    ) -> Result<()> {
        launch(address, profile, &profile.generate_expression(type_name), None).await
    }

    pub async fn start_with_expression(
        address: &SocketAddress,
        profile: &BootstrapProfile,
        expression: &str,
    ) -> Result<()> {
        launch(address, profile, expression, None).await
    }

    /// Asks the worker on `address` to stop. Returns `false` when nothing is
    /// listening there, which counts as already stopped.
    pub async fn stop_worker(address: &SocketAddress, profile: &BootstrapProfile) -> Result<bool> {
        let cookie = require_cookie(profile.admin_cookie(), "stop")?;
        let mut channel = match open_channel(address, profile, None).await {
            Ok(channel) => channel,
            Err(err) if err.is_connect() => return Ok(false),
            Err(err) => return Err(err),
        };
        channel.send(admin::stop_message(Some(&cookie))).await?;
        Ok(true)
    }

    /// Queries the worker on `address` over a dedicated connection.
    pub async fn query_worker(
        address: &SocketAddress,
        profile: &BootstrapProfile,
    ) -> Result<WorkerStatus> {
        let cookie = require_cookie(profile.admin_cookie(), "query")?;
        let mut channel = open_channel(address, profile, None).await?;
        channel.send(admin::query_message(Some(&cookie))).await?;
        loop {
            let message = channel.recv().await?;
            if let Some(status) = admin::status_reply(&message) {
                return Ok(status);
            }
        }
    }

    /// Best-effort process id of whatever listens on `address`.
    pub async fn worker_process_id(address: &SocketAddress) -> Result<Option<u32>> {
        address.listening_process_id().await
    }

    pub fn socket_address(&self) -> &SocketAddress {
        &self.address
    }

    /// The connected worker's process id, looked up once and cached.
    pub async fn process_id(&mut self) -> Result<Option<u32>> {
        if let Some(cached) = self.process_id {
            return Ok(cached);
        }
        let pid = self.address.listening_process_id().await?;
        self.process_id = Some(pid);
        Ok(pid)
    }

    /// Asks the connected worker to stop listening.
    pub async fn stop(&mut self) -> Result<()> {
        let cookie = require_cookie(self.admin_cookie.as_deref(), "stop")?;
        self.channel.send(admin::stop_message(Some(&cookie))).await?;
        Ok(())
    }

    /// Queries the connected worker. Application messages received while
    /// waiting for the status reply land in the lookahead queue; a status
    /// already queued there satisfies the query without touching the wire.
    pub async fn query(&mut self) -> Result<WorkerStatus> {
        let cookie = require_cookie(self.admin_cookie.as_deref(), "query")?;
        self.channel.send(admin::query_message(Some(&cookie))).await?;
        for index in 0..self.unreceived.len() {
            if let Some(status) = admin::status_reply(&self.unreceived[index]) {
                self.unreceived.remove(index);
                return Ok(status);
            }
        }
        loop {
            let message = self.channel.recv().await?;
            match admin::status_reply(&message) {
                Some(status) => return Ok(status),
                None => self.unreceived.push_back(message),
            }
        }
    }

    pub async fn send_message(&mut self, message: Message) -> Result<()> {
        Ok(self.channel.send(message).await?)
    }

    /// Receives the next message, draining the lookahead queue first.
    pub async fn receive_message(&mut self) -> Result<Message> {
        if let Some(message) = self.unreceived.pop_front() {
            return Ok(message);
        }
        Ok(self.channel.recv().await?)
    }

    /// Receives from the wire even when the lookahead queue holds messages.
    pub async fn receive_message_directly(&mut self) -> Result<Message> {
        Ok(self.channel.recv().await?)
    }

    /// Queues `message` for a later [`SharedWorker::receive_message`].
    pub fn unreceive_message(&mut self, message: Message) {
        self.unreceived.push_back(message);
    }

    pub fn unreceived_message_count(&self) -> usize {
        self.unreceived.len()
    }

    pub fn peek_unreceived_messages(&self) -> impl Iterator<Item = &Message> {
        self.unreceived.iter()
    }

    pub fn remove_unreceived_message(&mut self, index: usize) -> Result<Message> {
        let len = self.unreceived.len();
        self.unreceived
            .remove(index)
            .ok_or(WorkerError::OutOfRange { index, len })
    }
}

impl std::fmt::Debug for SharedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWorker")
            .field("address", &self.address)
            .field("unreceived", &self.unreceived.len())
            .finish_non_exhaustive()
    }
}

async fn open_channel(
    address: &SocketAddress,
    profile: &BootstrapProfile,
    timeout: Option<Duration>,
) -> Result<MessageChannel> {
    let stream = create_client_socket(address, timeout, profile.socket_context()).await?;
    Ok(MessageChannel::new(stream, profile.encoding()))
}

/// Starts the daemon detached: no pipes, no kill on drop, stdio to the null
/// device. On launch failure a freshly written launcher document is removed;
/// a successfully launched daemon removes its own.
async fn launch(
    address: &SocketAddress,
    profile: &BootstrapProfile,
    expression: &str,
    connect_error: Option<WorkerError>,
) -> Result<()> {
    if !address.is_local() {
        return Err(match connect_error {
            Some(err) => err,
            None => WorkerError::Logic(
                "can't start the worker, because its socket address is not local".to_owned(),
            ),
        });
    }
    let compiled = profile.compile_script_with_expression(expression, Some(address))?;
    let result = spawn_detached(profile, &compiled);
    if result.is_err() && compiled.delete_on_error {
        remove_script(&compiled.path);
    }
    result
}

fn spawn_detached(profile: &BootstrapProfile, compiled: &CompiledScript) -> Result<()> {
    let mut command = profile.runner_command(&compiled.path)?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = command.spawn()?;
    info!(script = %compiled.path.display(), pid = child.id(), "launched a shared worker");
    drop(child);
    Ok(())
}

async fn reconnect(address: &SocketAddress, profile: &BootstrapProfile) -> Result<MessageChannel> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match open_channel(address, profile, Some(RETRY_CONNECT_TIMEOUT)).await {
            Ok(channel) => return Ok(channel),
            Err(err) if err.is_connect() => {
                debug!(%address, attempt, "worker not answering yet");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
    // Last resort, with the default timeout and no swallowing.
    open_channel(address, profile, None).await
}

fn require_cookie(cookie: Option<&str>, operation: &str) -> Result<String> {
    cookie.map(str::to_owned).ok_or_else(|| {
        WorkerError::Logic(format!(
            "cannot {operation} a shared worker without an admin cookie"
        ))
    })
}

#[cfg(test)]
mod tests {
    use ganger_wire::Encoding;

    use super::*;
    use crate::socket::create_server_socket;
    use crate::status::WorkerCounter;

    async fn connected_pair(profile: &BootstrapProfile) -> (SharedWorker, MessageChannel) {
        let dir = tempfile::tempdir().expect("tempdir");
        let address =
            SocketAddress::new(format!("unix://{}", dir.path().join("w.sock").display()));
        let server = create_server_socket(&address, None).await.expect("bind");
        let (worker, accepted) = tokio::join!(
            SharedWorker::connect(address.clone(), profile),
            server.accept()
        );
        let (stream, _) = accepted.expect("accept");
        (
            worker.expect("connect"),
            MessageChannel::new(stream, Encoding::Framed),
        )
    }

    #[tokio::test]
    async fn test_connect_without_launching_surfaces_the_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let address =
            SocketAddress::new(format!("unix://{}", dir.path().join("absent.sock").display()));
        let err = SharedWorker::connect(address, &BootstrapProfile::new())
            .await
            .expect_err("nothing listens");
        assert!(err.is_connect());
    }

    #[tokio::test]
    async fn test_launching_a_remote_address_is_refused() {
        let err = SharedWorker::start(
            &SocketAddress::from("tcp://worker-3.example.net:2017"),
            &BootstrapProfile::new(),
            "Anything",
        )
        .await
        .expect_err("remote launch");
        assert!(matches!(err, WorkerError::Logic(_)));
    }

    #[tokio::test]
    async fn test_stop_and_query_require_a_cookie() {
        let profile = BootstrapProfile::new();
        let (mut worker, _server) = connected_pair(&profile).await;

        let err = worker.stop().await.expect_err("no cookie");
        assert!(matches!(err, WorkerError::Logic(_)));
        let err = worker.query().await.expect_err("no cookie");
        assert!(matches!(err, WorkerError::Logic(_)));
    }

    #[tokio::test]
    async fn test_stopping_an_absent_worker_reports_false() {
        let dir = tempfile::tempdir().expect("tempdir");
        let address =
            SocketAddress::new(format!("unix://{}", dir.path().join("gone.sock").display()));
        let mut profile = BootstrapProfile::new();
        profile.set_admin_cookie(Some("c".to_owned()));

        let stopped = SharedWorker::stop_worker(&address, &profile)
            .await
            .expect("stop");
        assert!(!stopped);
    }

    #[tokio::test]
    async fn test_lookahead_queue_is_fifo() {
        let profile = BootstrapProfile::new();
        let (mut worker, mut server) = connected_pair(&profile).await;

        server
            .send(Message::data(serde_json::json!("wire")))
            .await
            .expect("send");
        worker.unreceive_message(Message::data(serde_json::json!("first")));
        worker.unreceive_message(Message::data(serde_json::json!("second")));

        assert_eq!(worker.unreceived_message_count(), 2);
        assert_eq!(
            worker.receive_message().await.expect("recv"),
            Message::data(serde_json::json!("first"))
        );
        assert_eq!(
            worker.receive_message().await.expect("recv"),
            Message::data(serde_json::json!("second"))
        );
        assert_eq!(
            worker.receive_message().await.expect("recv"),
            Message::data(serde_json::json!("wire"))
        );
    }

    #[tokio::test]
    async fn test_query_takes_a_queued_status_and_keeps_the_rest() {
        let mut profile = BootstrapProfile::new();
        profile.set_admin_cookie(Some("c".to_owned()));
        let (mut worker, _server) = connected_pair(&profile).await;

        let status = WorkerStatus::new(
            Some("crunching".to_owned()),
            vec![WorkerCounter::new("jobs", 2.0)],
        );
        worker.unreceive_message(Message::data(serde_json::json!(1)));
        worker.unreceive_message(admin::status_message(&status).expect("status message"));

        let got = worker.query().await.expect("query");
        assert_eq!(got, status);
        assert_eq!(worker.unreceived_message_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_unreceived_message_checks_the_index() {
        let profile = BootstrapProfile::new();
        let (mut worker, _server) = connected_pair(&profile).await;

        worker.unreceive_message(Message::data(serde_json::json!(1)));
        let err = worker.remove_unreceived_message(3).expect_err("bad index");
        assert!(matches!(
            err,
            WorkerError::OutOfRange { index: 3, len: 1 }
        ));
        worker.remove_unreceived_message(0).expect("good index");
        assert_eq!(worker.unreceived_message_count(), 0);
    }
}
