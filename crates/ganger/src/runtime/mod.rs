//! Worker-process runtime: one reactor per process, two terminal modes.
//!
//! **Dedicated mode** wraps the process's stdin/stdout as a single channel
//! to the master. A raw implementation takes the channel and runs; an
//! evented implementation gets callbacks as messages arrive.
//!
//! **Shared mode** binds a server socket (under the cross-process [`Lock`],
//! after consulting the kill switch) and serves any number of clients.
//! Messages on client connections are classified first: a privileged stop
//! request stops listening and invokes `on_stop`, an unprivileged one is
//! swallowed; queries of either privilege are answered with the
//! implementation's status; everything else reaches `on_message`. The
//! runtime stops listening on every exit path, and deletes the unix socket
//! file it created.
//!
//! All callbacks run on the reactor thread; the in-process flags guarding
//! the listening socket are plain single-threaded state. The cross-process
//! bind-or-recover race is the one real hazard, and the [`Lock`] held
//! across kill-switch check and bind closes it.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use ganger_wire::{
    Encoding, Message, MessageChannel, MessageReader, MessageWriter, Reactor, ReactorHandle,
    WireError,
};

use crate::address::SocketAddress;
use crate::admin;
use crate::error::{Result, WorkerError};
use crate::kill_switch::KillSwitch;
use crate::lock::Lock;
use crate::roles::{EventedWorkerImpl, SharedWorkerImpl};
use crate::socket::{self, ServerSocket, SocketContext};

pub mod registry;

pub use registry::{WorkerInstance, WorkerRegistry};

type SharedImpl = Rc<RefCell<Box<dyn SharedWorkerImpl>>>;

/// Settings installed into the runtime before a worker starts.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    pub admin_cookie: Option<String>,
    pub kill_switch_path: Option<PathBuf>,
    pub socket_context: Option<SocketContext>,
    pub encoding: Encoding,
}

struct Listening {
    server: Rc<ServerSocket>,
    accept: AbortHandle,
}

struct RunnerState {
    options: RunnerOptions,
    listening: Option<Listening>,
    to_delete: Option<PathBuf>,
    error: Option<WorkerError>,
}

/// Clonable handle on the running worker process, handed to evented
/// implementations at `initialize` time.
#[derive(Clone)]
pub struct RunnerHandle {
    reactor: ReactorHandle,
    state: Rc<RefCell<RunnerState>>,
}

impl RunnerHandle {
    /// The process's event loop, for registering additional sources.
    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    pub fn admin_cookie(&self) -> Option<String> {
        self.state.borrow().options.admin_cookie.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.state.borrow().listening.is_some()
    }

    /// Stops accepting connections and deletes the unix socket file, if one
    /// was created. Idempotent; existing connections are not touched.
    pub fn stop_listening(&self) {
        let listening = self.state.borrow_mut().listening.take();
        if let Some(listening) = listening {
            debug!(address = %listening.server.address(), "stopped listening");
            listening.accept.abort();
            drop(listening.server);
        }
        let to_delete = self.state.borrow_mut().to_delete.take();
        if let Some(path) = to_delete {
            if let Err(err) = std::fs::remove_file(&path) {
                debug!(file = %path.display(), %err, "could not remove socket file");
            }
        }
    }

    /// Stops the event loop even if sources remain registered.
    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// Records the first fatal error and stops the loop so it can surface.
    fn record_error(&self, error: WorkerError) {
        {
            let mut state = self.state.borrow_mut();
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.reactor.stop();
    }

    fn take_error(&self) -> Option<WorkerError> {
        self.state.borrow_mut().error.take()
    }
}

struct PeerShared {
    sender: mpsc::UnboundedSender<Message>,
    peer_name: Option<String>,
}

/// Write handle on one connected peer, usable from synchronous callbacks.
/// Messages are queued onto the connection's writer task.
#[derive(Clone)]
pub struct PeerHandle {
    shared: Rc<PeerShared>,
}

impl PeerHandle {
    fn new(sender: mpsc::UnboundedSender<Message>, peer_name: Option<String>) -> Self {
        Self {
            shared: Rc::new(PeerShared { sender, peer_name }),
        }
    }

    /// The peer's address string; `None` on the master channel and on
    /// transports without peer names.
    pub fn peer_name(&self) -> Option<&str> {
        self.shared.peer_name.as_deref()
    }

    pub fn send_message(&self, message: Message) -> Result<()> {
        self.shared
            .sender
            .send(message)
            .map_err(|_| WorkerError::Wire(WireError::Closed))
    }
}

/// The per-process worker runtime. Consumed by one of the run methods.
pub struct WorkerRunner {
    reactor: Reactor,
    state: Rc<RefCell<RunnerState>>,
}

impl WorkerRunner {
    pub fn new(options: RunnerOptions) -> Result<Self> {
        crate::status::mark_process_start();
        let reactor = Reactor::new()?;
        let state = Rc::new(RefCell::new(RunnerState {
            options,
            listening: None,
            to_delete: None,
            error: None,
        }));
        Ok(Self { reactor, state })
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            reactor: self.reactor.handle(),
            state: self.state.clone(),
        }
    }

    /// Runs a dedicated worker over the process's own stdin/stdout.
    pub fn run_dedicated(self, instance: WorkerInstance) -> Result<()> {
        let encoding = self.state.borrow().options.encoding;
        let channel = MessageChannel::from_pair(tokio::io::stdin(), tokio::io::stdout(), encoding);
        self.run_dedicated_on(instance, channel)
    }

    /// Runs a dedicated worker over an explicit master channel.
    pub fn run_dedicated_on(self, instance: WorkerInstance, channel: MessageChannel) -> Result<()> {
        match instance {
            WorkerInstance::Raw(mut implementation) => {
                self.reactor.block_on(implementation.run(channel))
            }
            WorkerInstance::Evented(implementation) => {
                self.drive_master_channel(implementation, channel)
            }
            WorkerInstance::Shared(implementation) => {
                self.drive_master_channel(implementation, channel)
            }
        }
    }

    /// Runs a shared worker bound to `address` until the last source drains
    /// or a fatal error stops the loop.
    pub fn run_shared(
        self,
        implementation: Box<dyn SharedWorkerImpl>,
        address: &SocketAddress,
    ) -> Result<()> {
        let handle = self.handle();
        let implementation: SharedImpl = Rc::new(RefCell::new(implementation));
        let encoding = self.state.borrow().options.encoding;

        self.reactor.block_on(start_listening(
            &handle,
            implementation.clone(),
            address,
            encoding,
        ))?;
        info!(address = %address, "shared worker listening");

        let mut result = implementation.borrow_mut().initialize(&handle);
        if result.is_ok() {
            self.reactor.run();
            result = handle.take_error().map_or(Ok(()), Err);
        }
        let result = match result {
            Ok(()) => implementation.borrow_mut().terminate(),
            Err(err) => Err(err),
        };
        handle.stop_listening();
        info!(address = %address, "shared worker finished");
        result
    }

    fn drive_master_channel<W>(self, implementation: Box<W>, channel: MessageChannel) -> Result<()>
    where
        W: EventedWorkerImpl + ?Sized + 'static,
    {
        let handle = self.handle();
        let implementation = Rc::new(RefCell::new(implementation));
        let (reader, writer) = channel.into_split();
        let (sender, outgoing) = mpsc::unbounded_channel();
        handle.reactor().spawn_detached(write_outgoing(writer, outgoing));
        let peer = PeerHandle::new(sender, None);

        {
            let implementation = implementation.clone();
            let handle = handle.clone();
            let peer = peer.clone();
            self.reactor.handle().spawn_source(async move {
                drive_evented_reader(implementation, handle, reader, peer).await;
            });
        }

        let mut result = implementation.borrow_mut().initialize(&handle);
        if result.is_ok() {
            result = implementation.borrow_mut().on_connect(&peer);
        }
        if result.is_ok() {
            self.reactor.run();
            result = handle.take_error().map_or(Ok(()), Err);
        }
        match result {
            Ok(()) => implementation.borrow_mut().terminate(),
            Err(err) => Err(err),
        }
    }
}

/// Kill-switch check, socket-directory creation, and bind, all under one
/// cross-process lock. The lock is released only once the bind attempt has
/// completed, success or failure.
async fn start_listening(
    handle: &RunnerHandle,
    implementation: SharedImpl,
    address: &SocketAddress,
    encoding: Encoding,
) -> Result<()> {
    let mut lock = Lock::acquire()?;
    let (kill_switch_path, context) = {
        let state = handle.state.borrow();
        (
            state.options.kill_switch_path.clone(),
            state.options.socket_context.clone(),
        )
    };
    if let Some(path) = kill_switch_path {
        let switch = KillSwitch::load(path);
        if switch.global() || switch.has_address(address) {
            return Err(WorkerError::Runtime(
                "this worker has been prevented from starting using the kill switch".to_owned(),
            ));
        }
    }
    if let Some(file) = address.socket_file() {
        if let Some(dir) = file.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
    }
    let server = socket::create_server_socket(address, context.as_ref()).await?;
    lock.release();

    let server = Rc::new(server);
    let accept = handle.reactor().spawn_source(accept_connections(
        implementation,
        handle.clone(),
        server.clone(),
        encoding,
    ));
    let mut state = handle.state.borrow_mut();
    state.to_delete = address.socket_file();
    state.listening = Some(Listening { server, accept });
    Ok(())
}

async fn accept_connections(
    implementation: SharedImpl,
    handle: RunnerHandle,
    server: Rc<ServerSocket>,
    encoding: Encoding,
) {
    loop {
        match server.accept().await {
            Ok((stream, peer_name)) => {
                debug!(peer = ?peer_name, "accepted connection");
                let (reader, writer) = MessageChannel::new(stream, encoding).into_split();
                let (sender, outgoing) = mpsc::unbounded_channel();
                handle.reactor().spawn_detached(write_outgoing(writer, outgoing));
                let peer = PeerHandle::new(sender, peer_name);
                handle.reactor().spawn_source(serve_connection(
                    implementation.clone(),
                    handle.clone(),
                    reader,
                    peer.clone(),
                ));
                let result = implementation.borrow_mut().on_connect(&peer);
                if let Err(err) = result {
                    handle.record_error(err);
                    return;
                }
            }
            Err(err) => {
                warn!(%err, "could not accept a connection");
                // back off so a persistent accept failure cannot spin
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Per-connection receive loop of a shared worker. A closed peer triggers
/// the disconnect callback; a malformed or oversized message drops only
/// this connection, not the whole worker.
async fn serve_connection(
    implementation: SharedImpl,
    handle: RunnerHandle,
    mut reader: MessageReader,
    peer: PeerHandle,
) {
    loop {
        match reader.recv().await {
            Ok(message) => {
                if let Err(err) = dispatch_shared(&implementation, &handle, message, &peer) {
                    handle.record_error(err);
                    return;
                }
            }
            Err(WireError::Closed) => break,
            Err(err) => {
                warn!(peer = ?peer.peer_name(), %err, "dropping connection after receive error");
                break;
            }
        }
    }
    let result = implementation.borrow_mut().on_disconnect(&peer);
    if let Err(err) = result {
        handle.record_error(err);
    }
}

/// Admin classification happens before the implementation sees anything:
/// stop requests never reach `on_message`, and queries are answered here.
fn dispatch_shared(
    implementation: &SharedImpl,
    handle: &RunnerHandle,
    message: Message,
    peer: &PeerHandle,
) -> Result<()> {
    let cookie = handle.admin_cookie();
    if let Some(privileged) = admin::stop_request(&message, cookie.as_deref()) {
        if privileged {
            info!(peer = ?peer.peer_name(), "received a privileged stop request");
            let mut lock = Lock::acquire()?;
            handle.stop_listening();
            implementation.borrow_mut().on_stop();
            lock.release();
        } else {
            debug!(peer = ?peer.peer_name(), "ignoring an unprivileged stop request");
        }
        Ok(())
    } else if let Some(privileged) = admin::query_request(&message, cookie.as_deref()) {
        let status = implementation.borrow_mut().on_query(privileged);
        if let Err(err) = peer.send_message(admin::status_message(&status)?) {
            debug!(peer = ?peer.peer_name(), %err, "could not answer a query");
        }
        Ok(())
    } else {
        implementation.borrow_mut().on_message(message, peer)
    }
}

/// Per-connection receive loop of a dedicated evented worker. No admin
/// classification here; everything goes to `on_message`.
async fn drive_evented_reader<W>(
    implementation: Rc<RefCell<Box<W>>>,
    handle: RunnerHandle,
    mut reader: MessageReader,
    peer: PeerHandle,
) where
    W: EventedWorkerImpl + ?Sized,
{
    loop {
        match reader.recv().await {
            Ok(message) => {
                let result = implementation.borrow_mut().on_message(message, &peer);
                if let Err(err) = result {
                    handle.record_error(err);
                    return;
                }
            }
            Err(WireError::Closed) => break,
            Err(err) => {
                handle.record_error(err.into());
                return;
            }
        }
    }
    let result = implementation.borrow_mut().on_disconnect(&peer);
    if let Err(err) = result {
        handle.record_error(err);
    }
}

/// Drains queued outgoing messages onto the wire. Exits when every handle
/// on the queue is gone or the peer stops accepting writes.
async fn write_outgoing(mut writer: MessageWriter, mut outgoing: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outgoing.recv().await {
        if let Err(err) = writer.send(message).await {
            debug!(%err, "peer write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::roles::RawWorkerImpl;

    struct AddOne;

    impl EventedWorkerImpl for AddOne {
        fn on_message(&mut self, message: Message, peer: &PeerHandle) -> Result<()> {
            let n = message
                .payload()
                .and_then(|payload| payload.get("n"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            peer.send_message(Message::data(json!({ "n": n + 1 })))?;
            Ok(())
        }
    }

    struct EchoOnce;

    #[async_trait::async_trait(?Send)]
    impl RawWorkerImpl for EchoOnce {
        async fn run(&mut self, mut channel: MessageChannel) -> Result<()> {
            let message = channel.recv().await?;
            channel.send(message).await?;
            Ok(())
        }
    }

    fn master_thread(
        io: tokio::io::DuplexStream,
        body: impl FnOnce(MessageChannel) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()>>>
        + Send
        + 'static,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            let local = tokio::task::LocalSet::new();
            rt.block_on(local.run_until(body(MessageChannel::new(io, Encoding::Framed))));
        })
    }

    #[test]
    fn test_dedicated_evented_worker_answers_and_exits() {
        let (master_io, worker_io) = tokio::io::duplex(4096);
        let master = master_thread(master_io, |mut channel| {
            Box::pin(async move {
                channel
                    .send(Message::data(json!({ "n": 41 })))
                    .await
                    .expect("send");
                let reply = channel.recv().await.expect("recv");
                assert_eq!(reply, Message::data(json!({ "n": 42 })));
            })
        });

        let runner = WorkerRunner::new(RunnerOptions::default()).expect("runner");
        let channel = MessageChannel::new(worker_io, Encoding::Framed);
        runner
            .run_dedicated_on(WorkerInstance::Evented(Box::new(AddOne)), channel)
            .expect("worker run");
        master.join().expect("master thread");
    }

    #[test]
    fn test_dedicated_raw_worker_owns_the_channel() {
        let (master_io, worker_io) = tokio::io::duplex(4096);
        let master = master_thread(master_io, |mut channel| {
            Box::pin(async move {
                channel
                    .send(Message::data(json!("ping")))
                    .await
                    .expect("send");
                let reply = channel.recv().await.expect("recv");
                assert_eq!(reply, Message::data(json!("ping")));
            })
        });

        let runner = WorkerRunner::new(RunnerOptions::default()).expect("runner");
        let channel = MessageChannel::new(worker_io, Encoding::Framed);
        runner
            .run_dedicated_on(WorkerInstance::Raw(Box::new(EchoOnce)), channel)
            .expect("worker run");
        master.join().expect("master thread");
    }
}
