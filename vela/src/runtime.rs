use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use proto::{
    CommandToken, Config, DeviceHandle, DeviceSummary, Endpoint, Event, HostPorts, State, Transmit,
};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::task::{spawn_local, JoinHandle, LocalSet};
use tracing::{debug, error, trace, warn};

use crate::sdk::{ClosedError, Completion, DeviceEvent, EventHandler, FrameConsumer};
use crate::socket;

/// Work a client thread runs on the I/O thread
pub(crate) type LoopFn = Box<dyn FnOnce(&mut Inner) + Send>;

enum Control {
    Post(LoopFn),
    Quit,
}

/// Inbound datagram tagged with the socket it arrived on
enum Ingress {
    Discovery {
        remote: SocketAddr,
        datagram: Vec<u8>,
    },
    Command {
        handle: DeviceHandle,
        remote: SocketAddr,
        datagram: Vec<u8>,
    },
    Data {
        handle: DeviceHandle,
        remote: SocketAddr,
        datagram: Vec<u8>,
    },
}

/// Owner of the I/O thread
///
/// All protocol state lives on that thread; client threads reach it by
/// posting closures. Dropping the handle tears sessions down and stops the
/// thread.
#[derive(Debug)]
pub(crate) struct EventLoop {
    control: mpsc::UnboundedSender<Control>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Bind the announcement listener and launch the I/O thread
    ///
    /// Blocks until the thread's reactor is running; also returns the local
    /// address of the announcement socket.
    pub(crate) fn spawn(config: Arc<Config>, announce_port: u16) -> io::Result<(Self, SocketAddr)> {
        let discovery = socket::bind_discovery(announce_port)?;
        let local_addr = discovery.local_addr()?;
        let (control, control_rx) = mpsc::unbounded_channel();
        let (ready, ready_rx) = std::sync::mpsc::sync_channel(1);
        let thread = thread::Builder::new()
            .name("vela-io".into())
            .spawn(move || io_thread(config, discovery, control_rx, ready))?;
        match ready_rx.recv() {
            Ok(Ok(())) => Ok((
                Self {
                    control,
                    thread: Some(thread),
                },
                local_addr,
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "I/O thread died during startup",
                ))
            }
        }
    }

    /// Run `work` on the I/O thread
    ///
    /// A refused post drops `work`; completion guards captured inside then
    /// report `Closed` from the calling thread.
    pub(crate) fn post(&self, work: LoopFn) -> Result<(), ClosedError> {
        self.control
            .send(Control::Post(work))
            .map_err(|_| ClosedError)
    }

    /// Stop the I/O thread and wait for it to quiesce; idempotent
    pub(crate) fn shutdown(&mut self) {
        let _ = self.control.send(Control::Quit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("I/O thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn io_thread(
    config: Arc<Config>,
    discovery: std::net::UdpSocket,
    control: mpsc::UnboundedReceiver<Control>,
    ready: std::sync::mpsc::SyncSender<io::Result<()>>,
) {
    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    // Reader tasks never outlive this; dropping the set cancels them
    let tasks = LocalSet::new();
    tasks.block_on(&runtime, run(config, discovery, control, ready));
}

async fn run(
    config: Arc<Config>,
    discovery: std::net::UdpSocket,
    mut control: mpsc::UnboundedReceiver<Control>,
    ready: std::sync::mpsc::SyncSender<io::Result<()>>,
) {
    let discovery = match UdpSocket::from_std(discovery) {
        Ok(socket) => Rc::new(socket),
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let (ingress, mut ingress_rx) = mpsc::unbounded_channel();
    let mut inner = Inner::new(config, ingress.clone());
    spawn_local(read_socket(discovery, ingress, |remote, datagram| {
        Ingress::Discovery { remote, datagram }
    }));
    let _ = ready.send(Ok(()));
    debug!("I/O thread running");

    loop {
        inner.flush();
        let deadline = inner.endpoint.poll_timeout();
        tokio::select! {
            msg = control.recv() => match msg {
                Some(Control::Post(work)) => work(&mut inner),
                Some(Control::Quit) | None => break,
            },
            msg = ingress_rx.recv() => {
                if let Some(msg) = msg {
                    inner.handle_ingress(msg);
                }
            }
            () = sleep(deadline) => inner.endpoint.handle_timeout(Instant::now()),
        }
    }

    // Work queued behind the quit request still runs; its commands are then
    // cancelled along with everything outstanding
    while let Ok(Control::Post(work)) = control.try_recv() {
        work(&mut inner);
    }
    inner.endpoint.shutdown(Instant::now());
    inner.flush();
    debug!("I/O thread stopped");
}

/// Sleep until `deadline`, or forever without one
async fn sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending::<()>().await,
    }
}

/// Feed one socket's datagrams into the ingress queue
async fn read_socket(
    socket: Rc<UdpSocket>,
    ingress: mpsc::UnboundedSender<Ingress>,
    wrap: impl Fn(SocketAddr, Vec<u8>) -> Ingress,
) {
    let mut buf = vec![0; u16::MAX as usize];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, remote)) => {
                if ingress.send(wrap(remote, buf[..len].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms; not fatal
                debug!(error = %e, "receive error");
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Sockets and reader tasks backing one device's session
struct DeviceIo {
    cmd: Rc<UdpSocket>,
    readers: [JoinHandle<()>; 2],
}

impl Drop for DeviceIo {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum ConnectError {
    #[error("lane socket setup: {0}")]
    Socket(#[from] io::Error),
    #[error(transparent)]
    Proto(#[from] proto::ConnectError),
}

/// Protocol endpoint plus the sockets and callbacks it drives
///
/// Lives on the I/O thread; client threads mutate it only through posted
/// closures.
pub(crate) struct Inner {
    endpoint: Endpoint,
    ingress: mpsc::UnboundedSender<Ingress>,
    lanes: FxHashMap<DeviceHandle, DeviceIo>,
    completions: FxHashMap<CommandToken, Completion>,
    consumers: FxHashMap<DeviceHandle, FrameConsumer>,
    handler: Option<EventHandler>,
    auto_connect: bool,
}

impl Inner {
    fn new(config: Arc<Config>, ingress: mpsc::UnboundedSender<Ingress>) -> Self {
        let auto_connect = config.get_auto_connect();
        let mut endpoint = Endpoint::new(config);
        // Announcements wait until the client calls start
        endpoint.stop_discovery();
        Self {
            endpoint,
            ingress,
            lanes: FxHashMap::default(),
            completions: FxHashMap::default(),
            consumers: FxHashMap::default(),
            handler: None,
            auto_connect,
        }
    }

    /// Drain the endpoint until it goes quiet
    ///
    /// Transmits drain before events, so parting datagrams leave on sockets
    /// the event side may close. Dispatch can queue further transmits, hence
    /// the outer loop.
    fn flush(&mut self) {
        loop {
            let mut idle = true;
            while let Some(transmit) = self.endpoint.poll_transmit() {
                idle = false;
                self.transmit(transmit);
            }
            while let Some(event) = self.endpoint.poll_event() {
                idle = false;
                self.dispatch(event);
            }
            if idle {
                return;
            }
        }
    }

    fn transmit(&mut self, transmit: Transmit) {
        let Some(io) = self.lanes.get(&transmit.handle) else {
            trace!(handle = ?transmit.handle, "transmit after lane close");
            return;
        };
        match io.cmd.try_send_to(&transmit.contents, transmit.destination) {
            Ok(_) => trace!(
                destination = %transmit.destination,
                len = transmit.contents.len(),
                "datagram sent"
            ),
            Err(e) => warn!(destination = %transmit.destination, error = %e, "send failed"),
        }
    }

    /// Translate one protocol event into client callbacks
    fn dispatch(&mut self, event: Event) {
        match event {
            Event::DeviceFound { handle, summary } => {
                if self.auto_connect {
                    if let Err(e) = self.connect(handle) {
                        warn!(device = %summary.serial, error = %e, "automatic connect failed");
                    }
                }
                self.emit(DeviceEvent::Found { handle, summary });
            }
            Event::StateChanged { handle, old, new } => {
                if new == State::Disconnected {
                    self.close_device(handle);
                }
                self.emit(DeviceEvent::StateChanged { handle, old, new });
            }
            Event::DeviceLost { handle, reason } => {
                self.emit(DeviceEvent::Lost { handle, reason });
            }
            Event::DeviceRemoved { handle } => {
                self.emit(DeviceEvent::Removed { handle });
            }
            Event::CommandComplete {
                handle,
                token,
                result,
            } => match self.completions.remove(&token) {
                Some(completion) => completion.complete(result.map_err(Into::into)),
                None => debug!(?handle, ?token, "completion without a caller"),
            },
            Event::Frame { handle, frame } => match self.consumers.get_mut(&handle) {
                Some(consumer) => consumer(frame),
                None => trace!(?handle, "frame without a consumer"),
            },
            Event::SamplingRejected { handle, error } => {
                self.consumers.remove(&handle);
                self.emit(DeviceEvent::SamplingRejected { handle, error });
            }
        }
    }

    fn emit(&mut self, event: DeviceEvent) {
        match &mut self.handler {
            Some(handler) => handler(event),
            None => trace!(?event, "event dropped, no handler registered"),
        }
    }

    fn close_device(&mut self, handle: DeviceHandle) {
        if self.lanes.remove(&handle).is_some() {
            debug!(?handle, "lanes closed");
        }
        self.consumers.remove(&handle);
    }

    /// Bind a command and a data lane for `handle` and begin its handshake
    fn connect(&mut self, handle: DeviceHandle) -> Result<(), ConnectError> {
        let summary = self
            .endpoint
            .device(handle)
            .ok_or(proto::ConnectError::UnknownDevice)?;
        let ip = socket::route_local_ip(summary.address)?;
        let cmd = socket::bind_lane(ip)?;
        let data = socket::bind_lane(ip)?;
        let host = HostPorts {
            ip,
            cmd_port: cmd.local_addr()?.port(),
            data_port: data.local_addr()?.port(),
        };
        let cmd = Rc::new(UdpSocket::from_std(cmd)?);
        let data = Rc::new(UdpSocket::from_std(data)?);
        self.endpoint.connect(Instant::now(), handle, host)?;
        debug!(
            device = %summary.serial,
            cmd_port = host.cmd_port,
            data_port = host.data_port,
            "lanes bound"
        );
        let readers = [
            spawn_local(read_socket(
                cmd.clone(),
                self.ingress.clone(),
                move |remote, datagram| Ingress::Command {
                    handle,
                    remote,
                    datagram,
                },
            )),
            spawn_local(read_socket(
                data,
                self.ingress.clone(),
                move |remote, datagram| Ingress::Data {
                    handle,
                    remote,
                    datagram,
                },
            )),
        ];
        self.lanes.insert(handle, DeviceIo { cmd, readers });
        Ok(())
    }

    fn handle_ingress(&mut self, msg: Ingress) {
        let now = Instant::now();
        match msg {
            Ingress::Discovery { remote, datagram } => {
                self.endpoint.handle_discovery_datagram(now, remote, &datagram);
            }
            Ingress::Command {
                handle,
                remote,
                datagram,
            } => {
                self.endpoint
                    .handle_command_datagram(now, handle, remote, &datagram);
            }
            Ingress::Data {
                handle,
                remote,
                datagram,
            } => {
                self.endpoint
                    .handle_data_datagram(now, handle, remote, &datagram);
            }
        }
    }

    pub(crate) fn start_discovery(&mut self) {
        self.endpoint.start_discovery();
    }

    pub(crate) fn set_handler(&mut self, handler: EventHandler) {
        self.handler = Some(handler);
    }

    pub(crate) fn devices(&self) -> Vec<(DeviceHandle, DeviceSummary)> {
        self.endpoint.devices()
    }

    /// Bind lanes and start the handshake, reporting refusal in the log
    pub(crate) fn request_connect(&mut self, handle: DeviceHandle) {
        if let Err(e) = self.connect(handle) {
            warn!(?handle, error = %e, "connect failed");
        }
    }

    pub(crate) fn disconnect(&mut self, handle: DeviceHandle) {
        if let Err(e) = self.endpoint.disconnect(Instant::now(), handle) {
            debug!(?handle, error = %e, "disconnect refused");
        }
    }

    pub(crate) fn send_command(
        &mut self,
        handle: DeviceHandle,
        code: u16,
        body: Bytes,
        timeout: Option<Duration>,
        completion: Completion,
    ) {
        match self
            .endpoint
            .send_command(Instant::now(), handle, code, body, timeout)
        {
            Ok(token) => {
                self.completions.insert(token, completion);
            }
            Err(e) => completion.complete(Err(e.into())),
        }
    }

    /// Ask the device to stream points into `consumer`
    ///
    /// The consumer is registered only on acceptance, so a refused request
    /// cannot displace one already streaming.
    pub(crate) fn start_sampling(&mut self, handle: DeviceHandle, consumer: FrameConsumer) {
        match self.endpoint.start_sampling(Instant::now(), handle) {
            Ok(()) => {
                self.consumers.insert(handle, consumer);
            }
            Err(e) => warn!(?handle, error = %e, "start sampling refused"),
        }
    }

    pub(crate) fn stop_sampling(&mut self, handle: DeviceHandle) {
        if let Err(e) = self.endpoint.stop_sampling(Instant::now(), handle) {
            debug!(?handle, error = %e, "stop sampling refused");
        }
    }
}
