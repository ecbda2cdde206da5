//! The proxy core: a single-threaded readiness loop over one `mio::Poll`
//! that owns every descriptor (sensor links, listening sockets, clients)
//! and drives heartbeat, reconnect, RPC remapping, hub routing and the
//! shutdown drain.

use crate::hub::Hub;
use crate::remap::RemapTable;
use crate::websock;
use crate::websock::Upgrade;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::SIGINT;
use signal_hook_mio::v0_8::Signals;
use slog::{debug, error, info, Logger};
use std::io;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tio::link::{is_wouldblock, LinkError};
use tio::packet::{Packet, PTYPE_LOG, PTYPE_RPC_ERROR, PTYPE_RPC_REP, PTYPE_RPC_REQ, PTYPE_TEXT};
use tio::rpc;
use tio::rpc::ErrorCode;
use tio::transport::{OpenError, Transport};
use tio::{logpkt, TCP_DEFAULT_PORT, WS_DEFAULT_PORT};

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);
const INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);

pub struct Config {
    pub tcp_port: u16,
    pub ws_port: u16,
    pub forward: bool,
    pub hub: bool,
    pub max_clients: usize,
    pub max_rpcs: u16,
    pub hub_id: String,
    pub ipv4_only: bool,
    /// Seconds a dead sensor may spend reconnecting before the proxy
    /// gives up; 0 makes any sensor I/O error fatal immediately.
    pub reconnect_timeout: u64,
    pub sensor_urls: Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            tcp_port: TCP_DEFAULT_PORT,
            ws_port: WS_DEFAULT_PORT,
            forward: false,
            hub: false,
            max_clients: 64,
            max_rpcs: 64,
            hub_id: String::new(),
            ipv4_only: false,
            reconnect_timeout: 60,
            sensor_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to open sensor '{url}': {source}")]
    Sensor { url: String, source: OpenError },
    #[error("Failed to bind listening socket on port {port}")]
    Bind { port: u16 },
    #[error("Failed to set up signal handling: {0}")]
    Signals(io::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Unrecoverable condition; the loop exits non-zero.
pub struct Fatal;

struct Sensor {
    url: String,
    link: Option<Transport>,
    deadline: Option<Instant>,
}

struct Listener {
    socket: TcpListener,
    websocket: bool,
}

enum ClientState {
    /// Accepted on the WebSocket port; raw socket until the upgrade
    /// completes.
    Handshake(TcpStream),
    Live(Transport),
}

struct Client {
    state: ClientState,
    peer: SocketAddr,
}

enum SensorSend {
    Sent,
    Dropped,
}

pub struct Proxy {
    cfg: Config,
    log: Logger,
    poll: Poll,
    events: Events,
    signals: Signals,
    sensors: Vec<Sensor>,
    listeners: Vec<Listener>,
    clients: Vec<Option<Client>>,
    free_slots: Vec<usize>,
    live: IndexSet<usize>,
    remap: Option<RemapTable>,
    hub: Hub,
    client_base: usize,
    last_heartbeat: Option<Instant>,
    shutdown: bool,
}

impl Proxy {
    pub fn new(cfg: Config, log: Logger) -> Result<Proxy, StartupError> {
        let poll = Poll::new()?;

        let mut sensors = Vec::with_capacity(cfg.sensor_urls.len());
        for (i, url) in cfg.sensor_urls.iter().enumerate() {
            let mut link = Transport::open(url, &log).map_err(|source| StartupError::Sensor {
                url: url.clone(),
                source,
            })?;
            link.register(poll.registry(), Token(i))?;
            sensors.push(Sensor {
                url: url.clone(),
                link: Some(link),
                deadline: None,
            });
        }

        let mut listeners = Vec::new();
        for socket in bind_port(cfg.tcp_port, cfg.ipv4_only)? {
            listeners.push(Listener {
                socket,
                websocket: false,
            });
        }
        for socket in bind_port(cfg.ws_port, cfg.ipv4_only)? {
            listeners.push(Listener {
                socket,
                websocket: true,
            });
        }
        for (j, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(&mut listener.socket, Token(sensors.len() + j), INTEREST)?;
        }

        let mut signals = Signals::new([SIGINT]).map_err(StartupError::Signals)?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        let remap = if cfg.forward {
            None
        } else {
            Some(RemapTable::new(cfg.max_rpcs, cfg.max_clients))
        };
        let hub = Hub::new(cfg.hub_id.clone(), sensors.len() as u32);
        let client_base = sensors.len() + listeners.len();

        info!(
            log,
            "Initialized. {} sockets listening, {} sensors, {} max clients",
            listeners.len(),
            sensors.len(),
            cfg.max_clients
        );

        Ok(Proxy {
            cfg,
            log,
            poll,
            events: Events::with_capacity(1024),
            signals,
            sensors,
            listeners,
            clients: Vec::new(),
            free_slots: Vec::new(),
            live: IndexSet::new(),
            remap,
            hub,
            client_base,
            last_heartbeat: None,
            shutdown: false,
        })
    }

    /// Local port of the first native-framing listener; used by tests
    /// binding ephemeral ports.
    pub fn tcp_port(&self) -> Option<u16> {
        self.listeners
            .iter()
            .find(|listener| !listener.websocket)
            .and_then(|listener| listener.socket.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Local port of the first WebSocket listener.
    pub fn ws_port(&self) -> Option<u16> {
        self.listeners
            .iter()
            .find(|listener| listener.websocket)
            .and_then(|listener| listener.socket.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Runs the loop until SIGINT or a fatal condition, then drains
    /// outbound buffers. Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        let mut ret = 0;
        while !self.shutdown {
            if self.step(POLL_TIMEOUT).is_err() {
                ret = 1;
                break;
            }
        }
        self.finish(ret)
    }

    /// One loop iteration: heartbeat/reconnect tick, readiness wait, RPC
    /// timeout sweep, event dispatch.
    pub fn step(&mut self, timeout: Duration) -> Result<(), Fatal> {
        let now = Instant::now();
        if self
            .last_heartbeat
            .map_or(true, |last| now.duration_since(last) >= HEARTBEAT_INTERVAL)
        {
            self.last_heartbeat = Some(now);
            self.heartbeat_tick(now)?;
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => {
                error!(self.log, "poll failed"; "error" => %err);
                return Err(Fatal);
            }
        }

        self.sweep_timeouts(Instant::now());

        let ready: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token().0, event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == SIGNAL_TOKEN.0 {
                for signal in self.signals.pending() {
                    if signal == SIGINT {
                        debug!(self.log, "SIGINT received");
                        self.shutdown = true;
                    }
                }
            } else if token < self.sensors.len() {
                self.handle_sensor(token, readable, writable)?;
            } else if token < self.client_base {
                if readable {
                    self.accept_clients(token - self.sensors.len())?;
                }
            } else {
                let slot = token - self.client_base;
                if slot < self.clients.len() {
                    self.handle_client(slot, readable, writable)?;
                }
            }
            if self.shutdown {
                break;
            }
        }

        // file replay cannot produce readiness events
        for i in 0..self.sensors.len() {
            let replay = self.sensors[i]
                .link
                .as_ref()
                .map_or(false, |link| link.always_ready());
            if replay {
                self.handle_sensor(i, true, false)?;
            }
        }

        Ok(())
    }

    /// Sends the periodic heartbeat to live sensors and retries dead
    /// ones. Surrendering on a sensor past its reconnect deadline is
    /// fatal.
    fn heartbeat_tick(&mut self, now: Instant) -> Result<(), Fatal> {
        for i in 0..self.sensors.len() {
            if self.sensors[i].link.is_some() {
                self.send_to_sensor(i, &Packet::heartbeat())?;
                continue;
            }

            let url = self.sensors[i].url.clone();
            match Transport::open(&url, &self.log) {
                Ok(mut link) => {
                    if let Err(err) = link.register(self.poll.registry(), Token(i)) {
                        debug!(self.log, "failed to register reopened sensor"; "error" => %err);
                        continue;
                    }
                    info!(self.log, "Successfully reopened sensor at {}", url);
                    self.sensors[i].link = Some(link);
                    self.sensors[i].deadline = None;
                }
                Err(err) => {
                    debug!(self.log, "sensor reconnect attempt failed"; "url" => %url, "error" => %err);
                    if let Some(deadline) = self.sensors[i].deadline {
                        if now > deadline {
                            error!(self.log, "sensor reconnect timeout"; "url" => %url);
                            return Err(Fatal);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fails every RPC that has waited past the timeout back to its
    /// caller. The queue is FIFO, so the sweep stops at the first record
    /// still within its window.
    fn sweep_timeouts(&mut self, now: Instant) {
        loop {
            let expired = match self.remap.as_mut().and_then(|remap| remap.pop_expired(now)) {
                Some(expired) => expired,
                None => return,
            };

            if let Some(slot) = expired.client {
                let slot = slot as usize;
                if self.live.contains(&slot) {
                    let err = rpc::make_error(expired.client_id, ErrorCode::Timeout, expired.route);
                    if self.send_to_client(slot, &err).is_err() {
                        info!(self.log, "Failed to send synthetic RPC timeout error");
                        self.disconnect_client(slot);
                    }
                }
            }
            info!(
                self.log,
                "RPC remap timeout";
                "client" => expired.client.map(|slot| slot as i64).unwrap_or(-1),
                "rpc" => expired.client_id,
                "proxy_id" => expired.proxy_id
            );
        }
    }

    fn handle_sensor(&mut self, i: usize, readable: bool, writable: bool) -> Result<(), Fatal> {
        if writable {
            let flushed = match self.sensors[i].link.as_mut() {
                Some(link) => link.flush(),
                None => return Ok(()),
            };
            if let Err(err) = flushed {
                self.sensor_io_error(i, &err)?;
                return Ok(());
            }
        }
        if !readable {
            return Ok(());
        }

        loop {
            let received = match self.sensors[i].link.as_mut() {
                Some(link) => link.recv(),
                None => return Ok(()),
            };
            match received {
                Ok(packet) => self.sensor_data(i, packet),
                Err(LinkError::Wait) => return Ok(()),
                Err(LinkError::Proto(err)) => {
                    // possibly corrupted serial data; there may be valid
                    // frames after the damage
                    info!(self.log, "Error in sensor communication"; "detail" => %err);
                }
                Err(err) => {
                    self.sensor_io_error(i, &err)?;
                    return Ok(());
                }
            }
        }
    }

    /// I/O failure on a sensor link: fatal when reconnect is disabled,
    /// otherwise close and arm the reconnect deadline.
    fn sensor_io_error(&mut self, i: usize, err: &LinkError) -> Result<(), Fatal> {
        if self.cfg.reconnect_timeout == 0 {
            error!(self.log, "Fatal error in sensor communication"; "detail" => %err);
            return Err(Fatal);
        }
        info!(
            self.log,
            "Error in sensor {} communication", self.sensors[i].url;
            "detail" => %err
        );
        self.close_sensor(i, Instant::now());
        Ok(())
    }

    fn close_sensor(&mut self, i: usize, now: Instant) {
        if let Some(mut link) = self.sensors[i].link.take() {
            let _ = link.deregister(self.poll.registry());
        }
        if self.cfg.reconnect_timeout > 0 {
            self.sensors[i].deadline = Some(now + Duration::from_secs(self.cfg.reconnect_timeout));
        }
    }

    /// Routes one packet arriving from sensor `i`: RPC replies resolve
    /// through the remap table to their single caller, everything else
    /// fans out to every live client.
    fn sensor_data(&mut self, i: usize, mut packet: Packet) {
        let mut only: Option<usize> = None;

        if self.remap.is_some()
            && (packet.ptype == PTYPE_RPC_REP || packet.ptype == PTYPE_RPC_ERROR)
        {
            let id = match rpc::reply_id(&packet) {
                Some(id) => id,
                None => {
                    info!(self.log, "Malformed rpc reply from sensor"; "sensor" => i);
                    return;
                }
            };
            let remap = self.remap.as_mut().expect("checked above");
            if id >= remap.capacity() {
                info!(self.log, "Unexpected returned rpc id, cannot remap"; "rpc" => id);
                return;
            }
            match remap.complete(id) {
                None => {
                    info!(self.log, "Cannot find remapping information for rpc {}", id);
                    return;
                }
                Some(dest) => match dest.client {
                    Some(slot) if self.live.contains(&(slot as usize)) => {
                        rpc::set_reply_id(&mut packet, dest.client_id);
                        only = Some(slot as usize);
                    }
                    _ => {
                        // the caller disconnected while the rpc was in
                        // flight; consume the late reply
                        debug!(self.log, "Discarding rpc reply for a gone client"; "rpc" => id);
                        return;
                    }
                },
            }
        }

        if self.cfg.hub && !packet.route.push(i as u8) {
            info!(
                self.log,
                "Warning: dropped sensor packet. Full routing in hub mode"
            );
            return;
        }

        if packet.ptype == PTYPE_LOG {
            match logpkt::parse(&packet) {
                Some(msg) => info!(
                    self.log,
                    "{} {}: {}",
                    packet.route,
                    logpkt::level_name(msg.level),
                    String::from_utf8_lossy(msg.message)
                ),
                None => info!(self.log, "{} <INVALID LOG PACKET>", packet.route),
            }
        }

        if packet.ptype == PTYPE_TEXT {
            info!(
                self.log,
                "TEXT ({} bytes): {}",
                packet.payload.len(),
                String::from_utf8_lossy(&packet.payload)
            );
            // nudge the sensor out of ascii mode; errors surface through
            // the normal send path later
            if let Some(link) = self.sensors[i].link.as_mut() {
                let _ = link.send(&Packet::heartbeat());
            }
        }

        let targets: Vec<usize> = match only {
            Some(slot) => vec![slot],
            None => self.live.iter().copied().collect(),
        };
        for slot in targets {
            if !self.live.contains(&slot) {
                continue;
            }
            if self.send_to_client(slot, &packet).is_err() {
                self.disconnect_client(slot);
            }
        }
    }

    /// Handles one packet arriving from a client: hub-local dispatch, RPC
    /// id remapping, hop-stack routing and forwarding to the sensor.
    fn client_data(&mut self, slot: usize, mut packet: Packet) -> Result<(), Fatal> {
        if self.cfg.hub && packet.route.is_empty() {
            // empty routing addresses the proxy itself
            if packet.ptype == PTYPE_RPC_REQ {
                let reply = self.hub.handle_request(&packet);
                if self.send_to_client(slot, &reply).is_err() {
                    self.disconnect_client(slot);
                }
            } else {
                info!(
                    self.log,
                    "Ignoring packet of type {} sent to hub by client", packet.ptype;
                    "client" => slot
                );
            }
            return Ok(());
        }

        if self.remap.is_some() && packet.ptype == PTYPE_RPC_REQ {
            let id = match rpc::request_id(&packet) {
                Some(id) => id,
                None => {
                    debug!(self.log, "Malformed rpc request from client"; "client" => slot);
                    return Ok(());
                }
            };
            let route = packet.route;
            let allocated = self.remap.as_mut().expect("checked above").alloc(
                slot as u16,
                id,
                route,
                Instant::now(),
            );
            match allocated {
                None => {
                    info!(
                        self.log,
                        "Could not remap rpc {} from client, out of buffers", id;
                        "client" => slot
                    );
                    // courtesy reply so the caller fails fast
                    let err = rpc::make_error(id, ErrorCode::Busy, route);
                    if self.send_to_client(slot, &err).is_err() {
                        info!(self.log, "Failed to send back error of too many rpcs in flight");
                        self.disconnect_client(slot);
                    }
                    return Ok(());
                }
                Some(proxy_id) => {
                    debug!(
                        self.log,
                        "Remapping client rpc {} to {}", id, proxy_id;
                        "client" => slot
                    );
                    rpc::set_request_id(&mut packet, proxy_id);
                }
            }
        }

        // In direct mode there is a single sensor at index zero; in hub
        // mode the top-of-stack hop selects it.
        let dest = if self.cfg.hub {
            match packet.route.pop() {
                Some(hop) => hop as usize,
                None => unreachable!("empty routing handled as hub-local"),
            }
        } else {
            0
        };

        if dest >= self.sensors.len() {
            // behave as if the sensor existed but was unplugged; any rpc
            // remap will time out
            info!(
                self.log,
                "Client attempted to access invalid sensor {}", dest;
                "client" => slot
            );
            return Ok(());
        }

        if let SensorSend::Dropped = self.send_to_sensor(dest, &packet)? {
            info!(
                self.log,
                "Packet dropped from client to sensor {}", dest;
                "client" => slot
            );
        }
        Ok(())
    }

    fn handle_client(&mut self, slot: usize, readable: bool, writable: bool) -> Result<(), Fatal> {
        let handshaking = matches!(
            self.clients[slot].as_ref().map(|client| &client.state),
            Some(ClientState::Handshake(_))
        );
        if handshaking {
            if readable {
                self.client_handshake(slot)?;
            }
            return Ok(());
        }

        if writable {
            let flushed = match self.clients[slot].as_mut() {
                Some(client) => match &mut client.state {
                    ClientState::Live(link) => link.flush(),
                    ClientState::Handshake(_) => return Ok(()),
                },
                None => return Ok(()),
            };
            if flushed.is_err() {
                self.disconnect_client(slot);
                return Ok(());
            }
        }
        if !readable {
            return Ok(());
        }

        loop {
            let received = match self.clients[slot].as_mut() {
                Some(client) => match &mut client.state {
                    ClientState::Live(link) => link.recv(),
                    ClientState::Handshake(_) => return Ok(()),
                },
                None => return Ok(()),
            };
            match received {
                Ok(packet) => self.client_data(slot, packet)?,
                Err(LinkError::Wait) => return Ok(()),
                Err(LinkError::Closed) => {
                    debug!(self.log, "Detected client disconnect"; "client" => slot);
                    self.disconnect_client(slot);
                    return Ok(());
                }
                Err(err) => {
                    debug!(self.log, "Client error"; "client" => slot, "detail" => %err);
                    self.disconnect_client(slot);
                    return Ok(());
                }
            }
        }
    }

    /// Runs the WebSocket upgrade for a freshly accepted client. The
    /// request must arrive (and the response leave) in one piece; anything
    /// else is a hard close.
    fn client_handshake(&mut self, slot: usize) -> Result<(), Fatal> {
        let mut buf = [0u8; 2048];
        let read = match self.clients[slot].as_mut() {
            Some(client) => match &mut client.state {
                ClientState::Handshake(stream) => stream.read(&mut buf),
                ClientState::Live(_) => return Ok(()),
            },
            None => return Ok(()),
        };
        let count = match read {
            Ok(0) => {
                self.disconnect_client(slot);
                return Ok(());
            }
            Ok(count) => count,
            Err(err) if is_wouldblock(&err) => return Ok(()),
            Err(_) => {
                self.disconnect_client(slot);
                return Ok(());
            }
        };

        match websock::process_request(&buf[..count]) {
            Upgrade::Complete { response, residual } => {
                let written = match self.clients[slot].as_mut() {
                    Some(client) => match &mut client.state {
                        ClientState::Handshake(stream) => stream.write(&response),
                        ClientState::Live(_) => return Ok(()),
                    },
                    None => return Ok(()),
                };
                if !matches!(written, Ok(count) if count == response.len()) {
                    self.disconnect_client(slot);
                    return Ok(());
                }

                let client = match self.clients[slot].take() {
                    Some(client) => client,
                    None => return Ok(()),
                };
                let Client { state, peer } = client;
                let state = match state {
                    ClientState::Handshake(stream) => {
                        ClientState::Live(Transport::websocket(stream, &residual, &self.log))
                    }
                    live => live,
                };
                self.clients[slot] = Some(Client { state, peer });
                debug!(self.log, "WebSocket client upgraded"; "client" => slot, "peer" => %peer);
                // bytes the client pipelined behind its request will not
                // raise another readable event
                self.handle_client(slot, true, false)
            }
            Upgrade::Reject => {
                debug!(self.log, "Invalid websocket handshake"; "client" => slot);
                self.disconnect_client(slot);
                Ok(())
            }
        }
    }

    /// Drains the accept queue of a listening socket. Per-client failures
    /// only cost that client; listener failures are fatal.
    fn accept_clients(&mut self, listener_idx: usize) -> Result<(), Fatal> {
        loop {
            match self.listeners[listener_idx].socket.accept() {
                Ok((mut stream, peer)) => {
                    if self.live.len() >= self.cfg.max_clients {
                        info!(
                            self.log,
                            "Accepting client ({}) would exceed maximum number of clients", peer
                        );
                        continue;
                    }

                    let slot = match self.free_slots.pop() {
                        Some(slot) => slot,
                        None => {
                            self.clients.push(None);
                            self.clients.len() - 1
                        }
                    };
                    let token = Token(self.client_base + slot);
                    if let Err(err) = self.poll.registry().register(&mut stream, token, INTEREST) {
                        info!(self.log, "Failed to register new client"; "error" => %err);
                        self.free_slots.push(slot);
                        continue;
                    }

                    let websocket = self.listeners[listener_idx].websocket;
                    let state = if websocket {
                        ClientState::Handshake(stream)
                    } else {
                        ClientState::Live(Transport::from_tcp_stream(stream, &self.log))
                    };
                    self.clients[slot] = Some(Client { state, peer });
                    self.live.insert(slot);
                    debug!(
                        self.log,
                        "Accepted client {}", peer;
                        "client" => slot,
                        "websocket" => websocket
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_wouldblock(&err) => return Ok(()),
                Err(err) => {
                    error!(self.log, "Fatal error on listening sockets"; "error" => %err);
                    return Err(Fatal);
                }
            }
        }
    }

    fn send_to_sensor(&mut self, i: usize, packet: &Packet) -> Result<SensorSend, Fatal> {
        let sent = match self.sensors[i].link.as_mut() {
            Some(link) => link.send(packet),
            None => return Ok(SensorSend::Dropped),
        };
        match sent {
            Ok(_) => Ok(SensorSend::Sent),
            Err(LinkError::Overflow) => Ok(SensorSend::Dropped),
            Err(err) => {
                info!(self.log, "Error writing to sensor {}", i; "detail" => %err);
                if self.cfg.reconnect_timeout == 0 {
                    return Err(Fatal);
                }
                self.close_sensor(i, Instant::now());
                Ok(SensorSend::Dropped)
            }
        }
    }

    /// Queues a packet toward one client. An error return means the
    /// client is beyond saving and the caller should disconnect it.
    fn send_to_client(&mut self, slot: usize, packet: &Packet) -> Result<(), ()> {
        let client = match self.clients[slot].as_mut() {
            Some(client) => client,
            None => return Err(()),
        };
        let link = match &mut client.state {
            ClientState::Live(link) => link,
            // mid-handshake clients do not speak packets yet
            ClientState::Handshake(_) => return Ok(()),
        };
        match link.send(packet) {
            Ok(_) => Ok(()),
            Err(LinkError::Overflow) => {
                info!(self.log, "Client transmit buffer overflow"; "client" => slot);
                Err(())
            }
            Err(LinkError::Io(err))
                if err.kind() == io::ErrorKind::BrokenPipe
                    || err.kind() == io::ErrorKind::ConnectionReset =>
            {
                Err(())
            }
            Err(err) => {
                info!(
                    self.log,
                    "Failed to send sensor packet to client"; "client" => slot, "detail" => %err
                );
                Err(())
            }
        }
    }

    fn disconnect_client(&mut self, slot: usize) {
        if let Some(mut client) = self.clients[slot].take() {
            match &mut client.state {
                ClientState::Handshake(stream) => {
                    let _ = self.poll.registry().deregister(stream);
                }
                ClientState::Live(link) => {
                    let _ = link.deregister(self.poll.registry());
                }
            }
            debug!(self.log, "Disconnected client"; "client" => slot, "peer" => %client.peer);
            if let Some(remap) = self.remap.as_mut() {
                remap.orphan_client(slot as u16);
            }
            self.live.swap_remove(&slot);
            self.free_slots.push(slot);
        }
    }

    /// Closes the listeners immediately and gives buffered outbound data
    /// about a second to drain before giving up on it.
    fn finish(&mut self, ret: i32) -> i32 {
        debug!(self.log, "Attempting clean termination of I/O descriptors");
        self.listeners.clear();

        for _ in 0..20 {
            let mut left = 0;

            for sensor in self.sensors.iter_mut() {
                if let Some(link) = sensor.link.as_mut() {
                    let _ = link.flush();
                    if link.has_egress() {
                        left += 1;
                    } else {
                        sensor.link = None;
                    }
                }
            }

            for slot in 0..self.clients.len() {
                let drained = match self.clients[slot].as_mut() {
                    None => continue,
                    Some(client) => match &mut client.state {
                        ClientState::Handshake(_) => true,
                        ClientState::Live(link) => {
                            let _ = link.flush();
                            !link.has_egress()
                        }
                    },
                };
                if drained {
                    self.clients[slot] = None;
                } else {
                    left += 1;
                }
            }

            if left == 0 {
                info!(self.log, "Exiting.");
                return ret;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        error!(self.log, "Unable to close all descriptors. Exit is not clean.");
        1
    }
}

/// Binds the wildcard address on `port`, both families unless restricted.
/// Dual-stack systems may accept IPv4 through the IPv6 socket, so a
/// failure of one family is tolerated as long as one socket binds.
fn bind_port(port: u16, ipv4_only: bool) -> Result<Vec<TcpListener>, StartupError> {
    let mut addrs: Vec<SocketAddr> = Vec::new();
    if !ipv4_only {
        addrs.push((Ipv6Addr::UNSPECIFIED, port).into());
    }
    addrs.push((Ipv4Addr::UNSPECIFIED, port).into());

    let mut sockets = Vec::new();
    for addr in addrs {
        if let Ok(socket) = TcpListener::bind(addr) {
            sockets.push(socket);
        }
    }
    if sockets.is_empty() {
        return Err(StartupError::Bind { port });
    }
    Ok(sockets)
}
