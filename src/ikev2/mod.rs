use log::{debug, info, trace, warn};
use std::{
    collections::HashMap,
    error, fmt,
    future::{self, Future},
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    pin::pin,
    sync::Arc,
    task::Poll,
    time::{Duration, Instant},
};
use tokio::{
    net::UdpSocket,
    runtime,
    sync::{mpsc, oneshot},
    task::JoinSet,
    time,
};

use crate::logger::fmt_slice_hex;

mod child_sa;
mod config;
mod engine;
mod ike_sa;
mod jobs;
mod kernel;
mod manager;
mod message;
mod task_manager;
mod tasks;

use config::{PeerConfig, Settings, StaticBackend};
use engine::Engine;
use kernel::{Kernel, SystemKernel};
use task_manager::Packet;

const MAX_DATAGRAM_SIZE: usize = 1500;

const NON_ESP_MARKER: [u8; 4] = [0x00, 0x00, 0x00, 0x00];
const NAT_KEEPALIVE: [u8; 1] = [0xff];

// Drives the local address watcher and the shutdown deadline.
const TICK_INTERVAL: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct Config {
    pub port: u16,
    pub nat_port: u16,
    pub listen_ips: Vec<IpAddr>,
    pub hostname: String,
    pub workers: usize,
    pub retransmit_timeout: Duration,
    pub retransmit_tries: usize,
    pub peers: Vec<SocketAddr>,
    pub remote_id: Option<String>,
    pub mobike: bool,
    pub reauth_time: Option<Duration>,
    pub child_lifetime: Option<Duration>,
}

pub struct Server {
    listen_ips: Vec<IpAddr>,
    port: u16,
    nat_port: u16,
    workers: usize,
    settings: Arc<Settings>,
    backend: Arc<StaticBackend>,
    cancel_sender: Option<oneshot::Sender<()>>,
    join_set: JoinSet<Result<(), IKEv2Error>>,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, IKEv2Error> {
        if config.listen_ips.is_empty() {
            return Err("No listen addresses configured".into());
        }
        if config.port == config.nat_port {
            return Err("IKE and NAT-T ports must be different".into());
        }
        let settings = Settings {
            retransmit_timeout: config.retransmit_timeout,
            retransmit_tries: config.retransmit_tries,
            ike_port: config.port,
            nat_port: config.nat_port,
            ..Settings::default()
        };

        // One initiator policy per peer, then a catch-all for incoming connections.
        let policy = |name: &str, remote_addr: Option<SocketAddr>| {
            let mut peer = PeerConfig::new(name, &config.hostname);
            peer.remote_id = config.remote_id.clone();
            peer.remote_addr = remote_addr;
            peer.mobike = config.mobike;
            peer.reauth_time = config.reauth_time;
            peer.child_lifetime = config.child_lifetime;
            peer
        };
        let mut peers = config
            .peers
            .iter()
            .map(|addr| policy(&format!("peer-{}", addr), Some(*addr)))
            .collect::<Vec<_>>();
        peers.push(policy("responder", None));

        Ok(Server {
            listen_ips: config.listen_ips,
            port: config.port,
            nat_port: config.nat_port,
            workers: config.workers,
            settings: Arc::new(settings),
            backend: Arc::new(StaticBackend::new(peers)),
            cancel_sender: None,
            join_set: JoinSet::new(),
        })
    }

    async fn send_ticks(
        duration: Duration,
        dest: mpsc::Sender<ServerCommand>,
    ) -> Result<(), IKEv2Error> {
        let mut interval = time::interval(duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            dest.send(ServerCommand::Tick)
                .await
                .map_err(|_| "Channel closed")?;
        }
    }

    pub async fn terminate(&mut self) -> Result<(), IKEv2Error> {
        match self.cancel_sender.take() {
            Some(cancel_sender) => {
                if cancel_sender.send(()).is_err() {
                    return Err("Cancel channel closed".into());
                }
            }
            None => return Err("Shutdown already in progress".into()),
        }
        while let Some(res) = self.join_set.join_next().await {
            match res {
                Ok(Err(err)) => warn!("Server stopped with error: {}", err),
                Err(err) => warn!("Error returned when shutting down: {}", err),
                Ok(Ok(())) => {}
            }
        }
        Ok(())
    }

    pub async fn start(&mut self) -> Result<(), IKEv2Error> {
        let sockets = Sockets::new(&self.listen_ips, self.port, self.nat_port).await?;
        let kernel = Arc::new(SystemKernel::new(&self.listen_ips)?);
        if let Err(err) = kernel.refresh().await {
            warn!("Failed to read interface addresses: {}", err);
        }
        let (engine, outbound) = Engine::start(
            self.settings.clone(),
            kernel.clone(),
            self.backend.clone(),
            self.workers,
        );
        for peer in self
            .backend
            .peers()
            .iter()
            .filter(|peer| peer.remote_addr.is_some())
        {
            info!("Initiating connection {}", peer.name);
            engine.initiate(peer.clone());
        }

        let rt = runtime::Handle::current();
        let (command_sender, command_receiver) = mpsc::channel(32);
        // Non-critical futures will be terminated by Tokio during the shutdown_timeout phase.
        rt.spawn(Server::send_ticks(TICK_INTERVAL, command_sender.clone()));
        let (cancel_sender, cancel_receiver) = oneshot::channel();
        self.cancel_sender = Some(cancel_sender);
        rt.spawn(async move {
            if cancel_receiver.await.is_ok()
                && command_sender.send(ServerCommand::Shutdown).await.is_err()
            {
                warn!("Command channel closed");
            }
        });

        let datagrams = Datagrams {
            kernel: kernel.clone(),
            nat_port: self.nat_port,
        };
        self.join_set.spawn_on(
            Self::run(
                command_receiver,
                sockets,
                outbound,
                engine,
                kernel,
                datagrams,
            ),
            &rt,
        );
        Ok(())
    }

    async fn run(
        mut command_receiver: mpsc::Receiver<ServerCommand>,
        mut sockets: Sockets,
        mut outbound: mpsc::Receiver<Packet>,
        mut engine: Engine,
        kernel: Arc<SystemKernel>,
        datagrams: Datagrams,
    ) -> Result<(), IKEv2Error> {
        let sender = sockets.create_sender();
        let mut local_addresses = kernel.local_addresses();
        let mut shutdown_deadline: Option<Instant> = None;
        loop {
            if let Some(deadline) = shutdown_deadline {
                if engine.manager().is_empty() || Instant::now() >= deadline {
                    engine.stop().await;
                    while let Ok(packet) = outbound.try_recv() {
                        sender.send_packet(datagrams.nat_port, &packet).await;
                    }
                    debug!("Shutdown completed");
                    return Ok(());
                }
            }
            // Wait until something is ready.
            let (command_message, datagram, packet) = {
                let mut receive_command = pin!(command_receiver.recv());
                let mut receive_udp = pin!(sockets.receive_datagram());
                let mut receive_packet = pin!(outbound.recv());
                future::poll_fn(move |cx| {
                    let mut ready = false;
                    let received_command = receive_command.as_mut().poll(cx);
                    ready = ready || received_command.is_ready();
                    let received_command = match received_command {
                        Poll::Ready(cmd) => cmd,
                        Poll::Pending => None,
                    };
                    let received_udp = receive_udp.as_mut().poll(cx);
                    ready = ready || received_udp.is_ready();
                    let received_udp = match received_udp {
                        Poll::Ready(datagram) => datagram,
                        Poll::Pending => None,
                    };
                    let received_packet = receive_packet.as_mut().poll(cx);
                    ready = ready || received_packet.is_ready();
                    let received_packet = match received_packet {
                        Poll::Ready(packet) => packet,
                        Poll::Pending => None,
                    };
                    if ready {
                        Poll::Ready((received_command, received_udp, received_packet))
                    } else {
                        Poll::Pending
                    }
                })
                .await
            };
            // Process all ready events.
            match command_message {
                Some(ServerCommand::Shutdown) if shutdown_deadline.is_none() => {
                    info!("Shutting down");
                    shutdown_deadline = Some(Instant::now() + SHUTDOWN_GRACE_PERIOD);
                    engine.delete_all();
                }
                Some(ServerCommand::Tick) if shutdown_deadline.is_none() => {
                    if let Err(err) = kernel.refresh().await {
                        warn!("Failed to read interface addresses: {}", err);
                    }
                    let current = kernel.local_addresses();
                    if current != local_addresses {
                        info!(
                            "Local addresses changed from {:?} to {:?}",
                            local_addresses, current
                        );
                        local_addresses = current;
                        engine.roam(true);
                    }
                }
                Some(_) | None => {}
            }
            if let Some(datagram) = datagram {
                if let Err(err) = datagrams.process(&engine, &datagram) {
                    warn!(
                        "Failed to process message from {}: {}",
                        datagram.remote_addr, err
                    );
                }
            }
            if let Some(packet) = packet {
                sender.send_packet(datagrams.nat_port, &packet).await;
            }
        }
    }
}

enum ServerCommand {
    Tick,
    Shutdown,
}

struct Datagrams {
    kernel: Arc<dyn Kernel>,
    nat_port: u16,
}

impl Datagrams {
    fn process(&self, engine: &Engine, datagram: &UdpDatagram) -> Result<(), IKEv2Error> {
        let data = if datagram.is_nat_port {
            if datagram.bytes == NAT_KEEPALIVE {
                trace!("Received NAT keepalive from {}", datagram.remote_addr);
                return Ok(());
            } else if !datagram.is_non_esp() {
                trace!(
                    "Ignoring ESP packet from {}: {}",
                    datagram.remote_addr,
                    fmt_slice_hex(&datagram.bytes[..datagram.bytes.len().min(8)])
                );
                return Ok(());
            }
            &datagram.bytes[NON_ESP_MARKER.len()..]
        } else {
            &datagram.bytes[..]
        };
        let remote_addr = SocketAddr::new(
            datagram.remote_addr.ip().to_canonical(),
            datagram.remote_addr.port(),
        );
        let local_addr = self.local_addr(datagram.local_addr, remote_addr);
        let message = message::Message::decode(data, remote_addr, local_addr)?;
        trace!("Received message {:?}", message);
        engine.submit(message);
        Ok(())
    }

    // Wildcard listeners don't know the destination address, the routing table does.
    fn local_addr(&self, listen_addr: SocketAddr, remote_addr: SocketAddr) -> SocketAddr {
        if !listen_addr.ip().is_unspecified() {
            return listen_addr;
        }
        match self.kernel.source_address(remote_addr) {
            Some(ip) => SocketAddr::new(ip, listen_addr.port()),
            None => listen_addr,
        }
    }
}

struct Sockets {
    listen_rx: mpsc::Receiver<UdpDatagram>,
    send_tx: mpsc::Sender<SendUdpDatagram>,
}

impl Sockets {
    async fn new(listen_ips: &[IpAddr], port: u16, nat_port: u16) -> Result<Sockets, IKEv2Error> {
        let mut sockets = HashMap::new();
        for listen_ip in listen_ips {
            for listen_port in [port, nat_port] {
                let socket = match UdpSocket::bind((*listen_ip, listen_port)).await {
                    Ok(socket) => socket,
                    Err(err) => {
                        log::error!("Failed to open listener on {}: {}", listen_ip, err);
                        return Err(err.into());
                    }
                };
                let listen_addr = socket.local_addr()?;
                info!("Started server on {}", listen_addr);
                sockets.insert(listen_addr, Arc::new(socket));
            }
        }
        let rt = runtime::Handle::current();
        let (listen_tx, listen_rx) = mpsc::channel(16);
        sockets.iter().for_each(|(listen_addr, socket)| {
            rt.spawn(Self::run_receiver(
                listen_tx.clone(),
                *listen_addr,
                socket.clone(),
                listen_addr.port() == nat_port,
            ));
        });
        let (send_tx, send_rx) = mpsc::channel(16);
        rt.spawn(Self::run_sender(send_rx, sockets));
        Ok(Sockets { listen_rx, send_tx })
    }

    async fn run_receiver(
        tx: mpsc::Sender<UdpDatagram>,
        listen_addr: SocketAddr,
        socket: Arc<UdpSocket>,
        is_nat_port: bool,
    ) {
        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (bytes_res, remote_addr) = match socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(err) => {
                    warn!("Failed to receive from socket {}: {}", listen_addr, err);
                    return;
                }
            };
            buf.truncate(bytes_res);
            let msg = UdpDatagram {
                remote_addr,
                local_addr: listen_addr,
                is_nat_port,
                bytes: buf,
            };
            if tx.send(msg).await.is_err() {
                warn!("Channel closed for {}", listen_addr);
                return;
            }
        }
    }

    async fn run_sender(
        mut rx: mpsc::Receiver<SendUdpDatagram>,
        sockets: HashMap<SocketAddr, Arc<UdpSocket>>,
    ) {
        while let Some(datagram) = rx.recv().await {
            let socket = match Self::find_socket(&sockets, &datagram.local_addr) {
                Some(socket) => socket,
                None => {
                    warn!(
                        "No open sockets for source address {} (destination {})",
                        datagram.local_addr, datagram.remote_addr
                    );
                    continue;
                }
            };
            if let Err(err) = socket.send_to(&datagram.bytes, datagram.remote_addr).await {
                warn!(
                    "Failed to send UDP message from {} to {}: {}",
                    datagram.local_addr, datagram.remote_addr, err
                );
            }
        }
    }

    // Falls back to a wildcard socket on the same port, the kernel picks the source address.
    fn find_socket<'a>(
        sockets: &'a HashMap<SocketAddr, Arc<UdpSocket>>,
        local_addr: &SocketAddr,
    ) -> Option<&'a Arc<UdpSocket>> {
        if let Some(socket) = sockets.get(local_addr) {
            return Some(socket);
        }
        let unspecified = match local_addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        sockets.get(&SocketAddr::new(unspecified, local_addr.port()))
    }

    async fn receive_datagram(&mut self) -> Option<UdpDatagram> {
        self.listen_rx.recv().await
    }

    fn create_sender(&self) -> UdpSender {
        UdpSender {
            tx: self.send_tx.clone(),
        }
    }
}

struct UdpDatagram {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    is_nat_port: bool,
    bytes: Vec<u8>,
}

impl UdpDatagram {
    fn is_non_esp(&self) -> bool {
        self.bytes.len() >= NON_ESP_MARKER.len() && self.bytes[0..4] == NON_ESP_MARKER
    }
}

#[derive(Clone)]
struct UdpSender {
    tx: mpsc::Sender<SendUdpDatagram>,
}

impl UdpSender {
    async fn send_packet(&self, nat_port: u16, packet: &Packet) {
        let non_esp_marker = packet.source.port() == nat_port;
        if let Err(err) = self
            .send_datagram(
                &packet.source,
                &packet.destination,
                non_esp_marker,
                &packet.data,
            )
            .await
        {
            warn!("Failed to send packet to {}: {}", packet.destination, err);
        }
    }

    async fn send_datagram(
        &self,
        local_addr: &SocketAddr,
        remote_addr: &SocketAddr,
        non_esp_marker: bool,
        data: &[u8],
    ) -> Result<(), SendError> {
        if data.len() + NON_ESP_MARKER.len() > MAX_DATAGRAM_SIZE {
            return Err("Message exceeds maximum datagram size".into());
        }
        let mut buffer = Vec::with_capacity(MAX_DATAGRAM_SIZE);
        if non_esp_marker {
            buffer.extend_from_slice(&NON_ESP_MARKER);
        }
        buffer.extend_from_slice(data);
        self.tx
            .send(SendUdpDatagram {
                local_addr: *local_addr,
                remote_addr: *remote_addr,
                bytes: buffer,
            })
            .await
            .map_err(|_| "UDP sender channel closed".into())
    }
}

struct SendUdpDatagram {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum SendError {
    Internal(&'static str),
    Io(io::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Io(ref e) => {
                write!(f, "IO error: {}", e)
            }
        }
    }
}

impl error::Error for SendError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_msg) => None,
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for SendError {
    fn from(msg: &'static str) -> SendError {
        Self::Internal(msg)
    }
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> SendError {
        Self::Io(err)
    }
}

#[derive(Debug)]
pub enum IKEv2Error {
    Internal(&'static str),
    Format(message::FormatError),
    Sa(ike_sa::SaError),
    Send(SendError),
    Join(tokio::task::JoinError),
    Io(io::Error),
}

impl fmt::Display for IKEv2Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(ref e) => write!(f, "Format error: {}", e),
            Self::Sa(ref e) => write!(f, "IKE SA error: {}", e),
            Self::Send(ref e) => write!(f, "Send error: {}", e),
            Self::Join(ref e) => write!(f, "Tokio join error: {}", e),
            Self::Io(ref e) => {
                write!(f, "IO error: {}", e)
            }
        }
    }
}

impl error::Error for IKEv2Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_msg) => None,
            Self::Format(ref err) => Some(err),
            Self::Sa(ref err) => Some(err),
            Self::Send(ref err) => Some(err),
            Self::Join(ref err) => Some(err),
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for IKEv2Error {
    fn from(msg: &'static str) -> IKEv2Error {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for IKEv2Error {
    fn from(err: message::FormatError) -> IKEv2Error {
        Self::Format(err)
    }
}

impl From<ike_sa::SaError> for IKEv2Error {
    fn from(err: ike_sa::SaError) -> IKEv2Error {
        Self::Sa(err)
    }
}

impl From<SendError> for IKEv2Error {
    fn from(err: SendError) -> IKEv2Error {
        Self::Send(err)
    }
}

impl From<tokio::task::JoinError> for IKEv2Error {
    fn from(err: tokio::task::JoinError) -> IKEv2Error {
        Self::Join(err)
    }
}

impl From<io::Error> for IKEv2Error {
    fn from(err: io::Error) -> IKEv2Error {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(bytes: &[u8], is_nat_port: bool) -> UdpDatagram {
        UdpDatagram {
            remote_addr: "192.0.2.1:4500".parse().unwrap(),
            local_addr: "198.51.100.1:4500".parse().unwrap(),
            is_nat_port,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn non_esp_marker_detection() {
        assert!(datagram(&[0, 0, 0, 0, 1, 2], true).is_non_esp());
        assert!(!datagram(&[0, 0, 0, 1, 1, 2], true).is_non_esp());
        assert!(!datagram(&[0, 0], true).is_non_esp());
    }

    #[tokio::test]
    async fn wildcard_socket_is_used_as_fallback() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port = socket.local_addr().unwrap().port();
        let mut sockets = HashMap::new();
        sockets.insert(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), socket);
        let source = SocketAddr::new(Ipv4Addr::new(192, 0, 2, 1).into(), port);
        assert!(Sockets::find_socket(&sockets, &source).is_some());
        let other_port = SocketAddr::new(source.ip(), port.wrapping_add(1));
        assert!(Sockets::find_socket(&sockets, &other_port).is_none());
        let v6 = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port);
        assert!(Sockets::find_socket(&sockets, &v6).is_none());
    }

    #[test]
    fn server_config_creates_initiator_and_responder_policies() {
        let server = Server::new(Config {
            port: 500,
            nat_port: 4500,
            listen_ips: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            hostname: "client.example.com".to_string(),
            workers: 2,
            retransmit_timeout: Duration::from_secs(1),
            retransmit_tries: 3,
            peers: vec!["198.51.100.1:500".parse().unwrap()],
            remote_id: Some("gw.example.com".to_string()),
            mobike: false,
            reauth_time: Some(Duration::from_secs(3600)),
            child_lifetime: None,
        })
        .unwrap();
        let peers = server.backend.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].remote_addr, Some("198.51.100.1:500".parse().unwrap()));
        assert!(!peers[0].mobike);
        assert_eq!(peers[0].reauth_time, Some(Duration::from_secs(3600)));
        assert_eq!(peers[1].child_lifetime, None);
        assert_eq!(peers[1].remote_addr, None);
        assert_eq!(server.settings.retransmit_tries, 3);
        assert_eq!(server.settings.nat_port, 4500);
    }
}
