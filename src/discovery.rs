//! Local-network service discovery over UDP multicast beacons.
//!
//! An [`Advertiser`] announces a [`ServiceInfo`] packet to a well-known
//! multicast group once per second. A [`Locator`] joins the group and
//! surfaces each matching announcement once as a [`ServiceEndpoint`],
//! keyed by service name and address.
//!
//! The beacon packet is the JSON encoding of [`ServiceInfo`]; the
//! endpoint address combines the sender's IP with the announced TCP
//! port.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, StatewireError};
use crate::transport;

/// Service type announced and matched by default.
pub const SERVICE_TYPE: &str = "_remote-debug._tcp";

/// Domain announced and matched by default.
pub const SERVICE_DOMAIN: &str = "local";

/// Default service instance name.
pub const SERVICE_NAME: &str = "remote-debugger";

/// Multicast group the beacons travel on.
pub const BEACON_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 98);

/// UDP port the beacons travel on.
pub const BEACON_PORT: u16 = 42042;

/// Gap between announcements.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Description of an advertised service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Instance name, e.g. `"remote-debugger"`.
    pub name: String,
    /// Service type, e.g. `"_remote-debug._tcp"`.
    pub service_type: String,
    /// Domain, e.g. `"local"`.
    pub domain: String,
    /// TCP port the service accepts connections on.
    pub port: u16,
}

impl ServiceInfo {
    /// Describe a service with the default type and domain.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            service_type: SERVICE_TYPE.to_string(),
            domain: SERVICE_DOMAIN.to_string(),
            port,
        }
    }
}

/// A discovered service instance and the address it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// The announcement the endpoint came from.
    pub info: ServiceInfo,
    /// Resolved address: announcing host plus announced port.
    pub addr: SocketAddr,
}

impl ServiceEndpoint {
    /// Open a TCP connection to the endpoint.
    pub async fn connect(&self) -> Result<TcpStream> {
        transport::connect(self.addr).await
    }
}

/// Announces a service on the local network until dropped.
pub struct Advertiser {
    registration: Option<oneshot::Receiver<Result<()>>>,
    task: JoinHandle<()>,
}

impl Advertiser {
    /// Start announcing `info` once per second.
    pub fn publish(info: ServiceInfo) -> Self {
        let (reg_tx, reg_rx) = oneshot::channel();
        let task = tokio::spawn(announce_loop(info, reg_tx));
        Self {
            registration: Some(reg_rx),
            task,
        }
    }

    /// Wait until the first announcement has gone out.
    ///
    /// Later calls return `Ok(())` immediately.
    pub async fn registration(&mut self) -> Result<()> {
        match self.registration.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                Err(StatewireError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "announce task stopped",
                )))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn announce_loop(info: ServiceInfo, reg_tx: oneshot::Sender<Result<()>>) {
    let target = SocketAddr::from((BEACON_GROUP, BEACON_PORT));

    let setup = async {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let packet = serde_json::to_vec(&info)?;
        socket.send_to(&packet, target).await?;
        Ok::<_, StatewireError>((socket, packet))
    };

    let (socket, packet) = match setup.await {
        Ok(pair) => {
            let _ = reg_tx.send(Ok(()));
            pair
        }
        Err(e) => {
            tracing::warn!("Failed to announce service: {}", e);
            let _ = reg_tx.send(Err(e));
            return;
        }
    };

    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
    ticker.tick().await; // first tick completes immediately; covered above
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&packet, target).await {
            tracing::warn!("Beacon send failed: {}", e);
        }
    }
}

/// Finds services announced on the local network.
pub struct Locator;

impl Locator {
    /// Listen for announcements matching `service_type` and `domain`.
    pub async fn resolve(service_type: &str, domain: &str) -> Result<Discovered> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, BEACON_PORT)).await?;
        socket.join_multicast_v4(BEACON_GROUP, Ipv4Addr::UNSPECIFIED)?;
        Ok(Discovered::over(
            socket,
            service_type.to_string(),
            domain.to_string(),
        ))
    }
}

/// Stream of discovered endpoints. Listening stops when dropped.
pub struct Discovered {
    rx: mpsc::Receiver<ServiceEndpoint>,
    task: JoinHandle<()>,
}

impl Discovered {
    fn over(socket: UdpSocket, service_type: String, domain: String) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(locate_loop(socket, service_type, domain, tx));
        Self { rx, task }
    }

    /// Next newly discovered endpoint. Each (name, address) pair is
    /// surfaced once; repeat announcements are dropped.
    pub async fn next(&mut self) -> Option<ServiceEndpoint> {
        self.rx.recv().await
    }
}

impl Drop for Discovered {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn locate_loop(
    socket: UdpSocket,
    service_type: String,
    domain: String,
    tx: mpsc::Sender<ServiceEndpoint>,
) {
    let mut seen: HashSet<(String, SocketAddr)> = HashSet::new();
    let mut buf = [0u8; 2048];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Beacon receive failed: {}", e);
                return;
            }
        };

        let Some(endpoint) = parse_announcement(&buf[..len], &service_type, &domain, from) else {
            continue;
        };

        if seen.insert((endpoint.info.name.clone(), endpoint.addr))
            && tx.send(endpoint).await.is_err()
        {
            return;
        }
    }
}

/// Parse one beacon packet into an endpoint, filtering by type and domain.
fn parse_announcement(
    packet: &[u8],
    service_type: &str,
    domain: &str,
    from: SocketAddr,
) -> Option<ServiceEndpoint> {
    let info: ServiceInfo = serde_json::from_slice(packet).ok()?;
    if info.service_type != service_type || info.domain != domain {
        return None;
    }
    let addr = SocketAddr::new(from.ip(), info.port);
    Some(ServiceEndpoint { info, addr })
}
