//! Hub discovery handshake
//!
//! 1. The hub broadcasts `pair:<hubIp>:<hubPort>:<uid>` over UDP
//! 2. The satellite connects to `<hubIp>:<hubPort>` over TCP and sends
//!    `<localIp>:<typeTag>`
//! 3. The hub answers `ok` over UDP, anything else is a refusal
//!
//! Every wait is bounded by a per-cycle receive timeout and a cycle count.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::DiscoveryError;

/// Prefix of a hub pairing announcement
pub const ANNOUNCEMENT_PREFIX: &str = "pair";

/// Terminal acceptance payload
pub const ACCEPTANCE: &str = "ok";

type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;

/// A parsed hub announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Hub address, later used as the remote bus host
    pub hub_ip: IpAddr,

    /// TCP port the hub listens on for the pairing reply
    pub hub_port: u16,

    /// Uid the hub attributes to this satellite
    pub uid: String,
}

impl Announcement {
    /// Parse `pair:<hubIp>:<hubPort>:<uid>`
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if a field is missing, extra, empty or invalid
    pub fn parse(raw: &str) -> DiscoveryResult<Self> {
        let malformed = || DiscoveryError::Malformed(raw.to_string());

        let parts: Vec<&str> = raw.trim().split(':').collect();
        let [prefix, ip, port, uid] = parts.as_slice() else {
            return Err(malformed());
        };

        if *prefix != ANNOUNCEMENT_PREFIX || uid.is_empty() {
            return Err(malformed());
        }

        let hub_ip = ip.parse().map_err(|_| malformed())?;
        let hub_port = port.parse().map_err(|_| malformed())?;

        Ok(Self {
            hub_ip,
            hub_port,
            uid: (*uid).to_string(),
        })
    }
}

/// Discovery parameters
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// UDP port to listen on
    pub port: u16,

    /// Per-cycle receive timeout
    pub receive_timeout: Duration,

    /// Receive cycles allowed for the announcement and again for the verdict
    pub max_cycles: u32,

    /// Address sent to the hub, detected when absent
    pub local_ip: Option<IpAddr>,

    /// Device type tag sent to the hub
    pub type_tag: String,
}

impl DiscoverySettings {
    /// Settings from the satellite configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            port: config.pairing.broadcast_port,
            receive_timeout: config.pairing.receive_timeout,
            max_cycles: config.pairing.max_cycles,
            local_ip: config.pairing.local_ip,
            type_tag: config.device.type_tag.clone(),
        }
    }

    fn reply_for(&self, local_ip: IpAddr) -> String {
        format!("{local_ip}:{}", self.type_tag)
    }
}

/// A bound discovery socket, ready to run the handshake
#[derive(Debug)]
pub struct Discovery {
    socket: UdpSocket,
    settings: DiscoverySettings,
}

impl Discovery {
    /// Bind the announcement socket
    ///
    /// # Errors
    ///
    /// Returns error if the UDP port cannot be bound
    pub async fn bind(settings: DiscoverySettings) -> DiscoveryResult<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.port));
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket, settings })
    }

    /// Port actually bound, useful when configured with port 0
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read
    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Run the full handshake
    ///
    /// # Errors
    ///
    /// Returns `NoHubFound`, `Malformed`, `NoAnswer`, `Refused` or a socket error
    pub async fn run(self) -> DiscoveryResult<Announcement> {
        tracing::info!(
            port = self.settings.port,
            "satellite not registered yet, searching for the hub"
        );

        let raw = self
            .receive(|_| true)
            .await?
            .ok_or(DiscoveryError::NoHubFound)?;
        let announcement = Announcement::parse(&raw)?;
        tracing::info!(hub = %announcement.hub_ip, uid = %announcement.uid, "hub found");

        self.reply(&announcement).await?;

        // The hub keeps broadcasting until it hears back; skip its repeats
        let verdict = self
            .receive(|payload| !payload.starts_with(ANNOUNCEMENT_PREFIX))
            .await?
            .ok_or(DiscoveryError::NoAnswer)?;

        if verdict == ACCEPTANCE {
            tracing::info!(uid = %announcement.uid, "hub accepted the satellite");
            Ok(announcement)
        } else {
            Err(DiscoveryError::Refused(verdict))
        }
    }

    async fn reply(&self, announcement: &Announcement) -> DiscoveryResult<()> {
        let local_ip = self.settings.local_ip.unwrap_or_else(local_ip);
        let reply = self.settings.reply_for(local_ip);
        let hub = SocketAddr::new(announcement.hub_ip, announcement.hub_port);

        let mut stream = tokio::time::timeout(self.settings.receive_timeout, TcpStream::connect(hub))
            .await
            .map_err(|_| {
                DiscoveryError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {hub} timed out"),
                ))
            })??;
        stream.write_all(reply.as_bytes()).await?;
        stream.shutdown().await?;

        tracing::debug!(%hub, reply, "sent pairing reply");
        Ok(())
    }

    /// Wait for a datagram accepted by `wanted`
    ///
    /// Returns `None` once `max_cycles` receive timeouts elapsed. Skipped
    /// datagrams do not extend the overall deadline.
    async fn receive(&self, wanted: impl Fn(&str) -> bool) -> DiscoveryResult<Option<String>> {
        let cycles = self.settings.max_cycles.max(1);
        let deadline = Instant::now() + self.settings.receive_timeout * cycles;
        let mut buf = [0_u8; 1024];
        let mut timeouts = 0;

        while timeouts < cycles {
            let cycle_end = (Instant::now() + self.settings.receive_timeout).min(deadline);
            match tokio::time::timeout_at(cycle_end, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    let payload = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                    if wanted(&payload) {
                        return Ok(Some(payload));
                    }
                    tracing::trace!(%from, payload, "skipped datagram");
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    timeouts += 1;
                    tracing::debug!(cycle = timeouts, of = cycles, "nothing received yet");
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        Ok(None)
    }
}

/// Run discovery with `settings`
///
/// # Errors
///
/// See [`Discovery::run`]
pub async fn discover(settings: DiscoverySettings) -> DiscoveryResult<Announcement> {
    Discovery::bind(settings).await?.run().await
}

/// Address of the interface that routes to the LAN, loopback if none
#[must_use]
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
        Ok(socket.local_addr()?.ip())
    };

    probe()
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
