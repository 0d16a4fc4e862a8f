//! 802.1AS over raw Ethernet (AF_PACKET, ethertype 0x88F7).

use crate::message::PtpMessage;
use crate::ptp::{Destination, MulticastKind, PortIdentity, PTP_ETHERTYPE};
use crate::timestamp::PtpTimestamp;
use crate::timestamper::SoftwareTimestamper;
use crate::traits::{NetResult, PtpNetwork};
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use nix::net::if_::if_nametoindex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const ETH_HEADER_SIZE: usize = 14;
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

pub fn interface_mac(iface: &str) -> Result<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", iface);
    let raw = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    parse_mac(raw.trim())
}

/// First interface that is up, not loopback, and has an Ethernet address.
pub fn default_interface() -> Result<String> {
    let mut names: Vec<String> = fs::read_dir("/sys/class/net")
        .context("Failed to list network interfaces")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    for name in names {
        if name == "lo" {
            continue;
        }
        let operstate = fs::read_to_string(format!("/sys/class/net/{}/operstate", name))
            .unwrap_or_default();
        if operstate.trim() != "up" {
            continue;
        }
        match interface_mac(&name) {
            Ok(mac) if mac != [0u8; 6] => return Ok(name),
            _ => continue,
        }
    }
    Err(anyhow!("No suitable network interface found"))
}

fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(|| anyhow!("Malformed MAC address {}", s))?;
        *byte = u8::from_str_radix(part, 16).with_context(|| format!("Malformed MAC address {}", s))?;
    }
    if parts.next().is_some() {
        return Err(anyhow!("Malformed MAC address {}", s));
    }
    Ok(mac)
}

fn link_addr(ifindex: i32, mac: Option<[u8; 6]>) -> Result<SockAddr> {
    let ((), addr) = unsafe {
        SockAddr::try_init(|storage, len| {
            let sll = storage as *mut libc::sockaddr_ll;
            (*sll).sll_family = libc::AF_PACKET as u16;
            (*sll).sll_protocol = PTP_ETHERTYPE.to_be();
            (*sll).sll_ifindex = ifindex;
            if let Some(mac) = mac {
                (*sll).sll_halen = 6;
                (&mut (*sll).sll_addr)[..6].copy_from_slice(&mac);
            }
            *len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            Ok(())
        })
    }?;
    Ok(addr)
}

fn add_membership(socket: &Socket, ifindex: i32, mac: [u8; 6]) -> Result<()> {
    let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
    mreq.mr_ifindex = ifindex;
    mreq.mr_type = libc::PACKET_MR_MULTICAST as u16;
    mreq.mr_alen = 6;
    mreq.mr_address[..6].copy_from_slice(&mac);

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error())
            .context("PACKET_ADD_MEMBERSHIP failed");
    }
    Ok(())
}

/// One physical port's raw socket. Records software timestamps for every
/// event message it sends or receives.
pub struct RawEthernetLink {
    socket: Socket,
    mac: [u8; 6],
    timestamper: Arc<SoftwareTimestamper>,
    /// Link-layer address of peers learned from received frames.
    peers: Mutex<HashMap<PortIdentity, [u8; 6]>>,
}

impl RawEthernetLink {
    pub fn open(iface: &str, timestamper: Arc<SoftwareTimestamper>) -> Result<Self> {
        let ifindex = if_nametoindex(iface)
            .with_context(|| format!("Unknown interface {}", iface))? as i32;
        let mac = interface_mac(iface)?;

        let protocol = Protocol::from(i32::from(PTP_ETHERTYPE.to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
            .context("Failed to open raw socket (are you root?)")?;
        socket.bind(&link_addr(ifindex, None)?)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        add_membership(&socket, ifindex, MulticastKind::PDelay.mac())?;
        add_membership(&socket, ifindex, MulticastKind::Other.mac())?;

        info!(
            "Opened {} (index {}, {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x})",
            iface, ifindex, mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );

        Ok(RawEthernetLink {
            socket,
            mac,
            timestamper,
            peers: Mutex::new(HashMap::new()),
        })
    }

    fn destination_mac(&self, destination: Destination) -> Option<[u8; 6]> {
        match destination {
            Destination::Multicast(kind) => Some(kind.mac()),
            Destination::Unicast(identity) => self
                .peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&identity)
                .copied(),
        }
    }
}

impl PtpNetwork for RawEthernetLink {
    fn send_message(
        &self,
        message: &PtpMessage,
        destination: Destination,
        wants_timestamp: bool,
    ) -> NetResult {
        let Some(dst) = self.destination_mac(destination) else {
            warn!("No link address known for {:?}", destination);
            return NetResult::Fail;
        };
        let payload = match message.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode {:?}: {}", message.message_type(), e);
                return NetResult::Fail;
            }
        };

        let mut frame = Vec::with_capacity(ETH_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&self.mac);
        frame.extend_from_slice(&PTP_ETHERTYPE.to_be_bytes());
        frame.extend_from_slice(&payload);

        match self.socket.send(&frame) {
            Ok(_) => {
                if wants_timestamp {
                    let header = message.header();
                    self.timestamper
                        .record_tx(header.source, header.sequence_id, PtpTimestamp::now());
                }
                NetResult::Succeed
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                NetResult::Fail
            }
            Err(e) => {
                warn!("Raw socket send failed: {}", e);
                NetResult::Fatal
            }
        }
    }

    fn recv_message(&self) -> Result<Option<PtpMessage>> {
        let mut buf = [0u8; 1518];
        let size = match (&self.socket).read(&mut buf) {
            Ok(size) => size,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e).context("Raw socket receive failed"),
        };
        // Capture ingress time immediately
        let rx_time = PtpTimestamp::now();

        if size < ETH_HEADER_SIZE || buf[12..14] != PTP_ETHERTYPE.to_be_bytes() {
            return Ok(None);
        }
        let mut src = [0u8; 6];
        src.copy_from_slice(&buf[6..12]);

        let message = match PtpMessage::decode(&buf[ETH_HEADER_SIZE..size]) {
            Ok(m) => m,
            Err(e) => {
                debug!("Dropping frame from {:02x?}: {}", src, e);
                return Ok(None);
            }
        };

        let header = message.header();
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(header.source, src);
        if message.is_event() {
            self.timestamper
                .record_rx(header.source, header.sequence_id, rx_time);
        }
        Ok(Some(message))
    }

    fn link_layer_address(&self) -> [u8; 6] {
        self.mac
    }
}
