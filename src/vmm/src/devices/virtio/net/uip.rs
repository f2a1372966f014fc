// SPDX-License-Identifier: Apache-2.0

//! User-mode IP backend for guests without a tap.
//!
//! A deliberately small stack: it answers ARP as the gateway, echoes ICMP,
//! and relays UDP through one host socket per guest flow. Frames headed to
//! the guest queue up behind a condition variable the RX thread sleeps on.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use super::{NetBackend, VIRTIO_NET_HDR_SIZE};

const ETH_HDR_LEN: usize = 14;
const ETHERTYPE_IP: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_UDP: u8 = 17;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

fn checksum16(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Addressing plus the guest-bound frame queue; shared with the per-flow
/// reader threads.
struct Endpoint {
    host_mac: [u8; 6],
    guest_mac: [u8; 6],
    host_ip: Ipv4Addr,
    guest_ip: Ipv4Addr,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    inbound_ready: Condvar,
}

impl Endpoint {
    fn push_inbound(&self, frame: Vec<u8>) {
        self.inbound.lock().unwrap().push_back(frame);
        self.inbound_ready.notify_one();
    }

    fn pop_inbound(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let mut queue = self.inbound.lock().unwrap();
        loop {
            if let Some(frame) = queue.pop_front() {
                return Some(frame);
            }
            queue = match timeout {
                None => self.inbound_ready.wait(queue).unwrap(),
                Some(timeout) => {
                    let (guard, wait) =
                        self.inbound_ready.wait_timeout(queue, timeout).unwrap();
                    if wait.timed_out() && guard.is_empty() {
                        return None;
                    }
                    guard
                }
            };
        }
    }

    fn eth_header(&self, ethertype: u16) -> Vec<u8> {
        let mut frame = Vec::with_capacity(64);
        frame.extend_from_slice(&self.guest_mac);
        frame.extend_from_slice(&self.host_mac);
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame
    }

    fn ip_header(&self, proto: u8, src: Ipv4Addr, payload_len: usize) -> Vec<u8> {
        let total = 20 + payload_len;
        let mut hdr = Vec::with_capacity(20);
        hdr.push(0x45);
        hdr.push(0);
        hdr.extend_from_slice(&(total as u16).to_be_bytes());
        hdr.extend_from_slice(&[0, 0, 0, 0]); // id, flags
        hdr.push(64); // ttl
        hdr.push(proto);
        hdr.extend_from_slice(&[0, 0]); // checksum, patched below
        hdr.extend_from_slice(&src.octets());
        hdr.extend_from_slice(&self.guest_ip.octets());
        let cksum = checksum16(&hdr);
        hdr[10..12].copy_from_slice(&cksum.to_be_bytes());
        hdr
    }

    fn handle_arp(&self, packet: &[u8]) {
        if packet.len() < 28 {
            return;
        }
        let oper = u16::from_be_bytes([packet[6], packet[7]]);
        if oper != ARP_OP_REQUEST {
            return;
        }
        let sender_ip = &packet[14..18];
        let target_ip = Ipv4Addr::new(packet[24], packet[25], packet[26], packet[27]);
        if target_ip == self.guest_ip {
            return;
        }

        // Everything off-box resolves to the host's MAC.
        let mut frame = self.eth_header(ETHERTYPE_ARP);
        frame.extend_from_slice(&1u16.to_be_bytes()); // ethernet
        frame.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
        frame.push(6);
        frame.push(4);
        frame.extend_from_slice(&ARP_OP_REPLY.to_be_bytes());
        frame.extend_from_slice(&self.host_mac);
        frame.extend_from_slice(&target_ip.octets());
        frame.extend_from_slice(&self.guest_mac);
        frame.extend_from_slice(sender_ip);
        self.push_inbound(frame);
    }

    fn handle_icmp(&self, ip: &[u8], ihl: usize) {
        let icmp = &ip[ihl..];
        if icmp.len() < 8 || icmp[0] != ICMP_ECHO_REQUEST {
            return;
        }
        let src = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

        let mut reply = icmp.to_vec();
        reply[0] = ICMP_ECHO_REPLY;
        reply[2] = 0;
        reply[3] = 0;
        let cksum = checksum16(&reply);
        reply[2..4].copy_from_slice(&cksum.to_be_bytes());

        let mut frame = self.eth_header(ETHERTYPE_IP);
        frame.extend_from_slice(&self.ip_header(IPPROTO_ICMP, src, reply.len()));
        frame.extend_from_slice(&reply);
        self.push_inbound(frame);
    }

    fn deliver_udp(&self, src_ip: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) {
        let mut udp = Vec::with_capacity(8 + payload.len());
        udp.extend_from_slice(&src_port.to_be_bytes());
        udp.extend_from_slice(&dst_port.to_be_bytes());
        udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]); // checksum optional over IPv4
        udp.extend_from_slice(payload);

        let mut frame = self.eth_header(ETHERTYPE_IP);
        frame.extend_from_slice(&self.ip_header(IPPROTO_UDP, src_ip, udp.len()));
        frame.extend_from_slice(&udp);
        self.push_inbound(frame);
    }
}

pub struct UserStack {
    endpoint: Arc<Endpoint>,
    // Guest UDP source port -> relay socket on the host.
    udp_flows: Mutex<HashMap<u16, Arc<UdpSocket>>>,
}

impl UserStack {
    pub fn new(
        host_mac: [u8; 6],
        guest_mac: [u8; 6],
        host_ip: Ipv4Addr,
        guest_ip: Ipv4Addr,
    ) -> Self {
        UserStack {
            endpoint: Arc::new(Endpoint {
                host_mac,
                guest_mac,
                host_ip,
                guest_ip,
                inbound: Mutex::new(VecDeque::new()),
                inbound_ready: Condvar::new(),
            }),
            udp_flows: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn pop_inbound(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        self.endpoint.pop_inbound(timeout)
    }

    fn udp_flow(&self, guest_port: u16) -> io::Result<Arc<UdpSocket>> {
        let mut flows = self.udp_flows.lock().unwrap();
        if let Some(socket) = flows.get(&guest_port) {
            return Ok(socket.clone());
        }

        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0))?);
        socket.set_broadcast(true)?;
        flows.insert(guest_port, socket.clone());

        // One reader per flow funnels replies back as guest frames.
        let endpoint = self.endpoint.clone();
        let reader = socket.clone();
        thread::Builder::new()
            .name(format!("uip-udp-{}", guest_port))
            .spawn(move || {
                let mut buf = [0u8; 65535];
                loop {
                    let (n, from) = match reader.recv_from(&mut buf) {
                        Ok(got) => got,
                        Err(e) => {
                            debug!("udp flow {} closed: {}", guest_port, e);
                            return;
                        }
                    };
                    let from_ip = match from {
                        SocketAddr::V4(v4) => *v4.ip(),
                        _ => continue,
                    };
                    endpoint.deliver_udp(from_ip, from.port(), guest_port, &buf[..n]);
                }
            })?;

        Ok(socket)
    }

    fn handle_udp(&self, ip: &[u8], ihl: usize) {
        let udp = &ip[ihl..];
        if udp.len() < 8 {
            return;
        }
        let src_port = u16::from_be_bytes([udp[0], udp[1]]);
        let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
        let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
        let payload = &udp[8..];

        let socket = match self.udp_flow(src_port) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("cannot open udp relay for port {}: {}", src_port, e);
                return;
            }
        };
        // Limited broadcasts are pointed at the host itself.
        let target = if dst_ip.is_broadcast() {
            self.endpoint.host_ip
        } else {
            dst_ip
        };
        if let Err(e) = socket.send_to(payload, (target, dst_port)) {
            warn!("udp relay to {}:{} failed: {}", target, dst_port, e);
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        if frame.len() < ETH_HDR_LEN {
            return;
        }
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        let payload = &frame[ETH_HDR_LEN..];

        match ethertype {
            ETHERTYPE_ARP => self.endpoint.handle_arp(payload),
            ETHERTYPE_IP => {
                if payload.len() < 20 || payload[0] >> 4 != 4 {
                    return;
                }
                let ihl = usize::from(payload[0] & 0xf) * 4;
                if payload.len() < ihl {
                    return;
                }
                match payload[9] {
                    IPPROTO_ICMP => self.endpoint.handle_icmp(payload, ihl),
                    IPPROTO_UDP => self.handle_udp(payload, ihl),
                    proto => debug!("user stack drops IP proto {}", proto),
                }
            }
            other => debug!("user stack drops ethertype {:#x}", other),
        }
    }
}

impl NetBackend for UserStack {
    fn rx(&self, frame: &mut [u8]) -> io::Result<usize> {
        let packet = match self.endpoint.pop_inbound(None) {
            Some(packet) => packet,
            None => return Ok(0),
        };
        let total = VIRTIO_NET_HDR_SIZE + packet.len();
        if frame.len() < total {
            return Err(io::Error::from_raw_os_error(libc::EMSGSIZE));
        }
        frame[..VIRTIO_NET_HDR_SIZE].iter_mut().for_each(|b| *b = 0);
        frame[VIRTIO_NET_HDR_SIZE..total].copy_from_slice(&packet);
        Ok(total)
    }

    fn tx(&self, frame: &[u8]) -> io::Result<usize> {
        if frame.len() > VIRTIO_NET_HDR_SIZE {
            self.handle_frame(&frame[VIRTIO_NET_HDR_SIZE..]);
        }
        Ok(frame.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_MAC: [u8; 6] = [0x02, 0x01, 0x01, 0x01, 0x01, 0x01];
    const GUEST_MAC: [u8; 6] = [0x02, 0x15, 0x15, 0x15, 0x15, 0x15];

    fn stack() -> UserStack {
        UserStack::new(
            HOST_MAC,
            GUEST_MAC,
            Ipv4Addr::new(192, 168, 33, 1),
            Ipv4Addr::new(192, 168, 33, 15),
        )
    }

    fn eth(ethertype: u16) -> Vec<u8> {
        let mut f = vec![0u8; VIRTIO_NET_HDR_SIZE];
        f.extend_from_slice(&HOST_MAC);
        f.extend_from_slice(&GUEST_MAC);
        f.extend_from_slice(&ethertype.to_be_bytes());
        f
    }

    fn ipv4(proto: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut ip = vec![0x45u8, 0];
        ip.extend_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0, 0, 64, proto, 0, 0]);
        ip.extend_from_slice(&src.octets());
        ip.extend_from_slice(&dst.octets());
        let cksum = checksum16(&ip[..20]);
        ip[10..12].copy_from_slice(&cksum.to_be_bytes());
        ip.extend_from_slice(payload);
        ip
    }

    #[test]
    fn arp_request_is_answered_with_the_host_mac() {
        let stack = stack();

        let mut frame = eth(ETHERTYPE_ARP);
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
        frame.extend_from_slice(&[6, 4]);
        frame.extend_from_slice(&ARP_OP_REQUEST.to_be_bytes());
        frame.extend_from_slice(&GUEST_MAC);
        frame.extend_from_slice(&[192, 168, 33, 15]);
        frame.extend_from_slice(&[0; 6]);
        frame.extend_from_slice(&[192, 168, 33, 1]);

        stack.tx(&frame).unwrap();
        let reply = stack.pop_inbound(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(&reply[..6], &GUEST_MAC);
        assert_eq!(u16::from_be_bytes([reply[12], reply[13]]), ETHERTYPE_ARP);
        let arp = &reply[ETH_HDR_LEN..];
        assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), ARP_OP_REPLY);
        assert_eq!(&arp[8..14], &HOST_MAC);
        assert_eq!(&arp[14..18], &[192, 168, 33, 1]);
    }

    #[test]
    fn icmp_echo_is_reflected() {
        let stack = stack();

        let mut icmp = vec![ICMP_ECHO_REQUEST, 0, 0, 0, 0, 1, 0, 1];
        icmp.extend_from_slice(b"payload");
        let cksum = checksum16(&icmp);
        icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

        let mut frame = eth(ETHERTYPE_IP);
        frame.extend_from_slice(&ipv4(
            IPPROTO_ICMP,
            Ipv4Addr::new(192, 168, 33, 15),
            Ipv4Addr::new(192, 168, 33, 1),
            &icmp,
        ));

        stack.tx(&frame).unwrap();
        let reply = stack.pop_inbound(Some(Duration::from_secs(1))).unwrap();

        let ip = &reply[ETH_HDR_LEN..];
        assert_eq!(ip[9], IPPROTO_ICMP);
        let echo = &ip[20..];
        assert_eq!(echo[0], ICMP_ECHO_REPLY);
        assert_eq!(&echo[8..], b"payload");
        assert_eq!(checksum16(echo), 0);
    }

    #[test]
    fn udp_is_relayed_both_ways() {
        let stack = stack();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut udp = Vec::new();
        udp.extend_from_slice(&7777u16.to_be_bytes());
        udp.extend_from_slice(&port.to_be_bytes());
        udp.extend_from_slice(&((8 + 5) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(b"knock");

        let mut frame = eth(ETHERTYPE_IP);
        frame.extend_from_slice(&ipv4(
            IPPROTO_UDP,
            Ipv4Addr::new(192, 168, 33, 15),
            Ipv4Addr::new(127, 0, 0, 1),
            &udp,
        ));
        stack.tx(&frame).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"knock");

        receiver.send_to(b"welcome", from).unwrap();
        let reply = stack.pop_inbound(Some(Duration::from_secs(5))).unwrap();

        let ip = &reply[ETH_HDR_LEN..];
        assert_eq!(ip[9], IPPROTO_UDP);
        let udp = &ip[20..];
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 7777);
        assert_eq!(&udp[8..], b"welcome");
    }
}
