//! Minimal virtual gateway for the datagram-socket attachment.
//!
//! The socketpair NIC is plain L2 with nothing on the host side to answer
//! ARP, so the VM would never resolve its default route. This gateway
//! learns the VM's MAC from its first frame, claims every queried IPv4
//! address with a fixed locally administered MAC, and converts between
//! ethernet frames (VM side) and bare IP packets (tunnel side).

use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
};
use std::sync::Mutex;

/// Locally administered MAC the gateway answers ARP with.
pub const GATEWAY_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

const ETHERNET_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

/// What to do with one frame read from the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An ARP reply to write straight back to the VM.
    ArpReply(Vec<u8>),
    /// An IP packet to hand to the tunnel.
    Packet(Vec<u8>),
    /// Not forwardable; ignore.
    Drop,
}

pub struct VirtualGateway {
    vm_mac: Mutex<Option<EthernetAddress>>,
}

impl VirtualGateway {
    pub fn new() -> Self {
        Self {
            vm_mac: Mutex::new(None),
        }
    }

    /// MAC learned from the VM, once it has sent a frame.
    pub fn vm_mac(&self) -> Option<[u8; 6]> {
        self.vm_mac.lock().unwrap().map(|mac| mac.0)
    }

    /// Classify one frame coming out of the VM.
    pub fn handle_outbound(&self, frame: &[u8]) -> Outbound {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return Outbound::Drop;
        };

        let src = eth.src_addr();
        if src.is_unicast() {
            let mut learned = self.vm_mac.lock().unwrap();
            if learned.is_none() {
                tracing::debug!(mac = %src, "learned VM MAC");
            }
            // Track the most recent unicast source in case the guest
            // re-rolls its MAC on reboot.
            *learned = Some(src);
        }

        match eth.ethertype() {
            EthernetProtocol::Arp => match self.arp_reply(eth.payload()) {
                Some(reply) => Outbound::ArpReply(reply),
                None => Outbound::Drop,
            },
            EthernetProtocol::Ipv4 | EthernetProtocol::Ipv6 => {
                Outbound::Packet(eth.payload().to_vec())
            }
            _ => Outbound::Drop,
        }
    }

    /// Re-frame an IP packet arriving from the tunnel for delivery to the
    /// VM. Returns `None` until the VM's MAC is known or when the payload
    /// is not IP.
    pub fn frame_inbound(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let dst = (*self.vm_mac.lock().unwrap())?;
        let ethertype = match packet.first()? >> 4 {
            4 => ETHERTYPE_IPV4,
            6 => ETHERTYPE_IPV6,
            _ => return None,
        };

        let mut buf = vec![0u8; ETHERNET_HEADER_LEN + packet.len()];
        let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
        eth.set_dst_addr(dst);
        eth.set_src_addr(EthernetAddress(GATEWAY_MAC));
        eth.set_ethertype(EthernetProtocol::from(ethertype));
        eth.payload_mut().copy_from_slice(packet);
        Some(buf)
    }

    /// Answer an ARP request by claiming the queried address.
    fn arp_reply(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let packet = ArpPacket::new_checked(payload).ok()?;
        let ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = ArpRepr::parse(&packet).ok()?
        else {
            return None;
        };

        let reply = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: EthernetAddress(GATEWAY_MAC),
            source_protocol_addr: target_protocol_addr,
            target_hardware_addr: source_hardware_addr,
            target_protocol_addr: source_protocol_addr,
        };

        let mut buf = vec![0u8; ETHERNET_HEADER_LEN + reply.buffer_len()];
        let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
        eth.set_dst_addr(source_hardware_addr);
        eth.set_src_addr(EthernetAddress(GATEWAY_MAC));
        eth.set_ethertype(EthernetProtocol::Arp);
        reply.emit(&mut ArpPacket::new_unchecked(eth.payload_mut()));
        Some(buf)
    }
}

impl Default for VirtualGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::Ipv4Address;

    const VM_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];

    fn eth_frame(src: [u8; 6], ethertype: EthernetProtocol, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; ETHERNET_HEADER_LEN + payload.len()];
        let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
        eth.set_dst_addr(EthernetAddress([0xff; 6]));
        eth.set_src_addr(EthernetAddress(src));
        eth.set_ethertype(ethertype);
        eth.payload_mut().copy_from_slice(payload);
        buf
    }

    fn arp_request(queried: Ipv4Address) -> Vec<u8> {
        let repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: EthernetAddress(VM_MAC),
            source_protocol_addr: Ipv4Address::new(10, 200, 200, 2),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: queried,
        };
        let mut payload = vec![0u8; repr.buffer_len()];
        repr.emit(&mut ArpPacket::new_unchecked(&mut payload[..]));
        eth_frame(VM_MAC, EthernetProtocol::Arp, &payload)
    }

    fn ipv4_packet() -> Vec<u8> {
        // Version/IHL byte is all the gateway inspects.
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet
    }

    #[test]
    fn answers_arp_for_any_queried_address() {
        let gw = VirtualGateway::new();
        for queried in [
            Ipv4Address::new(10, 200, 200, 1),
            Ipv4Address::new(1, 1, 1, 1),
        ] {
            let Outbound::ArpReply(reply) = gw.handle_outbound(&arp_request(queried)) else {
                panic!("expected ARP reply");
            };

            let eth = EthernetFrame::new_checked(&reply[..]).unwrap();
            assert_eq!(eth.dst_addr(), EthernetAddress(VM_MAC));
            assert_eq!(eth.src_addr(), EthernetAddress(GATEWAY_MAC));

            let arp = ArpPacket::new_checked(eth.payload()).unwrap();
            let ArpRepr::EthernetIpv4 {
                operation,
                source_hardware_addr,
                source_protocol_addr,
                ..
            } = ArpRepr::parse(&arp).unwrap()
            else {
                panic!("expected ethernet/ipv4 ARP");
            };
            assert_eq!(operation, ArpOperation::Reply);
            assert_eq!(source_hardware_addr, EthernetAddress(GATEWAY_MAC));
            assert_eq!(source_protocol_addr, queried);
        }
    }

    #[test]
    fn strips_ethernet_for_outbound_ip() {
        let gw = VirtualGateway::new();
        let packet = ipv4_packet();
        let frame = eth_frame(VM_MAC, EthernetProtocol::Ipv4, &packet);
        assert_eq!(gw.handle_outbound(&frame), Outbound::Packet(packet));
    }

    #[test]
    fn learns_mac_from_first_frame() {
        let gw = VirtualGateway::new();
        assert_eq!(gw.vm_mac(), None);
        gw.handle_outbound(&eth_frame(VM_MAC, EthernetProtocol::Ipv4, &ipv4_packet()));
        assert_eq!(gw.vm_mac(), Some(VM_MAC));
    }

    #[test]
    fn inbound_needs_learned_mac() {
        let gw = VirtualGateway::new();
        assert_eq!(gw.frame_inbound(&ipv4_packet()), None);

        gw.handle_outbound(&eth_frame(VM_MAC, EthernetProtocol::Ipv4, &ipv4_packet()));
        let framed = gw.frame_inbound(&ipv4_packet()).unwrap();

        let eth = EthernetFrame::new_checked(&framed[..]).unwrap();
        assert_eq!(eth.dst_addr(), EthernetAddress(VM_MAC));
        assert_eq!(eth.src_addr(), EthernetAddress(GATEWAY_MAC));
        assert_eq!(eth.ethertype(), EthernetProtocol::Ipv4);
        assert_eq!(eth.payload(), &ipv4_packet()[..]);
    }

    #[test]
    fn inbound_ipv6_gets_ipv6_ethertype() {
        let gw = VirtualGateway::new();
        gw.handle_outbound(&eth_frame(VM_MAC, EthernetProtocol::Ipv4, &ipv4_packet()));

        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        let framed = gw.frame_inbound(&packet).unwrap();
        let eth = EthernetFrame::new_checked(&framed[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Ipv6);
    }

    #[test]
    fn drops_unknown_ethertype() {
        let gw = VirtualGateway::new();
        let frame = eth_frame(VM_MAC, EthernetProtocol::from(0x88cc), &[0u8; 8]);
        assert_eq!(gw.handle_outbound(&frame), Outbound::Drop);
    }

    #[test]
    fn drops_truncated_frames() {
        let gw = VirtualGateway::new();
        assert_eq!(gw.handle_outbound(&[0u8; 6]), Outbound::Drop);
    }
}
