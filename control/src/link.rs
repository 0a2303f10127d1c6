//! Link-layer control of WireGuard interfaces: creating and destroying the
//! netdev, bringing it up or down, and managing the CIDR addresses bound to
//! it. None of this touches the WireGuard crypto configuration itself (see
//! [`crate::wg`] for that) - it only manipulates the interface the way `ip
//! link` / `ip addr` would.

use std::{io, net::IpAddr};

use netlink_packet_route::{
    address::nlas::Nla as AddressNla,
    constants::*,
    link::nlas::{Info, InfoKind, Nla as LinkNla},
    AddressHeader, AddressMessage, LinkHeader, LinkMessage, RtnlMessage,
};
use netlink_request::netlink_request_rtnl;

use crate::device::{AllowedIp, InterfaceName};

/// Controls the link-layer existence and addressing of a WireGuard
/// interface. Kept as a trait so the lifecycle manager can be driven by an
/// in-memory fake in tests instead of talking to the kernel.
pub trait LinkController: Send + Sync {
    /// Creates a new interface of kind `wireguard` with the given name.
    fn create_interface(&self, name: &InterfaceName) -> io::Result<()>;
    /// Removes the interface. Idempotent: absence of the interface is not an error.
    fn delete_interface(&self, name: &InterfaceName) -> io::Result<()>;
    /// Brings the interface administratively up.
    fn set_up(&self, name: &InterfaceName) -> io::Result<()>;
    /// Brings the interface administratively down.
    fn set_down(&self, name: &InterfaceName) -> io::Result<()>;
    /// Adds a CIDR address to the interface.
    fn add_address(&self, name: &InterfaceName, address: &AllowedIp) -> io::Result<()>;
    /// Lists the CIDR addresses currently bound to the interface.
    fn list_addresses(&self, name: &InterfaceName) -> io::Result<Vec<AllowedIp>>;
    /// Reports whether an interface with this name currently exists.
    fn exists(&self, name: &InterfaceName) -> io::Result<bool>;
}

fn if_index(name: &InterfaceName) -> io::Result<u32> {
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such interface: {}", name),
        ));
    }
    Ok(index)
}

fn family_and_octets(address: IpAddr) -> (u8, Vec<u8>) {
    match address {
        IpAddr::V4(a) => (AF_INET as u8, a.octets().to_vec()),
        IpAddr::V6(a) => (AF_INET6 as u8, a.octets().to_vec()),
    }
}

/// A [`LinkController`] that drives the in-kernel link and address state
/// directly over `NETLINK_ROUTE`, the same socket idiom used for the WG
/// genl family in [`crate::wg::NetlinkWgController`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkLinkController;

impl LinkController for NetlinkLinkController {
    fn create_interface(&self, name: &InterfaceName) -> io::Result<()> {
        let message = LinkMessage {
            header: LinkHeader::default(),
            nlas: vec![
                LinkNla::IfName(name.as_str_lossy().to_string()),
                LinkNla::Info(vec![Info::Kind(InfoKind::Wireguard)]),
            ],
        };
        let responses = netlink_request_rtnl(
            RtnlMessage::NewLink(message),
            Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_EXCL | NLM_F_CREATE),
        )?;
        check_ack(responses)
    }

    fn delete_interface(&self, name: &InterfaceName) -> io::Result<()> {
        let index = match if_index(name) {
            Ok(index) => index,
            // Already gone; deleting a nonexistent interface is a no-op.
            Err(_) => return Ok(()),
        };
        let message = LinkMessage {
            header: LinkHeader {
                index,
                ..Default::default()
            },
            nlas: vec![],
        };
        let responses = netlink_request_rtnl(
            RtnlMessage::DelLink(message),
            Some(NLM_F_REQUEST | NLM_F_ACK),
        )?;
        check_ack(responses)
    }

    fn set_up(&self, name: &InterfaceName) -> io::Result<()> {
        set_link_flags(name, IFF_UP, IFF_UP)
    }

    fn set_down(&self, name: &InterfaceName) -> io::Result<()> {
        set_link_flags(name, 0, IFF_UP)
    }

    fn add_address(&self, name: &InterfaceName, address: &AllowedIp) -> io::Result<()> {
        let index = if_index(name)?;
        let (family, octets) = family_and_octets(address.address);
        let message = AddressMessage {
            header: AddressHeader {
                family,
                prefix_len: address.cidr,
                index,
                ..Default::default()
            },
            nlas: vec![AddressNla::Local(octets.clone()), AddressNla::Address(octets)],
        };
        let responses = netlink_request_rtnl(
            RtnlMessage::NewAddress(message),
            Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE),
        )?;
        check_ack(responses)
    }

    fn list_addresses(&self, name: &InterfaceName) -> io::Result<Vec<AllowedIp>> {
        let index = if_index(name)?;
        let responses = netlink_request_rtnl(
            RtnlMessage::GetAddress(AddressMessage::default()),
            Some(NLM_F_REQUEST | NLM_F_DUMP),
        )?;
        let addresses = responses
            .into_iter()
            .filter_map(|response| match response.payload {
                netlink_packet_core::NetlinkPayload::InnerMessage(RtnlMessage::NewAddress(
                    address,
                )) if address.header.index == index => Some(address),
                _ => None,
            })
            .filter_map(|address| {
                let addr = address.nlas.iter().find_map(|nla| match nla {
                    AddressNla::Address(bytes) | AddressNla::Local(bytes) => {
                        parse_addr(address.header.family, bytes)
                    },
                    _ => None,
                })?;
                Some(AllowedIp {
                    address: addr,
                    cidr: address.header.prefix_len,
                })
            })
            .collect();
        Ok(addresses)
    }

    fn exists(&self, name: &InterfaceName) -> io::Result<bool> {
        Ok(if_index(name).is_ok())
    }
}

fn parse_addr(family: u8, bytes: &[u8]) -> Option<IpAddr> {
    match family as u16 {
        AF_INET => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::from(b)),
        AF_INET6 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::from(b)),
        _ => None,
    }
}

fn set_link_flags(name: &InterfaceName, flags: u32, change_mask: u32) -> io::Result<()> {
    let index = if_index(name)?;
    let message = LinkMessage {
        header: LinkHeader {
            index,
            flags,
            change_mask,
            ..Default::default()
        },
        nlas: vec![],
    };
    let responses = netlink_request_rtnl(
        RtnlMessage::SetLink(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    check_ack(responses)
}

fn check_ack(
    responses: Vec<netlink_packet_core::NetlinkMessage<RtnlMessage>>,
) -> io::Result<()> {
    for response in responses {
        if let netlink_packet_core::NetlinkPayload::Error(e) = response.payload {
            return Err(e.to_io());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_delete_requires_root() {
        if unsafe { libc::getuid() } != 0 {
            return;
        }

        let name: InterfaceName = "meshguard-lt0".parse().unwrap();
        let ctl = NetlinkLinkController;
        ctl.create_interface(&name).unwrap();
        assert!(ctl.exists(&name).unwrap());
        ctl.set_up(&name).unwrap();
        ctl.delete_interface(&name).unwrap();
        assert!(!ctl.exists(&name).unwrap());
    }
}
