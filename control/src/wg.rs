//! Control of the WireGuard crypto-layer configuration (keys, listen port,
//! peers) via the in-kernel `wg` generic-netlink family. This intentionally
//! never touches link existence or addressing (see [`crate::link`]).

use std::{convert::TryFrom, io, net::SocketAddr};

use netlink_packet_core::{NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_generic::GenlMessage;
use netlink_packet_route::{constants::*, link::nlas::{Info, InfoKind, Nla as LinkNla}, LinkMessage, RtnlMessage};
use netlink_packet_wireguard::{
    nlas::{WgAllowedIpAttrs, WgDeviceAttrs, WgPeerAttrs},
    Wireguard, WireguardCmd,
};
use netlink_request::{netlink_request_genl, netlink_request_rtnl};

use crate::{
    config::PeerConfigBuilder,
    device::{AllowedIp, Device, DeviceUpdate, InterfaceName, PeerConfig, PeerInfo, PeerStats},
    key::Key,
};

/// `wgdevice_flag` from `linux/wireguard.h`.
const WGDEVICE_F_REPLACE_PEERS: u32 = 1 << 0;
/// `wgpeer_flag` from `linux/wireguard.h`.
const WGPEER_F_REMOVE_ME: u32 = 1 << 0;
const WGPEER_F_REPLACE_ALLOWEDIPS: u32 = 1 << 1;
const WGPEER_F_UPDATE_ONLY: u32 = 1 << 2;

macro_rules! get_nla_value {
    ($nlas:expr, $e:ident, $v:ident) => {
        $nlas.iter().find_map(|attr| match attr {
            $e::$v(value) => Some(value),
            _ => None,
        })
    };
}

/// Controls the crypto-layer configuration of a WireGuard interface. A
/// trait so the reconciler and lifecycle manager can be driven from a
/// recorded fake in tests.
pub trait WgController: Send + Sync {
    /// Applies a configuration update to the named interface, creating
    /// peers (or updating/removing them) as described by `update`.
    fn configure_device(&self, name: &InterfaceName, update: &DeviceUpdate) -> io::Result<()>;
    /// Reads back the full current state of the named interface.
    fn device(&self, name: &InterfaceName) -> io::Result<Device>;
    /// Enumerates every WireGuard interface currently present on the host.
    fn devices(&self) -> io::Result<Vec<InterfaceName>>;
}

/// A [`WgController`] backed by the in-kernel WireGuard generic-netlink
/// family.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkWgController;

impl WgController for NetlinkWgController {
    fn configure_device(&self, name: &InterfaceName, update: &DeviceUpdate) -> io::Result<()> {
        let mut nlas = vec![WgDeviceAttrs::IfName(name.as_str_lossy().to_string())];

        if let Some(key) = &update.public_key {
            nlas.push(WgDeviceAttrs::PublicKey(key.0));
        }
        if let Some(key) = &update.private_key {
            nlas.push(WgDeviceAttrs::PrivateKey(key.0));
        }
        if let Some(fwmark) = update.fwmark {
            nlas.push(WgDeviceAttrs::Fwmark(fwmark));
        }
        if let Some(port) = update.listen_port {
            nlas.push(WgDeviceAttrs::ListenPort(port));
        }
        if update.replace_peers {
            nlas.push(WgDeviceAttrs::Flags(WGDEVICE_F_REPLACE_PEERS));
        }
        if !update.peers.is_empty() {
            nlas.push(WgDeviceAttrs::Peers(
                update.peers.iter().map(encode_peer).collect(),
            ));
        }

        let genlmsg: GenlMessage<Wireguard> = GenlMessage::from_payload(Wireguard {
            cmd: WireguardCmd::SetDevice,
            nlas,
        });
        let responses = netlink_request_genl(genlmsg, Some(NLM_F_REQUEST | NLM_F_ACK))?;
        check_genl_ack(responses)
    }

    fn device(&self, name: &InterfaceName) -> io::Result<Device> {
        let genlmsg: GenlMessage<Wireguard> = GenlMessage::from_payload(Wireguard {
            cmd: WireguardCmd::GetDevice,
            nlas: vec![WgDeviceAttrs::IfName(name.as_str_lossy().to_string())],
        });
        let responses = netlink_request_genl(genlmsg, Some(NLM_F_REQUEST | NLM_F_ACK))?;

        if let Some(NetlinkPayload::Error(e)) = responses
            .iter()
            .map(|m| &m.payload)
            .find(|p| matches!(p, NetlinkPayload::Error(_)))
        {
            return Err(e.to_io());
        }
        let message = responses
            .into_iter()
            .find_map(|response| match response.payload {
                NetlinkPayload::InnerMessage(message) => Some(message),
                _ => None,
            })
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "no device message in response")
            })?;
        Device::try_from(&message.payload)
    }

    fn devices(&self) -> io::Result<Vec<InterfaceName>> {
        let responses = netlink_request_rtnl(
            RtnlMessage::GetLink(LinkMessage::default()),
            Some(NLM_F_REQUEST | NLM_F_DUMP),
        )?;
        let names = responses
            .into_iter()
            .filter_map(|response| match response.payload {
                NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)) => Some(link),
                _ => None,
            })
            .filter(|link| {
                link.nlas.iter().any(|nla| match nla {
                    LinkNla::Info(infos) => {
                        infos.iter().any(|info| info == &Info::Kind(InfoKind::Wireguard))
                    },
                    _ => false,
                })
            })
            .filter_map(|link| {
                link.nlas.iter().find_map(|nla| match nla {
                    LinkNla::IfName(name) => Some(name.clone()),
                    _ => None,
                })
            })
            .filter_map(|name| name.parse().ok())
            .collect();
        Ok(names)
    }
}

fn encode_peer(peer: &PeerConfigBuilder) -> Vec<WgPeerAttrs> {
    let mut attrs = vec![WgPeerAttrs::PublicKey(peer.public_key.0)];

    if let Some(psk) = &peer.preshared_key {
        attrs.push(WgPeerAttrs::PresharedKey(psk.0));
    }
    if let Some(endpoint) = peer.endpoint {
        attrs.push(WgPeerAttrs::Endpoint(endpoint));
    }
    if let Some(interval) = peer.persistent_keepalive_interval {
        attrs.push(WgPeerAttrs::PersistentKeepalive(interval));
    }

    let mut flags = 0;
    if peer.remove_me {
        flags |= WGPEER_F_REMOVE_ME;
    }
    if peer.replace_allowed_ips {
        flags |= WGPEER_F_REPLACE_ALLOWEDIPS;
    }
    if peer.update_only {
        flags |= WGPEER_F_UPDATE_ONLY;
    }
    if flags != 0 {
        attrs.push(WgPeerAttrs::Flags(flags));
    }

    if !peer.allowed_ips.is_empty() {
        attrs.push(WgPeerAttrs::AllowedIps(
            peer.allowed_ips
                .iter()
                .map(|ip| {
                    vec![
                        WgAllowedIpAttrs::Family(if ip.address.is_ipv4() { AF_INET } else { AF_INET6 }),
                        WgAllowedIpAttrs::IpAddr(ip.address),
                        WgAllowedIpAttrs::Cidr(ip.cidr),
                    ]
                })
                .collect(),
        ));
    }

    attrs
}

fn check_genl_ack(
    responses: Vec<netlink_packet_core::NetlinkMessage<GenlMessage<Wireguard>>>,
) -> io::Result<()> {
    for response in responses {
        if let NetlinkPayload::Error(e) = response.payload {
            return Err(e.to_io());
        }
    }
    Ok(())
}

impl<'a> TryFrom<Vec<WgAllowedIpAttrs>> for AllowedIp {
    type Error = io::Error;

    fn try_from(attrs: Vec<WgAllowedIpAttrs>) -> Result<Self, Self::Error> {
        let address = *get_nla_value!(attrs, WgAllowedIpAttrs, IpAddr)
            .ok_or(io::ErrorKind::NotFound)?;
        let cidr = *get_nla_value!(attrs, WgAllowedIpAttrs, Cidr).ok_or(io::ErrorKind::NotFound)?;
        Ok(AllowedIp { address, cidr })
    }
}

impl TryFrom<Vec<WgPeerAttrs>> for PeerInfo {
    type Error = io::Error;

    fn try_from(attrs: Vec<WgPeerAttrs>) -> Result<Self, Self::Error> {
        let public_key = get_nla_value!(attrs, WgPeerAttrs, PublicKey)
            .map(|key| Key(*key))
            .ok_or(io::ErrorKind::NotFound)?;
        let preshared_key = get_nla_value!(attrs, WgPeerAttrs, PresharedKey).map(|key| Key(*key));
        let endpoint: Option<SocketAddr> = get_nla_value!(attrs, WgPeerAttrs, Endpoint).copied();
        let persistent_keepalive_interval =
            get_nla_value!(attrs, WgPeerAttrs, PersistentKeepalive).copied();
        let allowed_ips = get_nla_value!(attrs, WgPeerAttrs, AllowedIps)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(AllowedIp::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let last_handshake_time = get_nla_value!(attrs, WgPeerAttrs, LastHandshake).copied();
        let rx_bytes = get_nla_value!(attrs, WgPeerAttrs, RxBytes).copied().unwrap_or_default();
        let tx_bytes = get_nla_value!(attrs, WgPeerAttrs, TxBytes).copied().unwrap_or_default();
        Ok(PeerInfo {
            config: PeerConfig {
                public_key,
                preshared_key,
                endpoint,
                persistent_keepalive_interval,
                allowed_ips,
            },
            stats: PeerStats {
                last_handshake_time,
                rx_bytes,
                tx_bytes,
            },
        })
    }
}

impl<'a> TryFrom<&'a Wireguard> for Device {
    type Error = io::Error;

    fn try_from(wg: &'a Wireguard) -> Result<Self, Self::Error> {
        let name = get_nla_value!(wg.nlas, WgDeviceAttrs, IfName)
            .ok_or(io::ErrorKind::NotFound)?
            .parse()?;
        let public_key = get_nla_value!(wg.nlas, WgDeviceAttrs, PublicKey).map(|key| Key(*key));
        let private_key = get_nla_value!(wg.nlas, WgDeviceAttrs, PrivateKey).map(|key| Key(*key));
        let listen_port = get_nla_value!(wg.nlas, WgDeviceAttrs, ListenPort).copied();
        let fwmark = get_nla_value!(wg.nlas, WgDeviceAttrs, Fwmark).copied();
        let peers = get_nla_value!(wg.nlas, WgDeviceAttrs, Peers)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(PeerInfo::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Device {
            name,
            public_key,
            private_key,
            listen_port,
            fwmark,
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyPair;

    #[test]
    fn test_encode_peer_flags() {
        let keypair = KeyPair::generate();
        let builder = PeerConfigBuilder::new(&keypair.public)
            .replace_allowed_ips()
            .update_only()
            .add_allowed_ip("10.0.0.5".parse().unwrap(), 32);

        let attrs = encode_peer(&builder);
        let flags = attrs
            .iter()
            .find_map(|a| match a {
                WgPeerAttrs::Flags(f) => Some(*f),
                _ => None,
            })
            .unwrap();
        assert_eq!(flags, WGPEER_F_REPLACE_ALLOWEDIPS | WGPEER_F_UPDATE_ONLY);
    }

    #[test]
    fn test_list_devices_requires_root() {
        if unsafe { libc::getuid() } != 0 {
            return;
        }
        let ctl = NetlinkWgController;
        ctl.devices().unwrap();
    }
}
