//! Parses the externally-supplied, line-oriented `.conf`-style interface
//! and peer configuration text described in §4.9 - the de-facto WireGuard
//! wire format's `[Interface]` / `[Peer]` INI dialect.

use meshguard_control::Key;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigImportError {
    #[error("interface section is missing a PrivateKey")]
    MissingPrivateKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedInterface {
    pub private_key: Key,
    pub address: String,
    pub listen_port: u16,
    pub dns: String,
    pub mtu: u32,
}

impl Default for ImportedInterface {
    fn default() -> Self {
        Self {
            private_key: Key::zero(),
            address: String::new(),
            listen_port: 0,
            dns: String::new(),
            mtu: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedPeer {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub allowed_ips: String,
    pub endpoint: String,
    pub persistent_keepalive: u16,
}

impl Default for ImportedPeer {
    fn default() -> Self {
        Self {
            public_key: Key::zero(),
            preshared_key: None,
            allowed_ips: String::new(),
            endpoint: String::new(),
            persistent_keepalive: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportedConfig {
    pub interface: ImportedInterface,
    pub peers: Vec<ImportedPeer>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

/// Parses `text` into an [`ImportedConfig`]. Blank lines and lines starting
/// with `#` or `;` are skipped. Keys are matched case-insensitively.
/// Unknown keys are ignored. An integer field that fails to parse is
/// demoted to zero rather than aborting the parse. A `[Peer]` header
/// encountered while a peer is already under construction finalizes that
/// peer first. Fails only when the interface section never supplies a
/// `PrivateKey`.
pub fn parse(text: &str) -> Result<ImportedConfig, ConfigImportError> {
    let mut section = Section::None;
    let mut interface = ImportedInterface::default();
    let mut have_private_key = false;
    let mut peers = Vec::new();
    let mut current: Option<ImportedPeer> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let header = line[1..line.len() - 1].trim();
            if header.eq_ignore_ascii_case("interface") {
                finalize_peer(&mut current, &mut peers);
                section = Section::Interface;
            } else if header.eq_ignore_ascii_case("peer") {
                finalize_peer(&mut current, &mut peers);
                current = Some(ImportedPeer::default());
                section = Section::Peer;
            } else {
                finalize_peer(&mut current, &mut peers);
                section = Section::None;
            }
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match section {
            Section::Interface => apply_interface_key(&mut interface, &mut have_private_key, &key, value),
            Section::Peer => {
                if let Some(peer) = current.as_mut() {
                    apply_peer_key(peer, &key, value);
                }
            },
            Section::None => {},
        }
    }
    finalize_peer(&mut current, &mut peers);

    if !have_private_key {
        return Err(ConfigImportError::MissingPrivateKey);
    }

    Ok(ImportedConfig { interface, peers })
}

fn finalize_peer(current: &mut Option<ImportedPeer>, peers: &mut Vec<ImportedPeer>) {
    if let Some(peer) = current.take() {
        peers.push(peer);
    }
}

fn apply_interface_key(interface: &mut ImportedInterface, have_private_key: &mut bool, key: &str, value: &str) {
    match key {
        "privatekey" => match Key::from_base64(value) {
            Ok(k) => {
                interface.private_key = k;
                *have_private_key = true;
            },
            Err(_) => log::warn!("config import: ignoring unparseable PrivateKey value"),
        },
        "address" => interface.address = value.to_string(),
        "listenport" => interface.listen_port = parse_or_zero(value),
        "dns" => interface.dns = value.to_string(),
        "mtu" => interface.mtu = parse_or_zero(value),
        _ => {},
    }
}

fn apply_peer_key(peer: &mut ImportedPeer, key: &str, value: &str) {
    match key {
        "publickey" => match Key::from_base64(value) {
            Ok(k) => peer.public_key = k,
            Err(_) => log::warn!("config import: ignoring unparseable PublicKey value"),
        },
        "presharedkey" => match Key::from_base64(value) {
            Ok(k) => peer.preshared_key = Some(k),
            Err(_) => log::warn!("config import: ignoring unparseable PresharedKey value"),
        },
        "allowedips" => peer.allowed_ips = value.to_string(),
        "endpoint" => peer.endpoint = value.to_string(),
        "persistentkeepalive" => peer.persistent_keepalive = parse_or_zero(value),
        _ => {},
    }
}

fn parse_or_zero<T: std::str::FromStr + Default>(value: &str) -> T {
    value.parse().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_private_key_fails() {
        let text = "[Interface]\nListenPort = 51820\n";
        assert!(matches!(parse(text), Err(ConfigImportError::MissingPrivateKey)));
    }

    #[test]
    fn test_parses_interface_and_peers() {
        let private = Key::generate_private();
        let public = Key::generate_private().get_public();
        let text = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.0.0.1/24\nListenPort = 51820\nDNS = 1.1.1.1\n\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.0.2/32\nPersistentKeepalive = 25\n",
            private.to_base64(),
            public.to_base64(),
        );

        let config = parse(&text).unwrap();
        assert_eq!(config.interface.private_key, private);
        assert_eq!(config.interface.address, "10.0.0.1/24");
        assert_eq!(config.interface.listen_port, 51820);
        assert_eq!(config.interface.dns, "1.1.1.1");
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].public_key, public);
        assert_eq!(config.peers[0].persistent_keepalive, 25);
    }

    #[test]
    fn test_case_insensitive_section_headers_and_keys() {
        let private = Key::generate_private();
        let text = format!("[iNtErFaCe]\nprivatekey = {}\n", private.to_base64());
        let config = parse(&text).unwrap();
        assert_eq!(config.interface.private_key, private);
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let private = Key::generate_private();
        let text = format!(
            "# a comment\n; another comment\n\n[Interface]\nPrivateKey = {}\n",
            private.to_base64()
        );
        assert!(parse(&text).is_ok());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let private = Key::generate_private();
        let text = format!("[Interface]\nPrivateKey = {}\nFooBar = baz\n", private.to_base64());
        assert!(parse(&text).is_ok());
    }

    #[test]
    fn test_bad_integer_demotes_to_zero() {
        let private = Key::generate_private();
        let text = format!(
            "[Interface]\nPrivateKey = {}\nListenPort = not-a-number\n",
            private.to_base64()
        );
        let config = parse(&text).unwrap();
        assert_eq!(config.interface.listen_port, 0);
    }

    #[test]
    fn test_repeated_peer_sections_finalize_previous_peer() {
        let private = Key::generate_private();
        let p1 = Key::generate_private().get_public();
        let p2 = Key::generate_private().get_public();
        let text = format!(
            "[Interface]\nPrivateKey = {}\n\n[Peer]\nPublicKey = {}\n\n[Peer]\nPublicKey = {}\n",
            private.to_base64(),
            p1.to_base64(),
            p2.to_base64(),
        );
        let config = parse(&text).unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].public_key, p1);
        assert_eq!(config.peers[1].public_key, p2);
    }
}
