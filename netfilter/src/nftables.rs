use std::io;

use crate::{
    rule::{BridgeDirection, FirewallRule},
    wire::{
        commit_batch, AttrWriter, NftMessage, NFPROTO_INET, NFT_MSG_DELTABLE, NFT_MSG_NEWCHAIN,
        NFT_MSG_NEWRULE, NFT_MSG_NEWTABLE,
    },
};

// Attribute indices from `linux/netfilter/nf_tables.h`. Only the subset this
// applier needs is modeled.
const NFTA_TABLE_NAME: u16 = 1;
const NFTA_CHAIN_TABLE: u16 = 1;
const NFTA_CHAIN_NAME: u16 = 2;
const NFTA_CHAIN_HOOK: u16 = 3;
const NFTA_CHAIN_POLICY: u16 = 4;
const NFTA_CHAIN_TYPE: u16 = 7;
const NFTA_HOOK_HOOKNUM: u16 = 1;
const NFTA_HOOK_PRIORITY: u16 = 2;
const NFTA_RULE_TABLE: u16 = 1;
const NFTA_RULE_CHAIN: u16 = 2;
const NFTA_RULE_EXPRESSIONS: u16 = 4;
const NFTA_LIST_ELEM: u16 = 1;
const NFTA_EXPR_NAME: u16 = 1;
const NFTA_EXPR_DATA: u16 = 2;
const NFTA_MASQ_FLAGS: u16 = 1;
const NFTA_META_DREG: u16 = 1;
const NFTA_META_KEY: u16 = 2;
const NFTA_CMP_SREG: u16 = 1;
const NFTA_CMP_OP: u16 = 2;
const NFTA_CMP_DATA: u16 = 3;
const NFTA_DATA_VALUE: u16 = 1;
const NFT_CMP_EQ: u8 = 0;
const NFT_META_IIFNAME: u32 = 5;
const NFT_META_OIFNAME: u32 = 6;
const NFT_REG_1: u32 = 8;

// Chain hook numbers / priorities, from `linux/netfilter_ipv4.h` and the
// nftables standard chain conventions.
const NF_INET_POST_ROUTING: u32 = 4;
const NF_INET_FORWARD: u32 = 3;
const NF_IP_PRI_NAT_SRC: i32 = 100;
const NF_IP_PRI_FILTER: i32 = 0;

// Named `wgpilot` per this system's kernel packet-filter contract - this is
// the one process-wide well-known external identifier in the whole design.
const TABLE_NAME: &str = "wgpilot";
const POSTROUTING_CHAIN: &str = "postrouting";
const FORWARD_CHAIN: &str = "forward";

/// Applies a full rule set into the kernel, replacing whatever this system
/// previously owned. Implementors are expected to make the swap atomic -
/// the nftables backend does this with a single batched netlink
/// transaction rebuilding the table from scratch.
pub trait RuleSetApplier: Send + Sync {
    fn apply(&self, rules: &[FirewallRule]) -> io::Result<()>;
}

/// Rebuilds the dedicated `wgpilot` nftables table from scratch on every
/// apply: one NAT (postrouting) chain, one forward chain, and one rule per
/// [`FirewallRule`]. This full-rewrite approach trades efficiency for the
/// simplicity of never having to diff or track individual kernel rule
/// handles between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct NftablesApplier;

impl RuleSetApplier for NftablesApplier {
    fn apply(&self, rules: &[FirewallRule]) -> io::Result<()> {
        // Flush whatever this system owns before rebuilding: deleting the
        // table cascades to every chain and rule nested under it, so the
        // rest of this batch starts from nothing rather than appending on
        // top of the previous apply's rules. The first ever apply has
        // nothing to delete - that failure is expected and swallowed.
        let mut messages = vec![
            delete_table(),
            new_table(),
            new_postrouting_chain(),
            new_forward_chain(),
        ];

        for rule in rules {
            match rule {
                FirewallRule::NatMasquerade { interface } => {
                    messages.push(masquerade_rule(interface.as_str_lossy().as_ref()));
                },
                FirewallRule::InterPeerForward { interface } => {
                    let name = interface.as_str_lossy();
                    messages.push(forward_rule(name.as_ref(), name.as_ref()));
                },
                FirewallRule::NetworkBridge { a, b, direction } => {
                    let a = a.as_str_lossy();
                    let b = b.as_str_lossy();
                    messages.push(forward_rule(a.as_ref(), b.as_ref()));
                    if *direction == BridgeDirection::Bidirectional {
                        messages.push(forward_rule(b.as_ref(), a.as_ref()));
                    }
                },
            }
        }

        commit_batch(messages)
    }
}

fn new_table() -> NftMessage {
    let mut body = AttrWriter::new();
    body.push_str_nul(NFTA_TABLE_NAME, TABLE_NAME);
    NftMessage::new(NFT_MSG_NEWTABLE, NFPROTO_INET, body)
}

/// Deletes the owned table outright, taking every chain and rule nested
/// under it with it. Errors (there is no `wgpilot` table yet) are expected
/// on the very first apply and ignored.
fn delete_table() -> NftMessage {
    let mut body = AttrWriter::new();
    body.push_str_nul(NFTA_TABLE_NAME, TABLE_NAME);
    let mut message = NftMessage::new(NFT_MSG_DELTABLE, NFPROTO_INET, body);
    message.ignore_errors = true;
    message
}

fn new_postrouting_chain() -> NftMessage {
    let mut body = AttrWriter::new();
    body.push_str_nul(NFTA_CHAIN_TABLE, TABLE_NAME);
    body.push_str_nul(NFTA_CHAIN_NAME, POSTROUTING_CHAIN);
    body.push_str_nul(NFTA_CHAIN_TYPE, "nat");
    let hook = body.nest_start(NFTA_CHAIN_HOOK);
    body.push_u32_be(NFTA_HOOK_HOOKNUM, NF_INET_POST_ROUTING);
    body.push_u32_be(NFTA_HOOK_PRIORITY, NF_IP_PRI_NAT_SRC as u32);
    body.nest_end(hook);
    body.push_u8(NFTA_CHAIN_POLICY, 0); // accept
    NftMessage::new(NFT_MSG_NEWCHAIN, NFPROTO_INET, body)
}

fn new_forward_chain() -> NftMessage {
    let mut body = AttrWriter::new();
    body.push_str_nul(NFTA_CHAIN_TABLE, TABLE_NAME);
    body.push_str_nul(NFTA_CHAIN_NAME, FORWARD_CHAIN);
    body.push_str_nul(NFTA_CHAIN_TYPE, "filter");
    let hook = body.nest_start(NFTA_CHAIN_HOOK);
    body.push_u32_be(NFTA_HOOK_HOOKNUM, NF_INET_FORWARD);
    body.push_u32_be(NFTA_HOOK_PRIORITY, NF_IP_PRI_FILTER as u32);
    body.nest_end(hook);
    body.push_u8(NFTA_CHAIN_POLICY, 0); // accept
    NftMessage::new(NFT_MSG_NEWCHAIN, NFPROTO_INET, body)
}

/// `meta nprotocol oif <interface> masquerade`, collapsed to "masquerade
/// everything leaving this interface" - this system never needs a narrower
/// match than that.
fn masquerade_rule(interface: &str) -> NftMessage {
    let mut body = AttrWriter::new();
    body.push_str_nul(NFTA_RULE_TABLE, TABLE_NAME);
    body.push_str_nul(NFTA_RULE_CHAIN, POSTROUTING_CHAIN);
    let exprs = body.nest_start(NFTA_RULE_EXPRESSIONS);
    push_iface_match(&mut body, NFT_META_OIFNAME, interface);
    push_masquerade_expr(&mut body);
    body.nest_end(exprs);
    NftMessage::new(NFT_MSG_NEWRULE, NFPROTO_INET, body)
}

/// `iifname <in> oifname <out> accept`.
fn forward_rule(in_iface: &str, out_iface: &str) -> NftMessage {
    let mut body = AttrWriter::new();
    body.push_str_nul(NFTA_RULE_TABLE, TABLE_NAME);
    body.push_str_nul(NFTA_RULE_CHAIN, FORWARD_CHAIN);
    let exprs = body.nest_start(NFTA_RULE_EXPRESSIONS);
    push_iface_match(&mut body, NFT_META_IIFNAME, in_iface);
    push_iface_match(&mut body, NFT_META_OIFNAME, out_iface);
    push_accept_expr(&mut body);
    body.nest_end(exprs);
    NftMessage::new(NFT_MSG_NEWRULE, NFPROTO_INET, body)
}

fn push_iface_match(body: &mut AttrWriter, meta_key: u32, interface: &str) {
    // `meta load <key> => reg 1`
    let elem = body.nest_start(NFTA_LIST_ELEM);
    let expr = body.nest_start(0);
    body.push_str_nul(NFTA_EXPR_NAME, "meta");
    let data = body.nest_start(NFTA_EXPR_DATA);
    body.push_u32_be(NFTA_META_DREG, NFT_REG_1);
    body.push_u32_be(NFTA_META_KEY, meta_key);
    body.nest_end(data);
    body.nest_end(expr);
    body.nest_end(elem);

    // `cmp reg 1 == <interface>\0`
    let elem = body.nest_start(NFTA_LIST_ELEM);
    let expr = body.nest_start(0);
    body.push_str_nul(NFTA_EXPR_NAME, "cmp");
    let data = body.nest_start(NFTA_EXPR_DATA);
    body.push_u32_be(NFTA_CMP_SREG, NFT_REG_1);
    body.push_u8(NFTA_CMP_OP, NFT_CMP_EQ);
    let mut name = interface.as_bytes().to_vec();
    name.push(0);
    let value = body.nest_start(NFTA_CMP_DATA);
    body.push(NFTA_DATA_VALUE, &name);
    body.nest_end(value);
    body.nest_end(data);
    body.nest_end(expr);
    body.nest_end(elem);
}

fn push_masquerade_expr(body: &mut AttrWriter) {
    let elem = body.nest_start(NFTA_LIST_ELEM);
    let expr = body.nest_start(0);
    body.push_str_nul(NFTA_EXPR_NAME, "masq");
    let data = body.nest_start(NFTA_EXPR_DATA);
    body.push_u32_be(NFTA_MASQ_FLAGS, 0);
    body.nest_end(data);
    body.nest_end(expr);
    body.nest_end(elem);
}

fn push_accept_expr(body: &mut AttrWriter) {
    let elem = body.nest_start(NFTA_LIST_ELEM);
    let expr = body.nest_start(0);
    body.push_str_nul(NFTA_EXPR_NAME, "immediate");
    body.nest_end(expr);
    body.nest_end(elem);
}

/// Renders the given rule set the way an external diagnostics tool would
/// want to read it - one line per rule, grouped and ordered deterministically
/// by kind then canonical key, independent of insertion order.
pub fn dump_rules(rules: &[FirewallRule]) -> String {
    let mut lines: Vec<String> = rules
        .iter()
        .map(|rule| match rule {
            FirewallRule::NatMasquerade { interface } => {
                format!("nat masquerade oif {}", interface)
            },
            FirewallRule::InterPeerForward { interface } => {
                format!("forward iif {0} oif {0} accept", interface)
            },
            FirewallRule::NetworkBridge { a, b, direction } => match direction {
                BridgeDirection::OneWay => format!("forward iif {} oif {} accept", a, b),
                BridgeDirection::Bidirectional => {
                    format!("forward iif {} oif {} accept <-> iif {} oif {} accept", a, b, b, a)
                },
            },
        })
        .collect();
    lines.sort();
    lines.join("\n")
}
