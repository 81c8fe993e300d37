//! Packet classification against a rule snapshot
//!
//! A small evaluator for the subset of iptables the mesh rule set uses. It
//! walks mangle before nat at each hook, evaluates nat only for packets that
//! open a new connection, follows jumps into user chains and reports where
//! the packet would end up.

use std::net::SocketAddr;

use super::filter::FilterSnapshot;
use super::rule::{Match, RuleSpec, Table, Target};

/// Deepest chain nesting followed before giving up
const MAX_JUMP_DEPTH: usize = 16;

/// Netfilter hook a packet traverses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Locally generated packets
    Output,
    /// Packets arriving from an interface
    Prerouting,
}

impl Hook {
    const fn chain(self) -> &'static str {
        match self {
            Self::Output => "OUTPUT",
            Self::Prerouting => "PREROUTING",
        }
    }
}

/// The packet to classify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub hook: Hook,
    pub tcp: bool,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// UID of the sending socket (only meaningful at `Output`)
    pub owner_uid: Option<u32>,
    /// Whether the packet opens a new tracked connection
    pub ct_new: bool,
    /// Connection mark already carried by the tracked connection
    pub conn_mark: u32,
}

impl Packet {
    /// New TCP connection leaving a local process
    #[must_use]
    pub const fn outbound(src: SocketAddr, dst: SocketAddr, owner_uid: u32) -> Self {
        Self {
            hook: Hook::Output,
            tcp: true,
            src,
            dst,
            owner_uid: Some(owner_uid),
            ct_new: true,
            conn_mark: 0,
        }
    }

    /// New TCP connection arriving from the network
    #[must_use]
    pub const fn inbound(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            hook: Hook::Prerouting,
            tcp: true,
            src,
            dst,
            owner_uid: None,
            ct_new: true,
            conn_mark: 0,
        }
    }

    /// Same packet on a connection carrying `mark`
    #[must_use]
    pub const fn with_conn_mark(mut self, mark: u32) -> Self {
        self.conn_mark = mark;
        self
    }
}

/// Final disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Delivered unchanged
    Accept,
    /// Redirected to a local port
    Redirect(u16),
}

/// Classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    /// Connection mark after traversal
    pub conn_mark: u32,
}

enum Outcome {
    Continue,
    Final(Verdict),
}

/// Evaluate `packet` against `snapshot`
#[must_use]
pub fn classify(snapshot: &FilterSnapshot, packet: &Packet) -> Classification {
    let mut conn_mark = packet.conn_mark;
    let chain = packet.hook.chain();

    // mangle cannot redirect, only mark
    let _ = walk(snapshot, Table::Mangle, chain, packet, &mut conn_mark, 0);

    let verdict = if packet.ct_new {
        match walk(snapshot, Table::Nat, chain, packet, &mut conn_mark, 0) {
            Outcome::Final(v) => v,
            Outcome::Continue => Verdict::Accept,
        }
    } else {
        Verdict::Accept
    };

    Classification { verdict, conn_mark }
}

fn walk(
    snapshot: &FilterSnapshot,
    table: Table,
    chain: &str,
    packet: &Packet,
    conn_mark: &mut u32,
    depth: usize,
) -> Outcome {
    if depth > MAX_JUMP_DEPTH {
        return Outcome::Continue;
    }

    for rule in snapshot.rules(table, chain) {
        if !matches(rule, packet, *conn_mark) {
            continue;
        }

        match &rule.target {
            Target::Return => return Outcome::Continue,
            Target::Jump(next) => {
                if let Outcome::Final(v) = walk(snapshot, table, next, packet, conn_mark, depth + 1) {
                    return Outcome::Final(v);
                }
            }
            Target::Redirect { to_port } => {
                if table == Table::Nat {
                    return Outcome::Final(Verdict::Redirect(*to_port));
                }
            }
            Target::SetConnMark(mark) => *conn_mark = *mark,
        }
    }

    Outcome::Continue
}

fn matches(rule: &RuleSpec, packet: &Packet, conn_mark: u32) -> bool {
    rule.matches.iter().all(|m| match m {
        Match::Tcp => packet.tcp,
        Match::Destination { net, negated } => net.contains(&packet.dst.ip()) != *negated,
        Match::SourcePort { port, negated } => (packet.src.port() == *port) != *negated,
        Match::DestinationPort { port, negated } => (packet.dst.port() == *port) != *negated,
        Match::OwnerUid(uid) => packet.hook == Hook::Output && packet.owner_uid == Some(*uid),
        Match::CtStateNew => packet.ct_new,
        Match::ConnMark(mark) => conn_mark == *mark,
    })
}
