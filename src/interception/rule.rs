//! Structured packet-filter rules
//!
//! Rules are kept as values ([`RuleSpec`]) rather than strings so the same
//! rule can be rendered for iptables, stored by the in-memory filter and
//! evaluated by the simulator.

use std::fmt;

use ipnet::IpNet;

use crate::config::Config;
use crate::error::ConfigError;

/// Built-in chains the mesh hooks into
pub const NAT_OUTPUT: &str = "OUTPUT";
/// Built-in nat chain for packets arriving from the network
pub const NAT_PREROUTING: &str = "PREROUTING";
/// Built-in mangle chain for locally generated packets
pub const MANGLE_OUTPUT: &str = "OUTPUT";

/// Packet-filter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Address translation (REDIRECT lives here)
    Nat,
    /// Packet and connection marking
    Mangle,
}

impl Table {
    /// Table name as passed to `iptables -t`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Mangle => "mangle",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One match criterion
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Match {
    /// `-p tcp`
    Tcp,
    /// `[!] -d <net>`
    Destination { net: IpNet, negated: bool },
    /// `[!] --sport <port>`
    SourcePort { port: u16, negated: bool },
    /// `[!] --dport <port>`
    DestinationPort { port: u16, negated: bool },
    /// `-m owner --uid-owner <uid>`
    OwnerUid(u32),
    /// `-m conntrack --ctstate NEW`
    CtStateNew,
    /// `-m connmark --mark <mark>`
    ConnMark(u32),
}

impl Match {
    fn push_args(&self, args: &mut Vec<String>) {
        let neg = |args: &mut Vec<String>, negated: bool| {
            if negated {
                args.push("!".into());
            }
        };

        match self {
            Self::Tcp => args.extend(["-p".into(), "tcp".into()]),
            Self::Destination { net, negated } => {
                neg(args, *negated);
                args.extend(["-d".into(), net.to_string()]);
            }
            Self::SourcePort { port, negated } => {
                neg(args, *negated);
                args.extend(["--sport".into(), port.to_string()]);
            }
            Self::DestinationPort { port, negated } => {
                neg(args, *negated);
                args.extend(["--dport".into(), port.to_string()]);
            }
            Self::OwnerUid(uid) => {
                args.extend(["-m".into(), "owner".into(), "--uid-owner".into(), uid.to_string()]);
            }
            Self::CtStateNew => {
                args.extend(["-m".into(), "conntrack".into(), "--ctstate".into(), "NEW".into()]);
            }
            Self::ConnMark(mark) => {
                args.extend(["-m".into(), "connmark".into(), "--mark".into(), format!("{mark:#x}")]);
            }
        }
    }
}

/// What a matching rule does
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// `-j <chain>`
    Jump(String),
    /// `-j RETURN`
    Return,
    /// `-j REDIRECT --to-ports <port>`
    Redirect { to_port: u16 },
    /// `-j CONNMARK --set-mark <mark>`
    SetConnMark(u32),
}

impl Target {
    fn push_args(&self, args: &mut Vec<String>) {
        args.push("-j".into());
        match self {
            Self::Jump(chain) => args.push(chain.clone()),
            Self::Return => args.push("RETURN".into()),
            Self::Redirect { to_port } => {
                args.extend(["REDIRECT".into(), "--to-ports".into(), to_port.to_string()]);
            }
            Self::SetConnMark(mark) => {
                args.extend(["CONNMARK".into(), "--set-mark".into(), format!("{mark:#x}")]);
            }
        }
    }
}

/// A rule body: match criteria plus target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleSpec {
    pub matches: Vec<Match>,
    pub target: Target,
}

impl RuleSpec {
    /// Rule with no criteria
    #[must_use]
    pub const fn new(target: Target) -> Self {
        Self {
            matches: Vec::new(),
            target,
        }
    }

    /// Add a match criterion
    #[must_use]
    pub fn with(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    /// iptables argument vector (without table/chain)
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for m in &self.matches {
            m.push_args(&mut args);
        }
        self.target.push_args(&mut args);
        args
    }

    /// Arguments joined with single spaces, as the iptables crate expects
    #[must_use]
    pub fn render(&self) -> String {
        self.to_args().join(" ")
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A rule together with where it goes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlannedRule {
    pub table: Table,
    pub chain: String,
    pub spec: RuleSpec,
}

impl PlannedRule {
    fn new(table: Table, chain: impl Into<String>, spec: RuleSpec) -> Self {
        Self {
            table,
            chain: chain.into(),
            spec,
        }
    }
}

impl fmt::Display for PlannedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {} {}", self.table, self.chain, self.spec)
    }
}

/// A chain identified by table and name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainRef {
    pub table: Table,
    pub name: String,
}

/// Chain topology and parameters of the mesh's interception rules
///
/// Built once per controller from configuration and threaded through every
/// install and remove call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptionRuleSet {
    /// nat chain for outbound capture (jumped to from nat OUTPUT)
    pub output_chain: String,
    /// nat chain for inbound capture (jumped to from nat PREROUTING)
    pub prerouting_chain: String,
    /// mangle chain for the connection mark (jumped to from mangle OUTPUT)
    pub mark_chain: String,
    pub pod_cidr: IpNet,
    pub conntrack_mark: u32,
    /// UID whose traffic is never captured (the proxy itself)
    pub proxy_uid: u32,
    pub inbound_port: u16,
    pub outbound_port: u16,
}

impl InterceptionRuleSet {
    /// Build the rule set from configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the proxy UID cannot be determined safely.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let i = &config.interception;
        Ok(Self {
            output_chain: i.output_chain.clone(),
            prerouting_chain: i.prerouting_chain.clone(),
            mark_chain: i.mark_chain.clone(),
            pod_cidr: i.pod_cidr,
            conntrack_mark: i.conntrack_mark,
            proxy_uid: i.effective_proxy_uid()?,
            inbound_port: config.inbound.port,
            outbound_port: config.outbound.port,
        })
    }

    /// Mesh chains, in creation order
    #[must_use]
    pub fn chains(&self) -> Vec<ChainRef> {
        vec![
            ChainRef {
                table: Table::Nat,
                name: self.output_chain.clone(),
            },
            ChainRef {
                table: Table::Nat,
                name: self.prerouting_chain.clone(),
            },
            ChainRef {
                table: Table::Mangle,
                name: self.mark_chain.clone(),
            },
        ]
    }

    /// Jump rules from the built-in chains into the mesh chains
    #[must_use]
    pub fn baseline_jumps(&self) -> Vec<PlannedRule> {
        let jump = |chain: &str| RuleSpec::new(Target::Jump(chain.to_string())).with(Match::Tcp);
        vec![
            PlannedRule::new(Table::Nat, NAT_OUTPUT, jump(&self.output_chain)),
            PlannedRule::new(Table::Nat, NAT_PREROUTING, jump(&self.prerouting_chain)),
            PlannedRule::new(Table::Mangle, MANGLE_OUTPUT, jump(&self.mark_chain)),
        ]
    }

    /// Outbound capture: proxy-owned traffic returns, mesh-bound traffic is
    /// redirected to the outbound port, and new mesh flows are conn-marked.
    #[must_use]
    pub fn outbound_capture(&self) -> Vec<PlannedRule> {
        vec![
            PlannedRule::new(
                Table::Nat,
                &self.output_chain,
                RuleSpec::new(Target::Return).with(Match::OwnerUid(self.proxy_uid)),
            ),
            PlannedRule::new(
                Table::Nat,
                &self.output_chain,
                RuleSpec::new(Target::Redirect {
                    to_port: self.outbound_port,
                })
                .with(Match::Tcp)
                .with(Match::Destination {
                    net: self.pod_cidr,
                    negated: false,
                })
                .with(Match::DestinationPort {
                    port: self.outbound_port,
                    negated: true,
                })
                .with(Match::SourcePort {
                    port: self.outbound_port,
                    negated: true,
                }),
            ),
            PlannedRule::new(
                Table::Mangle,
                &self.mark_chain,
                RuleSpec::new(Target::SetConnMark(self.conntrack_mark))
                    .with(Match::Tcp)
                    .with(Match::Destination {
                        net: self.pod_cidr,
                        negated: false,
                    })
                    .with(Match::CtStateNew),
            ),
        ]
    }

    /// Inbound capture: conn-marked flows return, other mesh-bound traffic
    /// is redirected to the inbound port.
    #[must_use]
    pub fn inbound_capture(&self) -> Vec<PlannedRule> {
        vec![
            PlannedRule::new(
                Table::Nat,
                &self.prerouting_chain,
                RuleSpec::new(Target::Return).with(Match::ConnMark(self.conntrack_mark)),
            ),
            PlannedRule::new(
                Table::Nat,
                &self.prerouting_chain,
                RuleSpec::new(Target::Redirect {
                    to_port: self.inbound_port,
                })
                .with(Match::Tcp)
                .with(Match::Destination {
                    net: self.pod_cidr,
                    negated: false,
                })
                .with(Match::DestinationPort {
                    port: self.inbound_port,
                    negated: true,
                }),
            ),
        ]
    }

    /// Every rule in installation order
    #[must_use]
    pub fn all_rules(&self) -> Vec<PlannedRule> {
        let mut rules = self.baseline_jumps();
        rules.extend(self.outbound_capture());
        rules.extend(self.inbound_capture());
        rules
    }
}
