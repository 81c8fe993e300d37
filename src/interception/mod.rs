//! Traffic interception
//!
//! Builds the packet-filter rules that steer mesh TCP flows into the two
//! proxy listeners without re-capturing the proxy's own upstream dials or
//! mesh-to-mesh return paths.
//!
//! ```text
//! nat    OUTPUT      -p tcp -j MESH_OUTPUT
//! nat    MESH_OUTPUT -m owner --uid-owner <proxy> -j RETURN
//! nat    MESH_OUTPUT -p tcp -d <cidr> ! --dport <out> ! --sport <out> -j REDIRECT --to-ports <out>
//! mangle OUTPUT      -p tcp -j MESH_MARK
//! mangle MESH_MARK   -p tcp -d <cidr> -m conntrack --ctstate NEW -j CONNMARK --set-mark <mark>
//! nat    PREROUTING  -p tcp -j MESH_PREROUTING
//! nat    MESH_PREROUTING -m connmark --mark <mark> -j RETURN
//! nat    MESH_PREROUTING -p tcp -d <cidr> ! --dport <in> -j REDIRECT --to-ports <in>
//! ```

mod controller;
mod filter;
mod rule;
pub mod simulate;

pub use controller::InterceptionController;
pub use filter::{is_builtin, FilterSnapshot, IptablesFilter, MemoryFilter, PacketFilter};
pub use rule::{ChainRef, InterceptionRuleSet, Match, PlannedRule, RuleSpec, Table, Target};
pub use simulate::{classify, Classification, Hook, Packet, Verdict};
