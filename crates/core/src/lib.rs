#![forbid(unsafe_code)]

mod blocklist;
mod capture;
mod engine;
mod events;
mod filter;
mod headers;
mod history;
mod packet;
mod queue;
mod request;
mod rules;

pub use blocklist::{BlockEntry, BlockList, PersistError};
pub use capture::VerdictHandle;
pub use engine::{Decision, EngineCounters, FirewallEngine, IdentityPolicy};
pub use events::{unix_to_rfc3339, EventWriter, FirewallEvent};
pub use filter::{apply_static_rules, FilterError, KernelFilter};
pub use headers::ApplicationHeaders;
pub use history::SourceHistory;
pub use packet::{ParsedPacket, SourceKey, VerdictStatus};
pub use queue::DynamicQueueManager;
pub use request::{Request, DEFAULT_MAX_TIME, FLOW_WINDOW};
pub use rules::{DetectionRule, InvalidRuleConfig, Rule, RuleKind, RuleSpec, RuleTarget};
