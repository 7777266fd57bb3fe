//! Flow identity, tracked connection state and the exported record shape.

pub mod connection;
pub mod record;
pub mod tuple;

pub use connection::{
    Connection, EndReason, FlowType, PodIdentity, PolicyAttribution, PolicyType, RuleAction,
};
pub use record::FlowRecord;
pub use tuple::{ConnectionKey, Tuple};
