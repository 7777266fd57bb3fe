//! Connection tracking: expiry scheduling and the per-kind connection stores.

pub mod conntrack;
pub mod deny;
pub mod expiry;
pub mod store;

use crate::flow::{Connection, PolicyAttribution};
use crate::metadata::PolicyRuleResolver;

pub use conntrack::ConntrackConnectionStore;
pub use deny::DenyConnectionStore;
pub use expiry::{ExpiryItem, ExpiryQueue};
pub use store::{ConnectionStore, Delta, DueConnection, FlowTimeouts};

/// Fills in policy names for the rule UUIDs reported by the datapath.
fn resolve_policy_rules(rules: &dyn PolicyRuleResolver, conn: &mut Connection) {
    for attribution in [&mut conn.ingress_policy, &mut conn.egress_policy]
        .into_iter()
        .flatten()
    {
        resolve_attribution(rules, attribution);
    }
}

fn resolve_attribution(rules: &dyn PolicyRuleResolver, attribution: &mut PolicyAttribution) {
    let Some(uuid) = attribution.uuid else {
        return;
    };

    match rules.rule_by_uuid(uuid) {
        Some(rule) => {
            attribution.name = rule.name;
            attribution.namespace = rule.namespace;
            attribution.rule_name = rule.rule_name;
            attribution.policy_type = rule.policy_type;
        }
        None => tracing::debug!(rule = %uuid, "policy rule not found"),
    }
}
