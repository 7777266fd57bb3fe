use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::MetadataConfig;

use super::{
    protocol_number, InterfaceMetadata, InterfaceResolver, PolicyRule, PolicyRuleResolver,
    ServicePortName, ServiceResolver,
};

type ServiceKey = (IpAddr, u16, u8);

/// In-memory metadata tables seeded from configuration.
///
/// Tables can be updated at runtime; lookups take a read lock only.
#[derive(Default)]
pub struct StaticRegistry {
    services: RwLock<HashMap<ServiceKey, ServicePortName>>,
    interfaces: RwLock<HashMap<IpAddr, InterfaceMetadata>>,
    rules: RwLock<HashMap<Uuid, PolicyRule>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from the agent's metadata configuration.
    pub fn from_config(cfg: &MetadataConfig) -> Self {
        let registry = Self::new();

        for svc in &cfg.services {
            let port = if svc.port_name.is_empty() {
                svc.port.to_string()
            } else {
                svc.port_name.clone()
            };
            registry.upsert_service(
                svc.address,
                svc.port,
                ServicePortName {
                    namespace: svc.namespace.clone(),
                    name: svc.name.clone(),
                    port,
                    protocol: svc.protocol.to_ascii_uppercase(),
                },
            );
        }

        for iface in &cfg.interfaces {
            registry.upsert_interface(
                iface.ip,
                InterfaceMetadata {
                    pod_name: iface.pod_name.clone(),
                    pod_namespace: iface.pod_namespace.clone(),
                    node_name: iface.node_name.clone(),
                    labels: iface.labels.clone(),
                },
            );
        }

        for rule in &cfg.policy_rules {
            registry.upsert_rule(PolicyRule {
                uuid: rule.uuid,
                name: rule.name.clone(),
                namespace: rule.namespace.clone(),
                rule_name: rule.rule_name.clone(),
                policy_type: rule.policy_type,
            });
        }

        tracing::debug!(
            services = cfg.services.len(),
            interfaces = cfg.interfaces.len(),
            policy_rules = cfg.policy_rules.len(),
            "static metadata registry loaded"
        );

        registry
    }

    /// Adds or replaces a service frontend. Unknown protocols are ignored.
    pub fn upsert_service(&self, address: IpAddr, port: u16, name: ServicePortName) {
        let Some(proto) = protocol_number(&name.protocol) else {
            tracing::warn!(service = %name, protocol = %name.protocol, "ignoring service with unsupported protocol");
            return;
        };
        self.services.write().insert((address, port, proto), name);
    }

    pub fn upsert_interface(&self, address: IpAddr, meta: InterfaceMetadata) {
        self.interfaces.write().insert(address, meta);
    }

    pub fn remove_interface(&self, address: IpAddr) -> bool {
        self.interfaces.write().remove(&address).is_some()
    }

    pub fn upsert_rule(&self, rule: PolicyRule) {
        self.rules.write().insert(rule.uuid, rule);
    }
}

impl ServiceResolver for StaticRegistry {
    fn service_by_address(
        &self,
        address: IpAddr,
        port: u16,
        protocol: &str,
    ) -> Option<ServicePortName> {
        let proto = protocol_number(protocol)?;
        self.services.read().get(&(address, port, proto)).cloned()
    }
}

impl InterfaceResolver for StaticRegistry {
    fn interface_by_ip(&self, address: IpAddr) -> Option<InterfaceMetadata> {
        self.interfaces.read().get(&address).cloned()
    }
}

impl PolicyRuleResolver for StaticRegistry {
    fn rule_by_uuid(&self, uuid: Uuid) -> Option<PolicyRule> {
        self.rules.read().get(&uuid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use super::*;
    use crate::config::{InterfaceEntry, PolicyRuleEntry, ServiceEntry};
    use crate::flow::PolicyType;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn config(rule: Uuid) -> MetadataConfig {
        MetadataConfig {
            services: vec![
                ServiceEntry {
                    address: ip(10),
                    port: 53,
                    protocol: "udp".to_string(),
                    namespace: "kube-system".to_string(),
                    name: "kube-dns".to_string(),
                    port_name: "dns".to_string(),
                },
                ServiceEntry {
                    address: ip(11),
                    port: 8080,
                    protocol: "TCP".to_string(),
                    namespace: "default".to_string(),
                    name: "web".to_string(),
                    port_name: String::new(),
                },
            ],
            interfaces: vec![InterfaceEntry {
                ip: ip(20),
                pod_name: "web-0".to_string(),
                pod_namespace: "default".to_string(),
                node_name: "node-a".to_string(),
                labels: BTreeMap::new(),
            }],
            policy_rules: vec![PolicyRuleEntry {
                uuid: rule,
                name: "deny-egress".to_string(),
                namespace: "default".to_string(),
                rule_name: "r0".to_string(),
                policy_type: PolicyType::NetworkPolicy,
            }],
        }
    }

    #[test]
    fn test_service_lookup_matches_protocol() {
        let registry = StaticRegistry::from_config(&config(Uuid::new_v4()));

        let dns = registry.service_by_address(ip(10), 53, "UDP").unwrap();
        assert_eq!(dns.to_string(), "kube-system/kube-dns:dns");
        assert!(registry.service_by_address(ip(10), 53, "TCP").is_none());

        let web = registry.service_by_address(ip(11), 8080, "TCP").unwrap();
        assert_eq!(web.to_string(), "default/web:8080");
    }

    #[test]
    fn test_interface_lookup_and_removal() {
        let registry = StaticRegistry::from_config(&config(Uuid::new_v4()));

        let meta = registry.interface_by_ip(ip(20)).unwrap();
        assert_eq!(meta.pod_name, "web-0");
        assert!(registry.interface_by_ip(ip(21)).is_none());

        assert!(registry.remove_interface(ip(20)));
        assert!(registry.interface_by_ip(ip(20)).is_none());
    }

    #[test]
    fn test_rule_lookup() {
        let uuid = Uuid::new_v4();
        let registry = StaticRegistry::from_config(&config(uuid));

        let rule = registry.rule_by_uuid(uuid).unwrap();
        assert_eq!(rule.name, "deny-egress");
        assert_eq!(rule.policy_type, PolicyType::NetworkPolicy);
        assert!(registry.rule_by_uuid(Uuid::new_v4()).is_none());
    }
}
