//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 集群配置是纯值对象：一份不可变快照描述此刻的桶、节点、端口与分区
//!   归属；替换整体原子（`Arc` 换引用），读方永远看到自洽的一份；
//! - 拓扑收敛、键值定位都只消费这里的只读视图，不回写。
//!
//! ## 设计要求（What）
//! - 快照内部不持锁、不含共享可变状态，`Arc<ClusterConfig>` 可自由跨线程；
//! - 备选地址（alternate address)：按命名网络查表，生效地址与端口表整体
//!   切换，不做逐端口混合。

pub mod provider;

use std::collections::{BTreeMap, HashMap};

use crate::environment::NetworkResolution;
use crate::node::NodeIdentifier;
use crate::service::ServiceType;

/// 集群配置快照：桶名 → 桶配置，外加可选的全局配置。
#[derive(Clone, Debug, Default)]
pub struct ClusterConfig {
    buckets: BTreeMap<String, BucketConfig>,
    global: Option<GlobalConfig>,
}

impl ClusterConfig {
    /// 空快照；收敛器对它执行全量断连。
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: BucketConfig) -> Self {
        self.buckets.insert(bucket.name().to_string(), bucket);
        self
    }

    pub fn with_global(mut self, global: GlobalConfig) -> Self {
        self.global = Some(global);
        self
    }

    pub fn bucket_configs(&self) -> &BTreeMap<String, BucketConfig> {
        &self.buckets
    }

    pub fn bucket(&self, name: &str) -> Option<&BucketConfig> {
        self.buckets.get(name)
    }

    pub fn global_config(&self) -> Option<&GlobalConfig> {
        self.global.as_ref()
    }

    /// 既无桶也无全局配置：收敛器据此进入断连模式。
    pub fn has_no_topology(&self) -> bool {
        self.buckets.is_empty() && self.global.is_none()
    }

    /// 给定节点是否出现在任一桶或全局配置中。
    pub fn knows_node(&self, identifier: &NodeIdentifier) -> bool {
        self.buckets
            .values()
            .any(|bucket| bucket.contains_node(identifier))
            || self
                .global
                .as_ref()
                .is_some_and(|global| global.contains_node(identifier))
    }
}

/// 单个桶的配置：节点列表与分区归属表。
#[derive(Clone, Debug)]
pub struct BucketConfig {
    name: String,
    nodes: Vec<NodeInfo>,
    partitions: PartitionMap,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeInfo>, partitions: PartitionMap) -> Self {
        Self {
            name: name.into(),
            nodes,
            partitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn partitions(&self) -> &PartitionMap {
        &self.partitions
    }

    pub fn contains_node(&self, identifier: &NodeIdentifier) -> bool {
        self.nodes.iter().any(|node| node.identifier() == identifier)
    }
}

/// 分区归属表：分区号 → 节点下标（-1 表示该分区暂无主节点）。
#[derive(Clone, Debug)]
pub struct PartitionMap {
    active: Vec<i32>,
}

impl PartitionMap {
    pub fn new(active: Vec<i32>) -> Self {
        Self { active }
    }

    /// 分区总数；键值定位器的取模基数。
    pub fn num_partitions(&self) -> u16 {
        self.active.len() as u16
    }

    /// 分区的主节点下标；越界或 -1 返回 `None`。
    pub fn active_node_index(&self, partition: u16) -> Option<usize> {
        match self.active.get(usize::from(partition)) {
            Some(idx) if *idx >= 0 => Some(*idx as usize),
            _ => None,
        }
    }
}

/// 全局配置：与桶无关的节点端口表（集群级 HTTP 服务的路由来源）。
#[derive(Clone, Debug, Default)]
pub struct GlobalConfig {
    port_infos: Vec<NodeInfo>,
}

impl GlobalConfig {
    pub fn new(port_infos: Vec<NodeInfo>) -> Self {
        Self { port_infos }
    }

    pub fn port_infos(&self) -> &[NodeInfo] {
        &self.port_infos
    }

    pub fn contains_node(&self, identifier: &NodeIdentifier) -> bool {
        self.port_infos
            .iter()
            .any(|node| node.identifier() == identifier)
    }
}

/// 节点在配置中的形态：身份、主机名、明文/TLS 端口表与备选地址表。
#[derive(Clone, Debug)]
pub struct NodeInfo {
    identifier: NodeIdentifier,
    hostname: String,
    services: HashMap<ServiceType, u16>,
    tls_services: HashMap<ServiceType, u16>,
    alternate: HashMap<String, AlternateAddress>,
}

impl NodeInfo {
    /// `management_port` 参与节点身份，与主机名一起构成 [`NodeIdentifier`]。
    pub fn new(hostname: impl Into<String>, management_port: u16) -> Self {
        let hostname = hostname.into();
        Self {
            identifier: NodeIdentifier::new(hostname.clone(), management_port),
            hostname,
            services: HashMap::new(),
            tls_services: HashMap::new(),
            alternate: HashMap::new(),
        }
    }

    pub fn with_service(mut self, service: ServiceType, port: u16) -> Self {
        self.services.insert(service, port);
        self
    }

    pub fn with_tls_service(mut self, service: ServiceType, port: u16) -> Self {
        self.tls_services.insert(service, port);
        self
    }

    pub fn with_alternate(mut self, network: impl Into<String>, address: AlternateAddress) -> Self {
        self.alternate.insert(network.into(), address);
        self
    }

    pub fn identifier(&self) -> &NodeIdentifier {
        &self.identifier
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// 解析生效地址与端口表。
    ///
    /// 命名网络命中备选表时整体切换到备选主机与备选端口；未命中（或
    /// `Default` 网络）使用主表。TLS 开关选择明文/加密端口表。
    pub fn effective(&self, network: &NetworkResolution, tls: bool) -> EffectiveNodeAddress<'_> {
        if let Some(name) = network.alternate_name() {
            if let Some(alternate) = self.alternate.get(name) {
                return EffectiveNodeAddress {
                    hostname: alternate.hostname(),
                    services: alternate.ports(tls),
                    alternate_hostname: Some(alternate.hostname()),
                };
            }
        }
        EffectiveNodeAddress {
            hostname: &self.hostname,
            services: if tls { &self.tls_services } else { &self.services },
            alternate_hostname: None,
        }
    }
}

/// 备选地址：NAT/跨网段客户端可见的主机与端口表。
#[derive(Clone, Debug)]
pub struct AlternateAddress {
    hostname: String,
    services: HashMap<ServiceType, u16>,
    tls_services: HashMap<ServiceType, u16>,
}

impl AlternateAddress {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            services: HashMap::new(),
            tls_services: HashMap::new(),
        }
    }

    pub fn with_service(mut self, service: ServiceType, port: u16) -> Self {
        self.services.insert(service, port);
        self
    }

    pub fn with_tls_service(mut self, service: ServiceType, port: u16) -> Self {
        self.tls_services.insert(service, port);
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn ports(&self, tls: bool) -> &HashMap<ServiceType, u16> {
        if tls { &self.tls_services } else { &self.services }
    }
}

/// 一次地址解析的结果视图，借用底层配置。
#[derive(Clone, Copy, Debug)]
pub struct EffectiveNodeAddress<'a> {
    pub hostname: &'a str,
    pub services: &'a HashMap<ServiceType, u16>,
    pub alternate_hostname: Option<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeInfo {
        NodeInfo::new("10.0.0.1", 8091)
            .with_service(ServiceType::KeyValue, 11210)
            .with_service(ServiceType::Query, 8093)
            .with_tls_service(ServiceType::KeyValue, 11207)
            .with_alternate(
                "external",
                AlternateAddress::new("203.0.113.9")
                    .with_service(ServiceType::KeyValue, 31210)
                    .with_tls_service(ServiceType::KeyValue, 31207),
            )
    }

    #[test]
    fn default_network_uses_the_primary_table() {
        let node = node();
        let effective = node.effective(&NetworkResolution::Default, false);
        assert_eq!(effective.hostname, "10.0.0.1");
        assert_eq!(effective.services[&ServiceType::KeyValue], 11210);
        assert!(effective.alternate_hostname.is_none());
    }

    #[test]
    fn named_network_switches_host_and_ports_together() {
        let node = node();
        let effective = node.effective(&NetworkResolution::Named("external".into()), true);
        assert_eq!(effective.hostname, "203.0.113.9");
        assert_eq!(effective.services[&ServiceType::KeyValue], 31207);
        assert_eq!(effective.alternate_hostname, Some("203.0.113.9"));
        // 备选表没有 Query 端口：该服务在此网络不可达，而不是回落主表。
        assert!(!effective.services.contains_key(&ServiceType::Query));
    }

    #[test]
    fn unknown_named_network_falls_back_to_primary() {
        let node = node();
        let effective = node.effective(&NetworkResolution::Named("dmz".into()), false);
        assert_eq!(effective.hostname, "10.0.0.1");
    }

    #[test]
    fn partition_map_guards_against_orphan_partitions() {
        let map = PartitionMap::new(vec![0, 1, -1, 0]);
        assert_eq!(map.num_partitions(), 4);
        assert_eq!(map.active_node_index(1), Some(1));
        assert_eq!(map.active_node_index(2), None);
        assert_eq!(map.active_node_index(9), None);
    }
}
