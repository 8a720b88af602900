//! # topology 模块说明
//!
//! ## 角色定位（Why）
//! - 收敛器消费配置快照，把存活节点集与每节点服务集推向快照描述的形态；
//!   幂等、可重入触发、绝不并发执行；
//! - 两个原子标记 (`in_progress`, `pending`) 构成合并调度：收敛期间到达的
//!   触发只记一笔“还有下一轮”，收敛结束后恰好补跑一轮并观察**最新**
//!   配置——突发 n 次触发收敛至一次补跑，不丢最后一份配置。
//!
//! ## 设计要求（What）
//! - 步骤顺序固定：空快照全量断连 → 桶配置逐节点求服务差集 → 全局配置
//!   同样处理 → 清理既不在配置中（或已无服务）的节点；
//! - 单服务失败折叠为事件，不得污染整轮收敛；
//! - 两个终止分支（成功/失败）都必须清除 `in_progress`。

use std::sync::atomic::Ordering;

use tokio::time::Instant;

use crate::config::{ClusterConfig, NodeInfo};
use crate::core::Core;
use crate::environment::NetworkResolution;
use crate::error::CoreError;
use crate::events::CoreEvent;
use crate::service::{ServiceScope, ServiceType};

impl Core {
    /// 触发一轮拓扑收敛。
    ///
    /// 已有收敛在执行时，置挂起标记并发布 *reconfiguration ignored*；
    /// 正在执行的那轮结束后会补跑一轮并读取最新快照。
    pub async fn reconfigure(&self) {
        let inner = self.inner();
        if inner
            .reconfigure_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            inner.reconfigure_pending.store(true, Ordering::Release);
            self.publish(CoreEvent::ReconfigurationIgnored);
            return;
        }

        loop {
            let start = Instant::now();
            let snapshot = inner.current_config.load_full();
            match self.reconfigure_once(snapshot.as_ref()).await {
                Ok(()) => self.publish(CoreEvent::ReconfigurationCompleted {
                    elapsed: start.elapsed(),
                }),
                Err(error) => self.publish(CoreEvent::ReconfigurationErrorDetected {
                    detail: error.to_string(),
                }),
            }
            inner.reconfigure_in_progress.store(false, Ordering::Release);

            if inner.reconfigure_pending.swap(false, Ordering::AcqRel) {
                if inner
                    .reconfigure_in_progress
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // 另一个触发方已接管下一轮；把挂起标记还回去，避免丢轮次。
                    inner.reconfigure_pending.store(true, Ordering::Release);
                    return;
                }
                continue;
            }
            return;
        }
    }

    /// 单轮收敛主体。
    async fn reconfigure_once(&self, config: &ClusterConfig) -> Result<(), CoreError> {
        if config.has_no_topology() {
            let removed = self.replace_nodes(Vec::new());
            for node in removed {
                node.disconnect().await;
            }
            return Ok(());
        }

        let environment = self.context().environment();
        let network = environment.io().network().clone();
        let tls = environment.security().tls_enabled();

        for (bucket_name, bucket) in config.bucket_configs() {
            for info in bucket.nodes() {
                self.reconcile_node_services(info, Some(bucket_name), &network, tls)
                    .await;
            }
        }

        if let Some(global) = config.global_config() {
            for info in global.port_infos() {
                self.reconcile_node_services(info, None, &network, tls).await;
            }
        }

        // 清理：既不被任何桶/全局配置提及，或已无启用服务的节点。
        let snapshot = self.nodes_snapshot();
        let keep: Vec<_> = snapshot
            .iter()
            .filter(|node| config.knows_node(node.identifier()) && node.has_services_enabled())
            .cloned()
            .collect();
        if keep.len() != snapshot.len() {
            let removed = self.replace_nodes(keep);
            for node in removed {
                node.disconnect().await;
            }
        }

        Ok(())
    }

    /// 单节点服务差集：生效端口表里有的确保启用，没有的确保停用。
    ///
    /// 单服务失败折叠为 *service reconfiguration failed* 事件。
    async fn reconcile_node_services(
        &self,
        info: &NodeInfo,
        bucket: Option<&str>,
        network: &NetworkResolution,
        tls: bool,
    ) {
        let effective = info.effective(network, tls);
        for service in ServiceType::ALL {
            let bucket_arg = match service.scope() {
                ServiceScope::Bucket => bucket,
                ServiceScope::Cluster => None,
            };
            let outcome = match effective.services.get(&service) {
                Some(port) => {
                    self.ensure_service_at(
                        info.identifier(),
                        service,
                        *port,
                        bucket_arg,
                        effective.alternate_hostname,
                    )
                    .await
                }
                None => {
                    self.remove_service_from(info.identifier(), service, bucket_arg)
                        .await
                }
            };
            if let Err(error) = outcome {
                self.publish(CoreEvent::ServiceReconfigurationFailed {
                    node: info.identifier().clone(),
                    service,
                    detail: error.to_string(),
                });
            }
        }
    }
}
