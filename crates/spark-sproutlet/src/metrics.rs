//! # 远端别名路由计数
//!
//! 控制器在命中远端别名时记录两类事件，按请求方法分桶：
//! - `routed_to_remote_alias`：存在网络功能边界，请求被真实转发到远端站点；
//! - `accepted_for_remote_alias`：请求在本地处理（配置强制或未跨边界）。
//!
//! 计数后端由宿主决定；[`AliasRoutingCounters`] 是基于 `DashMap` 的进程内实现。

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::message::Method;

/// 远端别名路由指标的接收端。
pub trait RoutingMetrics: Send + Sync {
    fn routed_to_remote_alias(&self, method: &Method);

    fn accepted_for_remote_alias(&self, method: &Method);
}

/// 丢弃所有事件。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRoutingMetrics;

impl RoutingMetrics for NoopRoutingMetrics {
    fn routed_to_remote_alias(&self, _: &Method) {}

    fn accepted_for_remote_alias(&self, _: &Method) {}
}

/// 以方法 token 为键的并发计数表。
///
/// # 教案式说明
/// - **意图 (Why)**：多个工作线程上的事务会同时累加计数，`DashMap` 分片 + `AtomicU64`
///   让热路径只需一次分片读锁；
/// - **契约 (What)**：`routed_count`/`accepted_count` 对未出现过的方法返回 0。
#[derive(Debug, Default)]
pub struct AliasRoutingCounters {
    routed: DashMap<String, AtomicU64>,
    accepted: DashMap<String, AtomicU64>,
}

impl AliasRoutingCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routed_count(&self, method: &Method) -> u64 {
        read(&self.routed, method)
    }

    pub fn accepted_count(&self, method: &Method) -> u64 {
        read(&self.accepted, method)
    }
}

impl RoutingMetrics for AliasRoutingCounters {
    fn routed_to_remote_alias(&self, method: &Method) {
        increment(&self.routed, method);
    }

    fn accepted_for_remote_alias(&self, method: &Method) {
        increment(&self.accepted, method);
    }
}

fn increment(table: &DashMap<String, AtomicU64>, method: &Method) {
    if let Some(counter) = table.get(method.as_str()) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    table
        .entry(method.as_str().to_owned())
        .or_default()
        .fetch_add(1, Ordering::Relaxed);
}

fn read(table: &DashMap<String, AtomicU64>, method: &Method) -> u64 {
    table
        .get(method.as_str())
        .map_or(0, |counter| counter.load(Ordering::Relaxed))
}
