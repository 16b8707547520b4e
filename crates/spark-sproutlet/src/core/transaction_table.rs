//! # TransactionTable：事务控制器仓储
//!
//! ## 核心意图（Why）
//! - 宿主的传输层与定时器服务只知道事务编号；本表把编号映射到控制器，并负责在控制器
//!   自认销毁后移除条目；
//! - 基于 `DashMap` 分片存储，不同事务的事件可以在不同线程上并行处理。
//!
//! ## 行为契约（What）
//! - 每个控制器包裹在 `parking_lot::Mutex` 中：同一事务的所有事件串行执行；
//! - 投递前先克隆 `Arc` 并释放 `DashMap` guard，持有控制器锁期间不占用分片锁；
//! - 针对已销毁或不存在事务的投递返回 `false`，不视为错误。
//!
//! ## 风险提示（Trade-offs）
//! - 控制器在锁内同步调用 `OutboundTransport`，若传输实现在回调中同步重入同一事务会死锁；
//!   宿主应在其它线程投递响应。

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    core::{
        controller::TransactionController,
        fork::ForkErrorState,
        timer::{TimerKey, TimerService},
    },
    message::SipMessage,
    routing::RouterHandle,
    transport::{BranchId, OutboundTransport, TransactionId},
};

/// 进程内全部活动事务。
pub struct TransactionTable {
    transactions: DashMap<TransactionId, Arc<Mutex<TransactionController>>>,
    next_id: AtomicU64,
    transport: Arc<dyn OutboundTransport>,
    timers: Arc<dyn TimerService>,
}

impl TransactionTable {
    pub fn new(transport: Arc<dyn OutboundTransport>, timers: Arc<dyn TimerService>) -> Self {
        Self {
            transactions: DashMap::new(),
            next_id: AtomicU64::new(0),
            transport,
            timers,
        }
    }

    /// 以当前路由快照启动新事务。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 控制器先登记再初始化，初始化期间触发的异步回调可以找到它；
    ///   - 初始化即完成的事务（例如直接回 483）会被立即移除；
    /// - **后置条件**：返回的编号在进程内唯一，从 1 开始递增。
    pub fn start(&self, router: &RouterHandle, request: SipMessage, port: u16) -> TransactionId {
        let id = TransactionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let controller = router.load().create_transaction_controller(
            id,
            Arc::clone(&self.transport),
            Arc::clone(&self.timers),
        );
        let controller = Arc::new(Mutex::new(controller));
        self.transactions.insert(id, Arc::clone(&controller));

        let destroyed = {
            let mut controller = controller.lock();
            controller.init(request, port);
            controller.is_destroyed()
        };
        if destroyed {
            self.transactions.remove(&id);
            debug!(transaction = %id, "transaction completed during init");
        }
        id
    }

    pub fn deliver_response(
        &self,
        transaction: TransactionId,
        branch: BranchId,
        response: SipMessage,
    ) -> bool {
        self.with_controller(transaction, |controller| {
            controller.on_inbound_response(branch, response)
        })
    }

    pub fn deliver_branch_failure(
        &self,
        transaction: TransactionId,
        branch: BranchId,
        error: ForkErrorState,
    ) -> bool {
        self.with_controller(transaction, |controller| {
            controller.on_branch_failure(branch, error)
        })
    }

    pub fn deliver_cancel(&self, transaction: TransactionId, status: u16, reason: &str) -> bool {
        self.with_controller(transaction, |controller| controller.on_cancel(status, reason))
    }

    /// 宿主定时器到期回调。
    pub fn deliver_timer_pop(&self, key: TimerKey) -> bool {
        self.with_controller(key.transaction, |controller| controller.on_timer_pop(key.timer))
    }

    /// 在控制器锁内只读访问，事务不存在时返回 `None`。
    pub fn inspect<R>(
        &self,
        transaction: TransactionId,
        f: impl FnOnce(&TransactionController) -> R,
    ) -> Option<R> {
        let controller = self.controller(transaction)?;
        let guard = controller.lock();
        Some(f(&guard))
    }

    pub fn contains(&self, transaction: TransactionId) -> bool {
        self.transactions.contains_key(&transaction)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn controller(&self, transaction: TransactionId) -> Option<Arc<Mutex<TransactionController>>> {
        self.transactions
            .get(&transaction)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn with_controller(
        &self,
        transaction: TransactionId,
        f: impl FnOnce(&mut TransactionController),
    ) -> bool {
        let Some(controller) = self.controller(transaction) else {
            debug!(%transaction, "event for unknown transaction, dropping");
            return false;
        };
        let destroyed = {
            let mut guard = controller.lock();
            f(&mut guard);
            guard.is_destroyed()
        };
        if destroyed && self.transactions.remove(&transaction).is_some() {
            debug!(%transaction, "transaction removed");
        }
        true
    }
}

impl std::fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTable")
            .field("transactions", &self.transactions.len())
            .finish_non_exhaustive()
    }
}
