//! # 事务定时器
//!
//! ## 核心意图（Why）
//! - Sproutlet 挂起的定时器归属于事务控制器而非 Adapter：定时器触发总是先回到控制器，
//!   由控制器确认它仍然有效后再投递给所属 Adapter；
//! - 宿主侧 [`TimerService`] 只看到不透明的 [`TimerKey`]，触发时通过
//!   [`TransactionTable::deliver_timer_pop`](crate::core::TransactionTable::deliver_timer_pop)
//!   回送。
//!
//! ## 行为契约（What）
//! - 所有创建过的定时器记录保留到事务销毁才释放，编号在事务内永不复用；
//! - 只有“待触发集合”中的编号会被投递；已取消后才到达的触发被视为竞态并丢弃。

use std::{collections::BTreeSet, fmt, time::Duration};

use crate::{core::adapter::AdapterId, transport::TransactionId};

/// 事务内定时器编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// 宿主定时器服务使用的全局键。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub transaction: TransactionId,
    pub timer: TimerId,
}

/// 宿主侧定时器服务。
///
/// # 契约 (What)
/// - `schedule` 返回 `false` 表示无法挂起，Sproutlet 将得到 `None`；
/// - 触发时宿主调用 `TransactionTable::deliver_timer_pop(key)`，不得在 `schedule`/`cancel`
///   内同步回调；
/// - `cancel` 是尽力而为的：已在途的触发仍可能到达，由控制器过滤。
pub trait TimerService: Send + Sync {
    fn schedule(&self, key: TimerKey, after: Duration) -> bool;

    fn cancel(&self, key: TimerKey);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TimerRecord {
    pub(crate) adapter: AdapterId,
    pub(crate) context: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    records: Vec<TimerRecord>,
    pending: BTreeSet<TimerId>,
}

impl TimerTable {
    /// 分配新的定时器记录，尚未进入待触发集合。
    pub(crate) fn allocate(&mut self, adapter: AdapterId, context: u64) -> TimerId {
        let id = TimerId::new(self.records.len() as u64);
        self.records.push(TimerRecord { adapter, context });
        id
    }

    pub(crate) fn arm(&mut self, id: TimerId) {
        self.pending.insert(id);
    }

    /// 取出一次触发；不在待触发集合中时返回 `None`。
    pub(crate) fn pop(&mut self, id: TimerId) -> Option<TimerRecord> {
        if !self.pending.remove(&id) {
            return None;
        }
        usize::try_from(id.get())
            .ok()
            .and_then(|index| self.records.get(index))
            .copied()
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.pending.remove(&id)
    }

    pub(crate) fn is_running(&self, id: TimerId) -> bool {
        self.pending.contains(&id)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }

    /// 事务销毁时释放全部记录。
    pub(crate) fn release(&mut self) {
        self.pending.clear();
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_are_delivered_once() {
        let mut table = TimerTable::default();
        let id = table.allocate(AdapterId::new(0), 42);
        assert_eq!(table.pop(id), None, "unarmed timers never pop");

        table.arm(id);
        assert!(table.is_running(id));
        let record = table.pop(id).expect("armed timer pops");
        assert_eq!(record.context, 42);
        assert_eq!(table.pop(id), None);
        assert!(table.is_idle());
    }

    #[test]
    fn pop_after_cancel_is_a_race() {
        let mut table = TimerTable::default();
        let id = table.allocate(AdapterId::new(1), 7);
        table.arm(id);
        assert!(table.cancel(id));
        assert_eq!(table.pop(id), None);
        assert!(!table.cancel(id));
    }

    #[test]
    fn ids_are_not_reused_until_release() {
        let mut table = TimerTable::default();
        let first = table.allocate(AdapterId::new(0), 1);
        table.arm(first);
        table.cancel(first);
        let second = table.allocate(AdapterId::new(0), 2);
        assert_ne!(first, second);
        assert_eq!(table.record_count(), 2);

        table.release();
        assert_eq!(table.record_count(), 0);
    }
}
