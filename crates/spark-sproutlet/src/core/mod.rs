//! # core 模块说明
//!
//! ## 设计定位（Why）
//! - 承载事务运行期的全部状态：事务控制器、Adapter 树、分支状态机、响应聚合与定时器；
//! - 与 `routing` 模块的只读视图分离：路由决策是纯函数，状态变更只发生在这里。
//!
//! ## 子模块（What）
//! - [`adapter`]：Sproutlet 实例的适配层与 [`TsxContext`] 能力集合；
//! - [`aggregation`]：最终响应优先级规则；
//! - [`fork`]：分支状态机；
//! - [`timer`]：事务定时器表与宿主定时器契约；
//! - `controller` / `transaction_table`：事务控制器及其仓储，经本模块再导出。

pub mod adapter;
pub mod aggregation;
pub mod fork;
pub mod timer;

mod controller;
mod transaction_table;

pub use adapter::{AdapterId, EXTERNAL_NETWORK_FUNCTION, TsxContext};
pub use controller::{ControllerState, TransactionController};
pub use fork::{BranchState, ForkErrorState, ForkId, ForkState};
pub use timer::{TimerId, TimerKey, TimerService};
pub use transaction_table::TransactionTable;
