//! # 响应聚合规则
//!
//! 多分支的响应按以下优先级竞争“当前最佳响应”：
//! 1. 6xx 全局失败优于一切；
//! 2. 其余最终响应（2xx–5xx）次之；
//! 3. 临时响应最末；
//!
//! 同一档内状态码越小越优。函数均为纯函数，Adapter 的聚合流程与测试共用。

use std::cmp::Ordering;

fn rank(status: u16) -> u8 {
    match status {
        600.. => 0,
        200..=599 => 1,
        _ => 2,
    }
}

pub fn is_final(status: u16) -> bool {
    status >= 200
}

/// `Less` 表示 `a` 优于 `b`。
pub fn compare_status(a: u16, b: u16) -> Ordering {
    (rank(a), a).cmp(&(rank(b), b))
}

/// `candidate` 是否严格优于 `current`。
pub fn is_better(candidate: u16, current: u16) -> bool {
    compare_status(candidate, current) == Ordering::Less
}

/// 一组响应中的最佳者；空集合返回 `None`。
pub fn best_response<I>(statuses: I) -> Option<u16>
where
    I: IntoIterator<Item = u16>,
{
    statuses.into_iter().min_by(|a, b| compare_status(*a, *b))
}

/// 拿到即可立即上送、无需等待其它分支的最终响应：2xx 与 6xx。
pub fn forwards_immediately(status: u16) -> bool {
    (200..300).contains(&status) || status >= 600
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn global_failure_beats_success() {
        assert_eq!(best_response([503, 200, 600]), Some(600));
    }

    #[test]
    fn lower_code_wins_within_final_rank() {
        assert_eq!(best_response([404, 503]), Some(404));
        assert_eq!(best_response([603, 600]), Some(600));
    }

    #[test]
    fn any_final_beats_provisional() {
        assert_eq!(best_response([180, 500]), Some(500));
        assert_eq!(best_response([183, 180]), Some(180));
        assert_eq!(best_response(std::iter::empty()), None);
    }

    #[test]
    fn immediate_forwarding_classes() {
        assert!(forwards_immediately(200));
        assert!(forwards_immediately(604));
        assert!(!forwards_immediately(486));
        assert!(!forwards_immediately(302));
        assert!(!forwards_immediately(180));
    }

    proptest! {
        #[test]
        fn best_is_order_independent(mut statuses in prop::collection::vec(100u16..700, 1..8)) {
            let best = best_response(statuses.iter().copied());
            statuses.reverse();
            prop_assert_eq!(best, best_response(statuses.iter().copied()));
            prop_assert!(best.is_some_and(|status| statuses.contains(&status)));
        }

        #[test]
        fn global_failure_always_dominates(
            statuses in prop::collection::vec(100u16..600, 0..8),
            global in 600u16..700,
        ) {
            let best = best_response(statuses.iter().copied().chain([global]));
            prop_assert!(best.is_some_and(|status| status >= 600));
        }
    }
}
