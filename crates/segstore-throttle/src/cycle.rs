//! 节流周期与“比较即退役”槽位。
//!
//! # 模块定位（Why）
//! - 每个节流器同一时刻至多只有一个活跃周期，这是整个并发设计守护的核心不变量；
//! - 自然到期、通知（notify）、关闭（close）与等待方被丢弃四类事件可能并发争夺同一周期的退役权，
//!   只有一方能赢，其余一方的动作必须退化为空操作。
//!
//! # 结构概览（What）
//! - [`CycleCancellation`]：一次性取消令牌，首个取消者获胜，等待方可异步感知；
//! - [`Cycle`]：一次已调度的等待，携带决策快照与取消令牌；
//! - [`CycleSlot`]：基于 `ArcSwapOption` 的单槽位，提供 `install`/`take`/`retire` 三个原子原语。
//!
//! # 并发纪律（How）
//! - `take` 以原子交换取走当前周期，取走者负责取消它；
//! - `retire` 以比较交换仅在槽位仍指向给定周期时清空，返回是否获胜；
//! - 周期的 `Arc` 在等待期间始终被等待方持有，因此指针比较不存在 ABA 风险。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use tokio::sync::Notify;

use crate::calculator::ThrottlingDecision;

/// 周期取消令牌。
///
/// # 契约说明（What）
/// - `cancel` 返回 `true` 表示本次调用首次触发取消，重复调用返回 `false`；
/// - `cancelled().await` 在取消发生后完成，即使取消早于 `await` 发生也不会丢失唤醒。
#[derive(Debug, Default)]
pub struct CycleCancellation {
    flag: AtomicBool,
    notify: Notify,
}

impl CycleCancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒等待方。
    pub fn cancel(&self) -> bool {
        let first = self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            // `notify_one` 在没有等待者时保留一个许可，后续的 `notified()` 会立即完成。
            self.notify.notify_one();
        }
        first
    }

    /// 等待取消发生。
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// 一次已调度的节流等待。
///
/// 定时器返回的 `Delay` 句柄由等待循环独占持有，周期被放弃时随之 Drop。
#[derive(Debug)]
pub struct Cycle {
    id: u64,
    decision: ThrottlingDecision,
    cancellation: CycleCancellation,
}

impl Cycle {
    /// 以决策快照创建周期。
    pub fn new(id: u64, decision: ThrottlingDecision) -> Self {
        Self {
            id,
            decision,
            cancellation: CycleCancellation::new(),
        }
    }

    /// 节流器内单调递增的周期编号，仅用于日志关联。
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// 启动本周期的决策快照。
    pub const fn decision(&self) -> &ThrottlingDecision {
        &self.decision
    }

    /// 本周期的取消令牌。
    pub const fn cancellation(&self) -> &CycleCancellation {
        &self.cancellation
    }

    /// 放弃本周期：令牌首次取消时返回 `true`。
    pub fn abandon(&self) -> bool {
        self.cancellation.cancel()
    }
}

/// 当前周期槽位。
#[derive(Debug, Default)]
pub struct CycleSlot {
    current: ArcSwapOption<Cycle>,
}

impl CycleSlot {
    /// 创建空槽位。
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布新的当前周期。
    ///
    /// 调用方必须保证上一周期已经退役；节流器通过串行化 `throttle()` 满足这一前置条件。
    pub fn install(&self, cycle: &Arc<Cycle>) {
        self.current.store(Some(Arc::clone(cycle)));
    }

    /// 原子地取走当前周期（若有）。取走者获得退役权。
    pub fn take(&self) -> Option<Arc<Cycle>> {
        self.current.swap(None)
    }

    /// 仅当槽位仍指向 `cycle` 时将其清空；返回 `true` 表示调用方赢得退役权。
    pub fn retire(&self, cycle: &Arc<Cycle>) -> bool {
        let expected = Some(Arc::clone(cycle));
        let previous = self.current.compare_and_swap(&expected, None::<Arc<Cycle>>);
        matches!(&*previous, Some(prev) if Arc::ptr_eq(prev, cycle))
    }

    /// 是否存在活跃周期。
    pub fn is_occupied(&self) -> bool {
        self.current.load().is_some()
    }

    /// 当前周期的编号快照。
    pub fn current_id(&self) -> Option<u64> {
        self.current.load().as_ref().map(|cycle| cycle.id())
    }
}
