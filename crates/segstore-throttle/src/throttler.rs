//! 可中断的多周期节流器。
//!
//! # 模块定位（Why）
//! - 写入管线在接受更多工作前询问“是否需要放慢”，需要时等待一段由下游压力推导出的时长；
//! - 单次等待受上限约束；压力持续超限时逐周期重新度量并继续等待；
//! - 外部事件（某个压力源刚刚自我缓解）可以打断进行中的等待并立即重新计算。
//!
//! # 状态机（What）
//! - `Idle`：槽位为空；`Waiting(cycle)`：槽位持有唯一活跃周期；`Closed`：终态，任意状态可达；
//! - 自然到期、通知、关闭、等待方被丢弃四者通过 [`CycleSlot`] 的比较交换争夺同一周期的退役权，输家退化为空操作。
//!
//! # 调度模型（How）
//! - `throttle()` 从不阻塞调用线程，返回的 Future 只在定时器的 `Delay` 中挂起；
//! - 周期回调只做常数量的簿记，不执行任何重计算，避免拖慢共享执行器。

use std::fmt;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{Instrument, debug, debug_span, info, trace, warn};

use crate::calculator::ThrottlingCalculator;
use crate::cycle::{Cycle, CycleSlot};
use crate::error::{Result, ThrottleError};
use crate::metrics::MetricsSink;
use crate::time::Timer;

/// `throttle()` 返回的异步完成结果。
pub type ThrottleFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// 段存储写入管线的节流器。
///
/// # 教案式说明
/// - **意图 (Why)**：把计算器产出的决策流转换为单个对外可观察的完成结果，按需串联多个受限等待，并保持可被打断；
/// - **契约 (What)**：
///   - `is_throttling_required`：委托给计算器，不触碰周期状态，可随时调用；
///   - `throttle`：已关闭时立即失败；无需节流时立即成功且不产生周期与指标；否则驱动零到多个周期，
///     直到某周期以非超限状态自然到期；
///   - `notify_throttle_source_changed`：放弃当前周期并立即以新查询开启下一周期，从不直接完成 `throttle()`；
///   - `close`：幂等；关闭时正在等待的 `throttle()` 以 [`ThrottleError::Closed`] 结束；
/// - **并发 (Concurrency)**：`throttle` 预期由单一生产方顺序调用；`notify`/`close` 可在任意线程随时调用。
///   同一实例上的 `throttle()` 由异步闸门串行化，即使被误用也维持“至多一个周期”的不变量；
/// - **权衡 (Trade-offs)**：总等待时长不设上限，持续的严重压力理应换来持续的节流；上限只作用于单个周期。
#[derive(Clone)]
pub struct Throttler {
    inner: Arc<ThrottlerInner>,
}

struct ThrottlerInner {
    container_id: u32,
    calculator: ThrottlingCalculator,
    timer: Arc<dyn Timer>,
    metrics: Arc<dyn MetricsSink>,
    slot: CycleSlot,
    closed: AtomicBool,
    next_cycle_id: AtomicU64,
    in_flight: AsyncMutex<()>,
}

impl Throttler {
    /// 绑定计算器、定时器与指标出口，创建处于 `Idle` 状态的节流器。
    pub fn new(
        container_id: u32,
        calculator: ThrottlingCalculator,
        timer: Arc<dyn Timer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(ThrottlerInner {
                container_id,
                calculator,
                timer,
                metrics,
                slot: CycleSlot::new(),
                closed: AtomicBool::new(false),
                next_cycle_id: AtomicU64::new(0),
                in_flight: AsyncMutex::new(()),
            }),
        }
    }

    /// 所属容器编号。
    pub fn container_id(&self) -> u32 {
        self.inner.container_id
    }

    /// 是否有压力源要求节流。
    pub fn is_throttling_required(&self) -> Result<bool> {
        Ok(self.inner.calculator.is_throttling_required()?)
    }

    /// 按当前压力执行节流，返回在节流期兑现后完成的 Future。
    pub fn throttle(&self) -> ThrottleFuture {
        if self.is_closed() {
            return Box::pin(future::ready(Err(self.inner.closed_error())));
        }

        match self.inner.calculator.is_throttling_required() {
            Ok(false) => return Box::pin(future::ready(Ok(()))),
            Ok(true) => {}
            Err(err) => {
                warn!(
                    container_id = self.inner.container_id,
                    error = %err,
                    "pressure source failed while checking throttling"
                );
                return Box::pin(future::ready(Err(err.into())));
            }
        }

        let inner = Arc::clone(&self.inner);
        let span = debug_span!("throttle", container_id = inner.container_id);
        Box::pin(async move { inner.run_cycles().await }.instrument(span))
    }

    /// 通知压力源状态已变化：放弃当前周期（若有）。`Idle`/`Closed` 下为空操作。
    pub fn notify_throttle_source_changed(&self) {
        if let Some(cycle) = self.inner.slot.take() {
            if cycle.abandon() {
                debug!(
                    container_id = self.inner.container_id,
                    cycle = cycle.id(),
                    "throttle source changed, abandoning cycle"
                );
            }
        }
    }

    /// 关闭节流器。幂等。
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(container_id = self.inner.container_id, "throttler closed");
        if let Some(cycle) = self.inner.slot.take() {
            cycle.abandon();
        }
    }

    /// 是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl fmt::Debug for Throttler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttler")
            .field("container_id", &self.inner.container_id)
            .field("calculator", &self.inner.calculator)
            .field("current_cycle", &self.inner.slot.current_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ThrottlerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> ThrottleError {
        ThrottleError::Closed {
            container_id: self.container_id,
        }
    }

    async fn run_cycles(&self) -> Result<()> {
        let _gate = self.in_flight.lock().await;
        loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }

            let decision = self.calculator.throttling_delay().inspect_err(|err| {
                warn!(error = %err, "pressure source failed while computing delay");
            })?;
            let delay = self
                .timer
                .schedule_delay(decision.duration())
                .inspect_err(|err| warn!(error = %err, "timer rejected throttle delay"))?;

            let cycle = Arc::new(Cycle::new(
                self.next_cycle_id.fetch_add(1, Ordering::Relaxed),
                decision,
            ));
            self.metrics.report_delay(decision.duration_millis());
            debug!(
                cycle = cycle.id(),
                delay_ms = cycle.decision().duration_millis(),
                maxed_out = cycle.decision().is_maxed_out(),
                source = ?cycle.decision().source(),
                "throttle cycle started"
            );

            let lease = CycleLease::install(&self.slot, cycle);
            // `close` 先置位再清槽；安装后复查，保证关闭与安装交错时不会遗留孤儿周期。
            if self.is_closed() {
                return Err(self.closed_error());
            }

            // 先观察到期：到期与放弃同时就绪时，由槽位的比较交换裁决归属，迟到的到期被忽略。
            let elapsed = tokio::select! {
                biased;
                fired = delay => {
                    fired.inspect_err(|err| warn!(error = %err, "throttle delay failed"))?;
                    true
                }
                () = lease.cycle.cancellation().cancelled() => false,
            };

            if elapsed {
                if !lease.retire() {
                    trace!(cycle = lease.cycle.id(), "late elapse of abandoned cycle ignored");
                    continue;
                }
                trace!(cycle = lease.cycle.id(), "throttle cycle elapsed");
                if !lease.cycle.decision().is_maxed_out() {
                    return Ok(());
                }
            }
        }
    }
}

/// 等待期间持有的周期租约；Drop 时尝试退役，覆盖等待方 Future 被丢弃的情形。
struct CycleLease<'a> {
    slot: &'a CycleSlot,
    cycle: Arc<Cycle>,
}

impl<'a> CycleLease<'a> {
    fn install(slot: &'a CycleSlot, cycle: Arc<Cycle>) -> Self {
        slot.install(&cycle);
        Self { slot, cycle }
    }

    fn retire(&self) -> bool {
        self.slot.retire(&self.cycle)
    }
}

impl Drop for CycleLease<'_> {
    fn drop(&mut self) {
        self.retire();
    }
}
