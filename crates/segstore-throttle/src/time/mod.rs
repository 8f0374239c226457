//! 定时抽象模块，提供可注入的延迟调度能力，使节流周期在测试中完全确定。
//!
//! # 模块定位（Why）
//! - 节流器只依赖 [`Timer`] trait 登记“N 毫秒后完成”的等待，生产环境与测试环境通过注入不同实现切换；
//! - 以构造期注入取代“子类覆写创建延迟方法”的测试缝。
//!
//! # 结构概览（What）
//! - [`timer::Timer`]：核心 trait，暴露 `schedule_delay` 原语；
//! - [`timer::TokioTimer`]：绑定共享 Tokio 运行时的生产实现；
//! - [`timer::ManualTimer`]：记录请求时长并支持手动完成的确定性实现。

pub mod timer;

pub use timer::{Delay, ManualTimer, Timer, TokioTimer};
