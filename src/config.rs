//! 骨架配置
//!
//! 进程级的扁平默认值集合。IK 链、混合器和事件队列在创建时读取，
//! 需要修改请在构建之前调用 [`set_config`]。

use once_cell::sync::Lazy;
use std::sync::RwLock;

/// 骨架配置（扁平结构，无嵌套）
#[derive(Debug, Clone)]
pub struct RigConfig {
    // ========== IK ==========
    /// 新链的 FABRIK 迭代上限，默认 10
    pub ik_iterations: u32,
    /// 新链的收敛距离，默认 1e-3
    pub ik_tolerance: f32,
    /// 目标位于直链自身方向上时的侧推量，按最短段长的比例，默认 0.01
    pub straight_chain_nudge: f32,

    // ========== 姿态混合 ==========
    /// 每次更新向目标权重靠近的平滑系数，默认 0.1
    pub blend_smoothing: f32,
    /// 使用 `1 - exp(-rate * dt)` 代替每次更新系数，默认 false
    pub time_normalized_smoothing: bool,
    /// 时间归一化模式的平滑速率 (1/s)
    pub smoothing_rate: f32,

    // ========== 事件 ==========
    /// 每个骨架保留的待处理事件数，超出丢弃最早的，默认 1024
    pub max_pending_events: usize,

    // ========== 调试 ==========
    /// 以 info 级别输出求解器和约束摘要，默认 false
    pub debug_log: bool,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            ik_iterations: 10,
            ik_tolerance: 1.0e-3,
            straight_chain_nudge: 0.01,

            blend_smoothing: 0.1,
            time_normalized_smoothing: false,
            // -60 * ln(0.9)：每秒 60 次更新时等于旧的 0.1 系数
            smoothing_rate: 6.3216,

            max_pending_events: 1024,

            debug_log: false,
        }
    }
}

/// 全局配置实例
static RIG_CONFIG: Lazy<RwLock<RigConfig>> = Lazy::new(|| RwLock::new(RigConfig::default()));

/// 获取当前配置（副本）
pub fn get_config() -> RigConfig {
    RIG_CONFIG.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// 替换配置
pub fn set_config(config: RigConfig) {
    *RIG_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = config;
}

/// 恢复默认值
pub fn reset_config() {
    *RIG_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = RigConfig::default();
}
