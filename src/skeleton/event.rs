//! 面向渲染器和编辑器的变更通知

use std::collections::VecDeque;

use super::{IkResult, Transform};

/// 骨架上发生的变更
///
/// 每个变体都带骨架 id，以及足够的数据，使用方无需重读整个骨架即可刷新。
#[derive(Clone, Debug, PartialEq)]
pub enum SkeletonEvent {
    BoneAdded {
        skeleton: String,
        bone: String,
        parent: Option<String>,
    },
    BoneRemoved {
        skeleton: String,
        bone: String,
        /// 原子骨骼，现为根
        promoted: Vec<String>,
    },
    BoneUpdated {
        skeleton: String,
        bone: String,
        transform: Transform,
    },
    PoseApplied {
        skeleton: String,
        pose: String,
        bones_written: usize,
    },
    IkApplied {
        skeleton: String,
        chain: String,
        result: IkResult,
    },
    ConstraintApplied {
        skeleton: String,
        constraint: String,
        bone: String,
        transform: Transform,
    },
}

impl SkeletonEvent {
    pub fn skeleton_id(&self) -> &str {
        match self {
            SkeletonEvent::BoneAdded { skeleton, .. }
            | SkeletonEvent::BoneRemoved { skeleton, .. }
            | SkeletonEvent::BoneUpdated { skeleton, .. }
            | SkeletonEvent::PoseApplied { skeleton, .. }
            | SkeletonEvent::IkApplied { skeleton, .. }
            | SkeletonEvent::ConstraintApplied { skeleton, .. } => skeleton,
        }
    }
}

/// 有界的待处理事件队列，溢出时丢弃最早的事件
#[derive(Clone, Debug)]
pub(crate) struct EventQueue {
    events: VecDeque<SkeletonEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, event: SkeletonEvent) {
        if self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 1024 == 0 {
                log::warn!("[Event] {}: 事件队列已满, 已丢弃 {} 个事件", event.skeleton_id(), self.dropped);
            }
        }
        self.events.push_back(event);
    }

    pub(crate) fn drain(&mut self) -> Vec<SkeletonEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}
