//! 描述符变更监听

use chrono::{DateTime, Utc};
use infrastructure_common::ActiveDescriptor;
use std::sync::Arc;

/// 一次提交产生的描述符变更
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// 提交序号，从 1 开始递增
    pub sequence: u64,
    /// 新增的描述符
    pub added: Vec<Arc<ActiveDescriptor>>,
    /// 移除的描述符
    pub removed: Vec<Arc<ActiveDescriptor>>,
    /// 提交时间
    pub committed_at: DateTime<Utc>,
}

impl ChangeSet {
    /// 创建变更集
    pub fn new(
        sequence: u64,
        added: Vec<Arc<ActiveDescriptor>>,
        removed: Vec<Arc<ActiveDescriptor>>,
    ) -> Self {
        Self {
            sequence,
            added,
            removed,
            committed_at: Utc::now(),
        }
    }

    /// 是否没有任何变更
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// 配置变更监听器 trait
///
/// 按提交顺序同步调用；回调中不要在同一线程上提交新的配置事务
pub trait ConfigurationListener: Send + Sync {
    /// 监听器名称
    fn name(&self) -> &str;

    /// 是否启用
    fn is_enabled(&self) -> bool {
        true
    }

    /// 描述符集合已变更
    fn configuration_changed(&self, changes: &ChangeSet);
}
