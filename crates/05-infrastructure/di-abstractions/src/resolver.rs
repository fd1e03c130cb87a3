//! 依赖解析上下文
//!
//! 在一次构造链中跟踪正在创建的描述符，用于检测循环依赖

use infrastructure_common::{DependencyError, DependencyResult, DescriptorId};

/// 解析上下文
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// 当前解析链，用于检测循环依赖
    pub resolution_chain: Vec<(DescriptorId, String)>,
    /// 解析选项
    pub options: ResolveOptions,
}

impl ResolveContext {
    /// 创建新的解析上下文
    pub fn new() -> Self {
        Self::with_options(ResolveOptions::default())
    }

    /// 使用指定选项创建解析上下文
    pub fn with_options(options: ResolveOptions) -> Self {
        Self {
            resolution_chain: Vec::new(),
            options,
        }
    }

    /// 添加描述符到解析链
    pub fn push(&mut self, id: DescriptorId, implementation: &str) -> DependencyResult<()> {
        if self.resolution_chain.iter().any(|(existing, _)| *existing == id) {
            return Err(DependencyError::CircularDependency {
                dependency_chain: self.describe_with(implementation),
            });
        }
        if self.resolution_chain.len() >= self.options.max_depth {
            return Err(DependencyError::CircularDependency {
                dependency_chain: format!(
                    "解析深度超过 {}: {}",
                    self.options.max_depth,
                    self.describe_with(implementation)
                ),
            });
        }
        self.resolution_chain.push((id, implementation.to_string()));
        Ok(())
    }

    /// 从解析链中移除最后一个描述符
    pub fn pop(&mut self) {
        self.resolution_chain.pop();
    }

    /// 当前解析深度
    pub fn depth(&self) -> usize {
        self.resolution_chain.len()
    }

    fn describe_with(&self, next: &str) -> String {
        let mut chain: Vec<&str> = self
            .resolution_chain
            .iter()
            .map(|(_, implementation)| implementation.as_str())
            .collect();
        chain.push(next);
        chain.join(" -> ")
    }
}

impl Default for ResolveContext {
    fn default() -> Self {
        Self::new()
    }
}

/// 解析选项
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// 最大递归深度
    pub max_depth: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self { max_depth: 100 }
    }
}
