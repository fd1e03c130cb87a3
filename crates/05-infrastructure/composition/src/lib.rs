//! # 基础设施组合层
//!
//! 负责把配置、日志和服务注册表组装成一个可运行的注册表实例。
//!
//! ## 主要功能
//!
//! - **注册表构建器**: 使用构建者模式组装注册表
//! - **配置加载**: 从 `config/registry` 和 `REGISTRY__*` 环境变量加载
//! - **日志初始化**: 开发和生产两套预设
//!
//! ## 基本使用
//!
//! ```rust,no_run
//! use infrastructure_composition::{LoggingConfig, RegistryBuilder};
//! use infrastructure_common::{Descriptor, ScopeKind};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let locator = RegistryBuilder::new()
//!         .with_config_file("config/registry")
//!         .with_logging(LoggingConfig::development())
//!         .enable_immediate_scope(true)
//!         .add_descriptor(Descriptor::new("Heartbeat").in_scope(ScopeKind::Immediate))
//!         .build()?;
//!
//!     println!("已绑定 {} 个描述符", locator.descriptor_count());
//!     Ok(())
//! }
//! ```

pub mod builder;

// 重新导出主要类型
pub use builder::{LoggingConfig, RegistryBuilder};

// 重新导出错误类型
pub use infrastructure_common::InfrastructureError;
