//! # Infrastructure Common
//!
//! 服务注册表的公共类型：描述符、作用域、生命周期状态、服务创建器以及错误分类。
//!
//! ## 核心类型
//!
//! - [`Descriptor`] - 绑定前的描述符记录
//! - [`ActiveDescriptor`] - 注册表持有的描述符（已分配 ID，可调整排名）
//! - [`Lookup`] - 按契约、限定符和名称的查找条件
//! - [`ScopeKind`] - 实例缓存策略
//! - [`ServiceCreator`] - 服务实例的创建与销毁
//! - [`DependencyError`] - 解析、提交与构造失败的错误分类
//! - [`RegistryConfig`] - 注册表配置
//!
//! ## 设计原则
//!
//! - 注册表对象显式构造，不存在进程级全局注册表
//! - 描述符排名只能通过所属注册表修改
//! - 所有失败通过 `Result` 传播

pub mod component;
pub mod configuration;
pub mod descriptor;
pub mod errors;
pub mod lifecycle;
pub mod metadata;

pub use component::*;
pub use configuration::*;
pub use descriptor::*;
pub use errors::*;
pub use lifecycle::*;
pub use metadata::*;
