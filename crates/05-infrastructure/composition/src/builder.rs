//! 服务注册表构建器

use di_abstractions::{
    ConfigurationListener, ErrorService, ImmediateErrorHandler, InterceptionService, ScopeContext,
};
use di_impl::ServiceLocatorImpl;
use infrastructure_common::{Descriptor, InfrastructureError, RegistryConfig, ServiceCreator};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// 服务注册表构建器
///
/// 使用建造者模式组装注册表：配置、日志、错误服务、拦截服务、即时作用域以及初始描述符
pub struct RegistryBuilder {
    /// 显式指定的配置
    config: Option<RegistryConfig>,
    /// 配置文件路径（不含扩展名）
    config_path: Option<String>,
    /// 覆盖配置中的严格模式
    strict_mode: Option<bool>,
    /// 初始描述符
    descriptors: Vec<Descriptor>,
    /// 实现目录
    implementations: Vec<(String, Arc<dyn ServiceCreator>)>,
    /// 错误服务
    error_services: Vec<Arc<dyn ErrorService>>,
    /// 拦截服务
    interception_services: Vec<Arc<dyn InterceptionService>>,
    /// 配置变更监听器
    listeners: Vec<Arc<dyn ConfigurationListener>>,
    /// 自定义作用域
    scope_contexts: Vec<Arc<dyn ScopeContext>>,
    /// 是否开启即时作用域
    immediate_enabled: bool,
    /// 即时作用域错误处理器
    immediate_handler: Option<Arc<dyn ImmediateErrorHandler>>,
    /// 是否启用日志初始化
    logging_enabled: bool,
    /// 日志配置
    logging_config: LoggingConfig,
}

impl RegistryBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: None,
            config_path: None,
            strict_mode: None,
            descriptors: Vec::new(),
            implementations: Vec::new(),
            error_services: Vec::new(),
            interception_services: Vec::new(),
            listeners: Vec::new(),
            scope_contexts: Vec::new(),
            immediate_enabled: false,
            immediate_handler: None,
            logging_enabled: false, // 默认不初始化日志
            logging_config: LoggingConfig::default(),
        }
    }

    /// 使用指定配置
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 从配置文件和 `REGISTRY__*` 环境变量加载配置
    pub fn with_config_file(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        info!("使用注册表配置文件: {}", base);
        self.config_path = Some(base);
        self
    }

    /// 覆盖严格模式
    pub fn strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = Some(enabled);
        self
    }

    /// 添加初始描述符
    pub fn add_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// 批量添加已解析好的描述符记录
    pub fn with_descriptors<I>(mut self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = Descriptor>,
    {
        self.descriptors.extend(descriptors);
        self
    }

    /// 登记实现
    pub fn register_implementation(mut self, implementation: impl Into<String>, creator: Arc<dyn ServiceCreator>) -> Self {
        self.implementations.push((implementation.into(), creator));
        self
    }

    /// 添加错误服务
    pub fn add_error_service(mut self, service: Arc<dyn ErrorService>) -> Self {
        self.error_services.push(service);
        self
    }

    /// 添加拦截服务
    pub fn add_interception_service(mut self, service: Arc<dyn InterceptionService>) -> Self {
        self.interception_services.push(service);
        self
    }

    /// 添加配置变更监听器
    pub fn add_configuration_listener(mut self, listener: Arc<dyn ConfigurationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// 添加自定义作用域
    pub fn add_scope_context(mut self, context: Arc<dyn ScopeContext>) -> Self {
        self.scope_contexts.push(context);
        self
    }

    /// 开启或关闭即时作用域
    pub fn enable_immediate_scope(mut self, enabled: bool) -> Self {
        self.immediate_enabled = enabled;
        self
    }

    /// 设置即时作用域错误处理器，同时开启即时作用域
    pub fn with_immediate_error_handler(mut self, handler: Arc<dyn ImmediateErrorHandler>) -> Self {
        self.immediate_handler = Some(handler);
        self.immediate_enabled = true;
        self
    }

    /// 配置日志
    pub fn with_logging(mut self, config: LoggingConfig) -> Self {
        self.logging_config = config;
        self.logging_enabled = true;
        self
    }

    /// 构建注册表
    pub fn build(self) -> Result<Arc<ServiceLocatorImpl>, InfrastructureError> {
        if self.logging_enabled {
            self.logging_config.init();
        }
        info!("开始构建服务注册表");

        let mut config = match (self.config, &self.config_path) {
            (Some(config), _) => config,
            (None, Some(path)) => RegistryConfig::load_from(path)?,
            (None, None) => RegistryConfig::default(),
        };
        if let Some(strict_mode) = self.strict_mode {
            config.strict_mode = strict_mode;
        }
        config.validate()?;

        let locator = ServiceLocatorImpl::new(config);

        for (implementation, creator) in self.implementations {
            locator.register_implementation(implementation, creator);
        }
        for context in self.scope_contexts {
            locator.register_scope_context(context);
        }
        for service in self.error_services {
            locator.add_error_service(service);
        }
        for service in self.interception_services {
            locator.add_interception_service(service);
        }
        for listener in self.listeners {
            locator.add_configuration_listener(listener);
        }
        if self.immediate_enabled {
            locator.enable_immediate_scope(self.immediate_handler);
        }

        if !self.descriptors.is_empty() {
            let count = self.descriptors.len();
            locator
                .add_descriptors(self.descriptors)
                .map_err(|e| InfrastructureError::BootstrapFailed {
                    message: format!("绑定初始描述符失败: {}", e),
                })?;
            debug!("已绑定 {} 个初始描述符", count);
        }

        info!("服务注册表构建完成: {}", locator.config().name);
        Ok(locator)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// 日志级别，`RUST_LOG` 存在时以环境变量为准
    pub level: tracing::Level,
    /// 是否显示目标
    pub show_target: bool,
    /// 是否显示线程名称
    pub show_thread_names: bool,
    /// 是否显示文件名
    pub show_file: bool,
    /// 是否显示行号
    pub show_line_number: bool,
    /// 是否使用 JSON 格式
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: tracing::Level::INFO,
            show_target: true,
            show_thread_names: false,
            show_file: false,
            show_line_number: false,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// 创建开发环境日志配置
    pub fn development() -> Self {
        Self {
            level: tracing::Level::DEBUG,
            show_target: true,
            show_thread_names: true,
            show_file: true,
            show_line_number: true,
            json_format: false,
        }
    }

    /// 创建生产环境日志配置
    pub fn production() -> Self {
        Self {
            level: tracing::Level::INFO,
            show_target: false,
            show_thread_names: false,
            show_file: false,
            show_line_number: false,
            json_format: true,
        }
    }

    /// 初始化全局日志，返回是否由本次调用完成初始化
    ///
    /// 已经初始化过时只记录警告
    pub fn init(&self) -> bool {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string()));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.show_target)
            .with_thread_names(self.show_thread_names)
            .with_file(self.show_file)
            .with_line_number(self.show_line_number);

        let result = if self.json_format {
            subscriber.json().try_init()
        } else {
            subscriber.try_init()
        };

        match result {
            Ok(()) => {
                info!("日志系统初始化完成");
                true
            }
            Err(e) => {
                warn!("日志系统已初始化，跳过: {}", e);
                false
            }
        }
    }
}
