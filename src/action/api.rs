//! 外部 API 注册表
//!
//! 动作中的 `call api(...)` 按名查找 ExternalApi；ActionExecutor 负责超时与审计日志。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// 外部 API：参数为具名 JSON 对象，返回任意 JSON
#[async_trait]
pub trait ExternalApi: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn call(&self, args: Map<String, Value>) -> Result<Value, String>;
}

/// 闭包包装的同步 API（演示与测试用）
pub struct FnApi<F> {
    name: String,
    f: F,
}

impl<F> FnApi<F>
where
    F: Fn(Map<String, Value>) -> Result<Value, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> ExternalApi for FnApi<F>
where
    F: Fn(Map<String, Value>) -> Result<Value, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Map<String, Value>) -> Result<Value, String> {
        (self.f)(args)
    }
}

/// Echo：有 text 参数时回显 text，否则回显全部参数
pub struct EchoApi;

#[async_trait]
impl ExternalApi for EchoApi {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo arguments back. Args: {\"text\": \"message\"}"
    }

    async fn call(&self, args: Map<String, Value>) -> Result<Value, String> {
        match args.get("text") {
            Some(text) => Ok(text.clone()),
            None => Ok(Value::Object(args)),
        }
    }
}

/// 按名存储 Arc<dyn ExternalApi>
#[derive(Default, Clone)]
pub struct ApiRegistry {
    apis: HashMap<String, Arc<dyn ExternalApi>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置 echo
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(EchoApi);
        registry
    }

    pub fn register(&mut self, api: impl ExternalApi + 'static) {
        let name = api.name().to_string();
        self.apis.insert(name, Arc::new(api));
    }

    pub fn register_fn<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Map<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(FnApi::new(name, f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExternalApi>> {
        self.apis.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apis.contains_key(name)
    }

    pub fn api_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apis.keys().cloned().collect();
        names.sort();
        names
    }
}
