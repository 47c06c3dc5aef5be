//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WORKSHEETS__*` 覆盖（双下划线表示嵌套，如 `WORKSHEETS__ENGINE__KB_TIMEOUT_SECS=5`）。
//! 配置在进程启动时构建一次，显式传给引擎与会话。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub engine: EngineSection,
    pub spec: SpecSection,
    pub knowledge: KnowledgeSection,
    pub session: SessionSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [engine] 段：策略与动作执行参数
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// 一轮没有任何行为时说的话
    #[serde(default = "default_idle_utterance")]
    pub idle_utterance: String,
    #[serde(default = "default_abandon_utterance")]
    pub abandon_utterance: String,
    /// 单次外部 API 调用超时（秒）
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_kb_timeout_secs")]
    pub kb_timeout_secs: u64,
    #[serde(default)]
    pub open_new_worksheet_if_possible: bool,
    #[serde(default)]
    pub retry_failed_actions: bool,
    /// 覆盖自动计算的扫描遍数上限
    #[serde(default)]
    pub max_passes: Option<usize>,
}

fn default_idle_utterance() -> String {
    "Is there anything else I can help you with?".to_string()
}

fn default_abandon_utterance() -> String {
    "Okay, I have cancelled that.".to_string()
}

fn default_action_timeout_secs() -> u64 {
    30
}

fn default_kb_timeout_secs() -> u64 {
    10
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            idle_utterance: default_idle_utterance(),
            abandon_utterance: default_abandon_utterance(),
            action_timeout_secs: default_action_timeout_secs(),
            kb_timeout_secs: default_kb_timeout_secs(),
            open_new_worksheet_if_possible: false,
            retry_failed_actions: false,
            max_passes: None,
        }
    }
}

/// [spec] 段：工作表定义文件（TOML / JSON）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SpecSection {
    pub path: Option<PathBuf>,
}

/// [knowledge] 段：静态知识库文件与结果行数上限
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeSection {
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

fn default_max_rows() -> usize {
    3
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            path: None,
            max_rows: default_max_rows(),
        }
    }
}

/// [session] 段：会话快照路径，未设置时不持久化
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    pub state_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 WORKSHEETS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WORKSHEETS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WORKSHEETS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.action_timeout_secs, 30);
        assert_eq!(cfg.knowledge.max_rows, 3);
        assert!(!cfg.engine.retry_failed_actions);
        assert!(cfg.session.state_path.is_none());
    }

    #[test]
    fn test_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nkb_timeout_secs = 2\nopen_new_worksheet_if_possible = true\n\n[spec]\npath = \"sheets.toml\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.kb_timeout_secs, 2);
        assert!(cfg.engine.open_new_worksheet_if_possible);
        assert_eq!(cfg.spec.path, Some(PathBuf::from("sheets.toml")));
        assert_eq!(cfg.engine.idle_utterance, default_idle_utterance());
    }
}
