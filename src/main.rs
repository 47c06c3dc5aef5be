//! Worksheets - 行式演示驱动
//!
//! 入口：加载配置与工作表规格，每行读入一个 JSON 状态增量，输出本轮回复。
//! 用法：`worksheets [spec.toml]`，未给参数时使用配置中的 spec.path。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use worksheets::{
    action::{ActionExecutor, ApiRegistry},
    config::load_config,
    knowledge::StaticKnowledgeBase,
    observability,
    session::{JsonDeltaParser, PlainResponder, Session},
    state::StatePersistence,
    template::load_spec_file,
    PolicyEngine, PolicySettings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let spec_path: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| cfg.spec.path.clone())
        .context("No worksheet spec given (argument or spec.path in config)")?;

    let registry = load_spec_file(&spec_path)
        .with_context(|| format!("Failed to load worksheet spec {}", spec_path.display()))?;
    let executor = ActionExecutor::new(ApiRegistry::with_builtins(), cfg.engine.action_timeout_secs);
    let mut engine = PolicyEngine::new(Arc::new(registry), executor, PolicySettings::from(&cfg));
    if let Some(path) = &cfg.knowledge.path {
        let kb = StaticKnowledgeBase::from_file(path)
            .with_context(|| format!("Failed to load knowledge base {}", path.display()))?;
        engine = engine.with_knowledge(Arc::new(kb));
    }
    let engine = Arc::new(engine);

    let mut session = match &cfg.session.state_path {
        Some(path) => Session::resume(
            engine,
            Box::new(JsonDeltaParser),
            Box::new(PlainResponder),
            StatePersistence::new(path),
        )
        .context("Failed to resume session")?,
        None => Session::new(engine, Box::new(JsonDeltaParser), Box::new(PlainResponder)),
    };
    info!(spec = %spec_path.display(), "worksheets ready, one JSON delta per line");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match session.turn(&line).await {
            Ok(out) => println!("{}", out.response),
            Err(e) => eprintln!("rejected: {e}"),
        }
    }
    Ok(())
}
