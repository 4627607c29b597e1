//! Parts Agent 命令行入口
//!
//! 初始化日志、加载配置与配件目录、组装流水线，然后在标准输入上运行单会话对话。
//! 处理中按 Ctrl-C 取消当前轮，会话保持不变。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parts_agent::config::{load_config, AppConfig};
use parts_agent::core::{AgentBuilder, TurnVerdict};
use parts_agent::llm::{LlmClient, MockLlmClient, OpenAiClient};
use parts_agent::session::SessionStore;
use parts_agent::store::{MemoryCatalog, SqliteCatalog};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const DEFAULT_CATALOG: &str = "data/sample_catalog.json";
const SESSION_SWEEP_SECS: u64 = 60;

fn create_llm(cfg: &AppConfig, model: &str) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::warn!("Using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        _ => {
            tracing::info!(model = %model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                model,
                None,
                cfg.llm.timeouts.request,
            ))
        }
    }
}

async fn attach_catalog(builder: AgentBuilder, cfg: &AppConfig) -> anyhow::Result<AgentBuilder> {
    let catalog_path = cfg
        .app
        .catalog_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG));
    match cfg.app.sqlite_path {
        Some(ref db) => {
            let catalog = SqliteCatalog::open(db).context("Failed to open SQLite catalog")?;
            if catalog_path.exists() {
                let snapshot = parts_agent::store::CatalogSnapshot::load_json(&catalog_path)?;
                let imported = catalog.import(snapshot).await.context("Catalog import failed")?;
                tracing::info!(parts = imported, path = %catalog_path.display(), "catalog imported into SQLite");
            }
            Ok(builder.with_catalog(Arc::new(catalog)))
        }
        None => {
            let catalog = MemoryCatalog::from_json_file(&catalog_path)
                .with_context(|| format!("Failed to load catalog {}", catalog_path.display()))?;
            tracing::info!(parts = catalog.snapshot().parts.len(), "in-memory catalog loaded");
            Ok(builder.with_catalog(Arc::new(catalog)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parts_agent::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    #[allow(unused_mut)]
    let mut cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let llm = create_llm(&cfg, &cfg.llm.model);

    #[cfg(not(feature = "browser"))]
    if cfg.fallback.enabled {
        tracing::warn!("built without the `browser` feature, live fallback disabled");
        cfg.fallback.enabled = false;
    }

    let mut builder = AgentBuilder::new(cfg.clone()).with_llm(llm.clone());
    if let Some(ref model) = cfg.llm.classifier_model {
        builder = builder.with_classifier_llm(create_llm(&cfg, model));
    }
    #[cfg(feature = "browser")]
    {
        builder = builder.with_fetcher(Arc::new(parts_agent::fallback::ChromeFetcher::new(
            cfg.fallback.base_url.clone(),
            Duration::from_secs(cfg.fallback.timeout_secs),
        )));
    }
    let builder = attach_catalog(builder, &cfg).await?;
    let orchestrator = Arc::new(builder.build().context("Failed to build pipeline")?);

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(SESSION_SWEEP_SECS));
            loop {
                tick.tick().await;
                let removed = orchestrator.sessions().cleanup_expired().await;
                if removed > 0 {
                    tracing::info!(removed, "expired sessions removed");
                }
            }
        });
    }

    let conversation = SessionStore::new_conversation_id();
    println!("Refrigerator & dishwasher parts assistant. Ask a question, or type /quit to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt();
        let Some(line) = lines.next_line().await.context("stdin read failed")? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query == "/quit" || query == "/exit" {
            break;
        }

        let cancel = CancellationToken::new();
        let turn = orchestrator.handle(&conversation, query, &cancel);
        tokio::pin!(turn);
        let outcome = tokio::select! {
            outcome = &mut turn => outcome,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                turn.await
            }
        };

        match outcome.verdict {
            TurnVerdict::Cancelled => println!("(cancelled)"),
            _ => println!("\n{}\n", outcome.response),
        }
        for part in &outcome.parts {
            println!(
                "  [{}] {}{}",
                part.ps_number,
                part.part_name,
                part.part_price.map(|p| format!(" - ${:.2}", p)).unwrap_or_default()
            );
        }
        tracing::debug!(steps = outcome.steps, stop = ?outcome.stop_reason, "turn finished");
    }

    let (prompt, completion, total) = llm.token_usage();
    tracing::info!(prompt, completion, total, "token usage");
    Ok(())
}

fn print_prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}
