//! Hive 无头入口：命令行目标 -> 编排执行 -> 事件流打印 + 最终汇总

use std::sync::Arc;

use hive::config::load_config;
use hive::core::{create_gateway_from_config, Orchestrator};
use hive::observability;
use hive::tools::{EchoTool, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let objective: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if objective.trim().is_empty() {
        eprintln!("usage: hive <objective>");
        std::process::exit(2);
    }

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let gateway = create_gateway_from_config(&cfg);

    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);

    let orchestrator = Orchestrator::builder(gateway)
        .with_config(cfg)
        .with_tools(tools)
        .build();

    // 事件流打印到 stderr（JSON lines），汇总走 stdout
    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{}", line);
            }
        }
    });

    let session_id = orchestrator.create_session(&objective).await;
    let result = orchestrator.run_session(&session_id).await;
    printer.abort();

    match result {
        Ok(outcome) => {
            let (prompt, completion, total) = orchestrator.token_usage();
            tracing::info!(
                "session {} finished as {:?} (tokens: {}+{}={})",
                outcome.session_id,
                outcome.status,
                prompt,
                completion,
                total
            );
            println!("{}", outcome.summary);
            Ok(())
        }
        Err(e) => {
            orchestrator.publish_error(&session_id, &e);
            Err(e.into())
        }
    }
}
