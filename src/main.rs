//! Cadence 命令行入口
//!
//! 初始化日志、加载配置、装配编排器，然后在同一会话（CADENCE_SESSION，默认 "cli"）中逐行读取 stdin 提问，
//! 流式打印回答。Ctrl-C 取消当前运行并退出。

use std::sync::Arc;

use anyhow::Context;
use cadence::config::{load_config, AppConfig};
use cadence::core::{RunEvent, RunRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = load_config(None).unwrap_or_else(|e| {
        eprintln!("Config load failed ({e}), using defaults");
        AppConfig::default()
    });
    cadence::observability::init_with(cfg.app.log_level.as_deref());

    let orchestrator = Arc::new(
        cadence::agent::build_orchestrator(&cfg)
            .await
            .context("Failed to build orchestrator")?,
    );
    let session = std::env::var("CADENCE_SESSION").unwrap_or_else(|_| "cli".to_string());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("read stdin")?,
        };
        let Some(line) = line else { break };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query == "/quit" || query == "/exit" {
            break;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = RunRequest::new(query).with_session(session.clone());
        let orch = orchestrator.clone();
        let handle = tokio::spawn(async move { orch.run_with(request, Some(tx)).await });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    handle.abort();
                    break;
                }
                event = rx.recv() => match event {
                    Some(RunEvent::AnswerChunk { text }) => {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Some(RunEvent::AnswerDone) => stdout.write_all(b"\n").await?,
                    Some(_) => {}
                    None => break,
                },
            }
        }

        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => eprintln!("error: {e}"),
            Err(e) if e.is_cancelled() => eprintln!("cancelled"),
            Err(e) => eprintln!("run task failed: {e}"),
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    Ok(())
}
