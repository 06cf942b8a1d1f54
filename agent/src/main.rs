#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::config::{ProctorConfig, load_yaml_file};
use common::ipc::EndpointPaths;
use common::platform::Platform;
use common::platform::windows::WindowsPlatform;
use common::telemetry::init_telemetry;
use tokio::sync::watch;

use agent::coordinator::Coordinator;
use agent::ipc;
use agent::vm::VmDetector;

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), String> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("初始化 tokio 运行时失败: {e}"))?;
    rt.block_on(run_async())
}

async fn run_async() -> Result<(), String> {
    init_telemetry().map_err(|e| format!("初始化日志失败: {e}"))?;

    let args = parse_args(std::env::args().skip(1))?;
    let cfg = match args.config_path {
        Some(path) => load_yaml_file(path.as_path())
            .map_err(|e| format!("加载配置失败（{}）: {e}", path.display()))?,
        None => ProctorConfig::default(),
    };
    cfg.validate().map_err(|e| format!("配置校验失败: {e}"))?;

    let platform: Arc<dyn Platform> = Arc::new(WindowsPlatform::new());

    let vm_report = VmDetector::new(cfg.vm.clone()).probe(&platform);
    tracing::info!(
        is_vm = vm_report.is_vm,
        indicators = ?vm_report.indicators,
        "virtualization probe"
    );

    let paths = EndpointPaths::new(&cfg.agent.tag, cfg.agent.socket_dir.as_deref());
    let backoff = Duration::from_millis(cfg.agent.ipc_retry_backoff_ms);
    let coordinator = Arc::new(Coordinator::new(cfg, platform));
    if coordinator.startup_cleanup() {
        tracing::info!("startup cleanup complete");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _send_result = shutdown_tx.send(true);
        }
    });

    tracing::info!("agent started");
    ipc::serve(paths, backoff, Arc::clone(&coordinator), shutdown_rx).await;
    coordinator.shutdown().await;
    tracing::info!("agent stopped");
    Ok(())
}

#[derive(Debug)]
struct AgentArgs {
    config_path: Option<PathBuf>,
}

fn parse_args<I>(mut it: I) -> Result<AgentArgs, String>
where
    I: Iterator<Item = String>,
{
    let mut config_path: Option<PathBuf> = None;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let val = it.next().ok_or("--config 缺少参数".to_string())?;
                config_path = Some(PathBuf::from(val));
            }
            "--help" | "-h" => {
                return Err("Usage: proctor-agent [--config <FILE>]\n".to_string());
            }
            other => return Err(format!("未知参数: {other}")),
        }
    }

    Ok(AgentArgs { config_path })
}

#[cfg(test)]
mod tests {
    use super::parse_args;

    #[test]
    fn args_accept_optional_config() {
        let parsed = parse_args(["--config", "proctor.yml"].iter().map(ToString::to_string));
        assert_eq!(
            parsed.map(|a| a.config_path),
            Ok(Some(std::path::PathBuf::from("proctor.yml")))
        );

        let empty = parse_args(std::iter::empty());
        assert_eq!(empty.map(|a| a.config_path), Ok(None));
    }

    #[test]
    fn positional_arguments_are_rejected() {
        assert!(parse_args(["install"].iter().map(ToString::to_string)).is_err());
        assert!(parse_args(["--config"].iter().map(ToString::to_string)).is_err());
    }
}
