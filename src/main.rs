//! vm-exec 命令行入口
//! 通过配置的 SSH 会话执行一条远程命令，输出结果并以远端退出码退出

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use vm_exec::{config::AppConfig, telemetry, CommandExecutor, ExecOptions};

#[derive(Debug, Parser)]
#[command(name = "vm-exec", version, about = "Run a command on the configured VM over SSH")]
struct Cli {
    /// YAML 配置文件路径
    #[arg(short, long, env = "VM_EXEC_CONFIG")]
    config: Option<PathBuf>,

    /// 命令超时（秒），缺省使用配置中的 command_timeout_secs
    #[arg(short, long, conflicts_with = "no_timeout")]
    timeout: Option<u64>,

    /// 不设超时
    #[arg(long)]
    no_timeout: bool,

    /// 以 root 权限执行（需要配置 use_sudo）
    #[arg(long)]
    sudo: bool,

    /// 非零退出码视为错误
    #[arg(long)]
    check: bool,

    /// 要执行的命令
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载 .env 文件（开发环境）
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    // 1. 加载配置
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // 2. 初始化日志
    telemetry::init_telemetry(&config.logging)?;

    // 3. 执行命令
    let executor = CommandExecutor::from_config(&config)?;

    let mut options = ExecOptions::new();
    if let Some(secs) = cli.timeout {
        options = options.timeout(Duration::from_secs(secs));
    }
    if cli.no_timeout {
        options = options.no_timeout();
    }
    if cli.sudo {
        options = options.escalated();
    }
    if cli.check {
        options = options.verify_success();
    }

    let command = cli.command.join(" ");
    let outcome = executor.execute(&command, options).await;

    // 4. 关闭连接
    executor.close().await;

    match outcome {
        Ok(result) => {
            if !result.stdout().is_empty() {
                println!("{}", result.stdout());
            }
            if !result.stderr().is_empty() {
                eprintln!("{}", result.stderr());
            }
            std::process::exit(result.exit_code());
        }
        Err(e) => {
            eprintln!("error: {}", e);
            for cause in vm_exec::error::error_chain(&e) {
                eprintln!("  caused by: {}", cause);
            }
            std::process::exit(1);
        }
    }
}
