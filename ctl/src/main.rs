#![allow(missing_docs)]

use std::time::Duration;

use clap::Parser;
use common::error::ProctorError;
use common::ipc::{EndpointPaths, IpcClient};
use common::protocol::{Command, Reply};

#[derive(Parser, Debug)]
#[command(name = "proctorctl", version)]
struct Cli {
    /// ENTER, EXIT, STATUS or REFRESH (case-insensitive).
    command: String,

    #[arg(long = "tag", default_value = "Proctor")]
    tag: String,

    /// Unix hosts only: directory holding the agent's sockets.
    #[arg(long = "socket-dir")]
    socket_dir: Option<String>,

    #[arg(long = "timeout-sec", default_value_t = 60)]
    timeout_sec: u64,
}

fn main() {
    match run() {
        Ok(Reply::Ok) => println!("OK"),
        Ok(Reply::Error) => {
            println!("ERROR");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<Reply, ProctorError> {
    let cli = Cli::parse();
    let Some(command) = Command::parse(&cli.command) else {
        return Err(ProctorError::ConfigError {
            message: format!("未知命令: {}（支持 ENTER/EXIT/STATUS/REFRESH）", cli.command),
        });
    };

    let paths = EndpointPaths::new(&cli.tag, cli.socket_dir.as_deref());
    let client = IpcClient::new(paths);
    client.send(command.as_str(), Duration::from_secs(cli.timeout_sec))
}
