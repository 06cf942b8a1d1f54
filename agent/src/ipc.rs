//! Server side of the command channel: one listener that creates the
//! command endpoint, reads a single line, hands it to the coordinator, and
//! answers on a freshly created response endpoint. Endpoint I/O errors
//! discard the instance and recreate it after a back-off.

use std::sync::Arc;
use std::time::Duration;

use common::error::ProctorError;
#[cfg(not(unix))]
use common::error::ErrorCode;
use common::ipc::EndpointPaths;
use common::protocol::{Command, Reply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::coordinator::Coordinator;

const MAX_COMMAND_LEN: usize = 128;

pub async fn serve(
    paths: EndpointPaths,
    backoff: Duration,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(command = %paths.command, response = %paths.response, "IPC endpoint up");
    loop {
        let line = tokio::select! {
            read = read_command_line(&paths) => read,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "command endpoint failed, recreating");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let reply = match Command::parse(&line) {
            Some(command) => {
                tracing::info!(command = command.as_str(), "dispatching command");
                coordinator.dispatch(command).await
            }
            None => {
                tracing::warn!(line = %line.trim(), "unknown command");
                Reply::Error
            }
        };

        let written = tokio::select! {
            write = write_response_line(&paths, reply) => write,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "response endpoint failed");
            tokio::time::sleep(backoff).await;
        }
    }
    cleanup_endpoints(&paths);
    tracing::info!("IPC endpoint down");
}

async fn read_line_capped<R>(stream: &mut R) -> Result<String, ProctorError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                raw.push(byte[0]);
                if raw.len() > MAX_COMMAND_LEN {
                    break;
                }
            }
            Err(e) => return Err(ProctorError::IoError(e)),
        }
    }
    Ok(String::from_utf8_lossy(&raw).to_string())
}

#[cfg(unix)]
async fn read_command_line(paths: &EndpointPaths) -> Result<String, ProctorError> {
    let _removed = std::fs::remove_file(&paths.command);
    let listener =
        tokio::net::UnixListener::bind(&paths.command).map_err(ProctorError::IoError)?;
    let (mut stream, _) = listener.accept().await.map_err(ProctorError::IoError)?;
    let line = read_line_capped(&mut stream).await?;
    drop(listener);
    let _removed = std::fs::remove_file(&paths.command);
    Ok(line)
}

#[cfg(unix)]
async fn write_response_line(paths: &EndpointPaths, reply: Reply) -> Result<(), ProctorError> {
    let _removed = std::fs::remove_file(&paths.response);
    let listener =
        tokio::net::UnixListener::bind(&paths.response).map_err(ProctorError::IoError)?;
    let (mut stream, _) = listener.accept().await.map_err(ProctorError::IoError)?;
    stream
        .write_all(reply.as_line().as_bytes())
        .await
        .map_err(ProctorError::IoError)?;
    stream.flush().await.map_err(ProctorError::IoError)?;
    drop(stream);
    drop(listener);
    let _removed = std::fs::remove_file(&paths.response);
    Ok(())
}

#[cfg(windows)]
async fn read_command_line(paths: &EndpointPaths) -> Result<String, ProctorError> {
    use common::platform::windows::pipe_security::PipeSecurity;
    use tokio::net::windows::named_pipe::{PipeMode, ServerOptions};

    let mut security = PipeSecurity::authenticated_users()?;
    let mut server = unsafe {
        ServerOptions::new()
            .access_inbound(true)
            .access_outbound(false)
            .first_pipe_instance(true)
            .pipe_mode(PipeMode::Message)
            .create_with_security_attributes_raw(&paths.command, security.as_mut_ptr())
    }
    .map_err(|e| ProctorError::IpcError {
        message: format!("创建命令管道失败: {e}"),
        code: Some(ErrorCode::Ipc101),
    })?;

    server.connect().await.map_err(ProctorError::IoError)?;
    let line = read_line_capped(&mut server).await?;
    let _disconnect_result = server.disconnect();
    Ok(line)
}

#[cfg(windows)]
async fn write_response_line(paths: &EndpointPaths, reply: Reply) -> Result<(), ProctorError> {
    use common::platform::windows::pipe_security::PipeSecurity;
    use tokio::net::windows::named_pipe::{PipeMode, ServerOptions};

    let mut security = PipeSecurity::authenticated_users()?;
    let mut server = unsafe {
        ServerOptions::new()
            .access_inbound(false)
            .access_outbound(true)
            .first_pipe_instance(true)
            .pipe_mode(PipeMode::Message)
            .create_with_security_attributes_raw(&paths.response, security.as_mut_ptr())
    }
    .map_err(|e| ProctorError::IpcError {
        message: format!("创建响应管道失败: {e}"),
        code: Some(ErrorCode::Ipc101),
    })?;

    server.connect().await.map_err(ProctorError::IoError)?;
    server
        .write_all(reply.as_line().as_bytes())
        .await
        .map_err(ProctorError::IoError)?;
    server.flush().await.map_err(ProctorError::IoError)?;
    let _disconnect_result = server.disconnect();
    Ok(())
}

fn cleanup_endpoints(paths: &EndpointPaths) {
    #[cfg(unix)]
    {
        let _removed = std::fs::remove_file(&paths.command);
        let _removed = std::fs::remove_file(&paths.response);
    }
    #[cfg(not(unix))]
    {
        let _ = paths;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_line_capped_stops_at_newline() -> Result<(), ProctorError> {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(b"ENTER\ntrailing")
            .await
            .map_err(ProctorError::IoError)?;
        let line = read_line_capped(&mut server).await?;
        assert_eq!(line, "ENTER");
        Ok(())
    }

    #[tokio::test]
    async fn read_line_capped_handles_eof_without_newline() -> Result<(), ProctorError> {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"STATUS").await.map_err(ProctorError::IoError)?;
        drop(client);
        let line = read_line_capped(&mut server).await?;
        assert_eq!(line, "STATUS");
        Ok(())
    }
}
