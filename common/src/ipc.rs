//! Client side of the local command channel and the endpoint naming shared
//! with the agent. Windows hosts use the named pipes `\\.\pipe\<tag>` and
//! `\\.\pipe\<tag>_Response`; elsewhere the same two-endpoint protocol runs
//! over Unix domain sockets.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::{ErrorCode, ProctorError};
use crate::protocol::{Reply, command_endpoint_name, response_endpoint_name};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_REPLY_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPaths {
    pub command: String,
    pub response: String,
}

impl EndpointPaths {
    pub fn new(tag: &str, socket_dir: Option<&str>) -> Self {
        #[cfg(windows)]
        {
            let _ = socket_dir;
            Self {
                command: format!(r"\\.\pipe\{}", command_endpoint_name(tag)),
                response: format!(r"\\.\pipe\{}", response_endpoint_name(tag)),
            }
        }
        #[cfg(not(windows))]
        {
            let dir = socket_dir
                .map(std::path::PathBuf::from)
                .unwrap_or_else(std::env::temp_dir);
            Self {
                command: dir
                    .join(format!("{}.sock", command_endpoint_name(tag)))
                    .to_string_lossy()
                    .to_string(),
                response: dir
                    .join(format!("{}.sock", response_endpoint_name(tag)))
                    .to_string_lossy()
                    .to_string(),
            }
        }
    }
}

pub struct IpcClient {
    paths: EndpointPaths,
}

impl IpcClient {
    pub fn new(paths: EndpointPaths) -> Self {
        Self { paths }
    }

    /// One request/response round trip: connect to the command endpoint,
    /// write a single line, then collect the reply from the response
    /// endpoint. Busy endpoints are retried until the deadline.
    #[allow(clippy::missing_errors_doc)]
    pub fn send(&self, command: &str, timeout: Duration) -> Result<Reply, ProctorError> {
        let deadline = Instant::now() + timeout;

        let mut stream = connect_retrying(&self.paths.command, WriteSide, deadline)?;
        stream
            .write_all(format!("{command}\n").as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| ProctorError::IpcError {
                message: format!("写入命令失败: {e}"),
                code: Some(ErrorCode::Ipc101),
            })?;
        finish_write(stream);

        let mut response = connect_retrying(&self.paths.response, ReadSide, deadline)?;
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match response.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    raw.push(byte[0]);
                    if raw.len() > MAX_REPLY_LEN {
                        break;
                    }
                }
                Err(e) => {
                    return Err(ProctorError::IpcError {
                        message: format!("读取响应失败: {e}"),
                        code: Some(ErrorCode::Ipc101),
                    });
                }
            }
        }

        let line = String::from_utf8_lossy(&raw).to_string();
        Reply::parse(&line).ok_or_else(|| ProctorError::IpcError {
            message: format!("无法识别的响应: {line:?}"),
            code: Some(ErrorCode::Ipc101),
        })
    }
}

struct WriteSide;
struct ReadSide;

trait Side {
    fn open(path: &str) -> std::io::Result<Stream>;
}

#[cfg(windows)]
type Stream = std::fs::File;
#[cfg(not(windows))]
type Stream = std::os::unix::net::UnixStream;

impl Side for WriteSide {
    fn open(path: &str) -> std::io::Result<Stream> {
        #[cfg(windows)]
        {
            std::fs::OpenOptions::new().write(true).open(path)
        }
        #[cfg(not(windows))]
        {
            std::os::unix::net::UnixStream::connect(path)
        }
    }
}

impl Side for ReadSide {
    fn open(path: &str) -> std::io::Result<Stream> {
        #[cfg(windows)]
        {
            std::fs::OpenOptions::new().read(true).open(path)
        }
        #[cfg(not(windows))]
        {
            std::os::unix::net::UnixStream::connect(path)
        }
    }
}

#[cfg(windows)]
const ERROR_PIPE_BUSY: i32 = 231;

fn retryable(err: &std::io::Error) -> bool {
    #[cfg(windows)]
    if err.raw_os_error() == Some(ERROR_PIPE_BUSY) {
        return true;
    }
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
    )
}

fn connect_retrying<S: Side>(
    path: &str,
    _side: S,
    deadline: Instant,
) -> Result<Stream, ProctorError> {
    loop {
        match S::open(path) {
            Ok(stream) => return Ok(stream),
            Err(e) if retryable(&e) && Instant::now() < deadline => {
                tracing::debug!(path = %path, error = %e, "endpoint busy, retrying");
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => {
                return Err(ProctorError::IpcError {
                    message: format!("连接 {path} 失败: {e}"),
                    code: Some(ErrorCode::Ipc101),
                });
            }
        }
    }
}

fn finish_write(stream: Stream) {
    #[cfg(not(windows))]
    {
        let _shutdown_result = stream.shutdown(std::net::Shutdown::Write);
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn endpoint_paths_use_socket_dir() {
        let paths = EndpointPaths::new("Proctor", Some("/run/exam"));
        assert_eq!(paths.command, "/run/exam/Proctor.sock");
        assert_eq!(paths.response, "/run/exam/Proctor_Response.sock");
    }

    #[cfg(windows)]
    #[test]
    fn endpoint_paths_are_named_pipes() {
        let paths = EndpointPaths::new("Proctor", None);
        assert_eq!(paths.command, r"\\.\pipe\Proctor");
        assert_eq!(paths.response, r"\\.\pipe\Proctor_Response");
    }
}
