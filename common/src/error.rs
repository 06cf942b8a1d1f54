use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ipc101,
    Dns201,
    Dns202,
    Fw301,
    Fw302,
    Net401,
    Svc501,
    Proc601,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ipc101 => "PROCTOR-IPC-101",
            ErrorCode::Dns201 => "PROCTOR-DNS-201",
            ErrorCode::Dns202 => "PROCTOR-DNS-202",
            ErrorCode::Fw301 => "PROCTOR-FW-301",
            ErrorCode::Fw302 => "PROCTOR-FW-302",
            ErrorCode::Net401 => "PROCTOR-NET-401",
            ErrorCode::Svc501 => "PROCTOR-SVC-501",
            ErrorCode::Proc601 => "PROCTOR-PROC-601",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProctorError {
    #[error("IPC 错误: {message}")]
    IpcError {
        message: String,
        code: Option<ErrorCode>,
    },

    #[error("DNS 错误: {message}")]
    DnsError {
        message: String,
        code: Option<ErrorCode>,
    },

    #[error("防火墙错误: {message}")]
    FirewallError {
        message: String,
        code: Option<ErrorCode>,
    },

    #[error("网络配置错误: {message}")]
    NetworkError {
        message: String,
        code: Option<ErrorCode>,
    },

    #[error("服务控制错误: {message}")]
    ServiceError {
        message: String,
        code: Option<ErrorCode>,
    },

    #[error("进程控制错误: {message}")]
    ProcessError {
        message: String,
        code: Option<ErrorCode>,
    },

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置错误: {message}")]
    ConfigError { message: String },

    #[error("状态机拒绝: {message}")]
    StateError { message: String },
}

impl ProctorError {
    pub fn firewall(message: impl Into<String>) -> Self {
        ProctorError::FirewallError {
            message: message.into(),
            code: Some(ErrorCode::Fw301),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        ProctorError::NetworkError {
            message: message.into(),
            code: Some(ErrorCode::Net401),
        }
    }

    pub fn service(message: impl Into<String>) -> Self {
        ProctorError::ServiceError {
            message: message.into(),
            code: Some(ErrorCode::Svc501),
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        ProctorError::ProcessError {
            message: message.into(),
            code: Some(ErrorCode::Proc601),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;

    #[test]
    fn error_codes_are_stable() {
        let cases = [
            (ErrorCode::Ipc101, "PROCTOR-IPC-101"),
            (ErrorCode::Dns201, "PROCTOR-DNS-201"),
            (ErrorCode::Dns202, "PROCTOR-DNS-202"),
            (ErrorCode::Fw301, "PROCTOR-FW-301"),
            (ErrorCode::Fw302, "PROCTOR-FW-302"),
            (ErrorCode::Net401, "PROCTOR-NET-401"),
            (ErrorCode::Svc501, "PROCTOR-SVC-501"),
            (ErrorCode::Proc601, "PROCTOR-PROC-601"),
        ];

        for (code, expected) in cases {
            assert_eq!(code.as_str(), expected);
            assert!(code.as_str().starts_with("PROCTOR-"));
        }
    }
}
