//! Wire protocol for the local command channel: one LF-terminated UTF-8
//! line per message, single-word commands, `OK`/`ERROR` replies.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enter,
    Exit,
    Status,
    Refresh,
}

impl Command {
    pub fn parse(line: &str) -> Option<Command> {
        let word = line.trim();
        if word.is_empty() {
            return None;
        }
        if word.eq_ignore_ascii_case("ENTER") {
            return Some(Command::Enter);
        }
        if word.eq_ignore_ascii_case("EXIT") {
            return Some(Command::Exit);
        }
        if word.eq_ignore_ascii_case("STATUS") {
            return Some(Command::Status);
        }
        if word.eq_ignore_ascii_case("REFRESH") {
            return Some(Command::Refresh);
        }
        None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Enter => "ENTER",
            Command::Exit => "EXIT",
            Command::Status => "STATUS",
            Command::Refresh => "REFRESH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error,
}

impl Reply {
    pub fn as_line(self) -> &'static str {
        match self {
            Reply::Ok => "OK\n",
            Reply::Error => "ERROR\n",
        }
    }

    pub fn parse(line: &str) -> Option<Reply> {
        match line.trim() {
            "OK" => Some(Reply::Ok),
            "ERROR" => Some(Reply::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownState {
    Inactive,
    Entering,
    Active,
    Exiting,
}

impl LockdownState {
    pub fn as_str(self) -> &'static str {
        match self {
            LockdownState::Inactive => "inactive",
            LockdownState::Entering => "entering",
            LockdownState::Active => "active",
            LockdownState::Exiting => "exiting",
        }
    }
}

pub fn command_endpoint_name(tag: &str) -> String {
    tag.to_string()
}

pub fn response_endpoint_name(tag: &str) -> String {
    format!("{tag}_Response")
}

#[cfg(test)]
mod tests {
    use super::{Command, LockdownState, Reply, response_endpoint_name};

    #[test]
    fn commands_parse_case_insensitively() {
        assert_eq!(Command::parse("ENTER"), Some(Command::Enter));
        assert_eq!(Command::parse("enter"), Some(Command::Enter));
        assert_eq!(Command::parse("  Exit \n"), Some(Command::Exit));
        assert_eq!(Command::parse("status"), Some(Command::Status));
        assert_eq!(Command::parse("ReFrEsH"), Some(Command::Refresh));
    }

    #[test]
    fn unknown_and_empty_commands_are_rejected() {
        assert_eq!(Command::parse("FOO"), None);
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("   \n"), None);
        assert_eq!(Command::parse("ENTER EXIT"), None);
    }

    #[test]
    fn replies_round_trip_as_lines() {
        assert_eq!(Reply::Ok.as_line(), "OK\n");
        assert_eq!(Reply::Error.as_line(), "ERROR\n");
        assert_eq!(Reply::parse("OK\n"), Some(Reply::Ok));
        assert_eq!(Reply::parse("ERROR\n"), Some(Reply::Error));
        assert_eq!(Reply::parse("ok"), None);
    }

    #[test]
    fn response_endpoint_carries_suffix() {
        assert_eq!(response_endpoint_name("Proctor"), "Proctor_Response");
        assert_eq!(LockdownState::Active.as_str(), "active");
    }
}
