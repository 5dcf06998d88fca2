use serde::Serialize;

/// Base commands a Fleet Mate may be asked to run.
///
/// Only read-only informational and monitoring utilities belong here. Anything
/// that writes, deletes, or escalates privileges must stay off this list.
const ALLOWED_COMMANDS: &[&str] = &[
    // system info
    "df", "free", "uptime", "uname", "hostname", "whoami", "date",
    // read-only file inspection
    "ls", "cat", "head", "tail", "grep", "find", "du", "pwd",
    // process monitoring
    "ps", "top", "htop", "pgrep", "pidof",
    // service status
    "systemctl", "journalctl", "service",
    // network inspection
    "ping", "curl", "wget", "netstat", "ss", "ip", "ifconfig",
    // package queries
    "dpkg", "apt", "yum", "rpm",
    // other utilities
    "which", "whereis", "file", "stat", "wc", "sort", "uniq",
    "dmesg", "lsblk", "lsusb", "lspci", "env",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command cannot be empty")]
    EmptyCommand,
    #[error("command not whitelisted: {0}")]
    CommandNotWhitelisted(String),
}

impl CommandError {
    /// Machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::EmptyCommand => "empty_command",
            CommandError::CommandNotWhitelisted(_) => "command_not_whitelisted",
        }
    }
}

/// Validate a raw command string against the allow-list.
///
/// The command is trimmed and split on whitespace; only the first token (the
/// base command) is checked. Returns the base command on success.
pub fn validate_command(raw: &str) -> Result<&str, CommandError> {
    let base = raw
        .split_whitespace()
        .next()
        .ok_or(CommandError::EmptyCommand)?;
    if !is_allowed(base) {
        return Err(CommandError::CommandNotWhitelisted(base.to_string()));
    }
    Ok(base)
}

/// Return true if `base` is an allow-listed base command.
pub fn is_allowed(base: &str) -> bool {
    ALLOWED_COMMANDS.contains(&base)
}

/// All allow-listed base commands, sorted.
pub fn allowed_commands() -> Vec<&'static str> {
    let mut commands = ALLOWED_COMMANDS.to_vec();
    commands.sort_unstable();
    commands
}

/// Reconstruct the command line that was requested: the command followed by
/// its arguments, space-separated.
pub fn full_command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        return command.to_string();
    }
    let mut line = String::from(command);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// A labelled, pre-approved command offered to operators as a shortcut.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuickAction {
    pub label: &'static str,
    pub command: &'static str,
    pub args: &'static str,
}

pub const QUICK_ACTIONS: &[QuickAction] = &[
    QuickAction { label: "Disk Space", command: "df", args: "-h" },
    QuickAction { label: "Memory Usage", command: "free", args: "-h" },
    QuickAction { label: "System Uptime", command: "uptime", args: "" },
    QuickAction { label: "Top CPU Processes", command: "ps", args: "aux --sort=-cpu" },
    QuickAction { label: "Top Memory Processes", command: "ps", args: "aux --sort=-mem" },
    QuickAction { label: "System Log (last 50)", command: "journalctl", args: "-n 50" },
    QuickAction { label: "Failed Services", command: "systemctl", args: "list-units --state=failed" },
    QuickAction { label: "Open Ports", command: "ss", args: "-tuln" },
    QuickAction { label: "Network Interfaces", command: "ip", args: "addr show" },
    QuickAction { label: "Kernel Messages", command: "dmesg", args: "" },
];

impl QuickAction {
    /// Arguments split on whitespace, ready to go into an execution request.
    pub fn arg_list(&self) -> Vec<String> {
        self.args.split_whitespace().map(str::to_string).collect()
    }
}
