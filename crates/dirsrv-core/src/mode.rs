use dirsrv_backend::TaskKind;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// What this process was started to do. Chosen once, before any flag is
/// parsed, and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Server,
    Referral,
    Import,
    Export,
    Reindex,
    Backup,
    Restore,
    Upgrade,
    UpgradeDnFormat,
    Verify,
    SuffixToInstance,
    PrintVersion,
    Unknown,
}

const TOKENS: &[(&str, ExecutionMode)] = &[
    ("server", ExecutionMode::Server),
    ("refer", ExecutionMode::Referral),
    ("ldif2db", ExecutionMode::Import),
    ("db2ldif", ExecutionMode::Export),
    ("db2index", ExecutionMode::Reindex),
    ("db2archive", ExecutionMode::Backup),
    ("archive2db", ExecutionMode::Restore),
    ("upgradedb", ExecutionMode::Upgrade),
    ("upgradednformat", ExecutionMode::UpgradeDnFormat),
    ("dbverify", ExecutionMode::Verify),
    ("suffix2instance", ExecutionMode::SuffixToInstance),
];

/// Where the mode came from, and how many leading arguments it consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSelection {
    pub mode: ExecutionMode,
    /// Index of the first flag argument in argv.
    pub first_flag: usize,
}

impl ExecutionMode {
    pub fn from_token(token: &str) -> Option<Self> {
        TOKENS
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, mode)| *mode)
    }

    /// The sub-command token for this mode, if it has one.
    pub fn token(self) -> Option<&'static str> {
        TOKENS
            .iter()
            .find(|(_, mode)| *mode == self)
            .map(|(name, _)| *name)
    }

    /// Pick the mode from argv: first the program's own name (so
    /// `ldif2db` can be a link to the server binary), then a leading
    /// positional token. With neither, the process runs as a server. A
    /// positional token that names no mode yields `Unknown`.
    pub fn select<S: AsRef<str>>(argv: &[S]) -> ModeSelection {
        let program = argv
            .first()
            .map(|a| program_name(a.as_ref()))
            .unwrap_or_default();
        if let Some(mode) = Self::from_token(program) {
            return ModeSelection {
                mode,
                first_flag: 1,
            };
        }
        match argv.get(1).map(AsRef::as_ref) {
            Some(token) if !token.starts_with('-') => ModeSelection {
                mode: Self::from_token(token).unwrap_or(Self::Unknown),
                first_flag: 2,
            },
            _ => ModeSelection {
                mode: Self::Server,
                first_flag: 1,
            },
        }
    }

    /// Modes that run the worker pool and listen on the network.
    pub fn runs_server(self) -> bool {
        matches!(self, Self::Server | Self::Referral)
    }

    pub fn is_offline(self) -> bool {
        !self.runs_server() && self != Self::Unknown
    }

    /// The backend capability an offline task mode drives.
    pub fn task_kind(self) -> Option<TaskKind> {
        match self {
            Self::Import => Some(TaskKind::Import),
            Self::Export => Some(TaskKind::Export),
            Self::Reindex => Some(TaskKind::Reindex),
            Self::Backup => Some(TaskKind::Backup),
            Self::Restore => Some(TaskKind::Restore),
            Self::Upgrade => Some(TaskKind::Upgrade),
            Self::UpgradeDnFormat => Some(TaskKind::UpgradeDnFormat),
            Self::Verify => Some(TaskKind::Verify),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrintVersion => f.write_str("version"),
            Self::Unknown => f.write_str("unknown"),
            mode => f.write_str(mode.token().unwrap_or("unknown")),
        }
    }
}

fn program_name(argv0: &str) -> &str {
    Path::new(argv0)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(argv0)
}

/// One-line synopsis printed when the mode token is not recognized.
pub fn general_usage(program: &str) -> String {
    let tokens: Vec<&str> = TOKENS
        .iter()
        .filter(|(name, _)| *name != "server")
        .map(|(name, _)| *name)
        .collect();
    format!(
        "usage: {} -D configdir [{}] [options]",
        program_name(program),
        tokens.join(" | ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_server() {
        let sel = ExecutionMode::select(&["ns-slapd", "-D", "/etc/dirsrv"]);
        assert_eq!(sel.mode, ExecutionMode::Server);
        assert_eq!(sel.first_flag, 1);
        assert_eq!(ExecutionMode::select(&["ns-slapd"]).mode, ExecutionMode::Server);
    }

    #[test]
    fn positional_token_selects_mode() {
        let sel = ExecutionMode::select(&["ns-slapd", "db2ldif", "-D", "/etc/dirsrv"]);
        assert_eq!(sel.mode, ExecutionMode::Export);
        assert_eq!(sel.first_flag, 2);
    }

    #[test]
    fn program_name_selects_mode() {
        let sel = ExecutionMode::select(&["/usr/sbin/ldif2db", "-D", "/etc/dirsrv"]);
        assert_eq!(sel.mode, ExecutionMode::Import);
        assert_eq!(sel.first_flag, 1);
    }

    #[test]
    fn unrecognized_token_is_unknown() {
        let sel = ExecutionMode::select(&["ns-slapd", "db2tape"]);
        assert_eq!(sel.mode, ExecutionMode::Unknown);
        assert!(!sel.mode.is_offline());
        assert!(!sel.mode.runs_server());
    }

    #[test]
    fn classification() {
        assert!(ExecutionMode::Referral.runs_server());
        assert!(ExecutionMode::Verify.is_offline());
        assert!(ExecutionMode::SuffixToInstance.is_offline());
        assert_eq!(ExecutionMode::Backup.task_kind(), Some(TaskKind::Backup));
        assert_eq!(ExecutionMode::Server.task_kind(), None);
    }

    #[test]
    fn usage_lists_every_token() {
        let usage = general_usage("/usr/sbin/ns-slapd");
        assert!(usage.starts_with("usage: ns-slapd -D configdir"));
        assert!(usage.contains("upgradednformat"));
        assert!(usage.contains("suffix2instance"));
    }

    #[test]
    fn display_uses_token() {
        assert_eq!(ExecutionMode::UpgradeDnFormat.to_string(), "upgradednformat");
        assert_eq!(ExecutionMode::PrintVersion.to_string(), "version");
    }
}
