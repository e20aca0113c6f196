//! The `-d` debug-level grammar: names or numbers joined with `+`.

use std::fmt::Write as _;

pub const TRACE: u32 = 0x1;
pub const PACKETS: u32 = 0x2;
pub const ARGS: u32 = 0x4;
pub const CONNS: u32 = 0x8;
pub const BER: u32 = 0x10;
pub const FILTER: u32 = 0x20;
pub const CONFIG: u32 = 0x40;
pub const ACL: u32 = 0x80;
pub const STATS: u32 = 0x100;
pub const STATS2: u32 = 0x200;
pub const SHELL: u32 = 0x400;
pub const PARSE: u32 = 0x800;
pub const HOUSE: u32 = 0x1000;
pub const REPL: u32 = 0x2000;
/// Always set once any `-d` is given.
pub const ANY: u32 = 0x4000;
pub const CACHE: u32 = 0x8000;
pub const PLUGIN: u32 = 0x1_0000;
pub const TIMING: u32 = 0x2_0000;
pub const ACL_SUMMARY: u32 = 0x4_0000;
pub const BACKEND: u32 = 0x8_0000;
pub const ALL: u32 = 0xF_FFFF;

struct LevelName {
    level: u32,
    name: &'static str,
    hidden: bool,
}

const fn shown(level: u32, name: &'static str) -> LevelName {
    LevelName {
        level,
        name,
        hidden: false,
    }
}

const fn alias(level: u32, name: &'static str) -> LevelName {
    LevelName {
        level,
        name,
        hidden: true,
    }
}

const LEVELS: &[LevelName] = &[
    shown(TRACE, "trace"),
    shown(PACKETS, "packets"),
    shown(ARGS, "arguments"),
    alias(ARGS, "args"),
    shown(CONNS, "connections"),
    alias(CONNS, "conn"),
    alias(CONNS, "conns"),
    shown(BER, "ber"),
    shown(FILTER, "filters"),
    shown(CONFIG, "config"),
    shown(ACL, "accesscontrol"),
    alias(ACL, "acl"),
    alias(ACL, "acls"),
    shown(STATS, "stats"),
    shown(STATS2, "stats2"),
    alias(SHELL, "shell"),
    shown(PARSE, "parsing"),
    shown(HOUSE, "housekeeping"),
    shown(REPL, "replication"),
    alias(REPL, "repl"),
    shown(ANY, "errors"),
    alias(ANY, "ANY"),
    alias(ANY, "error"),
    shown(CACHE, "caches"),
    alias(CACHE, "cache"),
    shown(PLUGIN, "plugins"),
    alias(PLUGIN, "plugin"),
    shown(TIMING, "timing"),
    shown(ACL_SUMMARY, "accesscontrolsummary"),
    alias(ACL_SUMMARY, "aclsummary"),
    shown(BACKEND, "backend"),
    shown(ALL, "ALL"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugRequest {
    /// `-d ?` or `-d help`.
    Help,
    Level(u32),
}

/// Parse a `-d` argument. The returned level always includes `ANY`.
pub fn parse(spec: &str) -> Result<DebugRequest, String> {
    if spec.starts_with('?') || spec.eq_ignore_ascii_case("help") {
        return Ok(DebugRequest::Help);
    }
    let mut level = 0;
    for part in spec.split('+') {
        if part.starts_with(|c: char| c.is_ascii_digit()) {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            level |= digits
                .parse::<u32>()
                .map_err(|_| format!("Unrecognized debug level \"{part}\""))?;
            continue;
        }
        let entry = LEVELS
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(part))
            .ok_or_else(|| format!("Unrecognized debug level \"{part}\""))?;
        level |= entry.level;
    }
    Ok(DebugRequest::Level(level | ANY))
}

/// Names of the levels set in `level`, without `ANY`, joined with `+`.
pub fn describe(level: u32) -> String {
    let level = level & !ANY;
    LEVELS
        .iter()
        .filter(|l| !l.hidden && l.level != ALL && level & l.level != 0)
        .map(|l| l.name)
        .collect::<Vec<_>>()
        .join("+")
}

/// Tracing filter directive for a debug mask.
pub fn filter_directive(level: u32) -> &'static str {
    if level & (TRACE | PACKETS | BER) != 0 {
        "trace"
    } else if level & !ANY != 0 {
        "debug"
    } else {
        "info"
    }
}

/// The `-d ?` table.
pub fn usage() -> String {
    let mut out = String::from("Debug levels:\n");
    for l in LEVELS.iter().filter(|l| !l.hidden && l.level != ALL) {
        let note = if l.level & ANY == 0 {
            ""
        } else {
            " (always logged)"
        };
        let _ = writeln!(out, "    {:6} - {}{note}", l.level, l.name);
    }
    out.push_str(
        "To activate multiple levels, add the numeric values together or separate the\n\
         values with a + character, e.g., all of the following have the same effect:\n    \
         -d connections+filters\n    -d 8+32\n    -d 40\n",
    );
    out
}
