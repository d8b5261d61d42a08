use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommonOpts {
    pub config: Option<PathBuf>,
    pub vault: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalCmd {
    List,
    Show { id: String },
    Approve { id: String, reason: Option<String> },
    Reject { id: String, reason: String },
    History { limit: usize },
    Reload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqCmd {
    List,
    Retry { id: String },
    Purge { days: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditCmd {
    Verify,
    Export { out: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    VaultInit {
        opts: CommonOpts,
    },
    Start {
        opts: CommonOpts,
        log_level: Option<String>,
    },
    Status {
        opts: CommonOpts,
        json: bool,
    },
    Stop {
        opts: CommonOpts,
    },
    Restart {
        opts: CommonOpts,
        services: Vec<String>,
    },
    Approval {
        opts: CommonOpts,
        cmd: ApprovalCmd,
    },
    Dlq {
        opts: CommonOpts,
        cmd: DlqCmd,
    },
    Audit {
        opts: CommonOpts,
        cmd: AuditCmd,
    },
    Help,
}

pub fn help_text() -> String {
    [
        "Usage: vaultflow <command> [options]",
        "",
        "Commands:",
        "  vault init                         create the vault folder tree and Dashboard.md",
        "  start [--config PATH] [--log-level LEVEL]",
        "                                     run the orchestrator until stopped",
        "  status [--json]                    print service and workflow counts",
        "  stop                               stop a running orchestrator",
        "  restart [--services NAMES]        stop then start the orchestrator",
        "  approval list                      pending approvals",
        "  approval show <id>                 one approval record",
        "  approval approve <id> [-r REASON]  approve and release a plan",
        "  approval reject <id> -r REASON     reject a plan",
        "  approval history [--limit N]       recent approval audit entries",
        "  approval reload                    reload approval rules from config",
        "  dlq list                           dead-letter entries",
        "  dlq retry <id>                     replay a dead-letter entry",
        "  dlq purge [--days N]               drop old dead-letter entries",
        "  audit verify                       verify the audit hash chain",
        "  audit export [--out PATH]          export the audit log for external verification",
        "",
        "Common options:",
        "  --vault PATH                       vault root (default ./Vault)",
        "  --config PATH                      settings file (default <vault>/config.yaml)",
    ]
    .join("\n")
}

/// Extracts `--config` / `--vault` from anywhere in the argument list,
/// returning the remaining positional and flag tokens.
fn take_common(args: &[String]) -> Result<(CommonOpts, Vec<String>), String> {
    let mut opts = CommonOpts::default();
    let mut rest = Vec::new();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "--config requires a path".to_string())?;
                opts.config = Some(PathBuf::from(value));
                index += 2;
            }
            "--vault" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "--vault requires a path".to_string())?;
                opts.vault = Some(PathBuf::from(value));
                index += 2;
            }
            other => {
                rest.push(other.to_string());
                index += 1;
            }
        }
    }
    Ok((opts, rest))
}

fn flag_value(rest: &[String], flag: &str) -> Result<(Option<String>, Vec<String>), String> {
    let mut value = None;
    let mut remaining = Vec::new();
    let mut index = 0usize;
    while index < rest.len() {
        if rest[index] == flag {
            let next = rest
                .get(index + 1)
                .ok_or_else(|| format!("{flag} requires a value"))?;
            value = Some(next.clone());
            index += 2;
        } else {
            remaining.push(rest[index].clone());
            index += 1;
        }
    }
    Ok((value, remaining))
}

pub fn parse(args: &[String]) -> Result<Command, String> {
    let (opts, rest) = take_common(args)?;
    let Some(first) = rest.first().map(String::as_str) else {
        return Ok(Command::Help);
    };

    match first {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "vault" => match rest.get(1).map(String::as_str) {
            Some("init") => Ok(Command::VaultInit { opts }),
            other => Err(format!("unknown vault subcommand {other:?}")),
        },
        "start" => {
            let (log_level, remaining) = flag_value(&rest[1..], "--log-level")?;
            if !remaining.is_empty() {
                return Err(format!("unexpected arguments: {}", remaining.join(" ")));
            }
            Ok(Command::Start { opts, log_level })
        }
        "status" => {
            let mut json = false;
            for arg in &rest[1..] {
                match arg.as_str() {
                    "--json" => json = true,
                    other => return Err(format!("unexpected argument {other}")),
                }
            }
            Ok(Command::Status { opts, json })
        }
        "stop" => Ok(Command::Stop { opts }),
        "restart" => {
            let (services, remaining) = flag_value(&rest[1..], "--services")?;
            if !remaining.is_empty() {
                return Err(format!("unexpected arguments: {}", remaining.join(" ")));
            }
            let services = services
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            Ok(Command::Restart { opts, services })
        }
        "approval" => {
            let cmd = parse_approval(&rest[1..])?;
            Ok(Command::Approval { opts, cmd })
        }
        "dlq" => {
            let cmd = parse_dlq(&rest[1..])?;
            Ok(Command::Dlq { opts, cmd })
        }
        "audit" => {
            let cmd = parse_audit(&rest[1..])?;
            Ok(Command::Audit { opts, cmd })
        }
        other => Err(format!("unknown command `{other}`")),
    }
}

fn parse_approval(rest: &[String]) -> Result<ApprovalCmd, String> {
    match rest.first().map(String::as_str) {
        Some("list") => Ok(ApprovalCmd::List),
        Some("show") => {
            let id = rest
                .get(1)
                .ok_or_else(|| "approval show requires an id".to_string())?;
            Ok(ApprovalCmd::Show { id: id.clone() })
        }
        Some("approve") => {
            let id = rest
                .get(1)
                .ok_or_else(|| "approval approve requires an id".to_string())?;
            let (reason, remaining) = flag_value(&rest[2..], "-r")?;
            if !remaining.is_empty() {
                return Err(format!("unexpected arguments: {}", remaining.join(" ")));
            }
            Ok(ApprovalCmd::Approve {
                id: id.clone(),
                reason,
            })
        }
        Some("reject") => {
            let id = rest
                .get(1)
                .ok_or_else(|| "approval reject requires an id".to_string())?;
            let (reason, remaining) = flag_value(&rest[2..], "-r")?;
            if !remaining.is_empty() {
                return Err(format!("unexpected arguments: {}", remaining.join(" ")));
            }
            let reason = reason.ok_or_else(|| "approval reject requires -r REASON".to_string())?;
            Ok(ApprovalCmd::Reject {
                id: id.clone(),
                reason,
            })
        }
        Some("history") => {
            let (limit, remaining) = flag_value(&rest[1..], "--limit")?;
            if !remaining.is_empty() {
                return Err(format!("unexpected arguments: {}", remaining.join(" ")));
            }
            let limit = limit
                .map(|raw| raw.parse::<usize>().map_err(|_| "--limit must be a number"))
                .transpose()?
                .unwrap_or(20);
            Ok(ApprovalCmd::History { limit })
        }
        Some("reload") => Ok(ApprovalCmd::Reload),
        other => Err(format!("unknown approval subcommand {other:?}")),
    }
}

fn parse_dlq(rest: &[String]) -> Result<DlqCmd, String> {
    match rest.first().map(String::as_str) {
        Some("list") => Ok(DlqCmd::List),
        Some("retry") => {
            let id = rest
                .get(1)
                .ok_or_else(|| "dlq retry requires an id".to_string())?;
            Ok(DlqCmd::Retry { id: id.clone() })
        }
        Some("purge") => {
            let (days, remaining) = flag_value(&rest[1..], "--days")?;
            if !remaining.is_empty() {
                return Err(format!("unexpected arguments: {}", remaining.join(" ")));
            }
            let days = days
                .map(|raw| raw.parse::<u64>().map_err(|_| "--days must be a number"))
                .transpose()?
                .unwrap_or(30);
            Ok(DlqCmd::Purge { days })
        }
        other => Err(format!("unknown dlq subcommand {other:?}")),
    }
}

fn parse_audit(rest: &[String]) -> Result<AuditCmd, String> {
    match rest.first().map(String::as_str) {
        Some("verify") => Ok(AuditCmd::Verify),
        Some("export") => {
            let (out, remaining) = flag_value(&rest[1..], "--out")?;
            if !remaining.is_empty() {
                return Err(format!("unexpected arguments: {}", remaining.join(" ")));
            }
            Ok(AuditCmd::Export {
                out: out.map(PathBuf::from),
            })
        }
        other => Err(format!("unknown audit subcommand {other:?}")),
    }
}
