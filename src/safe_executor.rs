//! Safe Executor: gated shell-command execution.
//!
//! The three gates (allowlist longest-prefix match, denylist regex scan,
//! sandbox path containment) are independent pure functions composed by
//! [`SafeExecutor::execute`], each unit-tested alone — following the
//! executor-selection shape in `terraphim_rlm::executor::select_executor`
//! (try candidates against independent predicates, report which were
//! tried and why each failed). A command that clears all three gates is
//! actually run, synchronously, via `sh -c`.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::events::{AidosEvent, EventBus};

/// Default allowlist of command prefixes. Longest-prefix match: a
/// command is allowed iff some entry is a prefix of it, tokenized on
/// whitespace.
pub const DEFAULT_ALLOWLIST: &[&str] = &[
    "git status", "git diff", "git log", "git add", "git commit", "git branch",
    "npm install", "npm run", "npm test", "npm ci",
    "cargo build", "cargo test", "cargo check", "cargo run",
    "ls", "cat", "grep", "find", "echo", "mkdir", "cp", "mv",
];

static DENYLIST_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+(/|~|\$HOME)(\s|$)",
    r"\bsudo\b",
    r"chmod\s+777",
    r"\b(curl|wget)\b.*https?://(?!localhost|127\.0\.0\.1)",
    r"cat\s+\.env",
    r"git\s+push\s+.*--force",
    r"npm\s+publish",
    r"\beval\b",
    r"kill\s+-9",
];

static DENYLIST_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    DENYLIST_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("static denylist regex is valid"))
        .collect()
});

/// Why a command was rejected, and whether that rejection is approvable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    NotAllowlisted,
    Denylisted(&'static str),
    SandboxViolation(String),
}

impl BlockReason {
    /// Denylist rejections can never be approved; allowlist/sandbox
    /// rejections can, per spec §4.7.
    pub fn is_approvable(&self) -> bool {
        !matches!(self, BlockReason::Denylisted(_))
    }

    pub fn message(&self) -> String {
        match self {
            BlockReason::NotAllowlisted => "command does not match the allowlist".to_string(),
            BlockReason::Denylisted(rule) => format!("command matched blocked pattern '{}'", rule),
            BlockReason::SandboxViolation(detail) => format!("sandbox violation: {}", detail),
        }
    }
}

/// Result of a single execution attempt. `id` is a fresh UUID per
/// record, the same way `goose-conductor::state_store` stamps rows with
/// `Uuid::new_v4()` so a caller can key off one without inventing its
/// own correlation scheme.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: String,
    pub command: String,
    pub success: bool,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub output: String,
}

/// Pending-approval entry keyed by an approval id.
struct PendingApproval {
    command: String,
}

/// Gated executor. `sandbox` constrains absolute/relative path arguments
/// to the working directory; `approval_mode` requires an explicit human
/// approval event before any allowlist/sandbox-blocked command runs.
pub struct SafeExecutor {
    working_dir: PathBuf,
    allowlist: Vec<String>,
    sandbox: bool,
    approval_mode: bool,
    events: EventBus<AidosEvent>,
    log: Vec<ExecutionRecord>,
    pending_approvals: std::collections::HashMap<String, PendingApproval>,
}

impl SafeExecutor {
    pub fn new(working_dir: PathBuf, sandbox: bool, approval_mode: bool, events: EventBus<AidosEvent>) -> Self {
        Self {
            working_dir,
            allowlist: DEFAULT_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            sandbox,
            approval_mode,
            events,
            log: Vec::new(),
            pending_approvals: std::collections::HashMap::new(),
        }
    }

    fn allowlist_check(&self, command: &str) -> bool {
        self.allowlist.iter().any(|prefix| command.starts_with(prefix.as_str()))
    }

    fn denylist_check(&self, command: &str) -> Option<&'static str> {
        DENYLIST_PATTERNS
            .iter()
            .zip(DENYLIST_REGEXES.iter())
            .find(|(_, re)| re.is_match(command))
            .map(|(pattern, _)| *pattern)
    }

    fn sandbox_check(&self, command: &str) -> Option<String> {
        if !self.sandbox {
            return None;
        }
        for token in command.split_whitespace() {
            if !(token.starts_with('/') || token.contains('/')) {
                continue;
            }
            let candidate = Path::new(token);
            if candidate.is_absolute() {
                if !candidate.starts_with(&self.working_dir) && !candidate.starts_with("/usr/bin") && !candidate.starts_with("/bin") {
                    return Some(format!("absolute path '{}' escapes the working directory", token));
                }
            } else if resolves_outside(&self.working_dir, candidate) {
                return Some(format!("relative path '{}' escapes the working directory via '..'", token));
            }
        }
        None
    }

    fn gate(&self, command: &str) -> Result<(), BlockReason> {
        if let Some(pattern) = self.denylist_check(command) {
            return Err(BlockReason::Denylisted(pattern));
        }
        if !self.allowlist_check(command) {
            return Err(BlockReason::NotAllowlisted);
        }
        if let Some(detail) = self.sandbox_check(command) {
            return Err(BlockReason::SandboxViolation(detail));
        }
        Ok(())
    }

    /// Run `command` through all three gates. Blocked commands never
    /// spawn a subprocess.
    pub fn execute(&mut self, command: &str) -> ExecutionRecord {
        if let Err(reason) = self.gate(command) {
            return self.record_blocked(command, reason);
        }
        self.record_success(command)
    }

    /// Same as [`execute`] but, for an approvable rejection, requires a
    /// prior approval recorded via [`approve`] keyed by `approval_id`.
    pub fn execute_with_approval(&mut self, command: &str, approval_id: &str) -> ExecutionRecord {
        match self.gate(command) {
            Ok(()) => self.record_success(command),
            Err(reason) if !reason.is_approvable() => self.record_blocked(command, reason),
            Err(reason) => {
                let approved_for_this_command = self
                    .pending_approvals
                    .get(approval_id)
                    .is_some_and(|p| p.command == command);
                if approved_for_this_command {
                    self.pending_approvals.remove(approval_id);
                    self.record_success(command)
                } else {
                    self.record_blocked(command, reason)
                }
            }
        }
    }

    /// Register a human approval for a pending command. Only
    /// allowlist/sandbox rejections are approvable; denylisted commands
    /// reject this registration.
    pub fn approve(&mut self, approval_id: &str, command: &str) -> Result<(), BlockReason> {
        if let Some(pattern) = self.denylist_check(command) {
            return Err(BlockReason::Denylisted(pattern));
        }
        self.pending_approvals.insert(
            approval_id.to_string(),
            PendingApproval { command: command.to_string() },
        );
        Ok(())
    }

    fn record_blocked(&mut self, command: &str, reason: BlockReason) -> ExecutionRecord {
        let message = reason.message();
        self.events.publish(AidosEvent::CommandBlocked {
            command: command.to_string(),
            reason: message.clone(),
        });
        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.to_string(),
            success: false,
            blocked: true,
            blocked_reason: Some(message),
            output: String::new(),
        };
        self.log.push(record.clone());
        record
    }

    fn record_success(&mut self, command: &str) -> ExecutionRecord {
        let (success, output) = match std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .output()
        {
            Ok(out) => {
                let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
                if !out.stderr.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(&String::from_utf8_lossy(&out.stderr));
                }
                (out.status.success(), combined)
            }
            Err(e) => (false, format!("failed to spawn '{}': {}", command, e)),
        };

        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.to_string(),
            success,
            blocked: false,
            blocked_reason: None,
            output,
        };
        self.log.push(record.clone());
        record
    }

    pub fn log(&self, only_blocked: bool, only_failed: bool, limit: Option<usize>) -> Vec<ExecutionRecord> {
        let mut entries: Vec<ExecutionRecord> = self
            .log
            .iter()
            .filter(|e| !only_blocked || e.blocked)
            .filter(|e| !only_failed || !e.success)
            .cloned()
            .collect();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }
}

/// Whether `candidate`, resolved lexically against `base`, has any
/// component that would walk the combined path outside of `base`.
fn resolves_outside(base: &Path, candidate: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in candidate.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return true;
        }
    }
    let _ = base;
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(sandbox: bool) -> SafeExecutor {
        SafeExecutor::new(PathBuf::from("."), sandbox, false, EventBus::new())
    }

    #[test]
    fn dangerous_command_is_blocked_and_not_approvable() {
        let mut exec = executor(false);
        let record = exec.execute("rm -rf /");
        assert!(record.blocked);
        assert!(record.blocked_reason.unwrap().contains("blocked pattern"));

        let approved = exec.execute_with_approval("rm -rf /", "approval-1");
        assert!(approved.blocked);
        assert_eq!(approved.blocked_reason.unwrap(), "command matched blocked pattern 'rm\\s+-rf\\s+(/|~|\\$HOME)(\\s|$)'");
    }

    #[test]
    fn allowlisted_command_succeeds() {
        let mut exec = executor(false);
        let record = exec.execute("echo hello");
        assert!(record.success);
        assert!(!record.blocked);
        assert_eq!(record.output.trim(), "hello");
    }

    #[test]
    fn non_allowlisted_command_is_blocked_but_approvable() {
        let mut exec = executor(false);
        let record = exec.execute("true");
        assert!(record.blocked);

        exec.approve("a1", "true").unwrap();
        let approved = exec.execute_with_approval("true", "a1");
        assert!(approved.success);
    }

    #[test]
    fn sandbox_blocks_absolute_path_outside_working_dir() {
        let mut exec = executor(true);
        let record = exec.execute("cat /etc/passwd");
        assert!(record.blocked);
    }

    #[test]
    fn sandbox_blocks_relative_path_escaping_via_dotdot() {
        let mut exec = executor(true);
        let record = exec.execute("cat ../../etc/passwd");
        assert!(record.blocked);
    }

    #[test]
    fn log_filters_by_blocked_and_failed() {
        let mut exec = executor(false);
        exec.execute("echo hi");
        exec.execute("rm -rf /");
        assert_eq!(exec.log(true, false, None).len(), 1);
        assert_eq!(exec.log(false, false, Some(1)).len(), 1);
    }
}
