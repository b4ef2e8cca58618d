use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use turnwire_core::{ActionType, ApprovalRequirement, TrustSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    Supervised,
    Autonomous,
}

impl TrustMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "supervised" => Some(TrustMode::Supervised),
            "autonomous" => Some(TrustMode::Autonomous),
            _ => None,
        }
    }
}

/// Static risk buckets per action type. Approval gating and the
/// suppress-future-prompts mechanism both key off these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    ReadOnly,
    Destructive,
    Shell,
}

impl RiskCategory {
    pub fn of(action: ActionType) -> Self {
        match action {
            ActionType::FsRead | ActionType::FsList => RiskCategory::ReadOnly,
            ActionType::FsWrite | ActionType::FsAppend | ActionType::FsDelete => {
                RiskCategory::Destructive
            }
            ActionType::ShRun => RiskCategory::Shell,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            RiskCategory::ReadOnly => "read-only",
            RiskCategory::Destructive => "destructive",
            RiskCategory::Shell => "shell",
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("secret path denied")]
    SecretPath,
    #[error("unknown trust mode: {0}")]
    UnknownTrustMode(String),
}

#[derive(Debug, Clone)]
enum SecretRule {
    Segment(String),
    Glob(Pattern),
}

/// Decides which commands execute automatically, which prompt, and which
/// paths are off limits entirely.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    mode: TrustMode,
    autonomous_shell: bool,
    secret_rules: Vec<SecretRule>,
    risky_shell: Regex,
}

impl PolicyEngine {
    pub fn new(mode: TrustMode, autonomous_shell: bool, denied_secret_paths: &[String]) -> Self {
        let secret_rules = denied_secret_paths
            .iter()
            .map(|entry| {
                if entry.contains(['*', '?', '[']) {
                    match Pattern::new(entry) {
                        Ok(pattern) => SecretRule::Glob(pattern),
                        Err(_) => SecretRule::Segment(entry.clone()),
                    }
                } else {
                    SecretRule::Segment(entry.clone())
                }
            })
            .collect();
        Self {
            mode,
            autonomous_shell,
            secret_rules,
            risky_shell: Regex::new(
                r"(?i)\b(rm\s+-[a-z]*r[a-z]*|sudo|mkfs|shutdown|reboot|chmod\s+777)\b",
            )
            .expect("valid regex"),
        }
    }

    pub fn from_settings(settings: &TrustSettings) -> Result<Self, PolicyError> {
        let mode = TrustMode::parse(&settings.mode)
            .ok_or_else(|| PolicyError::UnknownTrustMode(settings.mode.clone()))?;
        Ok(Self::new(
            mode,
            settings.autonomous_shell,
            &settings.denied_secret_paths,
        ))
    }

    pub fn mode(&self) -> TrustMode {
        self.mode
    }

    /// Rejects paths that touch a configured secret location. Called before
    /// approval is ever requested, so a denial here never prompts.
    pub fn check_path(&self, path: &str) -> Result<(), PolicyError> {
        for rule in &self.secret_rules {
            let matched = match rule {
                SecretRule::Segment(segment) => Path::new(path)
                    .components()
                    .any(|c| c.as_os_str() == segment.as_str()),
                SecretRule::Glob(pattern) => pattern.matches(path),
            };
            if matched {
                return Err(PolicyError::SecretPath);
            }
        }
        Ok(())
    }

    /// Approval requirement for a command: the remote confirmation flag always
    /// prompts; otherwise read-only actions run automatically, destructive
    /// actions run automatically only in autonomous mode, and shell commands
    /// additionally need the separate autonomous_shell opt-in.
    pub fn approval_requirement(
        &self,
        action: ActionType,
        remote_requires_confirmation: bool,
    ) -> ApprovalRequirement {
        if remote_requires_confirmation {
            return ApprovalRequirement::Required;
        }
        match RiskCategory::of(action) {
            RiskCategory::ReadOnly => ApprovalRequirement::Auto,
            RiskCategory::Destructive => {
                if self.mode == TrustMode::Autonomous {
                    ApprovalRequirement::Auto
                } else {
                    ApprovalRequirement::Required
                }
            }
            RiskCategory::Shell => {
                if self.mode == TrustMode::Autonomous && self.autonomous_shell {
                    ApprovalRequirement::Auto
                } else {
                    ApprovalRequirement::Required
                }
            }
        }
    }

    /// Human-facing markers shown in the approval prompt.
    pub fn risk_markers(&self, action: ActionType, args: &Value) -> Vec<String> {
        let mut markers = vec![RiskCategory::of(action).label().to_string()];
        if action == ActionType::FsDelete {
            markers.push("recursive-delete".to_string());
        }
        if action == ActionType::ShRun
            && let Some(cmd) = args.get("cmd").and_then(|v| v.as_str())
            && self.risky_shell.is_match(cmd)
        {
            markers.push("dangerous-command".to_string());
        }
        markers
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        let settings = TrustSettings::default();
        Self::new(TrustMode::Supervised, false, &settings.denied_secret_paths)
    }
}
