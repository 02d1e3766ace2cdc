//! Agent CLI command lines.
//!
//! [`LaunchConfig`] holds everything that is fixed for the server's lifetime
//! (binary, model, credentials); [`TurnParams`] holds what varies per turn
//! (session, token, resume flag, working directory). Together they produce an
//! [`AgentCommand`], a plain description of argv/env/cwd that is cheap to
//! inspect in tests and converts into a `tokio::process::Command`.

use std::path::PathBuf;

use conduit_core::{AgentSessionId, SessionId};
use conduit_settings::{AgentSettings, AuthMode, PoolSettings};

/// Env var the agent CLI sets for its own children; must not leak into ours.
const NESTED_SESSION_VAR: &str = "CLAUDECODE";

/// Env var carrying the Conduit session id into the agent process.
pub const SESSION_ID_VAR: &str = "CONDUIT_SESSION_ID";

/// Static invocation settings.
#[derive(Clone, Debug)]
pub struct LaunchConfig {
    /// Executable name or path.
    pub binary: String,
    /// Arguments placed before the agent flags (wrapper launchers).
    pub binary_args: Vec<String>,
    /// `--model` value.
    pub model: Option<String>,
    /// Credential injection mode.
    pub auth_mode: AuthMode,
    /// `ANTHROPIC_API_KEY` value.
    pub api_key: Option<String>,
    /// `ANTHROPIC_BASE_URL` value.
    pub base_url: Option<String>,
    /// Metering proxy; replaces the base URL when set.
    pub metering_proxy_url: Option<String>,
    /// `--system-prompt` value.
    pub system_prompt: Option<String>,
    /// `--max-budget-usd` value.
    pub max_budget_usd: Option<f64>,
    /// Fallback working directory.
    pub default_work_dir: Option<PathBuf>,
    /// Buffered output lines per persistent worker.
    pub line_buffer: usize,
}

impl LaunchConfig {
    /// Minimal config running `binary` with no credentials.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            binary_args: Vec::new(),
            model: None,
            auth_mode: AuthMode::Oauth,
            api_key: None,
            base_url: None,
            metering_proxy_url: None,
            system_prompt: None,
            max_budget_usd: None,
            default_work_dir: None,
            line_buffer: 256,
        }
    }

    /// Build from loaded settings.
    pub fn from_settings(agent: &AgentSettings, pool: &PoolSettings) -> Self {
        Self {
            binary: agent.binary.clone(),
            binary_args: agent.binary_args.clone(),
            model: agent.model.clone(),
            auth_mode: agent.auth_mode,
            api_key: agent.api_key.clone(),
            base_url: agent.base_url.clone(),
            metering_proxy_url: agent.metering_proxy_url.clone(),
            system_prompt: agent.system_prompt.clone(),
            max_budget_usd: agent.max_budget_usd,
            default_work_dir: agent.default_work_dir.as_ref().map(PathBuf::from),
            line_buffer: pool.line_buffer,
        }
    }

    /// Command for a persistent worker fed turn by turn over stdin.
    pub fn persistent(&self, params: &TurnParams) -> AgentCommand {
        let mut args = self.base_args(&[
            "-p",
            "--verbose",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--include-partial-messages",
        ]);
        self.push_session_args(&mut args, params);
        args.push("--dangerously-skip-permissions".into());
        self.command(args, params)
    }

    /// Command for a single non-pooled invocation; the query is the last argument.
    pub fn one_shot(&self, params: &TurnParams, query: &str) -> AgentCommand {
        let mut args = self.base_args(&[
            "-p",
            "--dangerously-skip-permissions",
            "--verbose",
            "--output-format",
            "stream-json",
            "--include-partial-messages",
        ]);
        self.push_session_args(&mut args, params);
        args.push(query.to_string());
        self.command(args, params)
    }

    fn base_args(&self, flags: &[&str]) -> Vec<String> {
        self.binary_args
            .iter()
            .cloned()
            .chain(flags.iter().map(|f| (*f).to_string()))
            .collect()
    }

    fn push_session_args(&self, args: &mut Vec<String>, params: &TurnParams) {
        let flag = if params.resume { "--resume" } else { "--session-id" };
        args.push(flag.into());
        args.push(params.agent_session_id.to_string());
        if let Some(prompt) = self.system_prompt.as_ref().filter(|p| !p.is_empty()) {
            args.push("--system-prompt".into());
            args.push(prompt.clone());
        }
        if let Some(budget) = self.max_budget_usd {
            args.push("--max-budget-usd".into());
            args.push(format!("{budget:.2}"));
        }
        if let Some(model) = self.model.as_ref().filter(|m| !m.is_empty()) {
            args.push("--model".into());
            args.push(model.clone());
        }
    }

    fn command(&self, args: Vec<String>, params: &TurnParams) -> AgentCommand {
        AgentCommand {
            program: self.binary.clone(),
            args,
            env: self.env(params),
            env_remove: vec![NESTED_SESSION_VAR.to_string()],
            work_dir: self.work_dir(params),
        }
    }

    fn env(&self, params: &TurnParams) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if self.auth_mode != AuthMode::Oauth {
            if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
                env.push(("ANTHROPIC_API_KEY".to_string(), key.clone()));
            }
            let base_url = match self.metering_proxy_url.as_ref() {
                Some(proxy) => Some(metered_url(proxy, params.session_id)),
                None => self.base_url.clone(),
            };
            if let Some(url) = base_url {
                env.push(("ANTHROPIC_BASE_URL".to_string(), url));
            }
        }
        env.push((SESSION_ID_VAR.to_string(), params.session_id.to_string()));
        env
    }

    fn work_dir(&self, params: &TurnParams) -> PathBuf {
        params
            .work_dir
            .clone()
            .or_else(|| self.default_work_dir.clone())
            .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Tag upstream requests with the session so the proxy can attribute usage.
fn metered_url(proxy: &str, session_id: SessionId) -> String {
    let sep = if proxy.contains('?') { '&' } else { '?' };
    format!("{proxy}{sep}session_id={session_id}")
}

/// Per-turn invocation parameters.
#[derive(Clone, Debug)]
pub struct TurnParams {
    /// Conduit session.
    pub session_id: SessionId,
    /// Agent conversation token.
    pub agent_session_id: AgentSessionId,
    /// Continue the token's conversation instead of starting it.
    pub resume: bool,
    /// Working directory override.
    pub work_dir: Option<PathBuf>,
}

impl TurnParams {
    /// Parameters for a session turn.
    pub fn new(session_id: SessionId, agent_session_id: AgentSessionId, resume: bool) -> Self {
        Self {
            session_id,
            agent_session_id,
            resume,
            work_dir: None,
        }
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_work_dir(mut self, work_dir: Option<PathBuf>) -> Self {
        self.work_dir = work_dir;
        self
    }
}

/// A fully resolved process invocation.
#[derive(Clone, Debug)]
pub struct AgentCommand {
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Variables removed from the inherited environment.
    pub env_remove: Vec<String>,
    /// Working directory.
    pub work_dir: PathBuf,
}

impl AgentCommand {
    /// Convert into a tokio command. Stdio is left to the caller.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        let _ = cmd.args(&self.args).current_dir(&self.work_dir).kill_on_drop(true);
        for key in &self.env_remove {
            let _ = cmd.env_remove(key);
        }
        for (key, value) in &self.env {
            let _ = cmd.env(key, value);
        }
        cmd
    }

    /// Value of an injected variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
