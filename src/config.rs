//! Configuration types.
//!
//! Everything is read from environment variables. Loading goes through a
//! lookup function so tests can supply a map instead of mutating the
//! process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Extra time past the hard limit before an unacknowledged task is redelivered.
const VISIBILITY_MARGIN: Duration = Duration::from_secs(60);

/// Queue and worker pool configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Dedicated queue name; workers only consume this queue.
    pub queue_name: String,
    /// Hard per-task limit. The worker process is killed when exceeded.
    pub hard_time_limit: Duration,
    /// Soft per-task limit. Cancels the bridge so it can record `failed`.
    pub soft_time_limit: Duration,
    /// Number of worker processes.
    pub concurrency: usize,
    /// Tasks a worker processes before it is recycled.
    pub max_tasks_per_child: u32,
    /// Tasks a worker reserves at a time. Always 1.
    pub prefetch: u32,
    /// Lifetime of queue-level result metadata.
    pub result_expires: Duration,
    /// Job records older than this many days are swept.
    pub retention_days: u32,
    /// Cron expression for the retention sweep.
    pub sweep_schedule: String,
    /// Idle wait between empty polls of the queue.
    pub poll_interval: Duration,
}

impl QueueConfig {
    /// Claimed tasks older than this are considered abandoned and redelivered.
    pub fn visibility_timeout(&self) -> Duration {
        self.hard_time_limit + VISIBILITY_MARGIN
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "mcp_queue".to_string(),
            hard_time_limit: Duration::from_secs(1800), // 30 minutes
            soft_time_limit: Duration::from_secs(1500), // 25 minutes
            concurrency: 2,
            max_tasks_per_child: 1000,
            prefetch: 1,
            result_expires: Duration::from_secs(3600),
            retention_days: 7,
            sweep_schedule: "0 0 * * * *".to_string(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// How the toolkit child process is launched.
#[derive(Debug, Clone)]
pub struct ToolkitConfig {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Non-secret host variables copied into the child environment.
    pub passthrough_env: Vec<String>,
    /// Names of third-party API key variables forwarded from the host.
    pub api_key_vars: Vec<String>,
    /// Bounded wait for exit after SIGTERM before the child is killed.
    pub shutdown_grace: Duration,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "npx".to_string(),
                "-y".to_string(),
                "@googleworkspace/mcp-server".to_string(),
            ],
            passthrough_env: ["PATH", "HOME", "LANG", "TMPDIR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            api_key_vars: vec!["OPENAI_API_KEY".to_string()],
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    /// Upper bound on model round-trips in one agent turn.
    pub max_iterations: usize,
    /// Model whose tokenizer is used for usage accounting.
    pub tokenizer_model: String,
}

/// OAuth client and session token configuration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_url: String,
    pub jwt_secret: SecretString,
    pub jwt_ttl: Duration,
    /// How long an authorization-start state token stays valid.
    pub state_ttl: Duration,
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub queue: QueueConfig,
    pub toolkit: ToolkitConfig,
    pub llm: LlmConfig,
    pub oauth: OAuthConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let queue = QueueConfig::load(&env)?;
        let toolkit = ToolkitConfig::load(&env)?;

        let llm = LlmConfig {
            api_key: SecretString::from(env.required("OPENAI_API_KEY")?),
            base_url: env.string("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            model: env.string("AGENT_MODEL", "gpt-4o"),
            max_iterations: env.parse("AGENT_MAX_ITERATIONS", 10usize)?,
            tokenizer_model: env.string("TOKENIZER_MODEL", "gpt-4"),
        };

        let oauth = OAuthConfig {
            client_id: env.required("GOOGLE_CLIENT_ID")?,
            client_secret: SecretString::from(env.required("GOOGLE_CLIENT_SECRET")?),
            redirect_url: env.string("OAUTH_REDIRECT_URL", "http://localhost:8000/auth/callback"),
            jwt_secret: SecretString::from(env.required("JWT_SECRET")?),
            jwt_ttl: Duration::from_secs(env.parse("JWT_TTL_HOURS", 24u64)? * 3600),
            state_ttl: Duration::from_secs(env.parse("OAUTH_STATE_TTL_SECS", 600u64)?),
        };

        let api = ApiConfig {
            host: env.string("API_HOST", "0.0.0.0"),
            port: env.parse("API_PORT", 8000u16)?,
        };

        Ok(Self {
            database_path: PathBuf::from(env.string("DATABASE_PATH", "./data/mcp-jobs.db")),
            queue,
            toolkit,
            llm,
            oauth,
            api,
        })
    }
}

impl QueueConfig {
    fn load(env: &Env<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let hard = env.parse("TASK_TIME_LIMIT_SECS", defaults.hard_time_limit.as_secs())?;
        let soft = env.parse("TASK_SOFT_TIME_LIMIT_SECS", defaults.soft_time_limit.as_secs())?;
        if soft >= hard {
            return Err(ConfigError::InvalidValue {
                key: "TASK_SOFT_TIME_LIMIT_SECS".to_string(),
                message: format!("soft limit {soft}s must be below hard limit {hard}s"),
            });
        }

        let concurrency: usize = env.parse("WORKER_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }

        let max_tasks_per_child: u32 =
            env.parse("WORKER_MAX_TASKS_PER_CHILD", defaults.max_tasks_per_child)?;
        if max_tasks_per_child == 0 {
            return Err(invalid("WORKER_MAX_TASKS_PER_CHILD", "must be at least 1"));
        }

        let prefetch: u32 = env.parse("WORKER_PREFETCH", defaults.prefetch)?;
        if prefetch != 1 {
            return Err(invalid(
                "WORKER_PREFETCH",
                "only a prefetch of 1 is supported",
            ));
        }

        let sweep_schedule = env.string("SWEEP_SCHEDULE", &defaults.sweep_schedule);
        if let Err(e) = cron::Schedule::from_str(&sweep_schedule) {
            return Err(invalid("SWEEP_SCHEDULE", &format!("invalid cron: {e}")));
        }

        Ok(Self {
            queue_name: env.string("QUEUE_NAME", &defaults.queue_name),
            hard_time_limit: Duration::from_secs(hard),
            soft_time_limit: Duration::from_secs(soft),
            concurrency,
            max_tasks_per_child,
            prefetch,
            result_expires: Duration::from_secs(
                env.parse("RESULT_EXPIRES_SECS", defaults.result_expires.as_secs())?,
            ),
            retention_days: env.parse("JOB_RETENTION_DAYS", defaults.retention_days)?,
            sweep_schedule,
            poll_interval: Duration::from_millis(env.parse(
                "QUEUE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
        })
    }
}

impl ToolkitConfig {
    fn load(env: &Env<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let command = match env.get("TOOLKIT_COMMAND") {
            Some(raw) => {
                let parts = shlex::split(&raw)
                    .ok_or_else(|| invalid("TOOLKIT_COMMAND", "malformed command"))?;
                if parts.is_empty() {
                    return Err(invalid("TOOLKIT_COMMAND", "empty command"));
                }
                parts
            }
            None => defaults.command,
        };

        Ok(Self {
            command,
            passthrough_env: env.list("TOOLKIT_PASSTHROUGH_ENV", defaults.passthrough_env),
            api_key_vars: env.list("TOOLKIT_API_KEYS", defaults.api_key_vars),
            shutdown_grace: Duration::from_millis(env.parse(
                "TOOLKIT_SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace.as_millis() as u64,
            )?),
        })
    }

    /// Resolve the configured API key variables against a host lookup.
    /// Unset keys are skipped.
    pub fn collect_api_keys<F>(&self, lookup: F) -> HashMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.api_key_vars
            .iter()
            .filter_map(|name| lookup(name).map(|value| (name.clone(), value)))
            .collect()
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn list(&self, key: &str, default: Vec<String>) -> Vec<String> {
        match self.get(key) {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("OPENAI_API_KEY", "sk-test"),
            ("GOOGLE_CLIENT_ID", "client-id"),
            ("GOOGLE_CLIENT_SECRET", "client-secret"),
            ("JWT_SECRET", "jwt-secret"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_match_worker_settings() {
        let config = load(&base_env()).unwrap();
        let q = &config.queue;
        assert_eq!(q.queue_name, "mcp_queue");
        assert_eq!(q.hard_time_limit, Duration::from_secs(1800));
        assert_eq!(q.soft_time_limit, Duration::from_secs(1500));
        assert_eq!(q.concurrency, 2);
        assert_eq!(q.max_tasks_per_child, 1000);
        assert_eq!(q.prefetch, 1);
        assert_eq!(q.result_expires, Duration::from_secs(3600));
        assert_eq!(q.retention_days, 7);
        assert_eq!(q.visibility_timeout(), Duration::from_secs(1860));
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.api.port, 8000);
    }

    #[test]
    fn missing_secret_is_reported() {
        let mut vars = base_env();
        vars.remove("JWT_SECRET");
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "JWT_SECRET"));
    }

    #[test]
    fn soft_limit_must_be_below_hard() {
        let mut vars = base_env();
        vars.insert("TASK_TIME_LIMIT_SECS", "60");
        vars.insert("TASK_SOFT_TIME_LIMIT_SECS", "60");
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("TASK_SOFT_TIME_LIMIT_SECS"));
    }

    #[test]
    fn prefetch_other_than_one_rejected() {
        let mut vars = base_env();
        vars.insert("WORKER_PREFETCH", "4");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut vars = base_env();
        vars.insert("WORKER_CONCURRENCY", "0");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn invalid_sweep_schedule_rejected() {
        let mut vars = base_env();
        vars.insert("SWEEP_SCHEDULE", "not a cron");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn toolkit_command_is_shell_split() {
        let mut vars = base_env();
        vars.insert("TOOLKIT_COMMAND", "node 'my server.js' --stdio");
        vars.insert("TOOLKIT_API_KEYS", "OPENAI_API_KEY, SERPER_KEY");
        let config = load(&vars).unwrap();
        assert_eq!(config.toolkit.command, vec!["node", "my server.js", "--stdio"]);
        assert_eq!(config.toolkit.api_key_vars, vec!["OPENAI_API_KEY", "SERPER_KEY"]);
    }

    #[test]
    fn malformed_toolkit_command_rejected() {
        let mut vars = base_env();
        vars.insert("TOOLKIT_COMMAND", "node 'unterminated");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn collect_api_keys_skips_unset() {
        let toolkit = ToolkitConfig {
            api_key_vars: vec!["A".to_string(), "B".to_string()],
            ..ToolkitConfig::default()
        };
        let keys = toolkit.collect_api_keys(|k| (k == "A").then(|| "1".to_string()));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.get("A").map(String::as_str), Some("1"));
    }
}
