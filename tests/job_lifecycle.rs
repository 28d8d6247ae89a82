//! End-to-end job lifecycle against a real toolkit child process.
//!
//! The toolkit is a POSIX shell script speaking newline-delimited JSON-RPC;
//! the model is a scripted provider. Everything else is the production path:
//! submission, the libSQL queue, the job runner, the bridge, and the worker.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tempfile::TempDir;

use mcp_jobs::agent::{AgentReply, AgentRunner};
use mcp_jobs::bridge::{ToolSession, ToolkitBridge, TurnHandler};
use mcp_jobs::bridge::process::{Signal, is_alive, kill_group};
use mcp_jobs::config::{QueueConfig, ToolkitConfig};
use mcp_jobs::error::{AgentError, LlmError};
use mcp_jobs::jobs::runner::SkipReason;
use mcp_jobs::jobs::{JobRunner, JobStatus, JobSubmitter};
use mcp_jobs::llm::{
    FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};
use mcp_jobs::queue::worker::{ProviderFactory, WorkerSettings};
use mcp_jobs::queue::{ChildWorker, WorkerExit, run_retention_sweep};
use mcp_jobs::scopes::ClientCredentials;
use mcp_jobs::store::{Database, LibSqlBackend, QueuedTask, SessionRecord};
use mcp_jobs::tokens::TokenCounter;

const QUEUE: &str = "mcp_queue";
const SOFT_LIMIT: Duration = Duration::from_secs(20);
const GMAIL_READONLY: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Answers initialize, tools/list and tools/call. Records the authorized
/// scopes it was started with into `scopes.json` under `dir`.
fn toolkit_script(dir: &Path) -> String {
    format!(
        r#"printf '%s' "$GOOGLE_AUTHORIZED_SCOPES" > '{dir}/scopes.json'
echo "stub toolkit up" >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{}},"serverInfo":{{"name":"stub"}}}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"list_messages","description":"List mail","inputSchema":{{"type":"object"}}}}]}}}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"3 messages: invoice, lunch, standup"}}]}}}}\n' "$id" ;;
  esac
done
"#,
        dir = dir.display()
    )
}

/// Calls the toolkit's first tool once, then answers in text. When
/// `kill_pid` is set, kills the toolkit's process group before the first
/// tool call goes out.
struct ScriptedModel {
    kill_pid: Option<Arc<AtomicU32>>,
}

#[async_trait]
impl LlmProvider for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let after_tool = request
            .messages
            .last()
            .is_some_and(|m| m.role == Role::Tool);
        if after_tool || request.tools.is_empty() {
            return Ok(ToolCompletionResponse {
                content: Some("Your last 3 emails: an invoice, a lunch invite, a standup note.".to_string()),
                tool_calls: vec![],
                input_tokens: 10,
                output_tokens: 12,
                finish_reason: FinishReason::Stop,
            });
        }

        if let Some(slot) = &self.kill_pid {
            let pid = slot.load(Ordering::SeqCst);
            kill_group(pid, Signal::Kill);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(ToolCompletionResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: request.tools[0].name.clone(),
                arguments: serde_json::json!({ "max_results": 3 }),
            }],
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::ToolUse,
        })
    }
}

struct Harness {
    _dir: TempDir,
    dir: PathBuf,
    db: Arc<dyn Database>,
    submitter: JobSubmitter,
    runner: JobRunner,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let submitter = JobSubmitter::new(db.clone(), client(), QUEUE);
        let runner = JobRunner::new(db.clone(), Duration::from_secs(3600));
        Self {
            dir: dir.path().to_path_buf(),
            _dir: dir,
            db,
            submitter,
            runner,
        }
    }

    fn toolkit(&self) -> ToolkitConfig {
        ToolkitConfig {
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                toolkit_script(&self.dir),
            ],
            passthrough_env: vec!["PATH".to_string()],
            api_key_vars: vec![],
            shutdown_grace: Duration::from_millis(500),
        }
    }

    fn seen_scopes(&self) -> Vec<String> {
        let raw = std::fs::read_to_string(self.dir.join("scopes.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    async fn login(&self, user_id: &str, granted: &[&str], selected: &[&str]) {
        self.db
            .upsert_session(&SessionRecord {
                user_id: user_id.to_string(),
                access_token: SecretString::from("ya29.test"),
                refresh_token: Some(SecretString::from("1//refresh")),
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                granted_scopes: granted.iter().map(|s| s.to_string()).collect(),
                selected_scopes: selected.iter().map(|s| s.to_string()).collect(),
                authenticated: true,
                user_data: serde_json::json!({}),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn claim(&self) -> QueuedTask {
        self.db
            .claim_task(QUEUE, "test-worker", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("a queued task")
    }
}

fn client() -> ClientCredentials {
    ClientCredentials {
        client_id: "cid".to_string(),
        client_secret: SecretString::from("csecret"),
    }
}

fn agent(kill_pid: Option<Arc<AtomicU32>>) -> AgentRunner {
    AgentRunner::new(
        Arc::new(ScriptedModel { kill_pid }),
        Arc::new(TokenCounter::for_model("gpt-4")),
        10,
    )
}

#[tokio::test]
async fn requested_and_granted_scope_completes_with_usage() {
    let h = Harness::new().await;
    h.login("u1", &[GMAIL_READONLY], &["gmail_readonly"]).await;

    let job = h
        .submitter
        .submit("u1", "Summarize my last 3 emails", None)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let task = h.claim().await;
    let bridge = ToolkitBridge::new(h.toolkit());
    let report = h
        .runner
        .execute(&task, &bridge, &agent(None), SOFT_LIMIT)
        .await
        .unwrap();
    assert_eq!(report.status, Some(JobStatus::Completed));

    let record = h.db.get_job(job.id, "u1").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(!record.result.as_deref().unwrap_or_default().is_empty());
    assert!(record.error_message.is_none());
    assert!(record.completed_at.is_some());
    let usage = record.token_usage.unwrap();
    assert!(usage.total_tokens() > 0);
    assert_eq!(usage.total_tokens(), usage.input_tokens() + usage.output_tokens());

    assert_eq!(h.seen_scopes(), vec![GMAIL_READONLY.to_string()]);

    let teardown = report.teardown.unwrap();
    assert!(teardown.process_exited);
    assert!(teardown.reader_stopped);
    assert!(!is_alive(teardown.pid.unwrap()));
    assert_eq!(h.db.queue_depth(QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn ungranted_scope_reaches_terminal_state_with_no_permissions() {
    let h = Harness::new().await;
    h.login("u1", &[], &["drive"]).await;

    let job = h.submitter.submit("u1", "List my files", None).await.unwrap();
    let task = h.claim().await;
    assert!(task.env.authorized_scopes.is_empty());

    let bridge = ToolkitBridge::new(h.toolkit());
    let report = h
        .runner
        .execute(&task, &bridge, &agent(None), SOFT_LIMIT)
        .await
        .unwrap();
    assert!(report.status.unwrap().is_terminal());
    assert!(h.seen_scopes().is_empty());

    let record = h.db.get_job(job.id, "u1").await.unwrap().unwrap();
    assert!(record.status.is_terminal());
}

#[tokio::test]
async fn toolkit_killed_mid_exchange_fails_with_cause() {
    let h = Harness::new().await;
    h.login("u1", &[GMAIL_READONLY], &["gmail_readonly"]).await;
    let job = h
        .submitter
        .submit("u1", "Summarize my last 3 emails", None)
        .await
        .unwrap();
    let task = h.claim().await;

    let pid_slot = Arc::new(AtomicU32::new(0));
    let bridge = ToolkitBridge::new(h.toolkit()).with_pid_slot(pid_slot.clone());
    let started = std::time::Instant::now();
    let report = h
        .runner
        .execute(&task, &bridge, &agent(Some(pid_slot)), SOFT_LIMIT)
        .await
        .unwrap();
    assert!(started.elapsed() < SOFT_LIMIT);
    assert_eq!(report.status, Some(JobStatus::Failed));

    let record = h.db.get_job(job.id, "u1").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    let error = record.error_message.unwrap();
    assert!(error.starts_with("Agent error: "), "{error}");
    assert!(error.contains("toolkit exited with signal: 9"), "{error}");
    assert!(record.result.is_none());
    assert!(record.token_usage.is_none());
    assert!(!is_alive(report.teardown.unwrap().pid.unwrap()));
}

/// Lists the tools, then never answers.
struct Stall;

#[async_trait]
impl TurnHandler for Stall {
    async fn run_turn(
        &self,
        session: &mut dyn ToolSession,
        _message: &str,
    ) -> Result<AgentReply, AgentError> {
        session.list_tools().await?;
        std::future::pending().await
    }
}

#[tokio::test]
async fn soft_limit_fails_stalled_job_and_cleans_up() {
    let h = Harness::new().await;
    h.login("u1", &[GMAIL_READONLY], &["gmail_readonly"]).await;
    let job = h.submitter.submit("u1", "Summarize", None).await.unwrap();
    let task = h.claim().await;

    let bridge = ToolkitBridge::new(h.toolkit());
    let report = h
        .runner
        .execute(&task, &bridge, &Stall, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(report.status, Some(JobStatus::Failed));

    let record = h.db.get_job(job.id, "u1").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("Agent error: task exceeded soft time limit of 0s")
    );
    assert!(record.result.is_none());

    let teardown = report.teardown.unwrap();
    assert!(teardown.process_exited);
    assert!(teardown.reader_stopped);
    assert!(!is_alive(teardown.pid.unwrap()));
    assert_eq!(h.db.queue_depth(QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn results_are_scoped_to_their_owner() {
    let h = Harness::new().await;
    h.login("owner", &[], &[]).await;
    let job = h.submitter.submit("owner", "hello", None).await.unwrap();

    let unknown = uuid::Uuid::new_v4();
    assert!(h.db.get_job(unknown, "owner").await.unwrap().is_none());
    assert!(h.db.get_job(unknown, "intruder").await.unwrap().is_none());
    assert!(h.db.get_job(job.id, "intruder").await.unwrap().is_none());
    assert!(h.db.get_job(job.id, "owner").await.unwrap().is_some());
}

#[tokio::test]
async fn redelivery_after_completion_changes_nothing() {
    let h = Harness::new().await;
    h.login("u1", &[GMAIL_READONLY], &["gmail_readonly"]).await;
    let job = h.submitter.submit("u1", "Summarize", None).await.unwrap();
    let task = h.claim().await;

    let bridge = ToolkitBridge::new(h.toolkit());
    h.runner
        .execute(&task, &bridge, &agent(None), SOFT_LIMIT)
        .await
        .unwrap();
    let first = h.db.get_job(job.id, "u1").await.unwrap().unwrap();

    let again = h
        .runner
        .execute(&task, &bridge, &agent(None), SOFT_LIMIT)
        .await
        .unwrap();
    assert!(matches!(
        again.skipped,
        Some(SkipReason::AlreadyTerminal(JobStatus::Completed))
    ));
    assert!(again.teardown.is_none());

    let second = h.db.get_job(job.id, "u1").await.unwrap().unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn sweep_with_nothing_to_delete_is_ok() {
    let h = Harness::new().await;
    h.login("u1", &[], &[]).await;
    h.submitter.submit("u1", "recent", None).await.unwrap();

    let report = run_retention_sweep(h.db.as_ref(), 7, Utc::now()).await.unwrap();
    assert_eq!(report.jobs_deleted, 0);

    let later = Utc::now() + chrono::Duration::days(8);
    let report = run_retention_sweep(h.db.as_ref(), 7, later).await.unwrap();
    assert_eq!(report.jobs_deleted, 1);
}

#[test]
fn child_worker_processes_budget_then_recycles() {
    let control = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let h = control.block_on(Harness::new());
    control.block_on(h.login("u1", &[GMAIL_READONLY], &["gmail_readonly"]));
    let job = control
        .block_on(h.submitter.submit("u1", "Summarize my last 3 emails", None))
        .unwrap();

    let settings = WorkerSettings {
        queue: QueueConfig {
            max_tasks_per_child: 1,
            poll_interval: Duration::from_millis(20),
            soft_time_limit: SOFT_LIMIT,
            hard_time_limit: SOFT_LIMIT * 2,
            ..QueueConfig::default()
        },
        toolkit: h.toolkit(),
        max_iterations: 5,
        tokenizer_model: "gpt-4".to_string(),
        database_path: None,
    };
    let factory: ProviderFactory = Arc::new(|| -> Result<Arc<dyn LlmProvider>, LlmError> {
        Ok(Arc::new(ScriptedModel { kill_pid: None }))
    });
    let worker = ChildWorker::new(0, h.db.clone(), settings, factory);

    let exit = worker.run(&control).unwrap();
    assert_eq!(exit, WorkerExit::Recycle);

    let record = control
        .block_on(h.db.get_job(job.id, "u1"))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(control.block_on(h.db.queue_depth(QUEUE)).unwrap(), 0);
}
