//! Task execution: polling server tasks to a terminal state and the
//! multi-step protocols built on top of it.

use std::future::Future;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::api::Args;
use crate::audit::Surface;
use crate::context::Context;
use crate::error::{Error, Fault, Result};
use crate::value::{MoRef, TYPE_KEY, ValueExt};

/// Default limit for long-running operations.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(3600);
/// Limit for datastore file uploads.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Limit for entering or leaving maintenance mode.
pub const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSettings {
    pub poll_interval: Duration,
    pub default_timeout: Duration,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_timeout: LONG_TIMEOUT,
        }
    }
}

/// Server task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskState::Queued),
            "running" => Some(TaskState::Running),
            "success" => Some(TaskState::Success),
            "error" => Some(TaskState::Error),
            _ => None,
        }
    }
}

/// An answer to a blocking VM question, keyed by the message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub question: String,
    pub response: String,
}

/// Turn a `LocalizedMethodFault` into a [`Fault`].
pub fn task_fault(error: &Value) -> Fault {
    let inner = error.at("fault");
    let name = inner
        .and_then(|f| f.type_name())
        .unwrap_or("MethodFault")
        .to_string();
    let message = error
        .str_at("localizedMessage")
        .map(str::to_string)
        .or_else(|| inner.and_then(|f| f.str_at("msg")).map(str::to_string))
        .unwrap_or_default();
    let mut detail = inner.cloned().unwrap_or(Value::Null);
    if let Value::Object(map) = &mut detail {
        map.remove(TYPE_KEY);
    }
    Fault::new(name, message).with_detail(detail)
}

enum Poll {
    Done(Value),
    Pending,
}

pub struct TaskRunner<'a> {
    ctx: &'a Context,
}

impl<'a> TaskRunner<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Poll a vim25 task until it reaches a terminal state or `timeout`.
    pub async fn wait(&self, task: &MoRef, timeout: Duration) -> Result<Value> {
        self.wait_answering(task, None, &[], timeout).await
    }

    /// Like [`TaskRunner::wait`], answering questions that block `vm`.
    pub async fn wait_answering(
        &self,
        task: &MoRef,
        vm: Option<&MoRef>,
        answers: &[Answer],
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(vm) = vm {
                self.answer_question(vm, answers).await?;
            }
            let info = self.ctx.properties(task, &["info"]).await?;
            match vim_task_state(task, &info)? {
                Poll::Done(value) => return Ok(value),
                Poll::Pending => {}
            }
            self.pause(task, deadline, timeout, &info).await?;
        }
    }

    /// Poll a storage-monitoring (SMS) task.
    pub async fn wait_sms(&self, task: &MoRef, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let info = self
                .ctx
                .call_on(Surface::Sms, task, "QuerySmsTaskInfo", Vec::new())
                .await?;
            let state = info.str_at("state").and_then(TaskState::parse);
            match state {
                Some(TaskState::Success) => {
                    return self
                        .ctx
                        .call_on(Surface::Sms, task, "QuerySmsTaskResult", Vec::new())
                        .await;
                }
                Some(TaskState::Error) => {
                    let error = info.at("error").cloned().unwrap_or(Value::Null);
                    return Err(Error::Remote(task_fault(&error)));
                }
                _ => {}
            }
            let wrapped = json!({ "info": info });
            self.pause(task, deadline, timeout, &wrapped).await?;
        }
    }

    async fn pause(&self, task: &MoRef, deadline: Instant, timeout: Duration, info: &Value) -> Result<()> {
        let now = Instant::now();
        if now >= deadline {
            let what = info
                .str_at("info.descriptionId")
                .or_else(|| info.str_at("info.name"))
                .unwrap_or("task");
            warn!(task = %task.value, limit_secs = timeout.as_secs(), "task timed out");
            return Err(Error::Timeout(format!(
                "{what} ({}) did not complete within {}s; the server-side task continues",
                task.value,
                timeout.as_secs()
            )));
        }
        let progress = info.i64_at("info.progress");
        debug!(task = %task.value, progress = ?progress, "task pending");
        sleep(self.ctx.task_settings().poll_interval.min(deadline - now)).await;
        Ok(())
    }

    async fn answer_question(&self, vm: &MoRef, answers: &[Answer]) -> Result<()> {
        let props = self.ctx.properties(vm, &["runtime.question"]).await?;
        let Some(question) = props.at("runtime.question") else {
            return Ok(());
        };
        let question_id = question.str_at("id").unwrap_or_default().to_string();
        let text = question.str_at("text").unwrap_or_default().to_string();
        let choices = question.list_at("choice.choiceInfo");

        for message in question.list_at("message") {
            let Some(message_id) = message.str_at("id") else {
                continue;
            };
            let Some(answer) = answers.iter().find(|a| a.question == message_id) else {
                continue;
            };
            let choice = choices.iter().find(|c| {
                [c.str_at("key"), c.str_at("label"), c.str_at("summary")]
                    .into_iter()
                    .flatten()
                    .any(|v| v == answer.response)
            });
            let Some(key) = choice.and_then(|c| c.str_at("key")) else {
                return Err(Error::InvalidArgument(format!(
                    "response '{}' is not a valid choice for question '{message_id}'",
                    answer.response
                )));
            };
            info!(vm = %vm.value, question = %message_id, choice = %key, "answering VM question");
            let args: Args = vec![
                ("questionId".to_string(), Value::String(question_id.clone())),
                ("answerChoice".to_string(), Value::String(key.to_string())),
            ];
            self.ctx.mutate(vm, "AnswerVM", args).await?;
            return Ok(());
        }
        Err(Error::PreconditionFailed(format!(
            "virtual machine {} is blocked by an unanswered question: {}",
            vm.value,
            text.trim()
        )))
    }
}

fn vim_task_state(task: &MoRef, info: &Value) -> Result<Poll> {
    let state = info
        .str_at("info.state")
        .ok_or_else(|| Error::Internal(format!("task {} has no state", task.value)))?;
    match TaskState::parse(state) {
        Some(TaskState::Success) => Ok(Poll::Done(
            info.at("info.result").cloned().unwrap_or(Value::Null),
        )),
        Some(TaskState::Error) => {
            let error = info.at("info.error").cloned().unwrap_or(Value::Null);
            Err(Error::Remote(task_fault(&error)))
        }
        Some(TaskState::Queued | TaskState::Running) => Ok(Poll::Pending),
        None => Err(Error::Internal(format!(
            "task {} reported unknown state '{state}'",
            task.value
        ))),
    }
}

/// Fault name of an untrusted-certificate rejection.
pub const CERT_NOT_TRUSTED: &str = "CertificateNotTrusted";

/// Run `attempt` once; if it is rejected because the peer certificate is
/// not trusted, run it once more with the certificate the server returned.
pub async fn retry_on_cert_trust<T, F, Fut>(mut attempt: F) -> Result<T>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match attempt(None).await {
        Err(e) if e.fault().is_some_and(|f| f.name == CERT_NOT_TRUSTED) => {
            let certificate = e
                .fault()
                .and_then(|f| f.detail.str_at("certificate"))
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Remote(Fault::new(
                        CERT_NOT_TRUSTED,
                        "server rejected the certificate but did not return it",
                    ))
                })?;
            info!("retrying with the certificate presented by the provider");
            attempt(Some(certificate))
                .await
                .map_err(|e| e.in_step("retrying with the presented certificate"))
        }
        other => other,
    }
}

/// Run `action` with `host` in maintenance mode.
///
/// A host already in maintenance mode is left there. Otherwise the host
/// enters maintenance mode first (the action is skipped if that fails)
/// and leaves it afterwards whether or not the action succeeded.
pub async fn bracket_maintenance<T, F, Fut>(ctx: &Context, host: &MoRef, action: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let props = ctx.properties(host, &["runtime.inMaintenanceMode"]).await?;
    if props.bool_at("runtime.inMaintenanceMode") == Some(true) {
        return action().await;
    }

    let args = || -> Args { vec![("timeout".to_string(), Value::from(0))] };
    ctx.mutate_task_within(host, "EnterMaintenanceMode_Task", args(), MAINTENANCE_TIMEOUT)
        .await
        .map_err(|e| e.in_step("entering maintenance mode"))?;
    info!(host = %host.value, "entered maintenance mode");

    let result = action().await;

    let exit = ctx
        .mutate_task_within(host, "ExitMaintenanceMode_Task", args(), MAINTENANCE_TIMEOUT)
        .await;
    match (result, exit) {
        (Ok(value), Ok(_)) => {
            info!(host = %host.value, "exited maintenance mode");
            Ok(value)
        }
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(exit_err)) => {
            warn!(host = %host.value, error = %exit_err, "failed to exit maintenance mode");
            ctx.warn(format!(
                "host {} is still in maintenance mode: {exit_err}",
                host.value
            ));
            Err(e)
        }
        (Ok(_), Err(exit_err)) => Err(exit_err.in_step("exiting maintenance mode")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_fault_from_localized_fault() {
        let err = json!({
            "fault": { "_type": "InvalidState", "faultMessage": [] },
            "localizedMessage": "The operation is not allowed in the current state."
        });
        let f = task_fault(&err);
        assert_eq!(f.name, "InvalidState");
        assert_eq!(f.kind(), crate::error::ErrorKind::PreconditionFailed);
        assert!(f.detail.get(TYPE_KEY).is_none());
    }

    #[test]
    fn test_task_state_mapping() {
        let task = MoRef::new("Task", "task-1");
        let ok = json!({ "info": { "state": "success", "result": "x" } });
        assert!(matches!(vim_task_state(&task, &ok), Ok(Poll::Done(v)) if v == "x"));
        let running = json!({ "info": { "state": "running", "progress": "40" } });
        assert!(matches!(vim_task_state(&task, &running), Ok(Poll::Pending)));
        let failed = json!({ "info": { "state": "error", "error": { "fault": { "_type": "DuplicateName" } } } });
        let err = vim_task_state(&task, &failed).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_cert_trust_retries_once_with_certificate() {
        let mut seen = Vec::new();
        let result = retry_on_cert_trust(|cert: Option<String>| {
            seen.push(cert.clone());
            async move {
                match cert {
                    None => Err(Error::Remote(
                        Fault::new(CERT_NOT_TRUSTED, "untrusted")
                            .with_detail(json!({ "certificate": "-----BEGIN CERTIFICATE-----" })),
                    )),
                    Some(c) => Ok(c),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "-----BEGIN CERTIFICATE-----");
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_cert_trust_second_failure_is_reported() {
        let mut calls = 0;
        let err = retry_on_cert_trust(|_cert: Option<String>| {
            calls += 1;
            async move {
                Err::<(), _>(Error::Remote(
                    Fault::new(CERT_NOT_TRUSTED, "untrusted").with_detail(json!({ "certificate": "c" })),
                ))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls, 2);
        assert!(err.to_string().starts_with("retrying with the presented certificate"));
    }
}
