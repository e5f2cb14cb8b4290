//! codemode sandbox worker: one isolated child process per sandbox.
//!
//! Spawned by the host with a cleared environment. Speaks the length-delimited
//! JSON protocol of [`codemode_sandbox::ipc`] on stdin/stdout. Each `Execute`
//! runs in a fresh V8 isolate on its own thread; capability calls made by the
//! script are forwarded to the host as `CallRequest`s and resolved by
//! correlation id when the matching `CallResult` arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use codemode_sandbox::bindings::SerializedBindings;
use codemode_sandbox::ipc::{
    read_message_with_limit, write_message, ChildMessage, ParentMessage, ResourceUsage,
    ScriptFailure, WorkerLimits, DEFAULT_MAX_IPC_MESSAGE_SIZE,
};
use codemode_sandbox::proxy::{CallWaiter, PendingCalls};
use codemode_sandbox::runtime::spawn_script;
use codemode_sandbox::CallBridge;
use serde_json::Value;
use tokio::io::{self, BufReader, Stdout};
use tokio::sync::{mpsc, oneshot};

/// What the isolate thread asks of the IPC loop.
enum BridgeEvent {
    Call {
        group: Option<String>,
        method: String,
        args: Value,
        reply: CallWaiter,
    },
    Log(String),
}

/// Forwards proxy calls from the isolate thread to the IPC loop.
///
/// Registration of the waiter and sending of the request happen in the loop,
/// in that order, so a response can never arrive before its waiter exists.
struct IpcCallBridge {
    events: mpsc::UnboundedSender<BridgeEvent>,
}

#[async_trait::async_trait]
impl CallBridge for IpcCallBridge {
    async fn call(
        &self,
        group: Option<String>,
        method: String,
        args: Value,
    ) -> Result<Value, String> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(BridgeEvent::Call {
                group,
                method,
                args,
                reply,
            })
            .map_err(|_| "worker channel closed".to_string())?;
        response
            .await
            .map_err(|_| "call abandoned: execution ended".to_string())?
    }

    fn log(&self, message: &str) {
        let _ = self.events.send(BridgeEvent::Log(message.to_string()));
    }
}

type Inbox = mpsc::Receiver<std::io::Result<ParentMessage>>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let env_keys: Vec<String> = std::env::vars_os()
        .filter_map(|(k, _)| k.into_string().ok())
        .collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    // Reading a frame is not cancel-safe, so a dedicated task owns stdin.
    // Frames after an Execute are held to that execution's limit.
    let (inbox_tx, mut inbox) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut stdin = BufReader::new(io::stdin());
        let mut max_size = DEFAULT_MAX_IPC_MESSAGE_SIZE;
        loop {
            match read_message_with_limit::<ParentMessage, _>(&mut stdin, max_size).await {
                Ok(Some(msg)) => {
                    if let ParentMessage::Execute { limits, .. } = &msg {
                        max_size = limits.max_ipc_message_size;
                    }
                    if inbox_tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = inbox_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut stdout = io::stdout();
    while let Some(msg) = inbox.recv().await {
        match msg.context("failed to read message from host")? {
            ParentMessage::Reset => {
                write_message(&mut stdout, &ChildMessage::ResetComplete).await?;
            }
            ParentMessage::Execute {
                execution_id,
                script,
                bindings,
                limits,
            } => {
                let host_open =
                    run_execution(&mut stdout, &mut inbox, execution_id, script, bindings, limits)
                        .await?;
                if !host_open {
                    break;
                }
            }
            ParentMessage::CallResult { id, .. } => {
                tracing::debug!(id, "call result outside an execution dropped");
            }
        }
    }
    Ok(())
}

/// Run one execution to completion. Returns `false` if the host went away.
async fn run_execution(
    stdout: &mut Stdout,
    inbox: &mut Inbox,
    execution_id: String,
    script: String,
    bindings: SerializedBindings,
    limits: WorkerLimits,
) -> Result<bool> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let bridge: Arc<dyn CallBridge> = Arc::new(IpcCallBridge { events: events_tx });

    let mut done = match spawn_script(limits, script, bindings, bridge) {
        Ok(done) => done,
        Err(e) => {
            let complete = ChildMessage::ExecutionComplete {
                execution_id,
                outcome: Err(ScriptFailure::from(&e)),
                usage: ResourceUsage::default(),
            };
            write_message(stdout, &complete).await?;
            return Ok(true);
        }
    };

    let mut pending = PendingCalls::new();
    let run = loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => match event {
                BridgeEvent::Call { group, method, args, reply } => {
                    let id = pending.register(reply);
                    write_message(stdout, &ChildMessage::CallRequest { id, group, method, args })
                        .await
                        .context("failed to send call request")?;
                }
                BridgeEvent::Log(message) => {
                    write_message(stdout, &ChildMessage::Log { message }).await?;
                }
            },
            msg = inbox.recv() => match msg {
                Some(Ok(ParentMessage::CallResult { id, result })) => {
                    pending.resolve(id, result);
                }
                Some(Ok(other)) => {
                    tracing::warn!(?other, "unexpected message during execution");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "failed to read from host");
                    return Ok(false);
                }
                None => return Ok(false),
            },
            run = &mut done => break run,
        }
    };

    // Logs emitted just before completion still go out; stray calls are abandoned.
    while let Ok(event) = events.try_recv() {
        if let BridgeEvent::Log(message) = event {
            write_message(stdout, &ChildMessage::Log { message }).await?;
        }
    }
    let abandoned = pending.abandon_all();
    if abandoned > 0 {
        tracing::debug!(abandoned, "calls still pending at end of execution");
    }

    let (outcome, usage) = match run {
        Ok(run) => (run.result.map_err(|e| ScriptFailure::from(&e)), run.usage),
        Err(_) => (
            Err(ScriptFailure::from(&codemode_sandbox::SandboxError::WorkerCrashed {
                reason: "isolate thread exited without a result".into(),
            })),
            ResourceUsage::default(),
        ),
    };
    write_message(
        stdout,
        &ChildMessage::ExecutionComplete {
            execution_id,
            outcome,
            usage,
        },
    )
    .await
    .context("failed to send execution result")?;
    Ok(true)
}
