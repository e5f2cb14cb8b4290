//! The host refuses calls outside an execution's grant even when the worker
//! asks for them.
//!
//! These tests speak the IPC protocol to a real worker directly, playing the
//! host, so the worker can be handed bindings wider than the host's grant.

use std::process::Stdio;
use std::sync::Arc;

use codemode_sandbox::host::{dispatch_permitted, HostDispatcher};
use codemode_sandbox::ipc::{
    read_message, write_message, ChildMessage, FailureKind, ParentMessage, WorkerLimits,
};
use codemode_sandbox::{capability_fn, CapabilityTable, Grant, SandboxConfig, SerializedBindings};
use serde_json::json;
use serial_test::serial;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

struct RawWorker {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl RawWorker {
    fn spawn() -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_codemode-worker"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        Self {
            _child: child,
            stdin,
            stdout,
        }
    }

    async fn send(&mut self, msg: &ParentMessage) {
        write_message(&mut self.stdin, msg).await.unwrap();
    }

    async fn recv(&mut self) -> ChildMessage {
        read_message(&mut self.stdout).await.unwrap().unwrap()
    }
}

fn limits() -> WorkerLimits {
    WorkerLimits::from(&SandboxConfig::default())
}

#[tokio::test]
#[serial]
async fn reset_is_answered() {
    let mut worker = RawWorker::spawn();
    worker.send(&ParentMessage::Reset).await;
    assert!(matches!(worker.recv().await, ChildMessage::ResetComplete));
}

#[tokio::test]
#[serial]
async fn host_rejects_call_outside_grant() {
    let table = CapabilityTable::new()
        .with("core", "readQuery", capability_fn(|args| async move { Ok(args) }))
        .with("admin", "dropTable", capability_fn(|_| async move { Ok(json!("dropped")) }));
    let granted = SerializedBindings::new().with_group("core", ["readQuery"]);
    let mut host = HostDispatcher::new(Grant::from_bindings(&granted), Arc::new(table), 10, 1024);

    // The worker is told about admin.dropTable; the host never granted it.
    let mut worker = RawWorker::spawn();
    worker
        .send(&ParentMessage::Execute {
            execution_id: "exec-1".into(),
            script: r#"
                try {
                    await admin.dropTable({ table: "users" });
                    return "dropped";
                } catch (e) {
                    return e.message;
                }
            "#
            .into(),
            bindings: granted.clone().with_group("admin", ["dropTable"]),
            limits: limits(),
        })
        .await;

    let ChildMessage::CallRequest {
        id,
        group,
        method,
        args,
    } = worker.recv().await
    else {
        panic!("expected a call request");
    };
    assert_eq!(id, 0);
    assert_eq!(group.as_deref(), Some("admin"));
    assert_eq!(method, "dropTable");

    let err = host.authorize(group.as_deref(), &method, &args).unwrap_err();
    assert_eq!(err.code(), "NOT_PERMITTED");
    assert_eq!(host.calls_made(), 0);
    worker
        .send(&ParentMessage::CallResult {
            id,
            result: Err(err.to_string()),
        })
        .await;

    let ChildMessage::ExecutionComplete {
        execution_id,
        outcome,
        ..
    } = worker.recv().await
    else {
        panic!("expected completion");
    };
    assert_eq!(execution_id, "exec-1");
    assert_eq!(outcome.unwrap(), json!("not permitted: admin.dropTable"));
}

#[tokio::test]
#[serial]
async fn responses_are_matched_by_id_not_arrival_order() {
    let mut worker = RawWorker::spawn();
    worker
        .send(&ParentMessage::Execute {
            execution_id: "exec-2".into(),
            script: r#"
                const [a, b] = await Promise.all([core.first({}), core.second({})]);
                return [a, b];
            "#
            .into(),
            bindings: SerializedBindings::new().with_group("core", ["first", "second"]),
            limits: limits(),
        })
        .await;

    let mut requests = Vec::new();
    for _ in 0..2 {
        match worker.recv().await {
            ChildMessage::CallRequest { id, method, .. } => requests.push((id, method)),
            other => panic!("unexpected: {other:?}"),
        }
    }
    requests.sort();
    assert_eq!(requests[0], (0, "first".to_string()));
    assert_eq!(requests[1], (1, "second".to_string()));

    // Unknown id first, then answer in reverse order.
    worker
        .send(&ParentMessage::CallResult {
            id: 999,
            result: Ok(json!("stray")),
        })
        .await;
    worker
        .send(&ParentMessage::CallResult {
            id: 1,
            result: Ok(json!("two")),
        })
        .await;
    worker
        .send(&ParentMessage::CallResult {
            id: 0,
            result: Ok(json!("one")),
        })
        .await;

    let ChildMessage::ExecutionComplete { outcome, .. } = worker.recv().await else {
        panic!("expected completion");
    };
    assert_eq!(outcome.unwrap(), json!(["one", "two"]));
}

#[tokio::test]
#[serial]
async fn worker_holds_responses_to_the_execution_frame_limit() {
    let mut worker = RawWorker::spawn();
    worker
        .send(&ParentMessage::Execute {
            execution_id: "exec-4".into(),
            script: "return await core.readQuery({});".into(),
            bindings: SerializedBindings::new().with_group("core", ["readQuery"]),
            limits: WorkerLimits {
                max_ipc_message_size: 256,
                ..limits()
            },
        })
        .await;

    let ChildMessage::CallRequest { id, .. } = worker.recv().await else {
        panic!("expected a call request");
    };
    worker
        .send(&ParentMessage::CallResult {
            id,
            result: Ok(json!({ "rows": "x".repeat(1024) })),
        })
        .await;

    // The oversized frame ends the session instead of reaching the script.
    let next = read_message::<ChildMessage, _>(&mut worker.stdout).await;
    assert!(matches!(next, Ok(None) | Err(_)), "got: {next:?}");
}

#[tokio::test]
#[serial]
async fn script_failures_are_classified() {
    let mut worker = RawWorker::spawn();
    worker
        .send(&ParentMessage::Execute {
            execution_id: "exec-3".into(),
            script: r#"throw new TypeError("nope");"#.into(),
            bindings: SerializedBindings::new(),
            limits: limits(),
        })
        .await;

    let ChildMessage::ExecutionComplete { outcome, .. } = worker.recv().await else {
        panic!("expected completion");
    };
    let failure = outcome.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Script);
    assert!(failure.message.contains("nope"), "got: {}", failure.message);

    // The worker takes another execution afterwards.
    worker.send(&ParentMessage::Reset).await;
    assert!(matches!(worker.recv().await, ChildMessage::ResetComplete));
}

#[tokio::test]
async fn dispatch_permitted_reaches_the_capability() {
    let table = CapabilityTable::new().with(
        "core",
        "readQuery",
        capability_fn(|args| async move { Ok(json!({ "echo": args })) }),
    );
    let grant = Grant::from_bindings(&table.serialize());
    let call = grant.authorize(Some("core"), "readQuery").unwrap();

    let result = dispatch_permitted(&table, &call, json!({ "sql": "select 1" })).await;
    assert_eq!(result.unwrap(), json!({ "echo": { "sql": "select 1" } }));
}
