//! Jupyter kernel server backed by a remote Backend.AI kernel session.

pub mod complete;
pub mod execute;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;
use zeromq::{PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::api::{ApiError, BackendClient, ExecutionResult, RunMode};
use crate::config::Config;
use crate::flavors::Flavor;
use crate::wire::{ConnectionInfo, Message, Signer, PROTOCOL_VERSION};
use complete::CursorContext;
use execute::{run_cell, CellOutcome, CellOutput, CodeRunner, RunFlags};

/// State shared between the shell and control loops.
struct KernelContext {
    session: String,
    signer: Signer,
    flavor: &'static Flavor,
    client: BackendClient,
    kernel_id: String,
    iopub: Mutex<PubSocket>,
    stdin: Mutex<RouterSocket>,
    shutdown: watch::Sender<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    code: String,
    #[serde(default)]
    silent: bool,
    #[serde(default = "yes")]
    store_history: bool,
    #[serde(default = "yes")]
    allow_stdin: bool,
}

fn yes() -> bool {
    true
}

fn to_zmq(frames: Vec<Bytes>) -> Result<ZmqMessage> {
    ZmqMessage::try_from(frames).map_err(|e| anyhow!("{e}"))
}

async fn bind<S: Socket>(mut socket: S, conn: &ConnectionInfo, port: u16) -> Result<S> {
    let endpoint = conn.endpoint(port);
    socket
        .bind(&endpoint)
        .await
        .with_context(|| format!("failed to bind {endpoint}"))?;
    Ok(socket)
}

/// Receive one message, dropping (and logging) anything that does not parse or verify.
async fn recv_message<S: SocketRecv>(socket: &mut S, signer: &Signer) -> Result<Option<Message>> {
    let frames = socket.recv().await?.into_vec();
    match Message::from_frames(frames, signer) {
        Ok(msg) => Ok(Some(msg)),
        Err(e) => {
            tracing::warn!(error = %e, "dropping invalid message");
            Ok(None)
        }
    }
}

async fn send_message<S: SocketSend>(socket: &mut S, msg: Message, signer: &Signer) -> Result<()> {
    socket.send(to_zmq(msg.into_frames(signer)?)?).await?;
    Ok(())
}

pub fn kernel_info_content(flavor: &Flavor) -> Value {
    json!({
        "status": "ok",
        "protocol_version": PROTOCOL_VERSION,
        "implementation": "Backend.AI",
        "implementation_version": env!("CARGO_PKG_VERSION"),
        "language_info": flavor.language_info(),
        "banner": flavor.banner,
        "help_links": [{ "text": "Backend.AI", "url": "https://www.backend.ai" }],
    })
}

pub fn execute_reply_content(execution_count: u64, outcome: &CellOutcome) -> Value {
    match outcome {
        CellOutcome::Finished => json!({
            "status": "ok",
            "execution_count": execution_count,
            "payload": [],
            "user_expressions": {},
        }),
        CellOutcome::Failed { ename, evalue } => json!({
            "status": "error",
            "execution_count": execution_count,
            "ename": ename,
            "evalue": evalue,
            "traceback": [],
        }),
    }
}

pub fn complete_reply_content(ctx: &CursorContext, matches: Vec<String>) -> Value {
    json!({
        "status": "ok",
        "matches": matches,
        "cursor_start": ctx.token_start,
        "cursor_end": ctx.cursor,
        "metadata": {},
    })
}

/// `foo_request` is answered by `foo_reply`.
pub fn reply_type(request_type: &str) -> Option<String> {
    request_type.strip_suffix("_request").map(|base| format!("{base}_reply"))
}

/// Reply content for a request whose handler failed.
pub fn error_reply_content(err: &anyhow::Error, execution_count: u64) -> Value {
    json!({
        "status": "error",
        "execution_count": execution_count,
        "ename": "KernelError",
        "evalue": format!("{err:#}"),
        "traceback": [],
    })
}

impl KernelContext {
    async fn publish(&self, parent: Option<&Message>, msg_type: &str, content: Value) -> Result<()> {
        let mut msg = Message::broadcast(parent, &self.session, msg_type, content);
        msg.identities = vec![Bytes::from(format!("kernel.{}.{}", self.session, msg_type))];
        let frames = msg.into_frames(&self.signer)?;
        self.iopub.lock().await.send(to_zmq(frames)?).await?;
        Ok(())
    }

    async fn publish_status(&self, parent: Option<&Message>, state: &str) -> Result<()> {
        self.publish(parent, "status", json!({ "execution_state": state })).await
    }

    fn reply(&self, parent: &Message, msg_type: &str, content: Value) -> Message {
        Message::reply(parent, &self.session, msg_type, content)
    }

    async fn interrupt(&self, req: &Message) -> Message {
        let status = match self.client.interrupt(&self.kernel_id).await {
            Ok(()) => "ok",
            Err(e) => {
                tracing::error!(error = %e, "interrupt failed");
                "error"
            }
        };
        self.reply(req, "interrupt_reply", json!({ "status": status }))
    }

    /// Destroys the remote kernel. Jupyter restarts by shutting down and
    /// launching a fresh process, so `restart` only echoes back.
    async fn shutdown(&self, req: &Message) -> Message {
        let restart = req.content.get("restart").and_then(Value::as_bool).unwrap_or(false);
        match self.client.destroy(&self.kernel_id).await {
            Ok(()) => tracing::info!(kernel_id = %self.kernel_id, "remote kernel destroyed"),
            Err(e) if e.is_not_found() => tracing::warn!("shutdown: missing kernel, ignoring"),
            Err(e) => tracing::error!(error = %e, "shutdown: API returned an error"),
        }
        self.reply(req, "shutdown_reply", json!({ "status": "ok", "restart": restart }))
    }

    async fn complete(&self, req: &Message) -> Message {
        let code = req.content.get("code").and_then(Value::as_str).unwrap_or_default();
        let cursor_pos = req
            .content
            .get("cursor_pos")
            .and_then(Value::as_u64)
            .map(|p| p as usize)
            .unwrap_or_else(|| code.chars().count());
        let ctx = CursorContext::parse(code, cursor_pos);
        let matches = match self.client.complete(&self.kernel_id, &ctx.code, &ctx.options()).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "completion failed");
                Vec::new()
            }
        };
        self.reply(req, "complete_reply", complete_reply_content(&ctx, matches))
    }

    async fn execute_cell(&self, req: &Message, execution_count: &mut u64) -> Result<Message> {
        let request: ExecuteRequest =
            serde_json::from_value(req.content.clone()).context("malformed execute_request")?;
        let store = request.store_history && !request.silent;
        if store {
            *execution_count += 1;
        }
        let count = *execution_count;
        if !request.silent {
            self.publish(
                Some(req),
                "execute_input",
                json!({ "code": request.code, "execution_count": count }),
            )
            .await?;
        }

        let mut channel = CellChannel { ctx: self, parent: req };
        let flags = RunFlags { silent: request.silent, allow_stdin: request.allow_stdin };
        // Failures were already written to stderr by the loop.
        let outcome = run_cell(self, &mut channel, &request.code, flags).await?;
        Ok(self.reply(req, "execute_reply", execute_reply_content(count, &outcome)))
    }

    /// Requests valid on both the shell and the control channel.
    async fn handle_common(&self, req: &Message) -> Option<(Message, Flow)> {
        match req.msg_type() {
            "kernel_info_request" => Some((
                self.reply(req, "kernel_info_reply", kernel_info_content(self.flavor)),
                Flow::Continue,
            )),
            "interrupt_request" => Some((self.interrupt(req).await, Flow::Continue)),
            "shutdown_request" => Some((self.shutdown(req).await, Flow::Stop)),
            _ => None,
        }
    }
}

impl CodeRunner for KernelContext {
    async fn execute(
        &self,
        run_id: Option<&str>,
        code: &str,
        mode: RunMode,
    ) -> Result<ExecutionResult, ApiError> {
        self.client.execute(&self.kernel_id, run_id, code, mode).await
    }
}

/// Routes one cell's output to iopub and its input prompts to stdin.
struct CellChannel<'a> {
    ctx: &'a KernelContext,
    parent: &'a Message,
}

impl CellOutput for CellChannel<'_> {
    async fn stream(&mut self, name: &str, text: &str) -> Result<()> {
        self.ctx
            .publish(Some(self.parent), "stream", json!({ "name": name, "text": text }))
            .await
    }

    async fn display(&mut self, data: Value) -> Result<()> {
        self.ctx
            .publish(Some(self.parent), "display_data", json!({ "data": data, "metadata": {} }))
            .await
    }

    async fn input(&mut self, prompt: &str) -> Result<String> {
        let request = self.ctx.reply(
            self.parent,
            "input_request",
            json!({ "prompt": prompt, "password": false }),
        );
        let mut stdin = self.ctx.stdin.lock().await;
        send_message(&mut *stdin, request, &self.ctx.signer).await?;
        loop {
            let Some(msg) = recv_message(&mut *stdin, &self.ctx.signer).await? else {
                continue;
            };
            if msg.msg_type() == "input_reply" {
                let value = msg.content.get("value").and_then(Value::as_str).unwrap_or_default();
                return Ok(value.to_string());
            }
            tracing::warn!(msg_type = %msg.msg_type(), "unexpected message on stdin");
        }
    }
}

async fn heartbeat(mut socket: RepSocket) -> Result<()> {
    loop {
        let ping = socket.recv().await?;
        socket.send(ping).await?;
    }
}

async fn serve_control(ctx: Arc<KernelContext>, mut socket: RouterSocket) -> Result<()> {
    loop {
        let Some(req) = recv_message(&mut socket, &ctx.signer).await? else {
            continue;
        };
        tracing::debug!(msg_type = %req.msg_type(), "control request");
        ctx.publish_status(Some(&req), "busy").await?;
        let handled = ctx.handle_common(&req).await;
        let flow = match handled {
            Some((reply, flow)) => {
                send_message(&mut socket, reply, &ctx.signer).await?;
                flow
            }
            None => {
                tracing::warn!(msg_type = %req.msg_type(), "unsupported control request");
                Flow::Continue
            }
        };
        ctx.publish_status(Some(&req), "idle").await?;
        if flow == Flow::Stop {
            // The main task exits on this, so it goes last.
            let _ = ctx.shutdown.send(true);
            return Ok(());
        }
    }
}

async fn handle_shell(
    ctx: &KernelContext,
    req: &Message,
    execution_count: &mut u64,
) -> Result<Option<(Message, Flow)>> {
    if let Some(handled) = ctx.handle_common(req).await {
        return Ok(Some(handled));
    }
    let reply = match req.msg_type() {
        "execute_request" => ctx.execute_cell(req, execution_count).await?,
        "complete_request" => ctx.complete(req).await,
        "is_complete_request" => ctx.reply(req, "is_complete_reply", json!({ "status": "unknown" })),
        "inspect_request" => ctx.reply(
            req,
            "inspect_reply",
            json!({ "status": "ok", "found": false, "data": {}, "metadata": {} }),
        ),
        "history_request" => ctx.reply(req, "history_reply", json!({ "status": "ok", "history": [] })),
        "comm_info_request" => ctx.reply(req, "comm_info_reply", json!({ "status": "ok", "comms": {} })),
        "comm_open" | "comm_msg" | "comm_close" => return Ok(None),
        other => {
            tracing::warn!(msg_type = %other, "unsupported shell request");
            return Ok(None);
        }
    };
    Ok(Some((reply, Flow::Continue)))
}

async fn serve_shell(ctx: &KernelContext, socket: &mut RouterSocket) -> Result<()> {
    let mut execution_count = 0u64;
    loop {
        let Some(req) = recv_message(socket, &ctx.signer).await? else {
            continue;
        };
        tracing::debug!(msg_type = %req.msg_type(), "shell request");
        ctx.publish_status(Some(&req), "busy").await?;
        let reply = match handle_shell(ctx, &req, &mut execution_count).await {
            Ok(handled) => handled,
            Err(e) => {
                tracing::error!(error = %e, msg_type = %req.msg_type(), "request failed");
                reply_type(req.msg_type()).map(|msg_type| {
                    let content = error_reply_content(&e, execution_count);
                    (ctx.reply(&req, &msg_type, content), Flow::Continue)
                })
            }
        };
        let flow = match reply {
            Some((reply, flow)) => {
                send_message(socket, reply, &ctx.signer).await?;
                flow
            }
            None => Flow::Continue,
        };
        ctx.publish_status(Some(&req), "idle").await?;
        if flow == Flow::Stop {
            return Ok(());
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub async fn run(cfg: &Config, connection_file: &Path, flavor: &'static Flavor) -> Result<()> {
    let conn = ConnectionInfo::from_file(connection_file)
        .with_context(|| format!("loading {}", connection_file.display()))?;
    let signer = conn.signer()?;
    let client = BackendClient::from_config(cfg)?;
    let session = Uuid::new_v4().to_string();
    tracing::info!(%session, flavor = flavor.name, "Backend.AI kernel starting");

    let mut shell = bind(RouterSocket::new(), &conn, conn.shell_port).await?;
    let control = bind(RouterSocket::new(), &conn, conn.control_port).await?;
    let stdin = bind(RouterSocket::new(), &conn, conn.stdin_port).await?;
    let iopub = bind(PubSocket::new(), &conn, conn.iopub_port).await?;
    let hb = bind(RepSocket::new(), &conn, conn.hb_port).await?;

    let remote = client
        .get_or_create(flavor.backend_lang, &session)
        .await
        .with_context(|| format!("creating a {} kernel on Backend.AI", flavor.backend_lang))?;
    tracing::info!(kernel_id = %remote.kernel_id, created = remote.created, "remote kernel ready");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(KernelContext {
        session,
        signer,
        flavor,
        client,
        kernel_id: remote.kernel_id,
        iopub: Mutex::new(iopub),
        stdin: Mutex::new(stdin),
        shutdown,
    });
    ctx.publish_status(None, "starting").await?;

    let hb_task = tokio::spawn(heartbeat(hb));
    let control_task = tokio::spawn(serve_control(ctx.clone(), control));

    let result = tokio::select! {
        r = serve_shell(&ctx, &mut shell) => r,
        _ = wait_for_shutdown(shutdown_rx) => Ok(()),
    };

    hb_task.abort();
    control_task.abort();
    tracing::info!("kernel stopped");
    result
}
