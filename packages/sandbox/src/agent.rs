// ABOUTME: In-sandbox agent protocol for stateful execution
// ABOUTME: Guest-side accept loop, client-side shim transport, and typed reply parsing

use crate::runtime::ContainerRuntime;
use crate::settings::SandboxSettings;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use tracing::{debug, warn};

/// Placeholder substituted with the configured socket path in both the
/// agent program and the client shim
const SOCKET_PLACEHOLDER: &str = "__SCRIBBLE_SOCKET__";

/// Guest program run as the stateful container's command. Binds the
/// well-known Unix socket and serves one connection at a time: read until
/// the peer half-closes, exec the bytes as UTF-8 code against a single
/// persistent namespace, reply with one JSON object, close. No framing;
/// one request per connection.
const AGENT_PROGRAM: &str = r#"
import io, json, os, socket, traceback
from contextlib import redirect_stdout, redirect_stderr

SOCK = "__SCRIBBLE_SOCKET__"
namespace = {"__name__": "__main__"}

try:
    os.unlink(SOCK)
except OSError:
    pass

server = socket.socket(socket.AF_UNIX)
server.bind(SOCK)
server.listen(1)

while True:
    conn, _ = server.accept()
    chunks = []
    while True:
        data = conn.recv(65536)
        if not data:
            break
        chunks.append(data)
    code = b"".join(chunks).decode("utf-8")
    out, err = io.StringIO(), io.StringIO()
    reply = {"ok": True}
    try:
        with redirect_stdout(out), redirect_stderr(err):
            exec(code, namespace)
    except BaseException as exc:
        reply = {"ok": False, "error": repr(exc), "traceback": traceback.format_exc()}
    reply["stdout"] = out.getvalue()
    reply["stderr"] = err.getvalue()
    conn.sendall(json.dumps(reply).encode("utf-8"))
    conn.close()
"#;

/// Client shim executed inside the container. Carries the code payload
/// base64-encoded so arbitrary user text never has to survive quoting.
/// Connects, writes the decoded bytes, half-closes the write side, reads to
/// EOF, and prints the raw reply on stdout for the host side to parse.
const SHIM_PROGRAM: &str = r#"
import base64, socket, sys

s = socket.socket(socket.AF_UNIX)
s.connect("__SCRIBBLE_SOCKET__")
s.sendall(base64.b64decode("__SCRIBBLE_PAYLOAD__"))
s.shutdown(socket.SHUT_WR)
buf = b""
while True:
    data = s.recv(65536)
    if not data:
        break
    buf += data
sys.stdout.buffer.write(buf)
"#;

const PAYLOAD_PLACEHOLDER: &str = "__SCRIBBLE_PAYLOAD__";

/// Parsed agent reply. `Ok` is a completed execution (the guest program may
/// still have printed to stderr); `Err` is a guest exception.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    Ok { stdout: String, stderr: String },
    Err { message: String, trace: String },
}

/// Wire form of the agent response
#[derive(Deserialize)]
struct WireReply {
    ok: bool,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
}

impl AgentReply {
    /// Parse raw reply bytes. Empty or unparsable input yields `None`,
    /// which the orchestrator treats as "agent unavailable", never as a
    /// caller-visible error.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        let wire: WireReply = serde_json::from_slice(raw).ok()?;
        Some(if wire.ok {
            AgentReply::Ok {
                stdout: wire.stdout,
                stderr: wire.stderr,
            }
        } else {
            AgentReply::Err {
                message: wire.error.unwrap_or_else(|| "unknown guest error".to_string()),
                trace: wire.traceback.unwrap_or_default(),
            }
        })
    }
}

/// Command that launches the persistent agent, used as the container cmd in
/// stateful mode
pub fn agent_command(settings: &SandboxSettings) -> Vec<String> {
    vec![
        settings.interpreters[0].clone(),
        "-c".to_string(),
        AGENT_PROGRAM.replace(SOCKET_PLACEHOLDER, &settings.agent_socket),
    ]
}

/// Shim command for one stateful call
pub fn shim_command(settings: &SandboxSettings, interpreter: &str, code: &str) -> Vec<String> {
    let shim = SHIM_PROGRAM
        .replace(SOCKET_PLACEHOLDER, &settings.agent_socket)
        .replace(PAYLOAD_PLACEHOLDER, &BASE64.encode(code));
    vec![interpreter.to_string(), "-c".to_string(), shim]
}

/// Client side of the stateful path
pub struct AgentClient {
    settings: SandboxSettings,
}

impl AgentClient {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    /// Run one code snippet through the in-container agent. Any transport
    /// or protocol failure returns `None` so the caller can demote to the
    /// stateless path without surfacing an error.
    pub async fn call(
        &self,
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        code: &str,
    ) -> Option<AgentReply> {
        let cmd = shim_command(&self.settings, &self.settings.interpreters[0], code);

        let output = match runtime.exec(container_id, cmd).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Agent transport failed for {}: {}", container_id, e);
                return None;
            }
        };

        let reply = AgentReply::parse(&output.stdout);
        if reply.is_none() {
            debug!(
                "Agent reply empty or unparsable for {} (exit {})",
                container_id, output.exit_code
            );
        }
        reply
    }
}
