//! A minimal MCP stdio server used only by the concurrency boundary test in
//! `tests/mcp_boundary.rs`. Speaks the MCP JSON-RPC wire protocol directly
//! instead of depending on an MCP SDK's server-side API, the same technique
//! the coordinator's own connection actor is tested against: newline-framed
//! JSON on stdin/stdout, dispatched per request onto its own task so many
//! `tools/call` requests are genuinely in flight at once rather than
//! processed one at a time.

use std::sync::Arc;

use serde_json::{
    Value,
    json,
};
use tokio::io::{
    AsyncBufReadExt as _,
    AsyncWriteExt as _,
    BufReader,
};
use tokio::sync::Mutex;

#[tokio::main]
async fn main() {
    let stdin = tokio::io::stdin();
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let stdout = Arc::clone(&stdout);
        tokio::spawn(async move {
            if let Some(response) = handle(msg).await {
                send(&stdout, &response).await;
            }
        });
    }
}

async fn handle(msg: Value) -> Option<Value> {
    let method = msg.get("method").and_then(Value::as_str)?;
    let id = msg.get("id").cloned();

    match method {
        "initialize" => {
            let protocol_version = msg
                .get("params")
                .and_then(|p| p.get("protocolVersion"))
                .cloned()
                .unwrap_or_else(|| json!("2024-11-05"));
            Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": protocol_version,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fake-mcp-server", "version": "0.0.0" }
                }
            }))
        },
        "tools/list" => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [{
                    "name": "echo",
                    "description": "echoes the message argument back to the caller",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "message": { "type": "string" } }
                    }
                }]
            }
        })),
        "tools/call" => {
            let params = msg.get("params").cloned().unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let message = params
                .get("arguments")
                .and_then(|a| a.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("no message")
                .to_string();

            // A short sleep so 100 in-flight calls actually overlap instead
            // of completing in submission order — this is the property the
            // concurrency test is checking on the client side.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            if name == "echo" {
                Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{ "type": "text", "text": message }],
                        "isError": false
                    }
                }))
            } else {
                Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{ "type": "text", "text": format!("unknown tool: {name}") }],
                        "isError": true
                    }
                }))
            }
        },
        // Notifications (`notifications/initialized`, `ping` without an id,
        // cancellation, ...) get no reply.
        _ => None,
    }
}

async fn send(stdout: &Arc<Mutex<tokio::io::Stdout>>, msg: &Value) {
    let mut line = serde_json::to_vec(msg).expect("message must serialize");
    line.push(b'\n');
    let mut stdout = stdout.lock().await;
    let _ = stdout.write_all(&line).await;
    let _ = stdout.flush().await;
}
