//! DAP over stdin/stdout (`--stdio`).

mod dap_client;

use dap_client::wait_for_exit;
use replstalker::dap::io::{read_frame, write_frame};
use serde_json::{json, Value};
use std::io::BufReader;
use std::process::{ChildStdout, Command, Stdio};
use std::time::Duration;

fn read_until(reader: &mut BufReader<ChildStdout>, kind: &str, name: &str) -> anyhow::Result<Value> {
    let key = if kind == "event" { "event" } else { "command" };
    loop {
        let msg = read_frame(reader)?;
        if msg["type"] == kind && msg[key] == name {
            return Ok(msg);
        }
    }
}

#[test]
fn test_stdio_session() -> anyhow::Result<()> {
    let config = tempfile::NamedTempFile::new()?;
    let mut child = Command::new(env!("CARGO_BIN_EXE_replstalker"))
        .arg("--stdio")
        .arg("--config")
        .arg(config.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let mut stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin"))?;
    let mut stdout = BufReader::new(child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout"))?);

    write_frame(
        &mut stdin,
        &json!({"seq": 1, "type": "request", "command": "initialize", "arguments": {"adapterID": "replstalker"}}),
    )?;
    let response = read_until(&mut stdout, "response", "initialize")?;
    assert_eq!(response["success"], true);
    assert_eq!(response["request_seq"], 1);
    read_until(&mut stdout, "event", "initialized")?;

    write_frame(
        &mut stdin,
        &json!({"seq": 2, "type": "request", "command": "disconnect", "arguments": {}}),
    )?;
    let response = read_until(&mut stdout, "response", "disconnect")?;
    assert_eq!(response["success"], true);

    let status = wait_for_exit(&mut child, Duration::from_secs(5))?;
    assert!(status.success());
    Ok(())
}
