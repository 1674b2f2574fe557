//! Newline-delimited JSON transport between an [`EngineBridge`] and an engine
//! process. One frame per line in each direction.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::EngineBridge;
use crate::error::BridgeError;

/// Connect `bridge` to a reader/writer pair and pump frames until either side
/// closes. EOF or an I/O error resets the bridge, rejecting anything pending.
pub async fn pump<R, W>(bridge: Arc<EngineBridge>, reader: R, mut writer: W)
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    bridge.connect(tx);
    let mut lines = reader.lines();

    let reason = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break "bridge dropped its outbound channel".to_string();
                };
                let written = async {
                    writer.write_all(frame.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    break format!("write to engine failed: {e}");
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        bridge.handle_frame(line);
                    }
                }
                Ok(None) => break "engine closed its output".to_string(),
                Err(e) => break format!("read from engine failed: {e}"),
            },
        }
    };
    bridge.reset(&reason);
}

/// A running engine child process and the task pumping its stdio.
pub struct EngineProcess {
    pub child: Child,
    pub pump: JoinHandle<()>,
}

impl EngineProcess {
    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "engine already exited");
        }
        self.pump.abort();
    }
}

/// Spawn `program` with piped stdio and connect it to `bridge`. The child is
/// killed when the returned handle is dropped.
pub fn spawn_engine(
    program: &str,
    args: &[String],
    bridge: &Arc<EngineBridge>,
) -> Result<EngineProcess, BridgeError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BridgeError::Channel {
            message: format!("failed to start engine '{program}': {e}"),
        })?;

    let missing = |what: &str| BridgeError::Channel {
        message: format!("engine {what} was not captured"),
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "scene_bridge::engine", "{line}");
            }
        });
    }

    tracing::info!(program, pid = child.id(), "engine started");
    let pump = tokio::spawn(pump(Arc::clone(bridge), BufReader::new(stdout), stdin));
    Ok(EngineProcess { child, pump })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::{json, Value};
    use tokio::io::{duplex, split};

    use super::*;
    use crate::bridge::ConnectionStatus;
    use crate::settings::DispatchSettings;

    #[tokio::test]
    async fn frames_cross_the_pipe_both_ways() {
        let bridge = Arc::new(EngineBridge::new(DispatchSettings::default()));
        let (ours, theirs) = duplex(4096);
        let (read_half, write_half) = split(ours);
        let pump_task = tokio::spawn(pump(Arc::clone(&bridge), BufReader::new(read_half), write_half));

        let engine = tokio::spawn(async move {
            let (r, mut w) = split(theirs);
            let mut lines = BufReader::new(r).lines();
            let req: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(req["command"], "get_entity");
            let event = json!({ "eventType": "engine_log", "payload": "hi" });
            let reply = json!({ "correlationId": req["correlationId"], "ok": true, "result": 7 });
            w.write_all(format!("{event}\n\n{reply}\n").as_bytes()).await.unwrap();
            w.flush().await.unwrap();
        });

        while !bridge.is_connected() {
            tokio::task::yield_now().await;
        }
        let mut events = bridge.subscribe();
        let result = bridge.dispatch("get_entity", json!({})).await.unwrap();
        assert_eq!(result, 7);
        assert_eq!(events.recv().await.unwrap().event_type, "engine_log");

        engine.await.unwrap();
        pump_task.await.unwrap();
        assert!(matches!(
            *bridge.connection_status().borrow(),
            ConnectionStatus::Lost { .. }
        ));
    }

    #[tokio::test]
    async fn engine_exit_rejects_pending_commands() {
        let bridge = Arc::new(EngineBridge::new(DispatchSettings::default()));
        let (ours, theirs) = duplex(4096);
        let (read_half, write_half) = split(ours);
        let pump_task = tokio::spawn(pump(Arc::clone(&bridge), BufReader::new(read_half), write_half));
        while !bridge.is_connected() {
            tokio::task::yield_now().await;
        }

        let call = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.dispatch("bake_lighting", json!({})).await }
        });
        // Read the request, then hang up without replying.
        let (r, w) = split(theirs);
        let mut lines = BufReader::new(r).lines();
        lines.next_line().await.unwrap().unwrap();
        drop(lines);
        drop(w);

        let result = call.await.unwrap();
        assert!(matches!(result, Err(BridgeError::ConnectionLost { .. })));
        pump_task.await.unwrap();
        assert_eq!(bridge.pending_count(), 0);
    }
}
