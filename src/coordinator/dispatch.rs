use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::ClusterNode;
use crate::errors::{BackupError, Result};
use crate::request::OperationRequest;

/// Delivers a node-scoped request to one cluster member and waits for it to finish.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    async fn dispatch(&self, node: &ClusterNode, request: &OperationRequest) -> Result<()>;
}

/// Runs a configured command per node, for example
/// `["ssh", "{address}", "cassandratool", "{operation}", "-"]`, with the request
/// JSON on stdin. A zero exit status is success.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    command: Vec<String>,
}

impl CommandDispatcher {
    pub fn new(command: Vec<String>) -> Self {
        CommandDispatcher { command }
    }

    fn render(&self, node: &ClusterNode, operation: &str) -> Vec<String> {
        let address = node.address.as_deref().unwrap_or(&node.node_id);
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{node}", &node.node_id)
                    .replace("{address}", address)
                    .replace("{datacenter}", &node.datacenter)
                    .replace("{operation}", operation)
            })
            .collect()
    }
}

#[async_trait]
impl NodeDispatcher for CommandDispatcher {
    async fn dispatch(&self, node: &ClusterNode, request: &OperationRequest) -> Result<()> {
        let failed = |reason: String| BackupError::Dispatch {
            node: node.node_id.clone(),
            reason,
        };

        let argv = self.render(node, request.kind());
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| failed("dispatch command is empty".to_string()))?;
        let payload = request.to_json()?;

        tracing::debug!(node = %node.node_id, program = %program, "Dispatching request");
        // Dropping the child on a missed deadline kills it.
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("failed to start {program}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(payload.as_bytes()).await {
                Ok(()) => {}
                // The command did not read its input; its exit status decides.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(failed(format!("failed to send request: {e}"))),
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failed(format!("failed to wait for {program}: {e}")))?;
        if !output.status.success() {
            return Err(failed(format!(
                "{program} failed with status: {}\nStderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(
            node = %node.node_id,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "Node reported success"
        );
        Ok(())
    }
}
