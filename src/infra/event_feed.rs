use crate::domain::ContainerEvent;
use crate::infra::CliRuntime;
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Items delivered by the event feed. An `Err` is terminal: the feed stops
/// after sending it.
pub type FeedItem = Result<ContainerEvent>;

/// One line of `events --format "{{json .}}"`, in either Docker or Podman shape.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", alias = "Status", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: Option<RawActor>,
    #[serde(rename = "ID", default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
}

/// Parses one event line into a container event.
pub fn parse_event(line: &str) -> Result<ContainerEvent> {
    let raw: RawEvent = serde_json::from_str(line).context("parsing runtime event")?;

    let actor_id = raw
        .actor
        .map(|actor| actor.id)
        .filter(|id| !id.is_empty())
        .or(raw.id)
        .unwrap_or_default();

    // Podman reports container exits as "died".
    let action = match raw.action.as_str() {
        "died" => "die".to_string(),
        _ => raw.action,
    };

    Ok(ContainerEvent {
        kind: raw.kind.to_lowercase(),
        action,
        actor_id,
    })
}

impl CliRuntime {
    /// Starts `<runtime> events` and streams parsed events into a channel.
    ///
    /// The child is killed when the token is cancelled. End of stream or a
    /// read failure is sent as a final `Err`.
    pub fn spawn_event_feed(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<FeedItem>> {
        let mut child = Command::new(self.program())
            .args(["events", "--format", "{{json .}}"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting {} events", self.program()))?;

        let stdout = child
            .stdout
            .take()
            .context("event feed has no stdout")?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match parse_event(&line) {
                                Ok(event) => {
                                    if tx.send(Ok(event)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, line = %line, "skipping unreadable event"),
                            }
                        }
                        Ok(None) => {
                            let _ = tx.send(Err(anyhow!("event stream closed"))).await;
                            break;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(anyhow!(e).context("reading event stream"))).await;
                            break;
                        }
                    },
                    _ = cancel.cancelled() => {
                        info!("event feed shutting down");
                        break;
                    }
                }
            }

            if let Err(e) = child.kill().await {
                debug!(error = %e, "event process already exited");
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_event() {
        let line = r#"{"status":"start","id":"abc","Type":"container","Action":"start","Actor":{"ID":"abc","Attributes":{"name":"web"}},"scope":"local","time":1}"#;

        let event = parse_event(line).unwrap();

        assert_eq!(event, ContainerEvent::container("start", "abc"));
    }

    #[test]
    fn test_parse_podman_event() {
        let line = r#"{"ID":"def","Image":"nginx","Name":"web","Status":"died","Time":"2024-01-01T00:00:00Z","Type":"container"}"#;

        let event = parse_event(line).unwrap();

        assert_eq!(event, ContainerEvent::container("die", "def"));
    }

    #[test]
    fn test_parse_non_container_event() {
        let line = r#"{"Type":"network","Action":"connect","Actor":{"ID":"net1"}}"#;

        let event = parse_event(line).unwrap();

        assert!(!event.is_container());
        assert_eq!(event.actor_id, "net1");
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(parse_event("{not json").is_err());
    }

    #[tokio::test]
    async fn test_feed_reports_missing_program() {
        let runtime = CliRuntime::new("registrar-no-such-runtime-binary");

        assert!(runtime.spawn_event_feed(CancellationToken::new()).is_err());
    }
}
