//! Cooperative run loop.
//!
//! [`BackupStateMachine::run`] turns the poll-driven machine into a
//! long-lived task: it sleeps until the next poll or keep-alive deadline,
//! wakes early for requestor commands, and stops when the command channel
//! closes. Commands carry an optional reply channel so a transport can
//! hand the `(message, success)` pair straight back to the requestor.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::BackupStateMachine;
use crate::command::{BackupCommand, CommandReply};

/// One requestor command plus an optional reply channel
pub struct CommandRequest {
    /// The parsed command
    pub command: BackupCommand,
    /// Where the wire reply goes, if the transport wants one
    pub reply: Option<oneshot::Sender<CommandReply>>,
}

impl CommandRequest {
    /// Fire-and-forget request
    pub fn new(command: BackupCommand) -> Self {
        Self {
            command,
            reply: None,
        }
    }

    /// Request plus the receiver the transport awaits the reply on
    pub fn with_reply(command: BackupCommand) -> (Self, oneshot::Receiver<CommandReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }
}

impl BackupStateMachine {
    /// Drive the machine until the command channel closes.
    ///
    /// While idle, only a command can wake the loop; while a cycle is
    /// active it also wakes for poll ticks and keep-alive deadlines.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CommandRequest>) {
        loop {
            let wait = match self.next_poll_in() {
                None => {
                    match commands.recv().await {
                        Some(request) => {
                            self.serve(request).await;
                            continue;
                        }
                        None => break,
                    }
                }
                Some(poll_in) => poll_in.min(self.keep_alive.remaining()),
            };

            tokio::select! {
                maybe_request = commands.recv() => match maybe_request {
                    Some(request) => self.serve(request).await,
                    None => break,
                },
                _ = tokio::time::sleep(wait) => {
                    if let Err(err) = self.keep_alive_tick().await {
                        error!(error = %err, "failed to send keep-alive");
                    }
                    if let Err(err) = self.poll_tick().await {
                        error!(error = %err, "poll tick failed");
                    }
                }
            }
        }
        debug!("command channel closed, backup engine stopping");
    }

    async fn serve(&mut self, request: CommandRequest) {
        let reply = self.handle_command(request.command).await;
        if let Some(tx) = request.reply {
            // The transport may have gone away; nothing to do about it.
            let _ = tx.send(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use crate::event::channel_sink;
    use crate::provider::NullSyncProvider;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_replies_and_stops_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackupConfig::new(dir.path())
            .with_poll_period_active(Duration::from_millis(2))
            .with_poll_period_idle(Duration::from_millis(2));
        let (sink, _events) = channel_sink();
        let machine =
            BackupStateMachine::new(config, Box::new(NullSyncProvider), Box::new(sink));

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(machine.run(rx));

        let (request, reply) = CommandRequest::with_reply(BackupCommand::Abort);
        tx.send(request).await.unwrap();
        let reply = reply.await.unwrap();
        assert!(!reply.success);
        assert_eq!(reply.message, "no backup in progress");

        drop(tx);
        task.await.unwrap();
    }
}
