//! Runs a [`ChatSession`] on its own task.
//!
//! The task is the only owner of the session. Commands from any number of
//! [`SessionHandle`] clones, inbound transport events, connection changes
//! and scheduled tasks are all funnelled into one `select!` loop and
//! applied one at a time.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use veilchat_shared::api::message::UnreadOverview;
use veilchat_shared::api::ws::ServerEvent;
use veilchat_shared::ids::{MessageId, UserId};

use super::observe::SessionView;
use super::scheduler::SessionTask;
use super::ChatSession;
use crate::error::ClientError;

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum SessionCommand {
    Init { peer: UserId, reply: Reply<()> },
    Send { text: String, reply: Reply<()> },
    Edit { id: MessageId, text: String, reply: Reply<()> },
    Delete { id: MessageId, reply: Reply<()> },
    Typing,
    RegenerateKeys { reply: Reply<()> },
    Sync { reply: Reply<bool> },
    UnreadOverview { reply: Reply<Vec<UnreadOverview>> },
    Shutdown,
}

/// Cloneable front end to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    view: SessionView,
}

/// Move `session` onto a new task.
///
/// `tasks` is the receiver returned by [`ChatSession::new`]; `events` carries
/// inbound transport events.
pub fn spawn_session(
    mut session: ChatSession,
    mut tasks: mpsc::UnboundedReceiver<SessionTask>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, mut commands) = mpsc::channel(COMMAND_BUFFER);
    let view = session.view();
    let mut connection = view.connection.clone();
    let handle = SessionHandle { commands: tx, view };

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(cmd) => dispatch(&mut session, cmd).await,
                },
                Some(event) = events.recv() => session.handle_event(event).await,
                Some(task) = tasks.recv() => session.handle_task(task).await,
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connection.borrow_and_update();
                    session.on_connection_change(state).await;
                }
            }
        }
        session.shutdown();
        tracing::debug!(user_id = %session.me(), "session task stopped");
    });

    (handle, join)
}

async fn dispatch(session: &mut ChatSession, cmd: SessionCommand) {
    match cmd {
        SessionCommand::Init { peer, reply } => {
            let _ = reply.send(session.init(peer).await);
        }
        SessionCommand::Send { text, reply } => {
            let _ = reply.send(session.send(&text).await);
        }
        SessionCommand::Edit { id, text, reply } => {
            let _ = reply.send(session.edit(id, &text).await);
        }
        SessionCommand::Delete { id, reply } => {
            let _ = reply.send(session.delete(id).await);
        }
        SessionCommand::Typing => session.send_typing().await,
        SessionCommand::RegenerateKeys { reply } => {
            let _ = reply.send(session.regenerate_keys().await);
        }
        SessionCommand::Sync { reply } => {
            let _ = reply.send(session.perform_fallback_sync().await);
        }
        SessionCommand::UnreadOverview { reply } => {
            let _ = reply.send(Ok(session.unread_overview().await));
        }
        SessionCommand::Shutdown => {}
    }
}

impl SessionHandle {
    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub async fn init(&self, peer: UserId) -> Result<(), ClientError> {
        self.request(|reply| SessionCommand::Init { peer, reply }).await
    }

    pub async fn send(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| SessionCommand::Send { text, reply }).await
    }

    pub async fn edit(&self, id: MessageId, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| SessionCommand::Edit { id, text, reply }).await
    }

    pub async fn delete(&self, id: MessageId) -> Result<(), ClientError> {
        self.request(|reply| SessionCommand::Delete { id, reply }).await
    }

    pub async fn typing(&self) -> Result<(), ClientError> {
        self.commands
            .send(SessionCommand::Typing)
            .await
            .map_err(|_| ClientError::SessionClosed)
    }

    pub async fn regenerate_keys(&self) -> Result<(), ClientError> {
        self.request(|reply| SessionCommand::RegenerateKeys { reply }).await
    }

    /// Run a reconciliation pass now. Returns whether the list changed.
    pub async fn sync(&self) -> Result<bool, ClientError> {
        self.request(|reply| SessionCommand::Sync { reply }).await
    }

    pub async fn unread_overview(&self) -> Result<Vec<UnreadOverview>, ClientError> {
        self.request(|reply| SessionCommand::UnreadOverview { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }
}
