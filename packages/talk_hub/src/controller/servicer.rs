use std::sync::Arc;

use futures::future::BoxFuture;
use talk_store::TalkMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ControllerOptions, Job, Poster, enqueue, log_outcome};
use crate::error::{HubError, Result};
use crate::registry::ServicerMd;
use crate::session::ServicerSession;

/// A command aimed at one talk.
struct TalkCommand {
    talk_id: String,
    session: Arc<ServicerSession>,
}

struct IncomingMessage {
    talk_id: String,
    session: Arc<ServicerSession>,
    seq_id: u64,
    message: TalkMessage,
}

struct Receivers {
    install: mpsc::Receiver<Arc<ServicerSession>>,
    uninstall: mpsc::Receiver<Arc<ServicerSession>>,
    attach: mpsc::Receiver<TalkCommand>,
    detach: mpsc::Receiver<TalkCommand>,
    query_attached: mpsc::Receiver<Arc<ServicerSession>>,
    query_pending: mpsc::Receiver<Arc<ServicerSession>>,
    reload: mpsc::Receiver<TalkCommand>,
    message: mpsc::Receiver<IncomingMessage>,
    post: mpsc::Receiver<Job<ServicerMd>>,
}

/// Command API for servicer sessions.
#[derive(Clone)]
pub struct ServicerController {
    install_tx: mpsc::Sender<Arc<ServicerSession>>,
    uninstall_tx: mpsc::Sender<Arc<ServicerSession>>,
    attach_tx: mpsc::Sender<TalkCommand>,
    detach_tx: mpsc::Sender<TalkCommand>,
    query_attached_tx: mpsc::Sender<Arc<ServicerSession>>,
    query_pending_tx: mpsc::Sender<Arc<ServicerSession>>,
    reload_tx: mpsc::Sender<TalkCommand>,
    message_tx: mpsc::Sender<IncomingMessage>,
    poster: Poster<ServicerMd>,
}

fn talk_command(talk_id: &str, session: Arc<ServicerSession>) -> Result<TalkCommand> {
    if talk_id.is_empty() {
        return Err(HubError::InvalidArgument("talk_id"));
    }
    Ok(TalkCommand {
        talk_id: talk_id.to_string(),
        session,
    })
}

impl ServicerController {
    pub fn spawn(
        mut md: ServicerMd,
        options: ControllerOptions,
        cancel: CancellationToken,
    ) -> Self {
        let cap = options.command_capacity();
        let (install_tx, install) = mpsc::channel(cap);
        let (uninstall_tx, uninstall) = mpsc::channel(cap);
        let (attach_tx, attach) = mpsc::channel(cap);
        let (detach_tx, detach) = mpsc::channel(cap);
        let (query_attached_tx, query_attached) = mpsc::channel(cap);
        let (query_pending_tx, query_pending) = mpsc::channel(cap);
        let (reload_tx, reload) = mpsc::channel(cap);
        let (message_tx, message) = mpsc::channel(options.message_capacity());
        let (poster, post) = Poster::channel(options.message_capacity());

        md.setup(poster.clone());
        tokio::spawn(run(
            md,
            Receivers {
                install,
                uninstall,
                attach,
                detach,
                query_attached,
                query_pending,
                reload,
                message,
                post,
            },
            cancel,
        ));

        Self {
            install_tx,
            uninstall_tx,
            attach_tx,
            detach_tx,
            query_attached_tx,
            query_pending_tx,
            reload_tx,
            message_tx,
            poster,
        }
    }

    pub fn install(&self, session: Arc<ServicerSession>) -> Result<()> {
        enqueue(&self.install_tx, session)
    }

    pub fn uninstall(&self, session: Arc<ServicerSession>) -> Result<()> {
        enqueue(&self.uninstall_tx, session)
    }

    pub fn attach_talk(&self, talk_id: &str, session: Arc<ServicerSession>) -> Result<()> {
        enqueue(&self.attach_tx, talk_command(talk_id, session)?)
    }

    pub fn detach_talk(&self, talk_id: &str, session: Arc<ServicerSession>) -> Result<()> {
        enqueue(&self.detach_tx, talk_command(talk_id, session)?)
    }

    pub fn query_attached_talks(&self, session: Arc<ServicerSession>) -> Result<()> {
        enqueue(&self.query_attached_tx, session)
    }

    pub fn query_pending_talks(&self, session: Arc<ServicerSession>) -> Result<()> {
        enqueue(&self.query_pending_tx, session)
    }

    pub fn reload_talk(&self, session: Arc<ServicerSession>, talk_id: &str) -> Result<()> {
        enqueue(&self.reload_tx, talk_command(talk_id, session)?)
    }

    pub fn incoming_message(
        &self,
        talk_id: &str,
        session: Arc<ServicerSession>,
        seq_id: u64,
        message: TalkMessage,
    ) -> Result<()> {
        let TalkCommand { talk_id, session } = talk_command(talk_id, session)?;
        enqueue(
            &self.message_tx,
            IncomingMessage {
                talk_id,
                session,
                seq_id,
                message,
            },
        )
    }

    pub fn post<F>(&self, job: F)
    where
        F: for<'a> FnOnce(&'a mut ServicerMd) -> BoxFuture<'a, ()> + Send + 'static,
    {
        self.poster.post(job)
    }
}

async fn run(mut md: ServicerMd, mut rx: Receivers, cancel: CancellationToken) {
    debug!("servicer controller started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(session) = rx.install.recv() => log_outcome("install", md.install(session).await),
            Some(session) = rx.uninstall.recv() => log_outcome("uninstall", md.uninstall(&session)),
            Some(cmd) = rx.attach.recv() => {
                log_outcome("attach", md.attach_talk(&cmd.talk_id, &cmd.session).await)
            }
            Some(cmd) = rx.detach.recv() => {
                log_outcome("detach", md.detach_talk(&cmd.talk_id, &cmd.session).await)
            }
            Some(session) = rx.query_attached.recv() => {
                log_outcome("query_attached", md.query_attached_talks(&session).await)
            }
            Some(session) = rx.query_pending.recv() => {
                log_outcome("query_pending", md.query_pending_talks(&session).await)
            }
            Some(cmd) = rx.reload.recv() => {
                log_outcome("reload", md.reload_talk(&cmd.session, &cmd.talk_id).await)
            }
            Some(cmd) = rx.message.recv() => log_outcome(
                "message",
                md.incoming_message(&cmd.talk_id, &cmd.session, cmd.seq_id, cmd.message).await,
            ),
            Some(job) = rx.post.recv() => job(&mut md).await,
            else => break,
        }
    }
    debug!("servicer controller stopped");
}
