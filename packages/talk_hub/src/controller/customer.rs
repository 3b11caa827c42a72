use std::sync::Arc;

use futures::future::BoxFuture;
use talk_store::TalkMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ControllerOptions, Job, Poster, enqueue, log_outcome};
use crate::error::{HubError, Result};
use crate::registry::CustomerMd;
use crate::session::CustomerSession;

struct IncomingMessage {
    session: Arc<CustomerSession>,
    seq_id: u64,
    message: TalkMessage,
}

struct Receivers {
    install: mpsc::Receiver<Arc<CustomerSession>>,
    uninstall: mpsc::Receiver<Arc<CustomerSession>>,
    close: mpsc::Receiver<Arc<CustomerSession>>,
    message: mpsc::Receiver<IncomingMessage>,
    post: mpsc::Receiver<Job<CustomerMd>>,
}

/// Command API for customer sessions.
#[derive(Clone)]
pub struct CustomerController {
    install_tx: mpsc::Sender<Arc<CustomerSession>>,
    uninstall_tx: mpsc::Sender<Arc<CustomerSession>>,
    close_tx: mpsc::Sender<Arc<CustomerSession>>,
    message_tx: mpsc::Sender<IncomingMessage>,
    poster: Poster<CustomerMd>,
}

fn validate(session: &CustomerSession) -> Result<()> {
    if session.talk_id.is_empty() {
        return Err(HubError::InvalidArgument("talk_id"));
    }
    Ok(())
}

impl CustomerController {
    /// Wire `md` to its distribution and start the controller task. The task
    /// runs until `cancel` fires.
    pub fn spawn(
        mut md: CustomerMd,
        options: ControllerOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (install_tx, install) = mpsc::channel(options.command_capacity());
        let (uninstall_tx, uninstall) = mpsc::channel(options.command_capacity());
        let (close_tx, close) = mpsc::channel(options.command_capacity());
        let (message_tx, message) = mpsc::channel(options.message_capacity());
        let (poster, post) = Poster::channel(options.message_capacity());

        md.setup(poster.clone());
        tokio::spawn(run(
            md,
            Receivers {
                install,
                uninstall,
                close,
                message,
                post,
            },
            cancel,
        ));

        Self {
            install_tx,
            uninstall_tx,
            close_tx,
            message_tx,
            poster,
        }
    }

    pub fn install(&self, session: Arc<CustomerSession>) -> Result<()> {
        validate(&session)?;
        enqueue(&self.install_tx, session)
    }

    pub fn uninstall(&self, session: Arc<CustomerSession>) -> Result<()> {
        validate(&session)?;
        enqueue(&self.uninstall_tx, session)
    }

    /// Close the session's talk for everyone.
    pub fn close(&self, session: Arc<CustomerSession>) -> Result<()> {
        validate(&session)?;
        enqueue(&self.close_tx, session)
    }

    pub fn incoming_message(
        &self,
        session: Arc<CustomerSession>,
        seq_id: u64,
        message: TalkMessage,
    ) -> Result<()> {
        validate(&session)?;
        enqueue(
            &self.message_tx,
            IncomingMessage {
                session,
                seq_id,
                message,
            },
        )
    }

    pub fn post<F>(&self, job: F)
    where
        F: for<'a> FnOnce(&'a mut CustomerMd) -> BoxFuture<'a, ()> + Send + 'static,
    {
        self.poster.post(job)
    }
}

async fn run(mut md: CustomerMd, mut rx: Receivers, cancel: CancellationToken) {
    debug!("customer controller started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(session) = rx.install.recv() => log_outcome("install", md.install(session).await),
            Some(session) = rx.uninstall.recv() => log_outcome("uninstall", md.uninstall(&session)),
            Some(session) = rx.close.recv() => log_outcome("close", md.close(&session).await),
            Some(cmd) = rx.message.recv() => log_outcome(
                "message",
                md.incoming_message(&cmd.session, cmd.seq_id, cmd.message).await,
            ),
            Some(job) = rx.post.recv() => job(&mut md).await,
            else => break,
        }
    }
    debug!("customer controller stopped");
}
