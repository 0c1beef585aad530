//! Runs a [`CertificateManager`] as a single task that owns it
//!
//! Watch [`Event`]s and requests from [`CertificateManagerHandle`]s are processed strictly one at
//! a time, so the manager's indexes never need any locking.

use std::{future::Future, pin::pin};

use futures::{Stream, StreamExt};
use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::{
    manager::{self, CertificateManager, Event, LeafRequest},
    store::CertificateStore,
};

type Reply = oneshot::Sender<Result<(), manager::Error>>;

#[derive(Debug)]
pub enum Command {
    EnsureCa {
        namespace: String,
        name: String,
        subject: String,
        owner_references: Vec<OwnerReference>,
        reply: Reply,
    },
    Ensure {
        namespace: String,
        name: String,
        request: LeafRequest,
        owner_references: Vec<OwnerReference>,
        reply: Reply,
    },
}

#[derive(Debug, Snafu)]
pub enum HandleError {
    #[snafu(display("certificate manager is no longer running"))]
    Stopped,

    #[snafu(display("failed to ensure Certificate"))]
    Ensure { source: manager::Error },
}

/// A cloneable way to declare Certificates from other tasks.
#[derive(Clone, Debug)]
pub struct CertificateManagerHandle {
    commands: mpsc::Sender<Command>,
}

impl CertificateManagerHandle {
    /// See [`CertificateManager::ensure_ca`].
    pub async fn ensure_ca(
        &self,
        namespace: &str,
        name: &str,
        subject: &str,
        owner_references: Vec<OwnerReference>,
    ) -> Result<(), HandleError> {
        self.call(|reply| Command::EnsureCa {
            namespace: namespace.to_string(),
            name: name.to_string(),
            subject: subject.to_string(),
            owner_references,
            reply,
        })
        .await
    }

    /// See [`CertificateManager::ensure`].
    pub async fn ensure(
        &self,
        namespace: &str,
        name: &str,
        request: LeafRequest,
        owner_references: Vec<OwnerReference>,
    ) -> Result<(), HandleError> {
        self.call(|reply| Command::Ensure {
            namespace: namespace.to_string(),
            name: name.to_string(),
            request,
            owner_references,
            reply,
        })
        .await
    }

    async fn call(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), HandleError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| HandleError::Stopped)?;
        response
            .await
            .map_err(|_| HandleError::Stopped)?
            .context(EnsureSnafu)
    }
}

/// Creates a handle, and the receiver that must be passed to [`run`].
pub fn channel(buffer: usize) -> (CertificateManagerHandle, mpsc::Receiver<Command>) {
    let (commands, receiver) = mpsc::channel(buffer);
    (CertificateManagerHandle { commands }, receiver)
}

/// Drives `manager` until `shutdown` completes or `events` ends, returning it afterwards.
pub async fn run<S: CertificateStore>(
    mut manager: CertificateManager<S>,
    events: impl Stream<Item = Event>,
    mut commands: mpsc::Receiver<Command>,
    shutdown: impl Future<Output = ()>,
) -> CertificateManager<S> {
    let mut events = pin!(events);
    let mut shutdown = pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutting down certificate manager");
                break;
            }
            Some(command) = commands.recv() => execute(&mut manager, command).await,
            event = events.next() => match event {
                Some(event) => {
                    let key = event.key().clone();
                    if let Err(err) = manager.handle(event).await {
                        warn!(
                            object = %key,
                            error = &err as &dyn std::error::Error,
                            "failed to handle event"
                        );
                    }
                }
                None => {
                    warn!("event stream ended, stopping certificate manager");
                    break;
                }
            },
        }
    }
    manager
}

async fn execute<S: CertificateStore>(manager: &mut CertificateManager<S>, command: Command) {
    let (result, reply) = match command {
        Command::EnsureCa {
            namespace,
            name,
            subject,
            owner_references,
            reply,
        } => (
            manager
                .ensure_ca(&namespace, &name, &subject, &owner_references)
                .await,
            reply,
        ),
        Command::Ensure {
            namespace,
            name,
            request,
            owner_references,
            reply,
        } => (
            manager
                .ensure(&namespace, &name, request, &owner_references)
                .await,
            reply,
        ),
    };
    // The caller may have given up waiting
    let _ = reply.send(result);
}
