//! Confinement of the encoder session to a single thread.
//!
//! Every operation on the session travels as a [`Command`] to the
//! `encoder-session` thread, which owns the [`EncoderSession`] and runs a
//! current-thread tokio runtime. Completions never come back through this
//! queue: handles emit into an [`OutputSink`] drained by the
//! `encoder-output` pump thread straight into the hub.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use transcode_encode::{EncoderBackend, EncoderConfig, OutputSink};
use transcode_media::{EncoderOutput, RawFrame};

use crate::hub::BroadcastHub;
use crate::session::{EncoderSession, InvalidationCause, SessionState, SessionStats};
use crate::trigger::TriggerListener;
use crate::SessionError;

/// Requests handled on the session thread.
#[derive(Debug)]
pub(crate) enum Command {
    /// Encode one frame, recreating the handle if needed.
    PushFrame {
        frame: RawFrame,
        presentation_time: Duration,
        duration: Option<Duration>,
        reply: oneshot::Sender<()>,
    },
    /// Replace the configuration.
    SetConfiguration {
        config: EncoderConfig,
        reply: oneshot::Sender<()>,
    },
    /// Mark the live handle for replacement.
    Invalidate { reply: oneshot::Sender<()> },
    /// Force the next submitted frame to be a keyframe.
    RequestKeyframe { reply: oneshot::Sender<()> },
    State { reply: oneshot::Sender<SessionState> },
    Configuration { reply: oneshot::Sender<EncoderConfig> },
    Stats { reply: oneshot::Sender<SessionStats> },
    /// Destroy the handle and stop the thread.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Caller side of the confinement queue.
#[derive(Debug)]
pub(crate) struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Start the session and pump threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built or a thread cannot
    /// be spawned.
    pub(crate) fn spawn<B: EncoderBackend>(
        backend: B,
        config: EncoderConfig,
        trigger: TriggerListener,
        hub: Arc<BroadcastHub>,
    ) -> Result<Self, SessionError> {
        let (sink, outputs) = OutputSink::channel();

        let pump = std::thread::Builder::new()
            .name("encoder-output".into())
            .spawn(move || run_pump(outputs, &hub))
            .map_err(|source| SessionError::SpawnThread {
                name: "encoder-output",
                source,
            })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SessionError::Runtime)?;

        let (commands, rx) = mpsc::unbounded_channel();
        let session = EncoderSession::new(backend, config, sink);

        // If the spawn fails the closure drops the session and its sink,
        // which lets the pump close the hub and exit.
        let worker = std::thread::Builder::new()
            .name("encoder-session".into())
            .spawn(move || runtime.block_on(run_session(session, rx, trigger)))
            .map_err(|source| SessionError::SpawnThread {
                name: "encoder-session",
                source,
            })?;

        Ok(Self {
            commands,
            threads: Mutex::new(vec![worker, pump]),
        })
    }

    /// Send a command built around a reply channel and await the reply.
    pub(crate) async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Blocking variant of [`call`](Worker::call). Panics if called from
    /// within an async runtime.
    pub(crate) fn blocking_call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.blocking_recv().map_err(|_| SessionError::Closed)
    }

    /// Wait for both threads to exit.
    pub(crate) fn join(&self) {
        let threads = std::mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("Encoder thread panicked");
            }
        }
    }
}

async fn run_session<B: EncoderBackend>(
    mut session: EncoderSession<B>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut trigger: TriggerListener,
) {
    tracing::debug!(attached = trigger.is_attached(), "Encoder session thread started");

    let shutdown_reply = loop {
        tokio::select! {
            biased;

            () = trigger.fired() => {
                session.invalidate(InvalidationCause::External);
            }
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => break Some(reply),
                Some(command) => handle(&mut session, command),
                None => {
                    tracing::debug!("Encoder controller dropped");
                    break None;
                }
            },
        }
    };

    session.shutdown();
    let stats = session.stats().clone();
    drop(session);
    drop(trigger);

    tracing::info!(
        created = stats.handles_created,
        submitted = stats.frames_submitted,
        dropped = stats.frames_dropped,
        "Encoder session stopped"
    );

    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

fn handle<B: EncoderBackend>(session: &mut EncoderSession<B>, command: Command) {
    match command {
        Command::PushFrame {
            frame,
            presentation_time,
            duration,
            reply,
        } => {
            session.encode(&frame, presentation_time, duration);
            let _ = reply.send(());
        }
        Command::SetConfiguration { config, reply } => {
            session.set_config(config);
            let _ = reply.send(());
        }
        Command::Invalidate { reply } => {
            session.invalidate(InvalidationCause::Explicit);
            let _ = reply.send(());
        }
        Command::RequestKeyframe { reply } => {
            session.request_keyframe();
            let _ = reply.send(());
        }
        Command::State { reply } => {
            let _ = reply.send(session.state());
        }
        Command::Configuration { reply } => {
            let _ = reply.send(session.config().clone());
        }
        Command::Stats { reply } => {
            let _ = reply.send(session.stats().clone());
        }
        Command::Shutdown { reply } => {
            // Intercepted by the run loop.
            let _ = reply.send(());
        }
    }
}

/// Drain handle completions into the hub until every sink is gone.
#[allow(clippy::needless_pass_by_value)] // receiver is moved from a thread spawn closure
fn run_pump(mut outputs: mpsc::UnboundedReceiver<EncoderOutput>, hub: &BroadcastHub) {
    while let Some(output) = outputs.blocking_recv() {
        if let Err(failure) = &output {
            tracing::warn!(
                status = failure.status,
                presentation_time = ?failure.presentation_time,
                "Encode failed: {}",
                failure.reason
            );
        }
        let delivered = hub.deliver(output);
        tracing::trace!(delivered, "Encoder output delivered");
    }
    hub.close();
    tracing::debug!("Encoder output pump stopped");
}
