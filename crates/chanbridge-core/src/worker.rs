//! Dispatch worker
//!
//! One task per live subscription. The task consumes the subscription's bus
//! stream one message at a time and drives each message through an explicit
//! state machine:
//!
//! ```text
//! Received -> Delivering{attempt} -> Delivered -> Replying? -> Done
//!                                 \-> Exhausted -> DeadLettering? -> Done
//! ```
//!
//! The bus acknowledgment is sent only after a terminal outcome. A message
//! abandoned because the worker was cancelled is left unacknowledged so the
//! bus redelivers it.

use chanbridge_bus::Delivery;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::delivery::{DeliveryError, DeliveryResponse, DeliveryTarget, Forwarder, Outbound, Targets};
use crate::metrics::DispatchMetrics;
use crate::model::{ChannelId, Message, SubscriptionSpec};
use crate::retry::RetryConfig;

/// Why a worker task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    /// Stopped through its cancellation token
    Cancelled,
    /// The bus stream ended (subscription or connection gone)
    StreamClosed,
    /// Did not drain within the grace period and was aborted
    Aborted,
}

/// Observable worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Consuming messages
    Running,
    /// Cancelled, finishing the in-flight attempt
    Draining,
    /// Task has ended
    Stopped(WorkerExit),
}

impl WorkerState {
    /// Exit reason once stopped
    #[must_use]
    pub fn exit(&self) -> Option<WorkerExit> {
        match self {
            Self::Stopped(exit) => Some(*exit),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped(WorkerExit::Cancelled) => write!(f, "stopped (cancelled)"),
            Self::Stopped(WorkerExit::StreamClosed) => write!(f, "stopped (stream closed)"),
            Self::Stopped(WorkerExit::Aborted) => write!(f, "stopped (aborted)"),
        }
    }
}

/// Terminal result of processing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Subscriber accepted the message
    Delivered {
        /// Subscriber attempts made
        attempts: u32,
        /// Whether a reply was forwarded
        replied: bool,
    },
    /// Subscriber failed; the message went to the dead-letter sink
    DeadLettered {
        /// Subscriber attempts made
        attempts: u32,
    },
    /// Subscriber failed and no dead-letter sink took the message
    Dropped {
        /// Subscriber attempts made
        attempts: u32,
    },
    /// Worker was cancelled before a terminal outcome
    Abandoned,
}

impl MessageOutcome {
    /// Whether the message must be acknowledged to the bus
    #[must_use]
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::Abandoned)
    }
}

enum DeliveryState {
    Received,
    Delivering { attempt: u32 },
    Delivered { attempts: u32, response: DeliveryResponse },
    Replying { attempts: u32, target: DeliveryTarget, response: DeliveryResponse },
    Exhausted { attempts: u32, error: DeliveryError },
    DeadLettering { attempts: u32, target: DeliveryTarget, error: DeliveryError },
    Done(MessageOutcome),
}

/// Everything a worker needs besides its subscription: shared by all
/// workers a reconciler spawns.
#[derive(Clone)]
pub struct WorkerContext {
    /// Outbound request capability
    pub forwarder: Arc<dyn Forwarder>,
    /// Policy for subscriber and reply delivery
    pub retry: RetryConfig,
    /// Policy for dead-letter forwarding
    pub dead_letter_retry: RetryConfig,
    /// Shared counters
    pub metrics: Arc<DispatchMetrics>,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("retry", &self.retry)
            .field("dead_letter_retry", &self.dead_letter_retry)
            .finish_non_exhaustive()
    }
}

/// Per-subscription delivery loop
pub struct DispatchWorker {
    channel: ChannelId,
    durable_name: String,
    targets: Targets,
    ctx: WorkerContext,
    cancel: CancellationToken,
}

impl DispatchWorker {
    /// Create a worker for one (channel, subscription) pair
    #[must_use]
    pub fn new(
        channel: ChannelId,
        spec: &SubscriptionSpec,
        durable_name: impl Into<String>,
        ctx: WorkerContext,
    ) -> Self {
        Self {
            channel,
            durable_name: durable_name.into(),
            targets: Targets::from(spec),
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Start consuming `messages` on a new task
    pub fn spawn(self, messages: BoxStream<'static, Delivery>) -> WorkerHandle {
        let id = Uuid::new_v4();
        let cancel = self.cancel.clone();
        let (state, _) = watch::channel(WorkerState::Running);
        let state = Arc::new(state);

        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            let exit = self.run(messages).await;
            task_state.send_replace(WorkerState::Stopped(exit));
        });

        WorkerHandle {
            id,
            cancel,
            state,
            abort: task.abort_handle(),
        }
    }

    async fn run(self, mut messages: BoxStream<'static, Delivery>) -> WorkerExit {
        info!(
            channel = %self.channel,
            subscriber = %self.targets.subscriber.uri(),
            durable = %self.durable_name,
            "Dispatch worker started"
        );

        let exit = loop {
            let delivery = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break WorkerExit::Cancelled,
                next = messages.next() => match next {
                    Some(delivery) => delivery,
                    None => break WorkerExit::StreamClosed,
                },
            };

            self.ctx.metrics.messages_received.inc();
            let message = Message::from_bus(self.channel.clone(), delivery.message.clone());
            let outcome = self.process(&message).await;

            if !outcome.should_ack() {
                debug!(
                    channel = %self.channel,
                    sequence = message.sequence,
                    "Message left unacknowledged for redelivery"
                );
                continue;
            }
            if let Err(e) = delivery.ack().await {
                self.ctx.metrics.ack_failures.inc();
                warn!(
                    channel = %self.channel,
                    sequence = message.sequence,
                    error = %e,
                    "Failed to acknowledge message"
                );
            }
        };

        match exit {
            WorkerExit::StreamClosed => warn!(
                channel = %self.channel,
                durable = %self.durable_name,
                "Bus stream ended, dispatch worker stopping"
            ),
            _ => info!(
                channel = %self.channel,
                durable = %self.durable_name,
                "Dispatch worker stopped"
            ),
        }
        exit
    }

    /// Drive one message to a terminal outcome.
    pub(crate) async fn process(&self, message: &Message) -> MessageOutcome {
        let outbound = Outbound::from_message(message);
        let mut state = DeliveryState::Received;

        loop {
            state = match state {
                DeliveryState::Received => {
                    if self.cancel.is_cancelled() {
                        DeliveryState::Done(MessageOutcome::Abandoned)
                    } else {
                        DeliveryState::Delivering { attempt: 1 }
                    }
                }

                DeliveryState::Delivering { attempt } => {
                    self.ctx.metrics.delivery_attempts.inc();
                    match self.ctx.forwarder.forward(&self.targets.subscriber, &outbound).await {
                        Ok(response) => DeliveryState::Delivered {
                            attempts: attempt,
                            response,
                        },
                        Err(error)
                            if error.is_retryable(&self.ctx.retry)
                                && attempt < self.ctx.retry.attempts() =>
                        {
                            let delay = self.ctx.retry.delay_after(attempt);
                            debug!(
                                channel = %self.channel,
                                target = %self.targets.subscriber,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "Delivery attempt failed, retrying"
                            );
                            if self.backoff(delay).await {
                                DeliveryState::Delivering {
                                    attempt: attempt + 1,
                                }
                            } else {
                                DeliveryState::Done(MessageOutcome::Abandoned)
                            }
                        }
                        Err(error) if self.cancel.is_cancelled() => {
                            debug!(
                                channel = %self.channel,
                                error = %error,
                                "Delivery failed while draining"
                            );
                            DeliveryState::Done(MessageOutcome::Abandoned)
                        }
                        Err(error) => DeliveryState::Exhausted {
                            attempts: attempt,
                            error,
                        },
                    }
                }

                DeliveryState::Delivered { attempts, response } => {
                    self.ctx.metrics.delivered.inc();
                    match &self.targets.reply {
                        Some(target) if !response.body.is_empty() => DeliveryState::Replying {
                            attempts,
                            target: target.clone(),
                            response,
                        },
                        _ => DeliveryState::Done(MessageOutcome::Delivered {
                            attempts,
                            replied: false,
                        }),
                    }
                }

                DeliveryState::Replying {
                    attempts,
                    target,
                    response,
                } => {
                    let replied = if self.cancel.is_cancelled() {
                        warn!(channel = %self.channel, "Worker draining, reply not forwarded");
                        false
                    } else {
                        let reply = Outbound::reply(&response);
                        match self.forward_with_retry(&target, &reply, &self.ctx.retry).await {
                            Ok(_) => {
                                self.ctx.metrics.replies_forwarded.inc();
                                true
                            }
                            Err(e) => {
                                self.ctx.metrics.reply_failures.inc();
                                warn!(
                                    channel = %self.channel,
                                    target = %target,
                                    error = %e,
                                    "Failed to forward reply"
                                );
                                false
                            }
                        }
                    };
                    DeliveryState::Done(MessageOutcome::Delivered { attempts, replied })
                }

                DeliveryState::Exhausted { attempts, error } => match &self.targets.dead_letter {
                    Some(target) => DeliveryState::DeadLettering {
                        attempts,
                        target: target.clone(),
                        error,
                    },
                    None => {
                        self.ctx.metrics.dropped.inc();
                        error!(
                            channel = %self.channel,
                            target = %self.targets.subscriber,
                            attempts,
                            error = %error,
                            "Delivery failed, no dead-letter sink, dropping message"
                        );
                        DeliveryState::Done(MessageOutcome::Dropped { attempts })
                    }
                },

                DeliveryState::DeadLettering {
                    attempts,
                    target,
                    error,
                } => {
                    if self.cancel.is_cancelled() {
                        DeliveryState::Done(MessageOutcome::Abandoned)
                    } else {
                        let outbound =
                            Outbound::dead_letter(message, &self.targets.subscriber, &error);
                        match self
                            .forward_with_retry(&target, &outbound, &self.ctx.dead_letter_retry)
                            .await
                        {
                            Ok(_) => {
                                self.ctx.metrics.dead_lettered.inc();
                                warn!(
                                    channel = %self.channel,
                                    target = %self.targets.subscriber,
                                    attempts,
                                    error = %error,
                                    "Delivery failed, message dead-lettered"
                                );
                                DeliveryState::Done(MessageOutcome::DeadLettered { attempts })
                            }
                            Err(e) => {
                                self.ctx.metrics.dead_letter_failures.inc();
                                self.ctx.metrics.dropped.inc();
                                error!(
                                    channel = %self.channel,
                                    target = %target,
                                    error = %e,
                                    "Dead-letter forwarding failed, dropping message"
                                );
                                DeliveryState::Done(MessageOutcome::Dropped { attempts })
                            }
                        }
                    }
                }

                DeliveryState::Done(outcome) => {
                    if outcome == MessageOutcome::Abandoned {
                        self.ctx.metrics.abandoned.inc();
                    }
                    return outcome;
                }
            };
        }
    }

    /// Forward with retries under `policy`; used for reply and dead-letter
    /// targets.
    async fn forward_with_retry(
        &self,
        target: &DeliveryTarget,
        outbound: &Outbound,
        policy: &RetryConfig,
    ) -> std::result::Result<DeliveryResponse, DeliveryError> {
        let mut attempt = 1;
        loop {
            match self.ctx.forwarder.forward(target, outbound).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable(policy) && attempt < policy.attempts() => {
                    debug!(target = %target, attempt, error = %error, "Retrying");
                    if !self.backoff(policy.delay_after(attempt)).await {
                        return Err(error);
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Sleep unless cancelled first. Returns `false` when cancelled.
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

/// Control handle for a spawned worker. Clones refer to the same task.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: Uuid,
    cancel: CancellationToken,
    state: Arc<watch::Sender<WorkerState>>,
    abort: AbortHandle,
}

impl WorkerHandle {
    /// Worker id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Request cancellation without waiting
    pub fn cancel(&self) {
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Running {
                *state = WorkerState::Draining;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
    }

    /// Cancel and wait up to `grace` for the in-flight delivery to finish;
    /// abort the task after that.
    pub async fn stop(&self, grace: Duration) -> WorkerExit {
        self.cancel();

        let mut rx = self.state.subscribe();
        let exited = match tokio::time::timeout(grace, rx.wait_for(|s| s.exit().is_some())).await {
            Ok(Ok(state)) => state.exit(),
            _ => None,
        };
        if let Some(exit) = exited {
            return exit;
        }

        self.abort.abort();
        self.state.send_replace(WorkerState::Stopped(WorkerExit::Aborted));
        warn!(worker = %self.id, grace_ms = grace.as_millis() as u64, "Worker did not drain in time, aborted");
        WorkerExit::Aborted
    }
}
