/// Background jobs for side effects that must not block a handler.
///
/// Referral logging, delayed follow-up messages and post-login notifications
/// run here with a bounded retry policy, so their failures show up in the
/// logs instead of being dropped silently.
use crate::error::{BotError, Result};
use crate::messenger::{Messenger, OutgoingMessage};
use crate::store::{MessageLogEntry, Store};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// A unit of deferred work.
#[derive(Debug, Clone)]
pub enum Job {
    RecordReferral {
        telegram_id: i64,
        referral_code: String,
    },
    /// Send a message after a delay.
    DelayedMessage {
        message: OutgoingMessage,
        delay: Duration,
    },
    /// Send a message and append it to the message log under `log_type`.
    Notify {
        message: OutgoingMessage,
        log_type: &'static str,
    },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::RecordReferral { .. } => "record_referral",
            Job::DelayedMessage { .. } => "delayed_message",
            Job::Notify { .. } => "notify",
        }
    }
}

/// How many times a job is attempted and how long to back off between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    const MAX_DELAY: Duration = Duration::from_secs(30);

    /// Delay after the given (1-based) failed attempt: base, 2x base, 4x base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Self::MAX_DELAY)
            .min(Self::MAX_DELAY)
    }
}

#[derive(Clone)]
struct JobContext {
    store: Arc<Store>,
    messenger: Arc<dyn Messenger>,
    policy: RetryPolicy,
}

enum Envelope {
    Run(Job),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background worker.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl TaskQueue {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(store: Arc<Store>, messenger: Arc<dyn Messenger>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = JobContext {
            store,
            messenger,
            policy,
        };
        tokio::spawn(worker(rx, ctx));
        Self { tx }
    }

    /// Queue a job. Returns false if the worker is gone.
    pub fn enqueue(&self, job: Job) -> bool {
        let kind = job.kind();
        match self.tx.send(Envelope::Run(job)) {
            Ok(()) => {
                debug!(job = kind, "Job queued");
                true
            }
            Err(_) => {
                warn!(job = kind, "Task queue closed, job dropped");
                false
            }
        }
    }

    /// Wait until every job queued before this call has finished (or given up).
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn worker(mut rx: mpsc::UnboundedReceiver<Envelope>, ctx: JobContext) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            envelope = rx.recv() => match envelope {
                Some(Envelope::Run(job)) => {
                    in_flight.spawn(run_with_retry(ctx.clone(), job));
                }
                Some(Envelope::Flush(ack)) => {
                    while in_flight.join_next().await.is_some() {}
                    let _ = ack.send(());
                }
                None => break,
            }
        }
    }
    while in_flight.join_next().await.is_some() {}
    debug!("Task worker stopped");
}

async fn run_with_retry(ctx: JobContext, job: Job) {
    if let Job::DelayedMessage { delay, .. } = &job {
        sleep(*delay).await;
    }

    let kind = job.kind();
    let mut attempt = 1;
    loop {
        match run_job(&ctx, &job).await {
            Ok(()) => {
                debug!(job = kind, attempt, "Job finished");
                return;
            }
            Err(e) if e.is_retryable() && attempt < ctx.policy.max_attempts => {
                let mut wait = ctx.policy.backoff(attempt);
                if let BotError::Delivery(delivery) = &e {
                    if let Some(retry_after) = delivery.retry_after() {
                        wait = wait.max(retry_after);
                    }
                }
                warn!(job = kind, attempt, "Job failed, retrying in {:?}: {}", wait, e);
                sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                error!(job = kind, attempt, "Job gave up: {}", e);
                return;
            }
        }
    }
}

async fn run_job(ctx: &JobContext, job: &Job) -> Result<()> {
    match job {
        Job::RecordReferral {
            telegram_id,
            referral_code,
        } => ctx.store.log_referral(*telegram_id, referral_code, Utc::now()),
        Job::DelayedMessage { message, .. } => {
            ctx.messenger.send(message.clone()).await?;
            Ok(())
        }
        Job::Notify { message, log_type } => {
            let message_id = ctx.messenger.send(message.clone()).await?;
            let entry = MessageLogEntry {
                telegram_id: message.chat_id,
                message_type: log_type.to_string(),
                message_id,
                verification_id: None,
            };
            // The message is out; a lost log line must not trigger a resend.
            if let Err(e) = ctx.store.log_message(&entry, Utc::now()) {
                warn!(chat_id = message.chat_id, "Failed to log {} message: {}", log_type, e);
            }
            Ok(())
        }
    }
}

/// Periodically write `expired` onto codes that outlived their window.
pub fn spawn_expiry_sweep(store: Arc<Store>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match store.expire_stale(Utc::now()) {
                Ok(0) => {}
                Ok(expired) => info!(expired, "Expired stale verification codes"),
                Err(e) => warn!("Expiry sweep failed: {}", e),
            }
        }
    })
}
