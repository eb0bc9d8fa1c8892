//! Outbox delivery to the notification service.

use std::{convert::Infallible, future::Future, sync::Arc};

use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use rxledger_core::{
  clock::{Clock, SystemClock},
  event::Event,
  mirror::MirrorStore,
};

use crate::{Error, Result, config::DispatcherConfig};

// ─── Notifiers ───────────────────────────────────────────────────────────────

/// Delivers one event downstream. Transport is the implementor's concern.
pub trait Notifier: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn notify<'a>(
    &'a self,
    event: &'a Event,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

#[derive(Serialize)]
struct Envelope<'a> {
  topic: String,
  event: &'a Event,
}

/// POSTs `{ "topic", "event" }` as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
  client: Client,
  url:    String,
}

impl WebhookNotifier {
  pub fn new(url: impl Into<String>, config: &DispatcherConfig) -> Result<Self, reqwest::Error> {
    let client = Client::builder().timeout(config.request_timeout()).build()?;
    Ok(Self { client, url: url.into() })
  }
}

impl Notifier for WebhookNotifier {
  type Error = reqwest::Error;

  async fn notify<'a>(&'a self, event: &'a Event) -> Result<(), reqwest::Error> {
    self
      .client
      .post(&self.url)
      .json(&Envelope { topic: event.kind.topic(), event })
      .send()
      .await?
      .error_for_status()?;
    Ok(())
  }
}

/// Logs events instead of sending them. Payloads may carry consent codes, so
/// only identifiers are logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  type Error = Infallible;

  async fn notify<'a>(&'a self, event: &'a Event) -> Result<(), Infallible> {
    info!(
      topic = %event.kind.topic(),
      event_id = %event.event_id,
      record_id = %event.record_id,
      "notification"
    );
    Ok(())
  }
}

#[derive(Debug, Error)]
pub enum NotifyError {
  #[error("webhook delivery failed: {0}")]
  Webhook(#[from] reqwest::Error),
}

/// The notifier selected by [`DispatcherConfig::webhook_url`].
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
  Webhook(WebhookNotifier),
  Tracing(TracingNotifier),
}

impl ConfiguredNotifier {
  pub fn from_config(config: &DispatcherConfig) -> Result<Self, reqwest::Error> {
    Ok(match &config.webhook_url {
      Some(url) => Self::Webhook(WebhookNotifier::new(url.clone(), config)?),
      None => Self::Tracing(TracingNotifier),
    })
  }
}

impl Notifier for ConfiguredNotifier {
  type Error = NotifyError;

  async fn notify<'a>(&'a self, event: &'a Event) -> Result<(), NotifyError> {
    match self {
      Self::Webhook(n) => n.notify(event).await?,
      Self::Tracing(n) => match n.notify(event).await {
        Ok(()) => {}
        Err(never) => match never {},
      },
    }
    Ok(())
  }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
  pub delivered: usize,
  /// Failed this round, will be retried.
  pub retrying:  usize,
  /// Failed for the last time and parked.
  pub abandoned: usize,
}

pub struct NotificationDispatcher<M, N> {
  mirror:   Arc<M>,
  notifier: N,
  clock:    Arc<dyn Clock>,
  config:   DispatcherConfig,
}

impl<M, N> NotificationDispatcher<M, N>
where
  M: MirrorStore,
  N: Notifier,
{
  pub fn new(mirror: Arc<M>, notifier: N, config: DispatcherConfig) -> Self {
    Self { mirror, notifier, clock: Arc::new(SystemClock), config }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Attempt every pending event once, oldest first.
  pub async fn deliver_pending(&self) -> Result<DeliveryReport> {
    let pending = self
      .mirror
      .pending_events(self.config.batch_size.max(1))
      .await
      .map_err(Error::mirror)?;

    let mut report = DeliveryReport::default();
    for item in pending {
      let event = &item.event;
      match self.notifier.notify(event).await {
        Ok(()) => {
          self
            .mirror
            .mark_delivered(event.event_id, self.clock.now_utc())
            .await
            .map_err(Error::mirror)?;
          debug!(event_id = %event.event_id, kind = %event.kind, "event delivered");
          report.delivered += 1;
        }
        Err(e) => {
          let give_up = item.attempts + 1 >= self.config.max_attempts;
          warn!(
            event_id = %event.event_id,
            kind = %event.kind,
            attempt = item.attempts + 1,
            give_up,
            error = %e,
            "event delivery failed"
          );
          self
            .mirror
            .mark_failed(event.event_id, e.to_string(), give_up)
            .await
            .map_err(Error::mirror)?;
          if give_up {
            report.abandoned += 1;
          } else {
            report.retrying += 1;
          }
        }
      }
    }
    Ok(report)
  }

  pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(self.config.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval = ?self.config.poll_interval(), "notification dispatcher started");

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          match self.deliver_pending().await {
            Ok(report) if report != DeliveryReport::default() => {
              info!(?report, "outbox drained");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "outbox delivery failed"),
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    info!("notification dispatcher stopped");
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use chrono::DateTime;
  use rxledger_core::event::EventKind;
  use rxledger_store_sqlite::SqliteMirror;
  use uuid::Uuid;

  use super::*;

  #[derive(Debug, Error)]
  #[error("downstream refused")]
  struct Refused;

  /// Records what it was given; fails while `failing` is set.
  #[derive(Default)]
  struct Recording {
    seen:    Mutex<Vec<Uuid>>,
    failing: Mutex<bool>,
  }

  impl Notifier for Arc<Recording> {
    type Error = Refused;

    async fn notify<'a>(&'a self, event: &'a Event) -> Result<(), Refused> {
      if *self.failing.lock().unwrap() {
        return Err(Refused);
      }
      self.seen.lock().unwrap().push(event.event_id);
      Ok(())
    }
  }

  fn event(kind: EventKind) -> Event {
    let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    Event::once_per_record(Uuid::new_v4(), kind, serde_json::json!({}), at)
  }

  async fn setup(max_attempts: u32) -> (NotificationDispatcher<SqliteMirror, Arc<Recording>>, Arc<SqliteMirror>, Arc<Recording>) {
    let mirror = Arc::new(SqliteMirror::open_in_memory().await.unwrap());
    let notifier = Arc::new(Recording::default());
    let config = DispatcherConfig { max_attempts, ..DispatcherConfig::default() };
    let dispatcher = NotificationDispatcher::new(mirror.clone(), notifier.clone(), config);
    (dispatcher, mirror, notifier)
  }

  #[tokio::test]
  async fn delivers_in_creation_order_and_only_once() {
    let (d, mirror, notifier) = setup(5).await;
    let first = event(EventKind::Issued);
    let second = event(EventKind::Redeemed);
    mirror.emit_once(first.clone()).await.unwrap();
    mirror.emit_once(second.clone()).await.unwrap();

    let report = d.deliver_pending().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(*notifier.seen.lock().unwrap(), vec![first.event_id, second.event_id]);

    assert_eq!(d.deliver_pending().await.unwrap(), DeliveryReport::default());
  }

  #[tokio::test]
  async fn failures_retry_then_give_up() {
    let (d, mirror, notifier) = setup(2).await;
    mirror.emit_once(event(EventKind::Expired)).await.unwrap();
    *notifier.failing.lock().unwrap() = true;

    let report = d.deliver_pending().await.unwrap();
    assert_eq!(report.retrying, 1);
    assert_eq!(mirror.pending_events(10).await.unwrap()[0].attempts, 1);

    let report = d.deliver_pending().await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert!(mirror.pending_events(10).await.unwrap().is_empty());

    *notifier.failing.lock().unwrap() = false;
    assert_eq!(d.deliver_pending().await.unwrap(), DeliveryReport::default());
    assert!(notifier.seen.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn run_drains_then_stops_on_shutdown() {
    let (d, mirror, notifier) = setup(5).await;
    let queued = event(EventKind::Issued);
    mirror.emit_once(queued.clone()).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(d.run(rx));
    for _ in 0..500 {
      if !notifier.seen.lock().unwrap().is_empty() {
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(*notifier.seen.lock().unwrap(), vec![queued.event_id]);

    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), task)
      .await
      .expect("dispatcher stops promptly")
      .unwrap();
  }

  #[tokio::test]
  async fn tracing_notifier_accepts_everything() {
    let mirror = Arc::new(SqliteMirror::open_in_memory().await.unwrap());
    let notifier = ConfiguredNotifier::from_config(&DispatcherConfig::default()).unwrap();
    assert!(matches!(notifier, ConfiguredNotifier::Tracing(_)));

    mirror.emit_once(event(EventKind::Issued)).await.unwrap();
    let d = NotificationDispatcher::new(mirror, notifier, DispatcherConfig::default());
    assert_eq!(d.deliver_pending().await.unwrap().delivered, 1);
  }
}
