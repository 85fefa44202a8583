use async_trait::async_trait;
use santa_core::{invite_url, Event, User};
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::service;
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
#[error("delivery to {to} failed: {reason}")]
pub struct NotifyError {
    pub to: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Sent when an event is created.
    Invitation,
    /// Sent after the draw: the participant can now reveal their receiver.
    DrawReady,
}

impl Notice {
    pub fn subject(&self, event_title: &str) -> String {
        match self {
            Notice::Invitation => format!("You're invited to the Secret Santa: {event_title}"),
            Notice::DrawReady => format!("Your Secret Santa is waiting: {event_title}"),
        }
    }
}

/// Outbound delivery of a participant's personal invitation URL.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notice: Notice, to: &User, event: &Event, url: &str)
        -> Result<(), NotifyError>;
}

/// Development delivery: the message goes to the log, URL included.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        notice: Notice,
        to: &User,
        event: &Event,
        url: &str,
    ) -> Result<(), NotifyError> {
        info!(
            to = %to.email,
            subject = %notice.subject(&event.title),
            gift_value = event.gift_value.as_deref().unwrap_or("-"),
            %url,
            "notification"
        );
        Ok(())
    }
}

/// Makes sure every participant has a link, then sends each one their URL.
/// Returns the addresses that accepted the message; failed deliveries and
/// participants without a user record are logged and skipped.
pub async fn notify_participants(
    store: &dyn Store,
    notifier: &dyn Notifier,
    event: &mut Event,
    notice: Notice,
    base_url: &str,
) -> Result<Vec<String>, ServiceError> {
    service::ensure_links_for_event(store, event).await?;
    let users = store.load_users().await?;

    let mut delivered = Vec::new();
    for participant_id in event.participant_ids.clone() {
        let Some(user) = users.get(&participant_id) else {
            warn!(event_id = %event.id, %participant_id, "participant has no user record, skipped");
            continue;
        };
        let link = service::get_or_create_link(store, event, &participant_id).await?;
        let url = invite_url(base_url, &link.token);
        match notifier.send(notice, user, event, &url).await {
            Ok(()) => delivered.push(user.email.clone()),
            Err(err) => warn!(event_id = %event.id, %err, "notification not delivered"),
        }
    }

    info!(
        event_id = %event.id,
        ?notice,
        delivered = delivered.len(),
        participants = event.participant_ids.len(),
        "participants notified"
    );
    Ok(delivered)
}
