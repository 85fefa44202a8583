//! Assignment and invitation operations that write their result back.
//!
//! Each function takes an event the caller has just loaded, applies the pure
//! rule from `santa_core`, and persists the whole record once. A failed write
//! leaves the caller's copy mutated; nothing is rolled back or retried here.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use rand::Rng;
use santa_core::{
    AccessLink, Assignment, DrawStrategy, Event, RevealOutcome, User, UserId,
};
use tracing::{debug, info, warn};

use crate::error::{ServiceError, StoreError};
use crate::store::Store;

/// First characters of a token, enough to correlate log lines.
pub(crate) fn token_hint(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

pub async fn assign<R: Rng + ?Sized>(
    store: &dyn Store,
    event: &mut Event,
    strategy: DrawStrategy,
    rng: &mut R,
) -> Result<(), ServiceError> {
    santa_core::assign(event, strategy, rng)?;
    store.upsert_event(event).await?;
    info!(
        event_id = %event.id,
        participants = event.participant_ids.len(),
        %strategy,
        "assignments drawn"
    );
    Ok(())
}

pub async fn reveal(
    store: &dyn Store,
    event: &mut Event,
    user_id: &str,
) -> Result<RevealOutcome, ServiceError> {
    let outcome = santa_core::reveal(event, user_id);
    if outcome.changed() {
        store.upsert_event(event).await?;
        info!(event_id = %event.id, %user_id, "assignment revealed");
    }
    Ok(outcome)
}

pub async fn receiver_display_name(
    store: &dyn Store,
    assignment: &Assignment,
) -> Result<String, ServiceError> {
    let users = store.load_users().await?;
    Ok(santa_core::receiver_display_name(assignment, &users))
}

pub async fn ensure_links_for_event(
    store: &dyn Store,
    event: &mut Event,
) -> Result<usize, ServiceError> {
    let added = santa_core::ensure_links_for_event(event, Utc::now());
    if added > 0 {
        store.upsert_event(event).await?;
        info!(event_id = %event.id, added, "invitation links issued");
    }
    Ok(added)
}

pub async fn get_or_create_link(
    store: &dyn Store,
    event: &mut Event,
    user_id: &str,
) -> Result<AccessLink, ServiceError> {
    let (link, created) = santa_core::get_or_create_link(event, user_id, Utc::now())?;
    if created {
        store.upsert_event(event).await?;
        info!(event_id = %event.id, %user_id, token = token_hint(&link.token), "invitation link issued");
    }
    Ok(link)
}

pub async fn refresh_link(
    store: &dyn Store,
    event: &mut Event,
    user_id: &str,
) -> Result<AccessLink, ServiceError> {
    let link = santa_core::refresh_link(event, user_id, Utc::now())?;
    store.upsert_event(event).await?;
    info!(event_id = %event.id, %user_id, token = token_hint(&link.token), "invitation link refreshed");
    Ok(link)
}

/// Returns whether any link was switched off.
pub async fn disable_link(
    store: &dyn Store,
    event: &mut Event,
    user_id: &str,
) -> Result<bool, ServiceError> {
    let disabled = santa_core::disable_link(event, user_id);
    if disabled == 0 {
        debug!(event_id = %event.id, %user_id, "no enabled link to disable");
        return Ok(false);
    }
    store.upsert_event(event).await?;
    info!(event_id = %event.id, %user_id, disabled, "invitation link disabled");
    Ok(true)
}

/// Scans every event for an enabled link with this exact token.
///
/// Linear in events × links. Unknown, disabled and mistyped tokens all come
/// back as `None`.
pub async fn resolve_token(
    store: &dyn Store,
    token: &str,
) -> Result<Option<(Event, AccessLink)>, ServiceError> {
    let events = store.load_events().await?;
    let found = santa_core::find_token(events.values(), token)
        .map(|(event, link)| (event.clone(), link.clone()));
    if found.is_none() {
        debug!(token = token_hint(token), "token did not resolve");
    }
    Ok(found)
}

/// Bulk provisioning: replaces every stored user with the contents of a JSON
/// map `{ "<id>": { user } }`. Records are keyed by their own `id` field.
pub async fn import_users(store: &dyn Store, path: &Path) -> Result<usize, ServiceError> {
    let bytes = tokio::fs::read(path).await.map_err(StoreError::from)?;
    let parsed: HashMap<String, User> = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
    if parsed.is_empty() {
        return Err(ServiceError::BadRequest("no users in file".into()));
    }

    let mut users: HashMap<UserId, User> = HashMap::with_capacity(parsed.len());
    for (key, user) in parsed {
        if key != user.id {
            warn!(%key, id = %user.id, "user keyed under a different id, using the record id");
        }
        users.insert(user.id.clone(), user);
    }

    let count = users.len();
    let admins = users.values().filter(|u| u.is_admin).count();
    store.replace_users(users).await?;
    info!(count, admins, "users imported, previous users replaced");
    Ok(count)
}

/// Seeds `admin` when the store holds no users at all, so a fresh deployment
/// has someone who can log in. A populated store is left untouched.
/// Returns whether the admin was written.
pub async fn bootstrap_users(store: &dyn Store, admin: &User) -> Result<bool, ServiceError> {
    let users = store.load_users().await?;
    if !users.is_empty() {
        debug!(count = users.len(), "users present, bootstrap skipped");
        return Ok(false);
    }
    store.upsert_user(admin).await?;
    info!(id = %admin.id, email = %admin.email, "bootstrap admin created");
    Ok(true)
}
