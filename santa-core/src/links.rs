use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{AccessLink, Event, SantaError};

/// Marks invitation tokens so they are recognisable in logs and URLs.
pub const TOKEN_PREFIX: &str = "sst_";

/// A fresh bearer token: prefix plus 122 random bits from a v4 UUID, as hex.
pub fn generate_token() -> String {
    format!("{TOKEN_PREFIX}{}", Uuid::new_v4().simple())
}

fn new_link(user_id: &str, now: DateTime<Utc>) -> AccessLink {
    AccessLink {
        token: generate_token(),
        user_id: user_id.to_string(),
        created_at: now,
        disabled: false,
    }
}

fn ensure_participant(event: &Event, user_id: &str) -> Result<(), SantaError> {
    if event.is_participant(user_id) {
        Ok(())
    } else {
        Err(SantaError::NotParticipant(user_id.to_string()))
    }
}

/// Issues a link for every participant that has no enabled one.
/// Returns how many links were added.
pub fn ensure_links_for_event(event: &mut Event, now: DateTime<Utc>) -> usize {
    let mut covered: HashSet<String> = event
        .access_links
        .iter()
        .filter(|l| !l.disabled)
        .map(|l| l.user_id.clone())
        .collect();

    let mut added = 0;
    for participant_id in &event.participant_ids {
        if covered.insert(participant_id.clone()) {
            event.access_links.push(new_link(participant_id, now));
            added += 1;
        }
    }
    added
}

pub fn get_link_for<'a>(event: &'a Event, user_id: &str) -> Option<&'a AccessLink> {
    event
        .access_links
        .iter()
        .find(|l| l.user_id == user_id && !l.disabled)
}

/// Returns the enabled link for `user_id`, issuing one if there is none.
/// The flag is true when a link was created.
pub fn get_or_create_link(
    event: &mut Event,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(AccessLink, bool), SantaError> {
    if let Some(link) = get_link_for(event, user_id) {
        return Ok((link.clone(), false));
    }
    ensure_participant(event, user_id)?;
    let link = new_link(user_id, now);
    event.access_links.push(link.clone());
    Ok((link, true))
}

/// Disables every link `user_id` holds in this event and issues exactly one new one.
pub fn refresh_link(
    event: &mut Event,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<AccessLink, SantaError> {
    ensure_participant(event, user_id)?;
    for link in event.access_links.iter_mut().filter(|l| l.user_id == user_id) {
        link.disabled = true;
    }
    let link = new_link(user_id, now);
    event.access_links.push(link.clone());
    Ok(link)
}

/// Disables the enabled links of `user_id`. Returns how many were switched off.
pub fn disable_link(event: &mut Event, user_id: &str) -> usize {
    let mut disabled = 0;
    for link in event
        .access_links
        .iter_mut()
        .filter(|l| l.user_id == user_id && !l.disabled)
    {
        link.disabled = true;
        disabled += 1;
    }
    disabled
}

/// Exact, case-sensitive lookup of an enabled token across events.
pub fn find_token<'a, I>(events: I, token: &str) -> Option<(&'a Event, &'a AccessLink)>
where
    I: IntoIterator<Item = &'a Event>,
{
    events.into_iter().find_map(|event| {
        event
            .access_links
            .iter()
            .find(|l| !l.disabled && l.token == token)
            .map(|link| (event, link))
    })
}

pub fn invite_url(base_url: &str, token: &str) -> String {
    format!("{}?token={token}", base_url.trim_end_matches('/'))
}
