use serde::Serialize;

use crate::{Event, EventId, SantaError, User, UserId};

/// Who is making a request, after credentials have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Logged in with e-mail and password.
    Member(User),
    /// Presented an invitation token that resolved to a link in `event_id`.
    Invitee { user_id: UserId, event_id: EventId },
}

impl Actor {
    pub fn user_id(&self) -> &str {
        match self {
            Actor::Member(user) => &user.id,
            Actor::Invitee { user_id, .. } => user_id,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Member(user) if user.is_admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    View,
    Reveal,
    /// Anything that changes the event on behalf of the organiser:
    /// starting the draw, link management, deletion.
    Manage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Participant,
}

/// Admin rights are global: any admin may manage any event, not only the
/// ones they created.
pub fn authorize(actor: &Actor, event: &Event, op: Operation) -> Result<Role, SantaError> {
    match actor {
        Actor::Member(user) => match op {
            Operation::Manage if user.is_admin => Ok(Role::Admin),
            Operation::Manage => Err(SantaError::Forbidden),
            Operation::View if user.is_admin => Ok(Role::Admin),
            Operation::View if can_access_event(event, &user.id) => Ok(Role::Participant),
            Operation::Reveal if event.is_participant(&user.id) => Ok(Role::Participant),
            Operation::View | Operation::Reveal => Err(SantaError::Forbidden),
        },
        Actor::Invitee { user_id, event_id } => {
            if *event_id != event.id || !event.is_participant(user_id) {
                return Err(SantaError::Forbidden);
            }
            match op {
                Operation::View | Operation::Reveal => Ok(Role::Participant),
                Operation::Manage => Err(SantaError::Forbidden),
            }
        }
    }
}

pub fn can_access_event(event: &Event, user_id: &str) -> bool {
    event.is_participant(user_id) || event.created_by == user_id
}

/// Plain comparison against the stored secret. Unknown e-mail and wrong
/// password are indistinguishable to the caller.
pub fn authenticate<'a, I>(users: I, email: &str, password: &str) -> Option<&'a User>
where
    I: IntoIterator<Item = &'a User>,
{
    users
        .into_iter()
        .find(|u| u.email == email)
        .filter(|u| u.password == password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str, is_admin: bool) -> User {
        User {
            id: id.into(),
            name: id.to_uppercase(),
            email: format!("{id}@example.com"),
            password: format!("{id}-secret"),
            is_admin,
            password_changed: true,
        }
    }

    fn event() -> Event {
        Event::new("e1", "Club", "boss", vec!["ann".into(), "ben".into()], Utc::now())
    }

    #[test]
    fn admin_manages_any_event() {
        let admin = Actor::Member(user("root", true));
        assert_eq!(authorize(&admin, &event(), Operation::Manage), Ok(Role::Admin));
        assert_eq!(authorize(&admin, &event(), Operation::View), Ok(Role::Admin));
        // not a participant, nothing to reveal
        assert_eq!(
            authorize(&admin, &event(), Operation::Reveal),
            Err(SantaError::Forbidden)
        );
    }

    #[test]
    fn non_admin_member_sees_only_own_events_and_never_manages() {
        let ann = Actor::Member(user("ann", false));
        assert_eq!(authorize(&ann, &event(), Operation::View), Ok(Role::Participant));
        assert_eq!(authorize(&ann, &event(), Operation::Reveal), Ok(Role::Participant));
        assert_eq!(authorize(&ann, &event(), Operation::Manage), Err(SantaError::Forbidden));

        let boss = Actor::Member(user("boss", false));
        assert_eq!(authorize(&boss, &event(), Operation::View), Ok(Role::Participant));
        assert_eq!(authorize(&boss, &event(), Operation::Reveal), Err(SantaError::Forbidden));

        let stranger = Actor::Member(user("zed", false));
        assert_eq!(authorize(&stranger, &event(), Operation::View), Err(SantaError::Forbidden));
    }

    #[test]
    fn invitee_is_scoped_to_linked_event_and_membership() {
        let ben = Actor::Invitee {
            user_id: "ben".into(),
            event_id: "e1".into(),
        };
        assert_eq!(authorize(&ben, &event(), Operation::View), Ok(Role::Participant));
        assert_eq!(authorize(&ben, &event(), Operation::Reveal), Ok(Role::Participant));
        assert_eq!(authorize(&ben, &event(), Operation::Manage), Err(SantaError::Forbidden));

        let elsewhere = Actor::Invitee {
            user_id: "ben".into(),
            event_id: "e2".into(),
        };
        assert_eq!(authorize(&elsewhere, &event(), Operation::View), Err(SantaError::Forbidden));

        let removed = Actor::Invitee {
            user_id: "cat".into(),
            event_id: "e1".into(),
        };
        assert_eq!(authorize(&removed, &event(), Operation::View), Err(SantaError::Forbidden));
    }

    #[test]
    fn authenticate_requires_matching_email_and_password() {
        let users = vec![user("ann", false), user("root", true)];
        assert_eq!(
            authenticate(&users, "root@example.com", "root-secret").map(|u| u.id.as_str()),
            Some("root")
        );
        assert!(authenticate(&users, "root@example.com", "ann-secret").is_none());
        assert!(authenticate(&users, "nobody@example.com", "root-secret").is_none());
    }

    #[test]
    fn actor_accessors() {
        let admin = Actor::Member(user("root", true));
        let invitee = Actor::Invitee {
            user_id: "ben".into(),
            event_id: "e1".into(),
        };
        assert_eq!(admin.user_id(), "root");
        assert!(admin.is_admin());
        assert_eq!(invitee.user_id(), "ben");
        assert!(!invitee.is_admin());
    }
}
