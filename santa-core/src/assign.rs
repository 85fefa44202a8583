use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Assignment, Event, SantaError, User, UserId};

/// Display name used when an assignment points at a user that no longer exists.
pub const UNKNOWN_NAME: &str = "Unknown";

/// How receivers are drawn for an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrawStrategy {
    /// Shuffle once, then a single forward pass that swaps any self-match with
    /// its right neighbour (wrapping). Always a derangement for distinct ids,
    /// but not uniformly distributed over derangements.
    #[default]
    SingleSwap,
    /// Reshuffle until no participant draws themselves. Uniform over all
    /// derangements; requires distinct participant ids.
    Rejection,
}

impl fmt::Display for DrawStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawStrategy::SingleSwap => f.write_str("single-swap"),
            DrawStrategy::Rejection => f.write_str("rejection"),
        }
    }
}

impl FromStr for DrawStrategy {
    type Err = SantaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-swap" => Ok(DrawStrategy::SingleSwap),
            "rejection" => Ok(DrawStrategy::Rejection),
            other => Err(SantaError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Draws receivers for every participant and marks the event as started.
///
/// Does not look at `is_started`; callers decide whether a redraw is allowed.
/// The event is left untouched when an error is returned.
pub fn assign<R: Rng + ?Sized>(
    event: &mut Event,
    strategy: DrawStrategy,
    rng: &mut R,
) -> Result<(), SantaError> {
    let givers = event.participant_ids.clone();
    if givers.len() < 2 {
        return Err(SantaError::NotEnoughParticipants(givers.len()));
    }

    let receivers = match strategy {
        DrawStrategy::SingleSwap => {
            let mut receivers = givers.clone();
            receivers.shuffle(rng);
            correct_self_matches(&givers, &mut receivers);
            receivers
        }
        DrawStrategy::Rejection => {
            if let Some(dup) = first_duplicate(&givers) {
                return Err(SantaError::DuplicateParticipant(dup.clone()));
            }
            let mut receivers = givers.clone();
            loop {
                receivers.shuffle(rng);
                if !has_self_match(&givers, &receivers) {
                    break receivers;
                }
            }
        }
    };

    install_assignments(event, receivers);
    Ok(())
}

/// Single corrective pass: a self-match at `i` trades places with `i + 1`
/// (or index 0 at the end). Positions are not revisited after a swap.
pub fn correct_self_matches(givers: &[UserId], receivers: &mut [UserId]) {
    let n = receivers.len();
    if n == 0 {
        return;
    }
    for i in 0..n {
        if givers[i] == receivers[i] {
            receivers.swap(i, (i + 1) % n);
        }
    }
}

fn has_self_match(givers: &[UserId], receivers: &[UserId]) -> bool {
    givers.iter().zip(receivers).any(|(g, r)| g == r)
}

fn first_duplicate(ids: &[UserId]) -> Option<&UserId> {
    let mut seen = HashSet::new();
    ids.iter().find(|id| !seen.insert(id.as_str()))
}

fn install_assignments(event: &mut Event, receivers: Vec<UserId>) {
    event.assignments = event
        .participant_ids
        .iter()
        .cloned()
        .zip(receivers)
        .map(|(giver_id, receiver_id)| Assignment {
            giver_id,
            receiver_id,
            revealed: false,
        })
        .collect();
    event.is_started = true;
}

pub fn get_assignment_for<'a>(event: &'a Event, user_id: &str) -> Option<&'a Assignment> {
    event.assignments.iter().find(|a| a.giver_id == user_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealOutcome {
    Revealed(Assignment),
    AlreadyRevealed(Assignment),
    /// The draw has not happened yet.
    NotStarted,
    /// The event is running but this user gives to nobody.
    NoAssignment,
}

impl RevealOutcome {
    /// Whether the event was mutated and needs writing back.
    pub fn changed(&self) -> bool {
        matches!(self, RevealOutcome::Revealed(_))
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        match self {
            RevealOutcome::Revealed(a) | RevealOutcome::AlreadyRevealed(a) => Some(a),
            RevealOutcome::NotStarted | RevealOutcome::NoAssignment => None,
        }
    }
}

pub fn reveal(event: &mut Event, user_id: &str) -> RevealOutcome {
    if !event.is_started {
        return RevealOutcome::NotStarted;
    }
    let Some(assignment) = event.assignments.iter_mut().find(|a| a.giver_id == user_id) else {
        return RevealOutcome::NoAssignment;
    };
    if assignment.revealed {
        return RevealOutcome::AlreadyRevealed(assignment.clone());
    }
    assignment.revealed = true;
    RevealOutcome::Revealed(assignment.clone())
}

pub fn receiver_display_name(assignment: &Assignment, users: &HashMap<UserId, User>) -> String {
    display_name(&assignment.receiver_id, users)
}

/// Name of a user, or [`UNKNOWN_NAME`] when the id no longer resolves.
pub fn display_name(user_id: &str, users: &HashMap<UserId, User>) -> String {
    users
        .get(user_id)
        .map(|u| u.name.clone())
        .unwrap_or_else(|| UNKNOWN_NAME.to_string())
}

/// One row of the organiser's overview of an event's draw.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentView {
    pub giver: String,
    pub receiver: String,
    pub revealed: bool,
}

pub fn assignment_overview(event: &Event, users: &HashMap<UserId, User>) -> Vec<AssignmentView> {
    event
        .assignments
        .iter()
        .map(|a| AssignmentView {
            giver: display_name(&a.giver_id, users),
            receiver: display_name(&a.receiver_id, users),
            revealed: a.revealed,
        })
        .collect()
}
