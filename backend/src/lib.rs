use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use santa_core::{
    authorize, display_name, get_assignment_for, get_link_for, invite_url, Actor, AssignmentView,
    Event, Operation, RevealOutcome, Role, SantaError, User, UserId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod notify;
pub mod service;
pub mod store;

pub use config::{Args, Command, Settings};
pub use error::{ServiceError, StoreError};
pub use notify::{notify_participants, LogNotifier, Notice, Notifier};
pub use store::{JsonFileStore, MemoryStore, StorageConfig, Store};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<Settings>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(
            Arc::new(MemoryStore::default()),
            Arc::new(LogNotifier),
            Settings::default(),
        )
    }
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, settings: Settings) -> Self {
        Self {
            store,
            notifier,
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/events", post(create_event).get(list_events))
        .route("/events/:id", get(get_event).delete(delete_event))
        .route("/events/:id/start", post(start_event))
        .route("/events/:id/assignments", get(assignment_overview))
        .route("/events/:id/assignment", get(my_assignment))
        .route("/events/:id/reveal", post(reveal_assignment))
        .route("/events/:id/links", get(list_links))
        .route("/events/:id/links/:user_id", delete(disable_link))
        .route("/events/:id/links/:user_id/refresh", post(refresh_link))
        .route("/session", get(session))
        .with_state(state)
}

type ApiResult = Result<Response, ServiceError>;

#[derive(Deserialize, Default)]
struct AuthQuery {
    token: Option<String>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// An invitation token (query `token` or `x-invite-token`) wins over
/// `x-user-email` / `x-user-password`.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    token: Option<&str>,
) -> Result<Actor, ServiceError> {
    if let Some(token) = token.or_else(|| header(headers, "x-invite-token")) {
        let (event, link) = service::resolve_token(state.store(), token)
            .await?
            .ok_or(ServiceError::InvalidInvitation)?;
        if state.store.get_user(&link.user_id).await?.is_none() {
            warn!(event_id = %event.id, user_id = %link.user_id, "invitation points at a missing user");
            return Err(ServiceError::InvalidInvitation);
        }
        return Ok(Actor::Invitee {
            user_id: link.user_id,
            event_id: event.id,
        });
    }

    let (Some(email), Some(password)) = (
        header(headers, "x-user-email"),
        header(headers, "x-user-password"),
    ) else {
        return Err(ServiceError::Unauthorized);
    };
    let users = state.store.load_users().await?;
    match santa_core::authenticate(users.values(), email, password) {
        Some(user) => Ok(Actor::Member(user.clone())),
        None => {
            debug!("password login rejected");
            Err(ServiceError::Unauthorized)
        }
    }
}

async fn load_event(state: &AppState, event_id: &str) -> Result<Event, ServiceError> {
    state
        .store
        .get_event(event_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("event".into()))
}

struct Authorized {
    actor: Actor,
    event: Event,
    role: Role,
}

async fn authorized(
    state: &AppState,
    headers: &HeaderMap,
    token: Option<&str>,
    event_id: &str,
    op: Operation,
) -> Result<Authorized, ServiceError> {
    let actor = authenticate(state, headers, token).await?;
    let event = load_event(state, event_id).await?;
    let role = authorize(&actor, &event, op)?;
    Ok(Authorized { actor, event, role })
}

#[derive(Clone, Debug, Serialize)]
struct ParticipantView {
    id: UserId,
    name: String,
}

#[derive(Clone, Debug, Serialize)]
struct EventView {
    id: String,
    title: String,
    created_by: UserId,
    created_at: DateTime<Utc>,
    participants: Vec<ParticipantView>,
    is_started: bool,
    gift_value: Option<String>,
    role: Option<Role>,
}

fn to_view(event: &Event, users: &HashMap<UserId, User>, role: Option<Role>) -> EventView {
    EventView {
        id: event.id.clone(),
        title: event.title.clone(),
        created_by: event.created_by.clone(),
        created_at: event.created_at,
        participants: event
            .participant_ids
            .iter()
            .map(|id| ParticipantView {
                id: id.clone(),
                name: display_name(id, users),
            })
            .collect(),
        is_started: event.is_started,
        gift_value: event.gift_value.clone(),
        role,
    }
}

/// Runs after the event is saved, so a failed fan-out only shows up in the
/// response. Returns the notified addresses and whether the fan-out completed.
async fn notify_saved_event(
    state: &AppState,
    event: &mut Event,
    notice: Notice,
) -> (Vec<String>, bool) {
    match notify_participants(
        state.store(),
        state.notifier.as_ref(),
        event,
        notice,
        &state.settings.app_url,
    )
    .await
    {
        Ok(notified) => (notified, true),
        Err(err) => {
            warn!(event_id = %event.id, ?notice, %err, "event saved but notifications not sent");
            (Vec::new(), false)
        }
    }
}

#[derive(Deserialize)]
struct CreateEventRequest {
    title: String,
    participant_ids: Vec<UserId>,
    gift_value: Option<String>,
}

#[derive(Serialize)]
struct CreateEventResponse {
    event: EventView,
    notified: Vec<String>,
    notification_failed: bool,
}

async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateEventRequest>,
) -> ApiResult {
    let Actor::Member(creator) = authenticate(&state, &headers, None).await? else {
        return Err(SantaError::Forbidden.into());
    };
    if !creator.is_admin {
        return Err(SantaError::Forbidden.into());
    }

    let title = payload.title.trim();
    if title.is_empty() {
        return Err(ServiceError::BadRequest("title required".into()));
    }

    let users = state.store.load_users().await?;
    let mut participant_ids: Vec<UserId> = Vec::new();
    for id in std::iter::once(&creator.id).chain(payload.participant_ids.iter()) {
        if !users.contains_key(id) {
            return Err(ServiceError::BadRequest(format!("unknown participant: {id}")));
        }
        if !participant_ids.contains(id) {
            participant_ids.push(id.clone());
        }
    }

    let mut event = Event::new(
        Uuid::new_v4().to_string(),
        title,
        creator.id.clone(),
        participant_ids,
        Utc::now(),
    );
    event.gift_value = payload
        .gift_value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    state.store.upsert_event(&mut event).await?;
    info!(
        event_id = %event.id,
        created_by = %creator.id,
        participants = event.participant_ids.len(),
        "event created"
    );

    let (notified, complete) = notify_saved_event(&state, &mut event, Notice::Invitation).await;

    Ok((
        StatusCode::CREATED,
        Json(CreateEventResponse {
            event: to_view(&event, &users, Some(Role::Admin)),
            notified,
            notification_failed: !complete,
        }),
    )
        .into_response())
}

async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let actor = authenticate(&state, &headers, auth.token.as_deref()).await?;
    let events = match &actor {
        Actor::Member(user) if user.is_admin => {
            let mut all: Vec<Event> = state.store.load_events().await?.into_values().collect();
            all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            all
        }
        Actor::Member(user) => state.store.find_events_for_user(&user.id).await?,
        Actor::Invitee { event_id, .. } => state.store.get_event(event_id).await?.into_iter().collect(),
    };

    let users = state.store.load_users().await?;
    let views: Vec<EventView> = events
        .iter()
        .map(|e| to_view(e, &users, authorize(&actor, e, Operation::View).ok()))
        .collect();
    Ok(Json(views).into_response())
}

async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let Authorized { event, role, .. } = authorized(
        &state,
        &headers,
        auth.token.as_deref(),
        &event_id,
        Operation::View,
    )
    .await?;
    let users = state.store.load_users().await?;
    Ok(Json(to_view(&event, &users, Some(role))).into_response())
}

async fn delete_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let Authorized { actor, .. } = authorized(
        &state,
        &headers,
        auth.token.as_deref(),
        &event_id,
        Operation::Manage,
    )
    .await?;
    if !state.store.delete_event(&event_id).await? {
        return Err(ServiceError::NotFound("event".into()));
    }
    info!(%event_id, by = %actor.user_id(), "event deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
struct StartParams {
    seed: Option<u64>,
    token: Option<String>,
}

#[derive(Serialize)]
struct StartResponse {
    is_started: bool,
    assignments: usize,
    notified: Vec<String>,
    notification_failed: bool,
}

async fn start_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<StartParams>,
) -> ApiResult {
    let Authorized { mut event, .. } = authorized(
        &state,
        &headers,
        params.token.as_deref(),
        &event_id,
        Operation::Manage,
    )
    .await?;

    if event.is_started {
        return Err(ServiceError::InvalidState("event already started".into()));
    }

    let mut rng = params
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(|| ChaCha8Rng::from_entropy());
    service::assign(
        state.store(),
        &mut event,
        state.settings.draw_strategy,
        &mut rng,
    )
    .await?;

    let (notified, complete) = notify_saved_event(&state, &mut event, Notice::DrawReady).await;

    Ok(Json(StartResponse {
        is_started: event.is_started,
        assignments: event.assignments.len(),
        notified,
        notification_failed: !complete,
    })
    .into_response())
}

async fn assignment_overview(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let Authorized { event, .. } = authorized(
        &state,
        &headers,
        auth.token.as_deref(),
        &event_id,
        Operation::Manage,
    )
    .await?;
    let users = state.store.load_users().await?;
    let rows: Vec<AssignmentView> = santa_core::assignment_overview(&event, &users);
    Ok(Json(rows).into_response())
}

#[derive(Clone, Debug, Serialize)]
struct MyAssignmentView {
    is_started: bool,
    has_assignment: bool,
    revealed: bool,
    /// Only filled in once the participant has revealed.
    receiver: Option<String>,
    gift_value: Option<String>,
}

async fn my_assignment(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let Authorized { actor, event, .. } = authorized(
        &state,
        &headers,
        auth.token.as_deref(),
        &event_id,
        Operation::View,
    )
    .await?;

    let assignment = get_assignment_for(&event, actor.user_id());
    let receiver = match assignment {
        Some(a) if a.revealed => Some(service::receiver_display_name(state.store(), a).await?),
        _ => None,
    };

    Ok(Json(MyAssignmentView {
        is_started: event.is_started,
        has_assignment: assignment.is_some(),
        revealed: assignment.map(|a| a.revealed).unwrap_or(false),
        receiver,
        gift_value: event.gift_value.clone(),
    })
    .into_response())
}

#[derive(Clone, Debug, Serialize)]
struct RevealResponse {
    receiver: String,
    first_time: bool,
}

async fn reveal_assignment(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let Authorized {
        actor, mut event, ..
    } = authorized(
        &state,
        &headers,
        auth.token.as_deref(),
        &event_id,
        Operation::Reveal,
    )
    .await?;

    let outcome = service::reveal(state.store(), &mut event, actor.user_id()).await?;
    let first_time = outcome.changed();
    let assignment = match outcome {
        RevealOutcome::Revealed(a) | RevealOutcome::AlreadyRevealed(a) => a,
        RevealOutcome::NotStarted => {
            return Err(ServiceError::InvalidState("the draw has not happened yet".into()))
        }
        RevealOutcome::NoAssignment => return Err(ServiceError::NotFound("assignment".into())),
    };
    let receiver = service::receiver_display_name(state.store(), &assignment).await?;

    Ok(Json(RevealResponse {
        receiver,
        first_time,
    })
    .into_response())
}

#[derive(Clone, Debug, Serialize)]
struct InviteView {
    user_id: UserId,
    name: String,
    url: String,
}

async fn list_links(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let Authorized { mut event, .. } = authorized(
        &state,
        &headers,
        auth.token.as_deref(),
        &event_id,
        Operation::Manage,
    )
    .await?;
    service::ensure_links_for_event(state.store(), &mut event).await?;

    let users = state.store.load_users().await?;
    let invites: Vec<InviteView> = event
        .participant_ids
        .iter()
        .filter_map(|id| get_link_for(&event, id))
        .map(|link| InviteView {
            user_id: link.user_id.clone(),
            name: display_name(&link.user_id, &users),
            url: invite_url(&state.settings.app_url, &link.token),
        })
        .collect();
    Ok(Json(invites).into_response())
}

async fn refresh_link(
    State(state): State<AppState>,
    Path((event_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let Authorized { mut event, .. } = authorized(
        &state,
        &headers,
        auth.token.as_deref(),
        &event_id,
        Operation::Manage,
    )
    .await?;
    let link = service::refresh_link(state.store(), &mut event, &user_id).await?;
    let users = state.store.load_users().await?;
    Ok(Json(InviteView {
        name: display_name(&user_id, &users),
        url: invite_url(&state.settings.app_url, &link.token),
        user_id,
    })
    .into_response())
}

async fn disable_link(
    State(state): State<AppState>,
    Path((event_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let Authorized { mut event, .. } = authorized(
        &state,
        &headers,
        auth.token.as_deref(),
        &event_id,
        Operation::Manage,
    )
    .await?;
    service::disable_link(state.store(), &mut event, &user_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Clone, Debug, Serialize)]
struct SessionView {
    user_id: UserId,
    name: String,
    is_admin: bool,
    /// Set when the session came from an invitation link.
    event_id: Option<String>,
    event_title: Option<String>,
}

async fn session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> ApiResult {
    let view = match authenticate(&state, &headers, auth.token.as_deref()).await? {
        Actor::Member(user) => SessionView {
            user_id: user.id,
            name: user.name,
            is_admin: user.is_admin,
            event_id: None,
            event_title: None,
        },
        Actor::Invitee { user_id, event_id } => {
            let event = load_event(&state, &event_id).await?;
            let user = state
                .store
                .get_user(&user_id)
                .await?
                .ok_or(ServiceError::InvalidInvitation)?;
            SessionView {
                user_id,
                name: user.name,
                is_admin: false,
                event_id: Some(event.id),
                event_title: Some(event.title),
            }
        }
    };
    Ok(Json(view).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use rand::seq::SliceRandom;
    use serde_json::json;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(Notice, String, String)>>,
    }

    impl RecordingNotifier {
        /// Token from the most recent message to `email`.
        fn token_for(&self, email: &str) -> String {
            let sent = self.sent.lock().unwrap();
            let (_, _, url) = sent.iter().rev().find(|(_, to, _)| to == email).unwrap();
            url.split("token=").nth(1).unwrap().to_string()
        }

        fn count(&self, notice: Notice) -> usize {
            self.sent.lock().unwrap().iter().filter(|(n, _, _)| *n == notice).count()
        }
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            notice: Notice,
            to: &User,
            _event: &Event,
            url: &str,
        ) -> Result<(), notify::NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((notice, to.email.clone(), url.to_string()));
            Ok(())
        }
    }

    fn user(id: &str, name: &str, is_admin: bool) -> User {
        User {
            id: id.into(),
            name: name.into(),
            email: format!("{id}@example.com"),
            password: "temp123".into(),
            is_admin,
            password_changed: false,
        }
    }

    fn seeded_users() -> Vec<User> {
        vec![
            user("anna", "Anna Schmidt", true),
            user("max", "Max Mueller", false),
            user("lisa", "Lisa Weber", false),
            user("tom", "Tom Fischer", false),
        ]
    }

    fn test_app_with(store: Arc<dyn Store>) -> (Router, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = Settings {
            app_url: "https://santa.test".into(),
            ..Settings::default()
        };
        let state = AppState::new(store, notifier.clone(), settings);
        (app(state), notifier)
    }

    fn test_app() -> (Router, Arc<RecordingNotifier>) {
        test_app_with(Arc::new(MemoryStore::with_users(seeded_users())))
    }

    async fn json_body(res: Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn text_body(res: Response) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn as_user(method: Method, uri: &str, user_id: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-email", format!("{user_id}@example.com"))
            .header("x-user-password", "temp123")
    }

    fn bare(method: Method, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    async fn create_event(app: &Router, participants: &[&str]) -> String {
        let res = send(
            app,
            as_user(Method::POST, "/events", "anna")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "title": "Office 2025", "participant_ids": participants, "gift_value": "25 EUR" })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        json_body(res).await["event"]["id"].as_str().unwrap().to_string()
    }

    async fn start(app: &Router, event_id: &str, seed: u64) -> Response {
        send(
            app,
            as_user(Method::POST, &format!("/events/{event_id}/start?seed={seed}"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    #[tokio::test]
    async fn create_event_requires_admin_credentials() {
        let (app, _) = test_app();
        let body = json!({ "title": "x", "participant_ids": ["max"] }).to_string();

        let res = send(
            &app,
            Request::builder()
                .method(Method::POST)
                .uri("/events")
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = send(
            &app,
            as_user(Method::POST, "/events", "max")
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = send(
            &app,
            Request::builder()
                .method(Method::POST)
                .uri("/events")
                .header("x-user-email", "anna@example.com")
                .header("x-user-password", "wrong")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_event_adds_creator_dedupes_and_invites_everyone() {
        let (app, notifier) = test_app();
        let res = send(
            &app,
            as_user(Method::POST, "/events", "anna")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "title": "  Family  ", "participant_ids": ["max", "lisa", "max"], "gift_value": " " })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = json_body(res).await;

        assert_eq!(body["event"]["title"], "Family");
        assert_eq!(body["event"]["gift_value"], serde_json::Value::Null);
        assert_eq!(body["event"]["is_started"], false);
        let ids: Vec<&str> = body["event"]["participants"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["anna", "max", "lisa"]);
        assert_eq!(body["notified"].as_array().unwrap().len(), 3);
        assert_eq!(notifier.count(Notice::Invitation), 3);
        assert!(notifier.token_for("max@example.com").starts_with(santa_core::TOKEN_PREFIX));
    }

    #[tokio::test]
    async fn create_event_validates_input() {
        let (app, _) = test_app();
        for payload in [
            json!({ "title": "", "participant_ids": ["max"] }),
            json!({ "title": "Party", "participant_ids": ["max", "nobody"] }),
        ] {
            let res = send(
                &app,
                as_user(Method::POST, "/events", "anna")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await;
            assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn invitation_token_is_scoped_to_its_event() {
        let (app, notifier) = test_app();
        let first = create_event(&app, &["max", "lisa"]).await;
        let token = notifier.token_for("max@example.com");
        let second = create_event(&app, &["tom", "lisa"]).await;

        let res = send(&app, bare(Method::GET, &format!("/session?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::OK);
        let session = json_body(res).await;
        assert_eq!(session["user_id"], "max");
        assert_eq!(session["event_id"], first.as_str());
        assert_eq!(session["is_admin"], false);

        let res = send(&app, bare(Method::GET, &format!("/events/{first}?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["role"], "participant");

        let res = send(&app, bare(Method::GET, &format!("/events/{second}?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = send(&app, bare(Method::POST, &format!("/events/{first}/start?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = send(&app, bare(Method::GET, &format!("/events?token={token}"))).await;
        let listed = json_body(res).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["id"], first.as_str());
    }

    #[tokio::test]
    async fn unknown_token_gets_generic_message() {
        let (app, _) = test_app();
        create_event(&app, &["max"]).await;

        for token in ["sst_00000000000000000000000000000000", "garbage"] {
            let res = send(&app, bare(Method::GET, &format!("/session?token={token}"))).await;
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(text_body(res).await, "invalid or deactivated invitation link");
        }
    }

    #[tokio::test]
    async fn seeded_start_draws_reproducibly_and_blocks_restart() {
        let (app, notifier) = test_app();
        let event_id = create_event(&app, &["max", "lisa", "tom"]).await;

        let res = start(&app, &event_id, 42).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["is_started"], true);
        assert_eq!(body["assignments"], 4);
        assert_eq!(body["notified"].as_array().unwrap().len(), 4);
        assert_eq!(body["notification_failed"], false);
        assert_eq!(notifier.count(Notice::DrawReady), 4);

        let givers: Vec<String> = ["anna", "max", "lisa", "tom"].map(String::from).to_vec();
        let mut expected = givers.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        expected.shuffle(&mut rng);
        santa_core::assign::correct_self_matches(&givers, &mut expected);

        let res = send(
            &app,
            as_user(Method::GET, &format!("/events/{event_id}/assignments"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let rows = json_body(res).await;
        let names: HashMap<&str, &str> = seeded_users_names();
        let drawn: Vec<&str> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["receiver"].as_str().unwrap())
            .collect();
        let expected_names: Vec<&str> = expected.iter().map(|id| names[id.as_str()]).collect();
        assert_eq!(drawn, expected_names);

        let res = start(&app, &event_id, 7).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    /// Accepts event writes until the event carries invitation links.
    struct LinklessStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl Store for LinklessStore {
        async fn load_users(&self) -> Result<HashMap<UserId, User>, StoreError> {
            self.inner.load_users().await
        }
        async fn load_events(&self) -> Result<HashMap<String, Event>, StoreError> {
            self.inner.load_events().await
        }
        async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
            self.inner.upsert_user(user).await
        }
        async fn replace_users(&self, users: HashMap<UserId, User>) -> Result<(), StoreError> {
            self.inner.replace_users(users).await
        }
        async fn upsert_event(&self, event: &mut Event) -> Result<(), StoreError> {
            if !event.access_links.is_empty() {
                return Err(std::io::Error::other("read-only volume").into());
            }
            self.inner.upsert_event(event).await
        }
        async fn delete_event(&self, event_id: &str) -> Result<bool, StoreError> {
            self.inner.delete_event(event_id).await
        }
    }

    #[tokio::test]
    async fn start_succeeds_when_notifications_cannot_be_saved() {
        let store = Arc::new(LinklessStore {
            inner: MemoryStore::with_users(seeded_users()),
        });
        let mut event = Event::new(
            "e1",
            "Office",
            "anna",
            vec!["anna".into(), "max".into(), "lisa".into()],
            Utc::now(),
        );
        store.upsert_event(&mut event).await.unwrap();
        let (app, notifier) = test_app_with(store.clone());

        let res = start(&app, "e1", 5).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["is_started"], true);
        assert_eq!(body["assignments"], 3);
        assert_eq!(body["notification_failed"], true);
        assert_eq!(body["notified"].as_array().unwrap().len(), 0);
        assert_eq!(notifier.count(Notice::DrawReady), 0);

        let stored = store.get_event("e1").await.unwrap().unwrap();
        assert!(stored.is_started);
        assert_eq!(stored.assignments.len(), 3);

        assert_eq!(start(&app, "e1", 6).await.status(), StatusCode::CONFLICT);
    }

    fn seeded_users_names() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("anna", "Anna Schmidt"),
            ("max", "Max Mueller"),
            ("lisa", "Lisa Weber"),
            ("tom", "Tom Fischer"),
        ])
    }

    #[tokio::test]
    async fn participant_reveals_own_receiver_once() {
        let (app, notifier) = test_app();
        let event_id = create_event(&app, &["max", "lisa"]).await;
        let token = notifier.token_for("max@example.com");

        let res = send(&app, bare(Method::POST, &format!("/events/{event_id}/reveal?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        assert_eq!(start(&app, &event_id, 3).await.status(), StatusCode::OK);
        // the draw-ready mail reuses the invitation link
        assert_eq!(notifier.token_for("max@example.com"), token);

        let res = send(&app, bare(Method::GET, &format!("/events/{event_id}/assignment?token={token}"))).await;
        let mine = json_body(res).await;
        assert_eq!(mine["is_started"], true);
        assert_eq!(mine["has_assignment"], true);
        assert_eq!(mine["revealed"], false);
        assert_eq!(mine["receiver"], serde_json::Value::Null);
        assert_eq!(mine["gift_value"], "25 EUR");

        let res = send(&app, bare(Method::POST, &format!("/events/{event_id}/reveal?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::OK);
        let first = json_body(res).await;
        assert_eq!(first["first_time"], true);
        let receiver = first["receiver"].as_str().unwrap().to_string();
        assert_ne!(receiver, "Max Mueller");

        let res = send(&app, bare(Method::POST, &format!("/events/{event_id}/reveal?token={token}"))).await;
        let again = json_body(res).await;
        assert_eq!(again["first_time"], false);
        assert_eq!(again["receiver"], receiver.as_str());

        let res = send(
            &app,
            as_user(Method::GET, &format!("/events/{event_id}/assignments"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let rows = json_body(res).await;
        let revealed: Vec<(&str, bool)> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| (r["giver"].as_str().unwrap(), r["revealed"].as_bool().unwrap()))
            .collect();
        assert_eq!(
            revealed,
            vec![("Anna Schmidt", false), ("Max Mueller", true), ("Lisa Weber", false)]
        );

        // participants cannot see the overview
        let res = send(&app, bare(Method::GET, &format!("/events/{event_id}/assignments?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn refresh_and_disable_invalidate_links() {
        let (app, notifier) = test_app();
        let event_id = create_event(&app, &["max", "lisa"]).await;
        let old = notifier.token_for("max@example.com");

        let res = send(
            &app,
            as_user(Method::GET, &format!("/events/{event_id}/links"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let links = json_body(res).await;
        assert_eq!(links.as_array().unwrap().len(), 3);
        assert_eq!(links[1]["user_id"], "max");
        assert_eq!(links[1]["url"], format!("https://santa.test?token={old}"));

        let res = send(
            &app,
            as_user(Method::POST, &format!("/events/{event_id}/links/max/refresh"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let refreshed = json_body(res).await;
        let new = refreshed["url"].as_str().unwrap().split("token=").nth(1).unwrap().to_string();
        assert_ne!(new, old);

        let res = send(&app, bare(Method::GET, &format!("/session?token={old}"))).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let res = send(&app, bare(Method::GET, &format!("/session?token={new}"))).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = send(
            &app,
            as_user(Method::DELETE, &format!("/events/{event_id}/links/max"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let res = send(&app, bare(Method::GET, &format!("/session?token={new}"))).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = send(
            &app,
            as_user(Method::POST, &format!("/events/{event_id}/links/tom/refresh"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn listing_depends_on_who_asks() {
        let (app, _) = test_app();
        create_event(&app, &["max"]).await;
        create_event(&app, &["lisa", "tom"]).await;

        let res = send(&app, as_user(Method::GET, "/events", "anna").body(Body::empty()).unwrap()).await;
        let all = json_body(res).await;
        assert_eq!(all.as_array().unwrap().len(), 2);
        assert_eq!(all[0]["role"], "admin");

        let res = send(&app, as_user(Method::GET, "/events", "lisa").body(Body::empty()).unwrap()).await;
        let mine = json_body(res).await;
        assert_eq!(mine.as_array().unwrap().len(), 1);
        assert_eq!(mine[0]["role"], "participant");

        let res = send(&app, bare(Method::GET, "/events")).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn deleted_event_is_gone() {
        let (app, notifier) = test_app();
        let event_id = create_event(&app, &["max"]).await;
        let token = notifier.token_for("max@example.com");

        let res = send(
            &app,
            as_user(Method::DELETE, &format!("/events/{event_id}"), "max")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = send(
            &app,
            as_user(Method::DELETE, &format!("/events/{event_id}"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = send(
            &app,
            as_user(Method::GET, &format!("/events/{event_id}"), "anna")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = send(&app, bare(Method::GET, &format!("/session?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn events_survive_restart_with_json_storage() {
        let dir = std::env::temp_dir().join(format!("santa_state_{}", Uuid::new_v4()));
        let store = store::open(&StorageConfig::JsonFiles { dir: dir.clone() })
            .await
            .unwrap();
        store.replace_users(seeded_users().into_iter().map(|u| (u.id.clone(), u)).collect())
            .await
            .unwrap();
        let (app, notifier) = test_app_with(store);
        let event_id = create_event(&app, &["max", "lisa"]).await;
        assert_eq!(start(&app, &event_id, 11).await.status(), StatusCode::OK);
        let token = notifier.token_for("lisa@example.com");

        let reopened: Arc<dyn Store> = Arc::new(JsonFileStore::new(&dir));
        let (app, _) = test_app_with(reopened);
        let res = send(&app, bare(Method::GET, &format!("/events/{event_id}/assignment?token={token}"))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["has_assignment"], true);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
