//! REST API over the dashboard store using Axum (served on port 11111)
//!
//! - `/dashboard`: the aggregate state, and a manual refresh.
//! - `/collections/:table`: raw parameterized reads, plus a websocket that
//!   streams that table's change events.
//! - `/users`, `/fields`, `/tasks`, `/notifications`, `/weather`: the
//!   mutation pass-throughs.

use axum::{
    async_trait,
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::changes::Subscription;
use crate::error::SyncError;
use crate::models::{
    Field, FieldUpdate, NewField, NewForecastDay, NewNotification, NewTask, NewUser,
    NewWeatherSnapshot, Notification, Task, TaskStatus, TaskUpdate, User, UserUpdate,
};
use crate::query::{fetch, presets, QueryOptions};
use crate::schema::Collection;
use crate::storage::CollectionStore;
use crate::store::FarmData;

/// Shared app state for REST handlers
#[derive(Clone)]
pub struct AppState {
    data: Arc<FarmData>,
}

/// Every endpoint answers with this envelope.
#[derive(Serialize, Deserialize, Debug)]
pub struct RestResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RestResponse {
    fn ok(message: impl Into<String>, data: impl Serialize) -> Result<Json<Self>, ApiError> {
        Ok(Json(Self {
            success: true,
            message: message.into(),
            data: Some(serde_json::to_value(data).map_err(SyncError::from)?),
        }))
    }
}

/// A [`SyncError`] on its way out as an HTTP status.
#[derive(Debug)]
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::NotFound { .. } | SyncError::UnknownCollection(_) => StatusCode::NOT_FOUND,
            SyncError::Invalid(_) => StatusCode::BAD_REQUEST,
            SyncError::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        let body = RestResponse {
            success: false,
            message: self.0.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

/// [`Json`] body whose rejection is a 400 in the usual envelope.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(SyncError::invalid(rejection.body_text()))),
        }
    }
}

/// [`Query`] string whose rejection is a 400 in the usual envelope.
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(SyncError::invalid(rejection.body_text()))),
        }
    }
}

type ApiResult = Result<Json<RestResponse>, ApiError>;
type Created = Result<(StatusCode, Json<RestResponse>), ApiError>;

/// Create the Axum router over a running dashboard store
pub fn create_router(data: Arc<FarmData>) -> Router {
    let state = Arc::new(AppState { data });

    Router::new()
        .route("/health", get(health_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/dashboard/refresh", post(refresh_handler))
        .route("/collections/:table", get(collection_handler))
        .route("/collections/:table/changes", get(changes_handler))
        .route("/users", get(list_users_handler).post(create_user_handler))
        .route(
            "/users/:id",
            get(get_user_handler)
                .patch(update_user_handler)
                .delete(delete_user_handler),
        )
        .route("/users/:id/notifications/clear", post(clear_notifications_handler))
        .route("/fields", get(list_fields_handler).post(create_field_handler))
        .route(
            "/fields/:id",
            get(get_field_handler)
                .patch(update_field_handler)
                .delete(delete_field_handler),
        )
        .route("/tasks", get(list_tasks_handler).post(create_task_handler))
        .route(
            "/tasks/:id",
            get(get_task_handler)
                .patch(update_task_handler)
                .delete(delete_task_handler),
        )
        .route(
            "/notifications",
            get(list_notifications_handler).post(create_notification_handler),
        )
        .route("/notifications/:id/read", post(mark_read_handler))
        .route("/weather", post(record_weather_handler))
        .with_state(state)
}

/// Health check handler
async fn health_handler() -> Json<RestResponse> {
    Json(RestResponse {
        success: true,
        message: "farm_sync healthy".to_string(),
        data: None,
    })
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    RestResponse::ok("dashboard state", state.data.state())
}

/// Runs a refresh and reports the resulting state. A partial refresh still
/// answers 200; the failure is in `message` and in the state's `error`.
async fn refresh_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let outcome = state.data.refresh().await;
    let mut response = RestResponse::ok("dashboard refreshed", state.data.state())?;
    if let Err(e) = outcome {
        warn!(error = %e, "manual refresh incomplete");
        response.success = false;
        response.message = format!("refresh incomplete: {}", e);
    }
    Ok(response)
}

/// Query-string form of [`QueryOptions`]; values arrive as text.
#[derive(Deserialize, Debug, Default)]
pub struct CollectionQuery {
    pub filter_column: Option<String>,
    pub filter_value: Option<String>,
    pub order_by: Option<String>,
    pub ascending: Option<bool>,
    pub limit: Option<usize>,
    pub select: Option<String>,
}

impl CollectionQuery {
    fn into_options(self) -> Result<QueryOptions, SyncError> {
        let filter_value = match (&self.filter_column, self.filter_value) {
            (Some(_), Some(value)) => Some(Value::String(value)),
            (Some(column), None) => {
                return Err(SyncError::invalid(format!(
                    "filter_column {} given without filter_value",
                    column
                )))
            }
            (None, _) => None,
        };
        Ok(QueryOptions {
            filter_column: self.filter_column,
            filter_value,
            order_by: self.order_by,
            ascending: self.ascending,
            limit: self.limit,
            select: self.select,
        })
    }
}

async fn collection_handler(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    ApiQuery(query): ApiQuery<CollectionQuery>,
) -> ApiResult {
    let collection: Collection = table.parse()?;
    let options = query.into_options()?;
    let rows = state.data.store().select(collection, &options).await?;
    RestResponse::ok(format!("{} rows from {}", rows.len(), collection), rows)
}

/// Websocket: one JSON text frame per change event on `table`.
async fn changes_handler(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let collection: Collection = table.parse()?;
    let subscription = state.data.store().subscribe(collection);
    Ok(ws.on_upgrade(move |socket| stream_changes(socket, subscription)))
}

async fn stream_changes(socket: WebSocket, mut subscription: Subscription) {
    let collection = subscription.collection();
    debug!(collection = %collection, "change stream opened");
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(collection = %collection, error = %e, "unencodable change event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(collection = %collection, "change stream closed");
}

// --- users ---

async fn list_users_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let users: Vec<User> = fetch(state.data.store().as_ref(), Collection::Users, &presets::users()).await?;
    RestResponse::ok(format!("{} users", users.len()), users)
}

async fn create_user_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<NewUser>,
) -> Created {
    let user = state.data.create_user(payload).await?;
    Ok((StatusCode::CREATED, RestResponse::ok("user created", user)?))
}

async fn get_user_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    RestResponse::ok("user", state.data.user(&id).await?)
}

async fn update_user_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<UserUpdate>,
) -> ApiResult {
    RestResponse::ok("user updated", state.data.update_user(&id, payload).await?)
}

async fn delete_user_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    RestResponse::ok(format!("user {} deleted", id), state.data.delete_user(&id).await?)
}

// --- fields ---

async fn list_fields_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let fields: Vec<Field> = fetch(state.data.store().as_ref(), Collection::Fields, &presets::fields()).await?;
    RestResponse::ok(format!("{} fields", fields.len()), fields)
}

async fn create_field_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<NewField>,
) -> Created {
    let field = state.data.create_field(payload).await?;
    Ok((StatusCode::CREATED, RestResponse::ok("field created", field)?))
}

async fn get_field_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    RestResponse::ok("field", state.data.field(&id).await?)
}

async fn update_field_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<FieldUpdate>,
) -> ApiResult {
    RestResponse::ok("field updated", state.data.update_field(&id, payload).await?)
}

async fn delete_field_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    RestResponse::ok(format!("field {} deleted", id), state.data.delete_field(&id).await?)
}

// --- tasks ---

#[derive(Deserialize, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
}

async fn list_tasks_handler(
    State(state): State<Arc<AppState>>,
    ApiQuery(filter): ApiQuery<TaskFilter>,
) -> ApiResult {
    let tasks: Vec<Task> = fetch(
        state.data.store().as_ref(),
        Collection::Tasks,
        &presets::tasks(filter.status),
    )
    .await?;
    RestResponse::ok(format!("{} tasks", tasks.len()), tasks)
}

async fn create_task_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<NewTask>,
) -> Created {
    let task = state.data.create_task(payload).await?;
    Ok((StatusCode::CREATED, RestResponse::ok("task created", task)?))
}

async fn get_task_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    RestResponse::ok("task", state.data.task(&id).await?)
}

async fn update_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<TaskUpdate>,
) -> ApiResult {
    RestResponse::ok("task updated", state.data.update_task(&id, payload).await?)
}

async fn delete_task_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    RestResponse::ok(format!("task {} deleted", id), state.data.delete_task(&id).await?)
}

// --- notifications ---

#[derive(Deserialize, Debug, Default)]
pub struct NotificationFilter {
    pub user_id: Option<String>,
}

async fn list_notifications_handler(
    State(state): State<Arc<AppState>>,
    ApiQuery(filter): ApiQuery<NotificationFilter>,
) -> ApiResult {
    let notifications: Vec<Notification> = fetch(
        state.data.store().as_ref(),
        Collection::Notifications,
        &presets::notifications(filter.user_id.as_deref()),
    )
    .await?;
    RestResponse::ok(format!("{} notifications", notifications.len()), notifications)
}

async fn create_notification_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<NewNotification>,
) -> Created {
    let notification = state.data.create_notification(payload).await?;
    Ok((StatusCode::CREATED, RestResponse::ok("notification created", notification)?))
}

async fn mark_read_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    RestResponse::ok(
        "notification marked as read",
        state.data.mark_notification_as_read(&id).await?,
    )
}

async fn clear_notifications_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult {
    RestResponse::ok(
        format!("notifications cleared for {}", user_id),
        state.data.clear_all_notifications(&user_id).await?,
    )
}

// --- weather ---

/// A reading plus the forecast that replaces the current one.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WeatherReport {
    pub snapshot: NewWeatherSnapshot,
    #[serde(default)]
    pub forecast: Vec<NewForecastDay>,
}

async fn record_weather_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(report): ApiJson<WeatherReport>,
) -> Created {
    let recorded = state.data.record_weather(report.snapshot, report.forecast).await?;
    Ok((StatusCode::CREATED, RestResponse::ok("weather recorded", recorded)?))
}
