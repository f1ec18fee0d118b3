//! JSON HTTP surface: push tokens, spot subscriptions, favourite spots and
//! read-only reports.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};
use ulid::Ulid;

use crate::aggregate::Aggregator;
use crate::model::{SpotId, UserId};
use crate::notifications::NotificationService;
use crate::store::{HistoryStore, StorageError, Store};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid id {0:?}")]
    InvalidId(String),
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),
    #[error("no history for spot {0}")]
    NoHistory(SpotId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NoHistory(_) => StatusCode::NOT_FOUND,
            AppError::InvalidId(_) | AppError::InvalidBody(_) | AppError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub notifications: Arc<NotificationService>,
    pub aggregator: Arc<Aggregator>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePushToken {
    pub user_id: UserId,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePushToken {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavouriteSpot {
    /// `null` or absent clears the favourite.
    pub favourite_spot_id: Option<SpotId>,
}

/// Body of both subscribe and unsubscribe-by-pair.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotSubscription {
    pub user_id: UserId,
    pub parking_spot_id: SpotId,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/notifications/push-token",
            post(save_push_token).delete(delete_push_token),
        )
        .route("/notifications/subscribe", post(subscribe))
        .route("/notifications/unsubscribe", delete(unsubscribe_from_spot))
        .route("/notifications/user/{user_id}", get(user_notifications))
        .route("/notifications/{notification_id}", delete(unsubscribe))
        .route(
            "/users/{user_id}/favourite-spot",
            get(favourite_spot).put(set_favourite_spot),
        )
        .route("/spots", get(list_spots))
        .route("/spots/{spot_id}/favourited-by", get(favourited_by))
        .route("/history/occupancy-count", get(occupancy_count))
        .route("/history/{spot_id}", get(spot_history))
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let response = next.run(request).await;
    metrics::counter!(
        crate::observability::HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

fn parse_id(raw: &str) -> Result<Ulid, AppError> {
    Ulid::from_string(raw).map_err(|e| {
        warn!("rejecting id {raw:?}: {e}");
        AppError::InvalidId(raw.to_string())
    })
}

async fn save_push_token(
    State(state): State<AppState>,
    body: Result<Json<SavePushToken>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = body?;
    state
        .notifications
        .save_push_token(body.user_id, body.token)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true }))))
}

async fn delete_push_token(
    State(state): State<AppState>,
    body: Result<Json<DeletePushToken>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = body?;
    state.notifications.delete_push_token(body.user_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn subscribe(
    State(state): State<AppState>,
    body: Result<Json<SpotSubscription>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = body?;
    let sub = state
        .notifications
        .subscribe(body.user_id, body.parking_spot_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "notificationId": sub.notification_id })),
    ))
}

async fn user_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = parse_id(&user_id)?;
    let subs = state.notifications.user_notifications(&user_id);
    Ok(Json(json!({ "userNotifications": subs })))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let notification_id = parse_id(&notification_id)?;
    state.notifications.unsubscribe(notification_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn unsubscribe_from_spot(
    State(state): State<AppState>,
    body: Result<Json<SpotSubscription>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = body?;
    state
        .notifications
        .unsubscribe_user_from_spot(body.user_id, body.parking_spot_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn favourite_spot(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = parse_id(&user_id)?;
    Ok(Json(json!({ "favouriteSpotId": state.store.favourite_spot(&user_id) })))
}

async fn set_favourite_spot(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    body: Result<Json<FavouriteSpot>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = parse_id(&user_id)?;
    let Json(body) = body?;
    state
        .store
        .set_favourite_spot(user_id, body.favourite_spot_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn favourited_by(
    State(state): State<AppState>,
    Path(spot_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let spot_id = parse_id(&spot_id)?;
    Ok(Json(json!({ "userIds": state.store.users_with_favourite_spot(&spot_id) })))
}

async fn list_spots(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "spots": state.store.list_spots() }))
}

async fn spot_history(
    State(state): State<AppState>,
    Path(spot_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let spot_id = parse_id(&spot_id)?;
    let history = state
        .store
        .all(spot_id)
        .await?
        .ok_or(AppError::NoHistory(spot_id))?;
    Ok(Json(json!({ "history": history })))
}

async fn occupancy_count(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.aggregator.occupancy_counts().await?))
}
