use crate::profile::embedder::Embedder;
use crate::profile::{ProfileCard, ProfileSubmission, ProfileText};
use crate::similarity::engine::SimilarityEngine;
use crate::similarity::error::SimilarityError;
use crate::similarity::storage::Storage;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::{json, with_status, Json, WithStatus};
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeRequest {
    pub event_id: String,
    #[serde(default)]
    pub profile_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeResponse {
    pub success: bool,
    pub scores_calculated: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub profile_id: String,
    pub similarity_score: f64,
    #[serde(flatten)]
    pub card: ProfileCard,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub profile_id: String,
    pub embedded: bool,
}

pub struct App {
    pub engine: SimilarityEngine,
    pub storage: Storage,
    pub embedder: Arc<dyn Embedder>,
    pub dimensions: usize,
    pub max_tokens: usize,
}

pub fn routes(app: Arc<App>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let with_app = warp::any().map(move || Arc::clone(&app));

    let recompute_route = warp::path("similarities")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_app.clone())
        .and_then(handle_recompute);

    let connections_route = warp::path!("events" / String / "profiles" / String / "connections")
        .and(warp::get())
        .and(with_app.clone())
        .and_then(handle_connections);

    let register_route = warp::path!("events" / String / "profiles")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_app)
        .and_then(handle_register);

    recompute_route.or(connections_route).or(register_route)
}

async fn handle_recompute(
    request: RecomputeRequest,
    app: Arc<App>,
) -> Result<WithStatus<Json>, Infallible> {
    info!("get recompute request: {:?}", request);
    let result = match &request.profile_id {
        Some(profile_id) => {
            app.engine
                .recompute_for_profile(&request.event_id, profile_id)
                .await
        }
        None => app.engine.recompute_for_event(&request.event_id).await,
    };

    match result {
        Ok(outcome) => Ok(with_status(
            json(&RecomputeResponse {
                success: true,
                scores_calculated: outcome.scores_calculated,
            }),
            StatusCode::OK,
        )),
        Err(e) => {
            warn!("recompute {:?} failed: {}", request, e);
            Ok(error_reply(&e))
        }
    }
}

async fn handle_connections(
    event_id: String,
    profile_id: String,
    app: Arc<App>,
) -> Result<WithStatus<Json>, Infallible> {
    match app.engine.connections(&event_id, &profile_id).await {
        Ok(scored) => {
            let connections = scored
                .into_iter()
                .map(|s| Connection {
                    profile_id: s.profile_id,
                    similarity_score: s.similarity_score,
                    card: s.item,
                })
                .collect::<Vec<_>>();
            info!(
                "get connections request: event: {}, profile: {} return {}",
                event_id,
                profile_id,
                connections.len()
            );
            Ok(with_status(json(&connections), StatusCode::OK))
        }
        Err(e) => {
            warn!("connections of {} in {} failed: {}", profile_id, event_id, e);
            Ok(error_reply(&e))
        }
    }
}

async fn handle_register(
    event_id: String,
    submission: ProfileSubmission,
    app: Arc<App>,
) -> Result<WithStatus<Json>, Infallible> {
    info!("get register request: event: {}, {}", event_id, submission);
    if event_id.is_empty() || submission.profile_id.is_empty() {
        return Ok(message_reply(
            "event id and profile id are required",
            StatusCode::BAD_REQUEST,
        ));
    }

    if let Err(e) = app
        .storage
        .save_card(&event_id, &submission.profile_id, &submission.card())
        .await
    {
        error!("store card of {} failed: {}", submission.profile_id, e);
        return Ok(message_reply(&e.to_string(), StatusCode::BAD_GATEWAY));
    }
    // the old vector describes the previous card
    if let Err(e) = app
        .storage
        .clear_vector(&event_id, &submission.profile_id)
        .await
    {
        error!("clear vector of {} failed: {}", submission.profile_id, e);
        return Ok(message_reply(&e.to_string(), StatusCode::BAD_GATEWAY));
    }

    let text = match ProfileText::compose(&submission, app.max_tokens) {
        Ok(text) => text,
        Err(e) => {
            warn!("compose text of {} failed: {}", submission.profile_id, e);
            return Ok(message_reply(
                &e.to_string(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
    };
    if text.is_empty() {
        info!("profile {} has nothing to embed yet", submission.profile_id);
        return Ok(register_reply(submission.profile_id, false));
    }

    let vector = match app.embedder.embed(text).await {
        Ok(vector) => vector,
        Err(e) => {
            warn!("embedding {} failed: {}", submission.profile_id, e);
            return Ok(message_reply(
                &format!("embedding failed: {}", e),
                StatusCode::BAD_GATEWAY,
            ));
        }
    };
    if vector.len() != app.dimensions {
        warn!(
            "embedding of {} has {} dimensions, expected {}",
            submission.profile_id,
            vector.len(),
            app.dimensions
        );
        return Ok(message_reply(
            "embedding has unexpected dimensions",
            StatusCode::BAD_GATEWAY,
        ));
    }

    if let Err(e) = app
        .storage
        .save_vector(&event_id, &submission.profile_id, &vector)
        .await
    {
        error!("store vector of {} failed: {}", submission.profile_id, e);
        return Ok(message_reply(&e.to_string(), StatusCode::BAD_GATEWAY));
    }
    Ok(register_reply(submission.profile_id, true))
}

fn register_reply(profile_id: String, embedded: bool) -> WithStatus<Json> {
    with_status(
        json(&RegisterResponse {
            profile_id,
            embedded,
        }),
        StatusCode::OK,
    )
}

fn error_reply(e: &SimilarityError) -> WithStatus<Json> {
    let status = match e {
        SimilarityError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SimilarityError::MissingEmbedding { .. } => StatusCode::CONFLICT,
        SimilarityError::UpstreamRead(_) | SimilarityError::UpstreamWrite(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    message_reply(&e.to_string(), status)
}

fn message_reply(message: &str, status: StatusCode) -> WithStatus<Json> {
    with_status(
        json(&ErrorResponse {
            error: message.to_string(),
        }),
        status,
    )
}
