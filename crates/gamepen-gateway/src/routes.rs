use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    routing::get,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::warn;

use gamepen_types::api::Claims;
use gamepen_types::events::UserInfo;

use crate::connection;
use crate::handler::Gateway;

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Gateway,
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Optional bearer token; when valid the connection starts identified.
    pub token: Option<String>,
}

/// `GET /socket`: websocket upgrade for the realtime gateway.
pub fn routes(state: GatewayState) -> Router {
    Router::new()
        .route("/socket", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let identity = match query.token {
        Some(token) => Some(verify_token(&token, &state.jwt_secret).ok_or_else(|| {
            warn!("Rejected websocket upgrade with an invalid token");
            StatusCode::UNAUTHORIZED
        })?),
        None => None,
    };

    let gateway = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| connection::handle_connection(socket, gateway, identity)))
}

fn verify_token(token: &str, jwt_secret: &str) -> Option<UserInfo> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    Some(UserInfo {
        username: token_data.claims.username,
        user_id: token_data.claims.sub,
    })
}
