use crate::catalog::HubCapability;
use crate::service::state::StateHandle;
use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// Thin status/control surface over the bridge. Capability writes are
// routed through the same listener path as any other hub-originated
// command, so a rejected command surfaces here as an HTTP error.

fn response_with_code<T: ToString + std::fmt::Display>(code: StatusCode, err: T) -> Response {
    if !code.is_success() {
        log::error!("err: {err:#}");
    }

    let mut response = Json(serde_json::json!({
        "code": code.as_u16(),
        "msg": format!("{err:#}")
    }))
    .into_response();
    *response.status_mut() = code;
    response
}

fn generic<T: ToString + std::fmt::Display>(err: T) -> Response {
    response_with_code(StatusCode::INTERNAL_SERVER_ERROR, err)
}

fn not_found<T: ToString + std::fmt::Display>(err: T) -> Response {
    response_with_code(StatusCode::NOT_FOUND, err)
}

fn bad_request<T: ToString + std::fmt::Display>(err: T) -> Response {
    response_with_code(StatusCode::BAD_REQUEST, err)
}

#[derive(Serialize)]
struct CapabilityItem {
    pub id: String,
    pub value: JsonValue,
}

#[derive(Serialize)]
struct DeviceItem {
    pub sku: String,
    pub id: String,
    pub name: String,
    pub unavailable: Option<String>,
    pub capabilities: Vec<CapabilityItem>,
}

async fn device_item(state: &StateHandle, id: &str) -> Option<DeviceItem> {
    let device = state.device_by_id(id).await?;
    let hub = state.hub_for(id).await?;
    Some(DeviceItem {
        sku: device.sku.clone(),
        name: device.name(),
        id: device.id,
        unavailable: hub.unavailable_reason(),
        capabilities: hub
            .capability_values()
            .into_iter()
            .map(|(cap, value)| CapabilityItem {
                id: cap.to_string(),
                value,
            })
            .collect(),
    })
}

/// Returns a json array of device information
async fn list_devices(State(state): State<StateHandle>) -> Result<Response, Response> {
    let mut devices = vec![];
    for id in state.runtime_ids().await {
        if let Some(item) = device_item(&state, &id).await {
            devices.push(item);
        }
    }
    devices.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(devices).into_response())
}

async fn get_device(
    State(state): State<StateHandle>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    match device_item(&state, &id).await {
        Some(item) => Ok(Json(item).into_response()),
        None => Err(not_found(format!("device '{id}' not found"))),
    }
}

/// Writes one capability value; the body is the raw JSON value in the
/// hub's normalized domain.
async fn write_capability(
    State(state): State<StateHandle>,
    Path((id, capability)): Path<(String, String)>,
    Json(value): Json<JsonValue>,
) -> Result<Response, Response> {
    let capability: HubCapability = capability
        .parse()
        .map_err(|err| bad_request(format!("{err:#}")))?;

    let hub = state
        .hub_for(&id)
        .await
        .ok_or_else(|| not_found(format!("device '{id}' not found")))?;

    hub.write_capability(&capability, value)
        .await
        .map_err(bad_request)?;

    Ok(response_with_code(StatusCode::OK, "ok"))
}

/// Returns a JSON array of the available scene names for a given device
async fn device_list_scenes(
    State(state): State<StateHandle>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    let device = state
        .device_by_id(&id)
        .await
        .ok_or_else(|| not_found(format!("device '{id}' not found")))?;

    let scenes = state.device_list_scenes(&device).await.map_err(generic)?;

    Ok(Json(scenes).into_response())
}

#[derive(Deserialize)]
struct ApiKeyBody {
    api_key: String,
}

/// The stored API key changed; the shared platform client is replaced
/// so that every subsequent request uses the new credential.
async fn put_api_key(
    State(state): State<StateHandle>,
    Json(body): Json<ApiKeyBody>,
) -> Result<Response, Response> {
    if body.api_key.is_empty() {
        return Err(bad_request("api_key must not be empty"));
    }
    state.replace_platform_client(body.api_key).await;
    Ok(response_with_code(StatusCode::OK, "ok"))
}

fn build_router(state: StateHandle) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/device/{id}", get(get_device))
        .route("/api/device/{id}/capability/{capability}", post(write_capability))
        .route("/api/device/{id}/scenes", get(device_list_scenes))
        .route("/api/settings/api-key", put(put_api_key))
        .with_state(state)
}

#[cfg(test)]
#[test]
fn test_build_router() {
    // axum has a history of changing the URL syntax across semver
    // bumps; while that is OK, the syntax changes are not caught at
    // compile time, so we need a runtime check to verify that the
    // syntax is still good. This next line will panic if axum decides
    // that the syntax is bad.
    let _ = build_router(StateHandle::default());
}

pub async fn run_http_server(state: StateHandle, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("run_http_server: binding to port {port}"))?;
    let addr = listener.local_addr()?;
    log::info!("http server addr is {addr:?}");
    if let Err(err) = axum::serve(listener, app).await {
        log::error!("http server stopped: {err:#}");
    }

    Ok(())
}
