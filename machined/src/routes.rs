use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use machined_backend::{Error, MachineRecord, MachineRegistry};
use machined_def::VmDef;
use serde::Deserialize;
use serde_json::{json, Value};

type AppError = (StatusCode, Json<Value>);
type AppResult<T> = Result<Json<T>, AppError>;

/// CRUD plus lifecycle over machines, JSON bodies throughout.
pub fn router(registry: Arc<MachineRegistry>) -> Router {
    Router::new()
        .route("/machines", get(get_machines).post(post_machine))
        .route(
            "/machines/{name}",
            put(update_machine).delete(delete_machine),
        )
        .route("/machines/{name}/start", axum::routing::post(start_machine))
        .route("/machines/{name}/stop", axum::routing::post(stop_machine))
        .layer(Extension(registry))
}

fn reject(err: &Error) -> AppError {
    let status = match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({"error": err.to_string()})))
}

/// Lifecycle failures carry the machine name and the failing operation.
fn reject_op(op: &str, name: &str, err: &Error) -> AppError {
    let status = match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(json!({"error": format!("could not {op} machine '{name}': {err}")})),
    )
}

/// Bodies that fail to parse get the same `{"error": ...}` shape as
/// lifecycle failures.
fn bad_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": rejection.body_text()})),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct CreateMachineRequest {
    #[serde(flatten)]
    def: VmDef,
    #[serde(default)]
    ephemeral: bool,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    status: String,
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    status: String,
    #[serde(default)]
    force: bool,
}

async fn get_machines(
    Extension(registry): Extension<Arc<MachineRegistry>>,
) -> Json<Vec<MachineRecord>> {
    Json(registry.list_machines().await)
}

async fn post_machine(
    Extension(registry): Extension<Arc<MachineRegistry>>,
    payload: Result<Json<CreateMachineRequest>, JsonRejection>,
) -> AppResult<MachineRecord> {
    let request = bad_body(payload)?;
    registry
        .add_machine(request.def, request.ephemeral, request.description)
        .await
        .map(Json)
        .map_err(|e| reject(&e))
}

async fn update_machine(
    Extension(registry): Extension<Arc<MachineRegistry>>,
    Path(name): Path<String>,
    payload: Result<Json<CreateMachineRequest>, JsonRejection>,
) -> AppResult<MachineRecord> {
    let request = bad_body(payload)?;
    registry
        .update_machine(&name, request.def)
        .await
        .map(Json)
        .map_err(|e| reject(&e))
}

async fn delete_machine(
    Extension(registry): Extension<Arc<MachineRegistry>>,
    Path(name): Path<String>,
) -> AppResult<Value> {
    registry
        .delete_machine(&name)
        .await
        .map(|()| Json(json!({})))
        .map_err(|e| reject_op("delete", &name, &e))
}

async fn start_machine(
    Extension(registry): Extension<Arc<MachineRegistry>>,
    Path(name): Path<String>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> AppResult<Value> {
    let request = bad_body(payload)?;
    if request.status != "running" {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid start request status '{}'", request.status)})),
        ));
    }
    registry
        .start_machine(&name)
        .await
        .map(|()| Json(json!({"status": "running"})))
        .map_err(|e| reject_op("start", &name, &e))
}

async fn stop_machine(
    Extension(registry): Extension<Arc<MachineRegistry>>,
    Path(name): Path<String>,
    payload: Result<Json<StopRequest>, JsonRejection>,
) -> AppResult<Value> {
    let request = bad_body(payload)?;
    if request.status != "stopped" {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid stop request status '{}'", request.status)})),
        ));
    }
    registry
        .stop_machine(&name, request.force)
        .await
        .map(|()| Json(json!({"status": "stopped"})))
        .map_err(|e| reject_op("stop", &name, &e))
}
