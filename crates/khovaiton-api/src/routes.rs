use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use http::{header, Method};
use khovaiton_core::models::MappingTable;
use khovaiton_core::{FabricCode, MappingValue};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::store::MappingRegistry;

pub const MAPPINGS_PATH: &str = "/api/fabric-mappings";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<MappingRegistry>,
}

impl AppState {
    pub const fn new(registry: Arc<MappingRegistry>) -> Self {
        Self { registry }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            MAPPINGS_PATH,
            get(list_mappings).post(write_mappings).put(replace_mappings),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers([header::CONTENT_TYPE])
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS]),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    mappings: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        mappings: state.registry.snapshot().await.len(),
    })
}

#[derive(Debug, Serialize)]
struct MappingsResponse {
    success: bool,
    mappings: MappingTable,
    count: usize,
    timestamp: i64,
}

async fn list_mappings(State(state): State<AppState>) -> Json<MappingsResponse> {
    let mappings = state.registry.snapshot().await;
    Json(MappingsResponse {
        success: true,
        count: mappings.len(),
        mappings,
        timestamp: Utc::now().timestamp_millis(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteRequest {
    action: Option<String>,
    mappings: Option<BTreeMap<String, String>>,
    fabric_code: Option<String>,
    public_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    success: bool,
    updated_count: usize,
    total_count: usize,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddResponse {
    success: bool,
    is_new: bool,
    fabric_code: FabricCode,
    public_id: MappingValue,
    total_count: usize,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WriteResponse {
    Update(UpdateResponse),
    Add(AddResponse),
}

async fn write_mappings(
    State(state): State<AppState>,
    body: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<Json<WriteResponse>, AppError> {
    let Json(request) = body.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    match request.action.as_deref() {
        Some("update") => {
            let Some(mappings) = request.mappings else {
                return Err(AppError::bad_request("mappings parameter required"));
            };
            let outcome = state.registry.update(to_table(mappings)?).await?;
            tracing::info!(updated = outcome.updated, total = outcome.total, "Mappings updated");
            Ok(Json(WriteResponse::Update(UpdateResponse {
                success: true,
                updated_count: outcome.updated,
                total_count: outcome.total,
                timestamp: Utc::now().timestamp_millis(),
            })))
        }
        Some("add") => {
            let (Some(code), Some(value)) = (
                request.fabric_code.filter(|code| !code.trim().is_empty()),
                request.public_id.filter(|value| !value.trim().is_empty()),
            ) else {
                return Err(AppError::bad_request(
                    "fabricCode and publicId parameters required",
                ));
            };
            let code = FabricCode::new(code)?;
            let value = MappingValue::from(value);
            let outcome = state.registry.add(code.clone(), value.clone()).await?;
            tracing::info!(fabric_code = %code, is_new = outcome.is_new, "Mapping added");
            Ok(Json(WriteResponse::Add(AddResponse {
                success: true,
                is_new: outcome.is_new,
                fabric_code: code,
                public_id: value,
                total_count: outcome.total,
                timestamp: Utc::now().timestamp_millis(),
            })))
        }
        _ => Err(AppError::bad_request("Invalid action. Use: update or add")),
    }
}

async fn replace_mappings(
    State(state): State<AppState>,
    body: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<Json<UpdateResponse>, AppError> {
    let Json(request) = body.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let Some(mappings) = request.mappings else {
        return Err(AppError::bad_request("mappings parameter required"));
    };
    let outcome = state.registry.replace(to_table(mappings)?).await?;
    tracing::info!(total = outcome.total, "Mappings replaced");
    Ok(Json(UpdateResponse {
        success: true,
        updated_count: outcome.updated,
        total_count: outcome.total,
        timestamp: Utc::now().timestamp_millis(),
    }))
}

fn to_table(raw: BTreeMap<String, String>) -> Result<MappingTable, AppError> {
    raw.into_iter()
        .map(|(code, value)| {
            if value.trim().is_empty() {
                return Err(AppError::bad_request(format!(
                    "Mapping for {code} has an empty value"
                )));
            }
            Ok((FabricCode::new(code)?, MappingValue::from(value)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use khovaiton_core::http::ReqwestHttpClient;
    use khovaiton_core::mapping::{MappingStore, PushOutcome};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn state_with(entries: &[(&str, &str)]) -> AppState {
        let table = entries
            .iter()
            .map(|(code, value)| (FabricCode::new(*code).unwrap(), MappingValue::from(*value)))
            .collect();
        AppState::new(Arc::new(MappingRegistry::in_memory(table)))
    }

    fn request(body: serde_json::Value) -> Result<Json<WriteRequest>, JsonRejection> {
        Ok(Json(serde_json::from_value(body).unwrap()))
    }

    async fn write(state: AppState, body: serde_json::Value) -> serde_json::Value {
        let Json(response) = write_mappings(State(state), request(body)).await.unwrap();
        serde_json::to_value(response).unwrap()
    }

    #[tokio::test]
    async fn list_returns_envelope_with_count() {
        let state = state_with(&[("A", "img-a")]);

        let Json(response) = list_mappings(State(state)).await;

        assert!(response.success);
        assert_eq!(response.count, 1);
        assert_eq!(
            serde_json::to_value(&response.mappings).unwrap(),
            json!({"A": "img-a"})
        );
    }

    #[tokio::test]
    async fn update_reports_changed_and_total_counts() {
        let state = state_with(&[("A", "img-a")]);

        let body = write(
            state,
            json!({"action": "update", "mappings": {"A": "img-a", "B": "img-b"}}),
        )
        .await;

        assert_eq!(body["success"], json!(true));
        assert_eq!(body["updatedCount"], json!(1));
        assert_eq!(body["totalCount"], json!(2));
    }

    #[tokio::test]
    async fn add_reports_is_new() {
        let state = state_with(&[]);

        let body = write(
            state.clone(),
            json!({"action": "add", "fabricCode": "AB-100", "publicId": "img123"}),
        )
        .await;
        assert_eq!(body["isNew"], json!(true));
        assert_eq!(body["fabricCode"], json!("AB-100"));

        let body = write(
            state,
            json!({"action": "add", "fabricCode": "AB-100", "publicId": "img456"}),
        )
        .await;
        assert_eq!(body["isNew"], json!(false));
        assert_eq!(body["totalCount"], json!(1));
    }

    #[tokio::test]
    async fn missing_parameters_are_bad_requests() {
        let cases = [
            json!({"action": "update"}),
            json!({"action": "add", "fabricCode": "AB-100"}),
            json!({"action": "add", "fabricCode": " ", "publicId": "img"}),
            json!({"action": "delete"}),
            json!({}),
        ];
        for case in cases {
            let err = write_mappings(State(state_with(&[])), request(case.clone()))
                .await
                .unwrap_err();
            assert_eq!(
                err.into_response().status(),
                StatusCode::BAD_REQUEST,
                "{case}"
            );
        }
    }

    #[tokio::test]
    async fn replace_requires_mappings_and_drops_old_entries() {
        let state = state_with(&[("A", "img-a")]);

        let err = replace_mappings(State(state.clone()), request(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let Json(body) = replace_mappings(State(state.clone()), request(json!({"mappings": {"B": "img-b"}})))
            .await
            .unwrap();
        assert_eq!(body.total_count, 1);

        let Json(listing) = list_mappings(State(state)).await;
        assert_eq!(
            serde_json::to_value(&listing.mappings).unwrap(),
            json!({"B": "img-b"})
        );
    }

    #[tokio::test]
    async fn empty_mapping_value_is_rejected() {
        let err = write_mappings(
            State(state_with(&[])),
            request(json!({"action": "update", "mappings": {"A": "  "}})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn core_mapping_store_round_trips_through_router() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app_router(state_with(&[("SEED", "img-seed")]));
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let url = format!("http://{addr}{MAPPINGS_PATH}");
        let store = MappingStore::new(
            Arc::new(ReqwestHttpClient::new().unwrap()),
            Some(url.clone()),
            Some(url),
        );
        let code = FabricCode::new("AB-100").unwrap();

        let outcome = store
            .try_add(&code, &MappingValue::from("img123"))
            .await
            .unwrap();
        assert!(matches!(outcome, PushOutcome::Applied { .. }));

        let table = tokio::time::timeout(Duration::from_secs(5), store.try_fetch_all())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("AB-100"), Some(&MappingValue::from("img123")));

        server.abort();
    }
}
