use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;

use lmlens::generation::{SamplingParams, StreamEvent};
use lmlens::models::{ToyConfig, ToyLm};
use lmlens::tokenizer::TextTokenizer;
use lmlens::{
    AttentionReport, EmbeddingReport, Inspector, ModelInfo, NextTokenReport, TokenizationReport,
};

const DEFAULT_MODEL_NAME: &str = "distilgpt2";

#[derive(Clone)]
struct AppState {
    inspector: Arc<Inspector>,
    semaphore: Arc<Semaphore>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct TextRequest {
    text: String,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_k() -> usize {
    50
}

fn default_top_p() -> f32 {
    0.9
}

fn default_do_sample() -> bool {
    true
}

fn default_max_new_tokens() -> usize {
    50
}

fn default_top_n() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct LogitsRequest {
    text: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_top_p")]
    top_p: f32,
    #[serde(default = "default_do_sample")]
    do_sample: bool,
    #[serde(default = "default_top_n")]
    top_n: usize,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_top_p")]
    top_p: f32,
    #[serde(default = "default_do_sample")]
    do_sample: bool,
    #[serde(default = "default_max_new_tokens")]
    max_new_tokens: usize,
    seed: Option<u64>,
}

async fn models_info(State(state): State<Arc<AppState>>) -> Json<ModelInfo> {
    Json(state.inspector.info())
}

async fn tokenize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TextRequest>,
) -> Result<Json<TokenizationReport>, ApiError> {
    let report = state
        .inspector
        .tokenize(&req.text)
        .map_err(|e| ApiError::internal(format!("tokenization failed: {e}")))?;
    Ok(Json(report))
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TextRequest>,
) -> Result<Json<EmbeddingReport>, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }

    let _permit = state.semaphore.acquire().await.unwrap();
    let inspector = state.inspector.clone();
    let text = req.text;
    let report = tokio::task::spawn_blocking(move || {
        inspector
            .embeddings(&text)
            .map_err(|e| ApiError::internal(format!("embedding extraction failed: {e}")))
    })
    .await
    .map_err(|e| ApiError::internal(format!("task join error: {e}")))??;

    Ok(Json(report))
}

async fn attention(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TextRequest>,
) -> Result<Json<AttentionReport>, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }

    let _permit = state.semaphore.acquire().await.unwrap();
    let inspector = state.inspector.clone();
    let text = req.text;
    let report = tokio::task::spawn_blocking(move || {
        inspector
            .attention(&text)
            .map_err(|e| ApiError::internal(format!("attention extraction failed: {e}")))
    })
    .await
    .map_err(|e| ApiError::internal(format!("task join error: {e}")))??;

    Ok(Json(report))
}

async fn logits(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LogitsRequest>,
) -> Result<Json<NextTokenReport>, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }

    let params = SamplingParams {
        temperature: req.temperature,
        top_k: req.top_k,
        top_p: req.top_p,
        do_sample: req.do_sample,
    };

    let _permit = state.semaphore.acquire().await.unwrap();
    let inspector = state.inspector.clone();
    let text = req.text;
    let top_n = req.top_n;
    let seed = req.seed;
    let report = tokio::task::spawn_blocking(move || {
        inspector
            .next_token(&text, &params, top_n, seed)
            .map_err(|e| ApiError::internal(format!("next-token prediction failed: {e}")))
    })
    .await
    .map_err(|e| ApiError::internal(format!("task join error: {e}")))??;

    Ok(Json(report))
}

fn sse_json(value: serde_json::Value) -> Event {
    match Event::default().json_data(&value) {
        Ok(event) => event,
        Err(_) => Event::default(),
    }
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }

    let params = SamplingParams {
        temperature: req.temperature,
        top_k: req.top_k,
        top_p: req.top_p,
        do_sample: req.do_sample,
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);
    let inspector = state.inspector.clone();
    let permit = state.semaphore.clone().acquire_owned().await.unwrap();
    let prompt = req.prompt;
    let max_new_tokens = req.max_new_tokens;
    let seed = req.seed;

    let _worker = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let stream = match inspector.stream_generation(&prompt, params, max_new_tokens, seed) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.blocking_send(Ok(sse_json(json!({
                    "event": "error",
                    "error": e.to_string(),
                }))));
                return;
            }
        };

        for event in stream {
            let payload = match event {
                Ok(StreamEvent::Prompt { text }) => json!({ "token": "", "text": text }),
                Ok(StreamEvent::Token { token, text }) => json!({ "token": token, "text": text }),
                Ok(StreamEvent::Done { final_text, .. }) => {
                    json!({ "event": "done", "final_text": final_text })
                }
                Err(e) => json!({ "event": "error", "error": e.to_string() }),
            };
            // A closed receiver means the client went away; stop stepping.
            if tx.blocking_send(Ok(sse_json(payload))).is_err() {
                tracing::debug!("client disconnected, stopping generation");
                break;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

/// Load the requested tokenizer, falling back to the known-good default.
fn load_tokenizer(model_name: &str) -> Result<(TextTokenizer, String), ApiError> {
    match TextTokenizer::from_pretrained(model_name) {
        Ok(tokenizer) => Ok((tokenizer, model_name.to_string())),
        Err(e) if model_name != DEFAULT_MODEL_NAME => {
            tracing::warn!(
                "Failed to load tokenizer for '{}': {}. Falling back to '{}'",
                model_name,
                e,
                DEFAULT_MODEL_NAME
            );
            let tokenizer = TextTokenizer::from_pretrained(DEFAULT_MODEL_NAME).map_err(|e| {
                ApiError::internal(format!("failed to load fallback tokenizer: {e}"))
            })?;
            Ok((tokenizer, DEFAULT_MODEL_NAME.to_string()))
        }
        Err(e) => Err(ApiError::internal(format!(
            "failed to load tokenizer for '{model_name}': {e}"
        ))),
    }
}

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    tracing_subscriber::fmt::init();

    let model_name =
        std::env::var("MODEL_NAME").unwrap_or_else(|_| DEFAULT_MODEL_NAME.to_string());
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "5000".to_string())
        .parse()
        .map_err(|e| ApiError::bad_request(format!("invalid PORT: {e}")))?;
    let max_concurrency: usize = std::env::var("MAX_CONCURRENCY")
        .unwrap_or_else(|_| "2".to_string())
        .parse()
        .map_err(|e| ApiError::bad_request(format!("invalid MAX_CONCURRENCY: {e}")))?;

    let (tokenizer, model_name) = load_tokenizer(&model_name)?;
    tracing::info!(
        "Loaded tokenizer for '{}' ({} tokens)",
        model_name,
        tokenizer.vocab_size()
    );

    let model = ToyLm::new(ToyConfig {
        vocab_size: tokenizer.vocab_size(),
        ..Default::default()
    })
    .map_err(|e| ApiError::internal(format!("failed to build model: {e}")))?;
    let inspector = Inspector::new(Box::new(model), tokenizer, model_name)
        .map_err(|e| ApiError::internal(format!("failed to assemble inspector: {e}")))?;

    let state = Arc::new(AppState {
        inspector: Arc::new(inspector),
        semaphore: Arc::new(Semaphore::new(max_concurrency)),
    });

    let app = Router::new()
        .route("/models/info", get(models_info))
        .route("/tokenize", post(tokenize))
        .route("/embeddings", post(embeddings))
        .route("/attention", post(attention))
        .route("/logits", post(logits))
        .route("/generate", post(generate))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| ApiError::bad_request(format!("invalid HOST/PORT: {e}")))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ApiError::internal(format!("failed to bind: {e}")))?,
        app,
    )
    .await
    .map_err(|e| ApiError::internal(format!("server error: {e}")))?;

    Ok(())
}
