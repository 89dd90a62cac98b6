use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::RgbImage;
use lumen_core::{
    GenerateError, GenerationRequest, Generator, PipelineLoader, DEFAULT_GUIDANCE, DEFAULT_STEPS,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{io::Cursor, sync::Arc};

const MAX_RANDOM_SEED: u64 = 1_000_000;

const FAVICON: &[u8] = include_bytes!("../static/favicon.ico");

/// Shared application state: the process-wide generator.
pub struct AppState<L: PipelineLoader> {
    pub generator: Arc<Generator<L>>,
}

impl<L: PipelineLoader> Clone for AppState<L> {
    fn clone(&self) -> Self {
        Self {
            generator: Arc::clone(&self.generator),
        }
    }
}

pub fn router<L: PipelineLoader>(state: AppState<L>) -> Router {
    Router::new()
        .route("/", get(index).post(submit::<L>))
        .route("/generate", axum::routing::post(generate_api::<L>))
        .route("/download", get(download::<L>))
        .route("/favicon.ico", get(favicon))
        .with_state(state)
}

async fn index() -> Html<String> {
    render_page(None, None)
}

async fn favicon() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/x-icon")], FAVICON)
}

#[derive(Deserialize)]
pub struct PromptForm {
    #[serde(default)]
    prompt: String,
}

async fn submit<L: PipelineLoader>(
    State(state): State<AppState<L>>,
    Form(form): Form<PromptForm>,
) -> Html<String> {
    if form.prompt.trim().is_empty() {
        return render_page(Some("Please enter a prompt."), None);
    }
    // Random seed for variety on the page flow.
    let seed = rand::thread_rng().gen_range(1..=MAX_RANDOM_SEED);
    let request = GenerationRequest {
        prompt: form.prompt,
        steps: DEFAULT_STEPS,
        guidance: DEFAULT_GUIDANCE,
        seed: Some(seed),
    };
    match state.generator.generate(request).await {
        Ok(image) => match png_bytes(&image) {
            Ok(png) => render_page(None, Some(&BASE64_STANDARD.encode(png))),
            Err(e) => render_page(Some(&e.to_string()), None),
        },
        Err(e) => render_page(Some(&e.to_string()), None),
    }
}

fn default_steps() -> usize {
    DEFAULT_STEPS
}

fn default_guidance() -> f64 {
    DEFAULT_GUIDANCE
}

#[derive(Deserialize)]
pub struct ApiRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default = "default_steps")]
    steps: usize,
    #[serde(default = "default_guidance")]
    guidance: f64,
    #[serde(default)]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct ApiResponse {
    image: String,
    prompt: String,
    steps: usize,
    guidance: f64,
    seed: Option<u64>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn generate_api<L: PipelineLoader>(
    State(state): State<AppState<L>>,
    Json(body): Json<ApiRequest>,
) -> Response {
    let request = GenerationRequest {
        prompt: body.prompt.clone(),
        steps: body.steps,
        guidance: body.guidance,
        seed: body.seed,
    };
    match generate_png(&state, request).await {
        Ok(png) => Json(ApiResponse {
            image: BASE64_STANDARD.encode(png),
            prompt: body.prompt,
            steps: body.steps,
            guidance: body.guidance,
            seed: body.seed,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    prompt: String,
    #[serde(default = "default_steps")]
    steps: usize,
    #[serde(default = "default_guidance")]
    guidance: f64,
    #[serde(default)]
    seed: Option<u64>,
}

async fn download<L: PipelineLoader>(
    State(state): State<AppState<L>>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    // The seed lands in the attachment filename, so fix it up front.
    let seed = query
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(1..=MAX_RANDOM_SEED));
    let request = GenerationRequest {
        prompt: query.prompt,
        steps: query.steps,
        guidance: query.guidance,
        seed: Some(seed),
    };
    match generate_png(&state, request).await {
        Ok(png) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/png".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"generated_image_{seed}.png\""),
                ),
            ],
            png,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn generate_png<L: PipelineLoader>(
    state: &AppState<L>,
    request: GenerationRequest,
) -> Result<Vec<u8>, GenerateError> {
    let image = state.generator.generate(request).await?;
    png_bytes(&image).map_err(GenerateError::Generation)
}

fn png_bytes(image: &RgbImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

fn error_response(error: GenerateError) -> Response {
    tracing::error!("request failed: {error}");
    let status = if error.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let message = match error {
        GenerateError::EmptyPrompt => "Prompt is required".to_string(),
        other => other.to_string(),
    };
    (status, Json(ErrorBody { error: message })).into_response()
}

const PAGE_HEADER: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Lumen</title>
  <style>
    body { font-family: sans-serif; max-width: 640px; margin: 2rem auto; }
    input[type=text] { width: 70%; padding: 0.5rem; }
    button { padding: 0.5rem 1rem; }
    .error { color: #b00020; }
    .result { display: block; margin-top: 1rem; max-width: 100%; }
  </style>
</head>
<body>
  <h1>Lumen</h1>
  <form method="post" action="/">
    <input type="text" name="prompt" placeholder="Describe an image..." autofocus>
    <button type="submit">Generate</button>
  </form>
"#;

const PAGE_FOOTER: &str = r#"</body>
</html>
"#;

fn render_page(error: Option<&str>, image_base64: Option<&str>) -> Html<String> {
    let mut page = String::from(PAGE_HEADER);
    if let Some(error) = error {
        page.push_str(&format!("  <p class=\"error\">{}</p>\n", escape_html(error)));
    }
    if let Some(data) = image_base64 {
        page.push_str(&format!(
            "  <img class=\"result\" src=\"data:image/png;base64,{data}\" alt=\"generated image\">\n"
        ));
    }
    page.push_str(PAGE_FOOTER);
    Html(page)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_request_defaults() {
        let body: ApiRequest = serde_json::from_str(r#"{"prompt": "a red fox"}"#).unwrap();
        assert_eq!(body.steps, DEFAULT_STEPS);
        assert_eq!(body.guidance, DEFAULT_GUIDANCE);
        assert_eq!(body.seed, None);
    }

    #[test]
    fn page_escapes_error_text() {
        let Html(page) = render_page(Some("<script>alert(1)</script>"), None);
        assert!(!page.contains("<script>alert"));
        assert!(page.contains("&lt;script&gt;"));
    }
}
