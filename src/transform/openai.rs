//! OpenAI-compatible `images/edits` client.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;

use super::error::TransformError;
use super::{EditedImage, ImageEditor, ImageField, SourceImage};
use crate::config::TransformConfig;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct OpenAiImageEditor {
    client: Client,
    config: TransformConfig,
}

impl OpenAiImageEditor {
    pub fn new(config: TransformConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn build_form(&self, image: &SourceImage, field: ImageField) -> Result<Form, TransformError> {
        let part = Part::bytes(image.bytes.clone())
            .file_name(image.file_name())
            .mime_str(&image.mime_type)
            .map_err(|e| {
                TransformError::parse_error(
                    format!("Invalid image content type '{}': {}", image.mime_type, e),
                    None,
                )
            })?;

        Ok(Form::new()
            .text("model", self.config.model.clone())
            .text("prompt", self.config.prompt.clone())
            .text("size", self.config.size.clone())
            .text("input_fidelity", self.config.input_fidelity.clone())
            .part(field.as_str(), part))
    }
}

#[derive(Debug, Deserialize)]
struct EditsResponse {
    #[serde(default)]
    data: Vec<EditsDatum>,
}

#[derive(Debug, Deserialize)]
struct EditsDatum {
    b64_json: Option<String>,
}

#[async_trait]
impl ImageEditor for OpenAiImageEditor {
    async fn edit(
        &self,
        image: &SourceImage,
        field: ImageField,
    ) -> Result<EditedImage, TransformError> {
        let form = self.build_form(image, field)?;

        tracing::debug!(
            field = field.as_str(),
            mime = %image.mime_type,
            bytes = image.bytes.len(),
            model = %self.config.model,
            "Submitting image edit"
        );

        let response = match self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return Err(TransformError::network_error(format!(
                        "Request timeout: {}",
                        e
                    )));
                } else if e.is_connect() {
                    return Err(TransformError::network_error(format!(
                        "Connection failed: {}",
                        e
                    )));
                } else {
                    return Err(TransformError::network_error(format!(
                        "Request failed: {}",
                        e
                    )));
                }
            }
        };

        let status = response.status();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(TransformError::from_response(
                status.as_u16(),
                &body,
                request_id,
            ));
        }

        let parsed: EditsResponse = serde_json::from_str(&body).map_err(|e| {
            TransformError::parse_error(
                format!("Failed to parse image API response: {}", e),
                request_id.clone(),
            )
        })?;

        let b64_json = parsed
            .data
            .into_iter()
            .next()
            .and_then(|d| d.b64_json)
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| TransformError::missing_result(request_id.clone()))?;

        Ok(EditedImage {
            b64_json,
            request_id,
        })
    }
}
