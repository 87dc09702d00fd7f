//! Client side of the external image-editing service.
//!
//! The service takes a photo plus a fixed prompt and returns a
//! base64-encoded result. Its contract for the image field name is
//! ambiguous (`image` vs `image[]`), so submission goes through
//! [`edit_with_fallback`], which retries a client rejection exactly once
//! under the alternate field name.

pub mod error;
mod openai;

pub use error::{TransformError, TransformErrorKind};
pub use openai::OpenAiImageEditor;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Multipart field name carrying the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageField {
    /// `image`
    Primary,
    /// `image[]`
    Alternate,
}

impl ImageField {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageField::Primary => "image",
            ImageField::Alternate => "image[]",
        }
    }
}

/// Photo submitted for transformation.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub bytes: Vec<u8>,
    /// Always an `image/*` type
    pub mime_type: String,
}

impl SourceImage {
    pub fn file_name(&self) -> String {
        format!("input.{}", crate::storage::extension_for_mime(&self.mime_type))
    }
}

/// Successful upstream result, still base64-encoded.
#[derive(Debug, Clone)]
pub struct EditedImage {
    pub b64_json: String,
    pub request_id: Option<String>,
}

impl EditedImage {
    pub fn decode(&self) -> Result<Vec<u8>, TransformError> {
        STANDARD.decode(self.b64_json.trim()).map_err(|e| {
            TransformError::parse_error(
                format!("Image API returned invalid base64: {}", e),
                self.request_id.clone(),
            )
        })
    }
}

#[async_trait]
pub trait ImageEditor: Send + Sync {
    /// Submit one edit request with the image under `field`.
    async fn edit(&self, image: &SourceImage, field: ImageField)
        -> Result<EditedImage, TransformError>;
}

/// Submit under the primary field; on a client rejection retry exactly once
/// under the alternate field. No other retries.
pub async fn edit_with_fallback(
    editor: &dyn ImageEditor,
    image: &SourceImage,
) -> Result<EditedImage, TransformError> {
    match editor.edit(image, ImageField::Primary).await {
        Ok(result) => Ok(result),
        Err(err) if err.is_client_rejection() => {
            tracing::warn!(
                status = ?err.status_code,
                request_id = ?err.request_id,
                "Image API rejected '{}' field, retrying with '{}'",
                ImageField::Primary.as_str(),
                ImageField::Alternate.as_str()
            );
            editor.edit(image, ImageField::Alternate).await
        }
        Err(err) => Err(err),
    }
}
