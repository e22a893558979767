use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_with::{serde_as, DisplayFromStr};
use uuid::Uuid;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Inline image payload as it travels to and from the generation API:
/// raw base64 (no `data:` prefix) plus its mime type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

/// Immutable handle to generated image bytes.
///
/// The same image is used two ways: rendered by the browser through
/// [`ImageRef::to_data_url`], and re-submitted as edit input through
/// [`ImageRef::to_inline`]. Cloning shares the underlying buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageRef {
    mime_type: String,
    bytes: Bytes,
}

impl ImageRef {
    pub fn new(bytes: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        let bytes = bytes.into();
        let mut mime_type = mime_type.into();
        if mime_type.trim().is_empty() {
            mime_type = sniff_mime(&bytes).to_string();
        }
        Self { mime_type, bytes }
    }

    /// Decodes a wire payload. An empty mime type is filled in from the
    /// image header, falling back to `image/png`.
    pub fn from_inline(inline: &InlineData) -> Result<Self, base64::DecodeError> {
        let bytes = BASE64.decode(inline.data.trim())?;
        Ok(Self::new(bytes, inline.mime_type.clone()))
    }

    pub fn to_inline(&self) -> InlineData {
        InlineData {
            mime_type: self.mime_type.clone(),
            data: BASE64.encode(&self.bytes),
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.bytes))
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn file_extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or("image/png")
}

impl std::fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRef")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// The view renders images straight from the data URL.
impl Serialize for ImageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_data_url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Generate,
    Edit,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryItem {
    /// Milliseconds since epoch, bumped to stay strictly increasing.
    #[serde_as(as = "DisplayFromStr")]
    pub id: u64,
    pub image: ImageRef,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time copy of a session, handed to the view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub mode: Mode,
    pub is_loading: bool,
    pub image: Option<ImageRef>,
    pub last_error: Option<String>,
    pub history: Vec<HistoryItem>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PromptRequest {
    pub prompt: String,
}
