use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Text attachment carrying the merged prompt
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Attachment {
    pub extracted_content: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: usize,
}

impl Attachment {
    pub fn from_text(content: String) -> Self {
        Self {
            file_size: content.len(),
            extracted_content: content,
            file_name: "paste.txt".to_string(),
            file_type: "txt".to_string(),
        }
    }
}

/// Body of a Claude.ai conversation completion request
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WebRequestBody {
    pub max_tokens_to_sample: u32,
    pub attachments: Vec<Attachment>,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub rendering_mode: String,
    pub prompt: String,
    pub timezone: String,
    pub tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub file_uuid: String,
}
