use base64::{Engine, prelude::BASE64_STANDARD};
use serde_json::Value;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    claude_web::client::SUPER_CLIENT,
    config::CLOVER_CONFIG,
    error::{CloverError, WreqSnafu},
    types::claude::{
        ContentBlock, ImageSource, InputMessage, MessageContent, Role, ToolResultContent,
    },
};

/// Base64 image collected while merging
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedImage {
    pub media_type: String,
    pub data: String,
}

/// Collapse a system field and a message list into a single prompt text
/// with role markers, collecting embedded images on the way.
pub async fn merge_messages(
    messages: &[InputMessage],
    system: Option<&Value>,
) -> Result<(String, Vec<CollectedImage>), CloverError> {
    let config = CLOVER_CONFIG.load();
    let mut merged = match system {
        Some(Value::String(s)) => s.to_owned(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    let marker = if config.use_real_roles { "\u{8}" } else { "" };
    let human_prefix = format!("{marker}{}: ", config.human_name);
    let assistant_prefix = format!("{marker}{}: ", config.assistant_name);
    drop(config);

    let mut images: Vec<CollectedImage> = Vec::new();
    let mut current_role = Role::User;

    for message in messages {
        if message.role != current_role {
            if merged.ends_with('\n') {
                merged.pop();
            }
            let prefix = match message.role {
                Role::User => &human_prefix,
                Role::Assistant => &assistant_prefix,
            };
            merged.push_str("\n\n");
            merged.push_str(prefix);
        }
        current_role = message.role;

        match &message.content {
            MessageContent::Text(text) => {
                merged.push_str(text);
                merged.push('\n');
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    render_block(block, &mut merged, &mut images).await?;
                }
            }
        }
        if merged.ends_with('\n') {
            merged.pop();
        }
    }
    Ok((merged, images))
}

async fn render_block(
    block: &ContentBlock,
    merged: &mut String,
    images: &mut Vec<CollectedImage>,
) -> Result<(), CloverError> {
    match block {
        ContentBlock::Text { text, .. } => {
            merged.push_str(text);
            merged.push('\n');
        }
        ContentBlock::Thinking { thinking, .. } => {
            merged.push_str("<\u{8}antml:thinking>\n");
            merged.push_str(thinking);
            merged.push_str("\n</\u{8}antml:thinking>\n");
        }
        ContentBlock::ToolUse { name, input, .. }
        | ContentBlock::ServerToolUse { name, input, .. } => {
            merged.push_str("<\u{8}antml:function_calls>\n");
            merged.push_str(&format!("<\u{8}antml:invoke name=\"{name}\">\n"));
            if let Value::Object(input) = input {
                for (key, value) in input {
                    let rendered = match value {
                        Value::String(s) => s.to_owned(),
                        other => other.to_string(),
                    };
                    merged.push_str(&format!(
                        "<\u{8}antml:parameter name=\"{key}\">{rendered}</\u{8}antml:parameter>\n"
                    ));
                }
            }
            merged.push_str("</\u{8}antml:invoke>\n</\u{8}antml:function_calls>\n");
        }
        ContentBlock::ToolResult { content, .. } => {
            let mut text = String::new();
            match content {
                ToolResultContent::Text(s) => text.push_str(s),
                ToolResultContent::Blocks(blocks) => {
                    for inner in blocks {
                        match inner {
                            ContentBlock::Text { text: t, .. } => {
                                text.push_str(t);
                                text.push('\n');
                            }
                            ContentBlock::Image { source, .. } => {
                                if let Some(image) = collect_image(source).await? {
                                    images.push(image);
                                    text.push_str("(image attached)\n");
                                }
                            }
                            _ => {}
                        }
                        if text.ends_with('\n') {
                            text.pop();
                        }
                    }
                }
            }
            merged.push_str(&format!("<function_results>{text}</function_results>"));
        }
        ContentBlock::Image { source, .. } => {
            if let Some(image) = collect_image(source).await? {
                images.push(image);
            }
        }
        ContentBlock::WebSearchToolResult { .. } => {}
    }
    Ok(())
}

async fn collect_image(source: &ImageSource) -> Result<Option<CollectedImage>, CloverError> {
    match source {
        ImageSource::Base64 { media_type, data } => Ok(Some(CollectedImage {
            media_type: media_type.to_owned(),
            data: data.to_owned(),
        })),
        ImageSource::Url { url } => extract_image_from_url(url).await,
        // already uploaded server-side, nothing to collect
        ImageSource::File { .. } => Ok(None),
    }
}

/// Decode a data URL, or download an external image when allowed
pub async fn extract_image_from_url(url: &str) -> Result<Option<CollectedImage>, CloverError> {
    if let Some(rest) = url.strip_prefix("data:") {
        let Some((metadata, data)) = rest.split_once(',') else {
            warn!("Malformed data URL, skipping image");
            return Ok(None);
        };
        let media_type = metadata.split(';').next().unwrap_or_default().to_string();
        return Ok(Some(CollectedImage {
            media_type,
            data: data.to_string(),
        }));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        warn!("Unsupported image URL scheme, skipping: {url}");
        return Ok(None);
    }
    if !CLOVER_CONFIG.load().allow_external_images {
        return Err(CloverError::ExternalImageNotAllowed {
            url: url.to_string(),
        });
    }
    debug!("Downloading external image: {url}");
    let download = async {
        let res = SUPER_CLIENT
            .get(url)
            .timeout(std::time::Duration::from_secs(
                CLOVER_CONFIG.load().request_timeout,
            ))
            .send()
            .await
            .context(WreqSnafu {
                msg: "Failed to download external image",
            })?;
        if !res.status().is_success() {
            return Err(CloverError::ExternalImageDownload {
                url: url.to_string(),
            });
        }
        let media_type = res
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = res.bytes().await.context(WreqSnafu {
            msg: "Failed to read external image body",
        })?;
        Ok(CollectedImage {
            media_type,
            data: BASE64_STANDARD.encode(bytes),
        })
    };
    match download.await {
        Ok(image) => Ok(Some(image)),
        Err(CloverError::ExternalImageDownload { url }) => {
            Err(CloverError::ExternalImageDownload { url })
        }
        Err(_) => Err(CloverError::ExternalImageDownload {
            url: url.to_string(),
        }),
    }
}
