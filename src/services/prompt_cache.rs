use itertools::Itertools;
use moka::sync::Cache;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    config::CLOVER_CONFIG,
    types::claude::{ContentBlock, CreateMessageParams, ImageSource, MessageContent},
    utils::to_hex,
};

/// Result of scanning a request against the registry
#[derive(Debug, Default, Clone)]
pub struct CacheScan {
    /// Account owning the deepest matching prefix, if any
    pub sticky_account: Option<String>,
    /// Fingerprints of cache_control-annotated prefixes, to be recorded
    /// against the serving account after a successful call
    pub checkpoints: Vec<String>,
}

/// Content-addressed prompt-prefix registry.
///
/// An incremental sha-256 rolls over the model, the system blocks and
/// every message block; NUL-delimited sorted-key compact JSON keeps
/// block boundaries from straddling. After each block the hex digest
/// fingerprints the prefix up to and including that block.
#[derive(Clone)]
pub struct PromptCacheRegistry {
    checkpoints: Cache<String, String>,
}

impl PromptCacheRegistry {
    pub fn new() -> Self {
        let ttl = CLOVER_CONFIG.load().cache_timeout.max(1);
        Self::with_ttl(std::time::Duration::from_secs(ttl))
    }

    pub fn with_ttl(ttl: std::time::Duration) -> Self {
        Self {
            checkpoints: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Roll the fingerprint over the request, collecting checkpoints and
    /// the sticky account. Ties go to the last (deepest) match.
    pub fn scan(&self, params: &CreateMessageParams) -> CacheScan {
        let mut scan = CacheScan::default();
        let mut hasher = Sha256::new();
        absorb(&mut hasher, &json!({ "model": params.model }));

        if let Some(system) = &params.system {
            match system {
                Value::String(text) => {
                    let block = ContentBlock::text(text.to_owned());
                    self.fold_block(&mut hasher, &block, &mut scan);
                }
                Value::Array(blocks) => {
                    for raw in blocks {
                        let Ok(block) = serde_json::from_value::<ContentBlock>(raw.to_owned())
                        else {
                            continue;
                        };
                        self.fold_block(&mut hasher, &block, &mut scan);
                    }
                }
                _ => {}
            }
        }

        for message in &params.messages {
            absorb(&mut hasher, &json!({ "role": message.role }));
            match &message.content {
                MessageContent::Text(text) => {
                    let block = ContentBlock::text(text.to_owned());
                    self.fold_block(&mut hasher, &block, &mut scan);
                }
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        self.fold_block(&mut hasher, block, &mut scan);
                    }
                }
            }
        }

        if let Some(ref account) = scan.sticky_account {
            debug!("Prompt cache hit, sticky account {account}");
        }
        scan
    }

    fn fold_block(&self, hasher: &mut Sha256, block: &ContentBlock, scan: &mut CacheScan) {
        absorb(hasher, &block_digest_fields(block));
        let fingerprint = to_hex(&hasher.clone().finalize());
        if block.cache_control().is_some() {
            scan.checkpoints.push(fingerprint.to_owned());
        }
        if let Some(account) = self.checkpoints.get(&fingerprint) {
            scan.sticky_account = Some(account);
        }
    }

    /// Store checkpoints against the account that served the request
    pub fn record(&self, checkpoints: &[String], account_id: &str) {
        for checkpoint in checkpoints {
            self.checkpoints
                .insert(checkpoint.to_owned(), account_id.to_string());
        }
        if !checkpoints.is_empty() {
            debug!(
                "Recorded {} cache checkpoints for account {account_id}",
                checkpoints.len()
            );
        }
    }

    /// Interval sweeper; moka expires lazily, this forces the pending work
    pub fn spawn_sweeper(&self) {
        let registry = self.to_owned();
        tokio::spawn(async move {
            let period = CLOVER_CONFIG.load().cache_cleanup_interval.max(1);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(period));
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.checkpoints.run_pending_tasks();
            }
        });
    }

    pub fn len(&self) -> usize {
        self.checkpoints.run_pending_tasks();
        self.checkpoints.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PromptCacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// NUL delimiter + sorted-key compact JSON, so byte boundaries between
/// blocks are unambiguous
fn absorb(hasher: &mut Sha256, data: &Value) {
    hasher.update(b"\x00");
    hasher.update(canonical_json(data).as_bytes());
}

fn canonical_json(data: &Value) -> String {
    match data {
        Value::Object(map) => {
            let fields = map
                .keys()
                .sorted()
                .map(|k| format!("{}:{}", Value::String(k.to_owned()), canonical_json(&map[k])))
                .join(",");
            format!("{{{fields}}}")
        }
        Value::Array(items) => {
            format!("[{}]", items.iter().map(canonical_json).join(","))
        }
        other => other.to_string(),
    }
}

/// Only fields observable in the user-visible content participate
fn block_digest_fields(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text, .. } => json!({ "type": "text", "text": text }),
        ContentBlock::Thinking { thinking, .. } => {
            json!({ "type": "thinking", "thinking": thinking })
        }
        ContentBlock::ToolUse { id, .. } => json!({ "type": "tool_use", "id": id }),
        ContentBlock::ServerToolUse { id, .. } => {
            json!({ "type": "server_tool_use", "id": id })
        }
        ContentBlock::ToolResult { tool_use_id, .. } => {
            json!({ "type": "tool_result", "tool_use_id": tool_use_id })
        }
        ContentBlock::WebSearchToolResult { tool_use_id, .. } => {
            json!({ "type": "web_search_tool_result", "tool_use_id": tool_use_id })
        }
        ContentBlock::Image { source, .. } => match source {
            ImageSource::Base64 { data, .. } => {
                json!({ "type": "image", "source_type": "base64", "source_data": data })
            }
            ImageSource::Url { url } => {
                json!({ "type": "image", "source_type": "url", "source_url": url })
            }
            ImageSource::File { file_uuid } => {
                json!({ "type": "image", "source_type": "file", "source_file": file_uuid })
            }
        },
    }
}
