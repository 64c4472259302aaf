use std::pin::Pin;

use futures::Stream;

use crate::{error::CloverError, types::streaming::StreamEvent};

/// Upstream body decoded into newline-terminated text lines
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, CloverError>> + Send>>;

/// Typed streaming events flowing through the pipeline stages
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, CloverError>> + Send>>;
