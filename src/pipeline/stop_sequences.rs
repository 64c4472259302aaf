use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use crate::{
    claude_web::SessionManager,
    error::CloverError,
    pipeline::{PipelineContext, Processor, names},
    stream::EventStream,
    types::{
        claude::StopReason,
        streaming::{ContentBlockDelta, StreamEvent},
    },
};

/// Intercepts text deltas and terminates the stream when a declared stop
/// sequence completes.
///
/// A buffer holds text that could still belong to a match; candidates are
/// (start position, incremental trie search) pairs. On completion the
/// safe prefix is flushed, synthetic stop events are emitted and the web
/// session is evicted. Candidates that can no longer match release their
/// buffered text to the client.
pub struct StopSequencesProcessor;

#[async_trait]
impl Processor for StopSequencesProcessor {
    fn name(&self) -> &'static str {
        names::STOP_SEQUENCES
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        let Some(events) = ctx.event_stream.take() else {
            return Ok(());
        };
        let sequences = ctx.request.stop_sequences.to_owned().unwrap_or_default();
        if sequences.is_empty() {
            ctx.event_stream = Some(events);
            return Ok(());
        }
        let session_id = ctx.session.as_ref().map(|s| s.session_id().to_string());
        ctx.event_stream = Some(stop_stream(
            events,
            sequences,
            session_id,
            ctx.state.sessions.to_owned(),
        ));
        Ok(())
    }
}

fn stop_stream(
    mut events: EventStream,
    sequences: Vec<String>,
    session_id: Option<String>,
    manager: SessionManager,
) -> EventStream {
    Box::pin(try_stream! {
        let trie = trie_rs::map::Trie::from_iter(
            sequences
                .iter()
                .map(|s| (s.chars().collect::<Vec<char>>(), s.to_owned())),
        );
        let mut buffer: Vec<char> = Vec::new();
        let mut candidates = Vec::new();
        let mut current_index = 0usize;

        while let Some(event) = events.next().await {
            let event = event?;
            match event {
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::TextDelta { text },
                } => {
                    current_index = index;
                    for c in text.chars() {
                        buffer.push(c);
                        candidates.push((buffer.len() - 1, trie.inc_search()));

                        let mut surviving = Vec::with_capacity(candidates.len());
                        let mut hit: Option<(usize, String)> = None;
                        for (start, mut search) in candidates.drain(..) {
                            let Some(answer) = search.query(&c) else {
                                continue;
                            };
                            if answer.is_match() {
                                let sequence =
                                    search.value().cloned().unwrap_or_default();
                                hit = Some((start, sequence));
                                break;
                            }
                            if answer.is_prefix() {
                                surviving.push((start, search));
                            }
                        }
                        if let Some((start, sequence)) = hit {
                            debug!("Stop sequence detected: {sequence:?}");
                            let safe: String = buffer[..start].iter().collect();
                            if !safe.is_empty() {
                                yield StreamEvent::ContentBlockDelta {
                                    index: current_index,
                                    delta: ContentBlockDelta::TextDelta { text: safe },
                                };
                            }
                            yield StreamEvent::ContentBlockStop {
                                index: current_index,
                            };
                            yield StreamEvent::stopped(
                                StopReason::StopSequence,
                                Some(sequence),
                            );
                            yield StreamEvent::MessageStop;
                            if let Some(ref session_id) = session_id {
                                manager.remove(session_id).await;
                            }
                            return;
                        }
                        candidates = surviving;

                        // release text no live candidate still covers
                        let safe_len = candidates
                            .iter()
                            .map(|(start, _)| *start)
                            .min()
                            .unwrap_or(buffer.len());
                        if safe_len > 0 {
                            let safe: String = buffer[..safe_len].iter().collect();
                            yield StreamEvent::ContentBlockDelta {
                                index: current_index,
                                delta: ContentBlockDelta::TextDelta { text: safe },
                            };
                            buffer.drain(..safe_len);
                            for (start, _) in candidates.iter_mut() {
                                *start -= safe_len;
                            }
                        }
                    }
                }
                other => {
                    // non-text events flush the buffer unconditionally
                    if !buffer.is_empty() {
                        let pending: String = buffer.drain(..).collect();
                        candidates.clear();
                        yield StreamEvent::ContentBlockDelta {
                            index: current_index,
                            delta: ContentBlockDelta::TextDelta { text: pending },
                        };
                    }
                    yield other;
                }
            }
        }
        // stream ended with an unfinished partial match
        if !buffer.is_empty() {
            let pending: String = buffer.drain(..).collect();
            yield StreamEvent::ContentBlockDelta {
                index: current_index,
                delta: ContentBlockDelta::TextDelta { text: pending },
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountPoolHandle;
    use futures::stream;

    fn text_delta(text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentBlockDelta::TextDelta {
                text: text.to_string(),
            },
        }
    }

    async fn run(sequences: &[&str], inputs: Vec<StreamEvent>) -> Vec<StreamEvent> {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        let manager = SessionManager::new(pool);
        let events: Vec<Result<StreamEvent, CloverError>> =
            inputs.into_iter().map(Ok).collect();
        stop_stream(
            Box::pin(stream::iter(events)),
            sequences.iter().map(|s| s.to_string()).collect(),
            None,
            manager,
        )
        .map(|e| e.unwrap())
        .collect()
        .await
    }

    fn collect_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: ContentBlockDelta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn detects_sequence_across_deltas() {
        let events = run(
            &["END"],
            vec![text_delta("Hello thE"), text_delta("ND world")],
        )
        .await;
        assert_eq!(collect_text(&events), "Hello th");
        let tail = &events[events.len() - 3..];
        assert!(matches!(tail[0], StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(
            tail[1],
            StreamEvent::MessageDelta { ref delta, .. }
                if delta.stop_reason == Some(StopReason::StopSequence)
                    && delta.stop_sequence.as_deref() == Some("END")
        ));
        assert!(matches!(tail[2], StreamEvent::MessageStop));
    }

    #[tokio::test]
    async fn partial_match_is_released_on_mismatch() {
        let events = run(&["END"], vec![text_delta("bEN"), text_delta("x tail")]).await;
        assert_eq!(collect_text(&events), "bENx tail");
        assert!(
            events
                .iter()
                .all(|e| !matches!(e, StreamEvent::MessageStop)),
        );
    }

    #[tokio::test]
    async fn exact_boundary_match_terminates_cleanly() {
        let events = run(&["END"], vec![text_delta("stop here"), text_delta("END")]).await;
        assert_eq!(collect_text(&events), "stop here");
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    #[tokio::test]
    async fn non_text_events_flush_the_buffer() {
        let events = run(
            &["END"],
            vec![text_delta("abcE"), StreamEvent::Ping, text_delta("ND")],
        )
        .await;
        // the pending "E" flushes before the ping, so the later "ND"
        // cannot complete a match that straddles it
        assert_eq!(collect_text(&events), "abcEND");
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Ping)));
        assert!(
            events
                .iter()
                .all(|e| !matches!(e, StreamEvent::MessageStop)),
        );
    }

    #[tokio::test]
    async fn unfinished_partial_match_flushes_at_stream_end() {
        let events = run(&["END"], vec![text_delta("tail EN")]).await;
        assert_eq!(collect_text(&events), "tail EN");
    }

    #[tokio::test]
    async fn earliest_of_overlapping_sequences_wins() {
        let events = run(&["AB", "BC"], vec![text_delta("xABC")]).await;
        assert_eq!(collect_text(&events), "x");
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta { delta, .. }
                if delta.stop_sequence.as_deref() == Some("AB")
        )));
    }
}
