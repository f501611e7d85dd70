//! Per-request stream session.
//!
//! A [`StreamSession`] is owned by the single task that serves one client
//! stream. It drives classifier, sieve and emitter in order, accumulates the
//! text used for usage estimation and holds the external lease. The lease is
//! released exactly once: by [`StreamSession::close`] on a normal end, or by
//! the [`LeaseGuard`] drop path when the client goes away mid-stream.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::observability::token_counter::{build_usage, log_stream_usage, Usage};
use crate::sieve::{parse_standalone_tool_calls, SieveEvent, SieveEvents, SieveLimits, ToolSieve};
use crate::stream::{
    is_citation, FinishReason, FrameEmitter, PartKind, PathClassifier, SkipPaths, Terminal,
    UpstreamFrame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    /// Terminal frame written, lease not yet released.
    Finishing,
    Finished,
}

/// Releases an external lease. Errors are logged and otherwise ignored; the
/// lease owner expires abandoned leases on its own.
pub trait LeaseReleaser: Send + Sync {
    fn release<'a>(&'a self, lease_id: &'a str) -> BoxFuture<'a, Result<(), GatewayError>>;
}

/// Single-use handle on a lease.
pub struct LeaseGuard {
    lease_id: Option<String>,
    releaser: Arc<dyn LeaseReleaser>,
    timeout: Duration,
}

impl LeaseGuard {
    #[must_use]
    pub fn new(lease_id: Option<String>, releaser: Arc<dyn LeaseReleaser>, timeout: Duration) -> Self {
        Self {
            lease_id: lease_id.filter(|id| !id.trim().is_empty()),
            releaser,
            timeout,
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.lease_id.is_some()
    }

    /// Release now. Later calls, and the drop path, do nothing.
    pub async fn release(&mut self) {
        let Some(lease_id) = self.lease_id.take() else {
            return;
        };
        release_bounded(self.releaser.as_ref(), &lease_id, self.timeout).await;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease_id) = self.lease_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lease_id = %lease_id, "no runtime available to release lease");
            return;
        };
        let releaser = Arc::clone(&self.releaser);
        let timeout = self.timeout;
        handle.spawn(async move {
            release_bounded(releaser.as_ref(), &lease_id, timeout).await;
        });
    }
}

async fn release_bounded(releaser: &dyn LeaseReleaser, lease_id: &str, timeout: Duration) {
    match tokio::time::timeout(timeout, releaser.release(lease_id)).await {
        Ok(Ok(())) => debug!(lease_id = %lease_id, "lease released"),
        Ok(Err(err)) => warn!(lease_id = %lease_id, error = %err, "lease release failed"),
        Err(_) => warn!(
            lease_id = %lease_id,
            timeout_ms = timeout.as_millis() as u64,
            "lease release timed out"
        ),
    }
}

/// Everything a session needs from the prepare step and server config.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_id: String,
    pub model: String,
    /// Prompt text, only used for usage estimation.
    pub prompt: String,
    pub thinking_enabled: bool,
    /// Enables `[citation:` filtering.
    pub search_enabled: bool,
    /// Empty disables the sieve: answer text streams straight through.
    pub tool_names: Vec<String>,
    pub emit_early_tool_deltas: bool,
    pub final_text_fallback: bool,
    pub sieve_limits: SieveLimits,
    pub created: u64,
}

pub struct StreamSession {
    phase: SessionPhase,
    session_id: String,
    model: String,
    prompt: String,
    thinking_enabled: bool,
    search_enabled: bool,
    final_text_fallback: bool,
    classifier: PathClassifier,
    sieve: Option<ToolSieve>,
    emitter: FrameEmitter,
    events: SieveEvents,
    thinking_text: String,
    output_text: String,
    summary: Option<(FinishReason, Usage)>,
    lease: LeaseGuard,
    started: Instant,
}

impl StreamSession {
    #[must_use]
    pub fn new(options: SessionOptions, skip_paths: Arc<SkipPaths>, lease: LeaseGuard) -> Self {
        let sieve = (!options.tool_names.is_empty()).then(|| {
            ToolSieve::new(
                options.tool_names,
                options.sieve_limits,
                options.emit_early_tool_deltas,
            )
        });
        Self {
            phase: SessionPhase::Active,
            emitter: FrameEmitter::new(options.session_id.as_str(), options.model.as_str(), options.created),
            classifier: PathClassifier::new(skip_paths, options.thinking_enabled),
            session_id: options.session_id,
            model: options.model,
            prompt: options.prompt,
            thinking_enabled: options.thinking_enabled,
            search_enabled: options.search_enabled,
            final_text_fallback: options.final_text_fallback,
            sieve,
            events: SieveEvents::new(),
            thinking_text: String::new(),
            output_text: String::new(),
            summary: None,
            lease,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn sieve_enabled(&self) -> bool {
        self.sieve.is_some()
    }

    /// Answer text seen so far, before sieving.
    #[must_use]
    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    #[must_use]
    pub fn thinking_text(&self) -> &str {
        &self.thinking_text
    }

    /// Route one decoded upstream chunk to the client frames it produces.
    /// Returns the finish reason when the chunk ends the stream.
    pub fn handle_chunk(&mut self, chunk: &Value, out: &mut Vec<Bytes>) -> Option<FinishReason> {
        if self.phase != SessionPhase::Active {
            return None;
        }
        let outcome = self.classifier.classify(chunk);
        match outcome.terminal {
            Some(Terminal::Finished) => return Some(FinishReason::Stop),
            Some(Terminal::ContentFilter) => return Some(FinishReason::ContentFilter),
            None => {}
        }
        for part in &outcome.parts {
            if part.text.is_empty() || (self.search_enabled && is_citation(&part.text)) {
                continue;
            }
            match part.kind {
                // Reasoning is neither shown nor counted unless the request asked for it.
                PartKind::Thinking if !self.thinking_enabled => {}
                PartKind::Thinking => {
                    self.thinking_text.push_str(&part.text);
                    out.extend(self.emitter.reasoning(&part.text));
                }
                PartKind::Text => {
                    self.output_text.push_str(&part.text);
                    match self.sieve.as_mut() {
                        Some(sieve) => {
                            sieve.process_into(&part.text, &mut self.events);
                            emit_sieve_events(&mut self.emitter, &mut self.events, out);
                        }
                        None => out.extend(self.emitter.content(&part.text)),
                    }
                }
            }
        }
        None
    }

    /// Write the closing frames: whatever the sieve still holds, the final
    /// chunk with `finish_reason` and usage, then `[DONE]`. Only the first
    /// call produces output.
    pub fn finish_frames(&mut self, reason: FinishReason) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.phase != SessionPhase::Active {
            return out;
        }
        self.phase = SessionPhase::Finishing;
        self.drain_sieve(&mut out);
        let usage = build_usage(&self.prompt, &self.thinking_text, &self.output_text);
        let effective = self.emitter.effective_reason(reason);
        out.extend(self.emitter.finish(reason, &usage));
        self.summary = Some((effective, usage));
        out
    }

    /// Release the lease and log the completed stream. Idempotent.
    pub async fn close(&mut self) {
        if self.phase == SessionPhase::Finished {
            return;
        }
        self.phase = SessionPhase::Finished;
        self.lease.release().await;
        if let Some((reason, usage)) = self.summary.take() {
            log_stream_usage(
                &self.model,
                &self.session_id,
                reason.as_str(),
                &usage,
                self.emitter.tool_calls_emitted(),
                self.started.elapsed(),
            );
        }
    }

    /// [`Self::finish_frames`] followed by [`Self::close`].
    pub async fn finish(&mut self, reason: FinishReason) -> Vec<Bytes> {
        let frames = self.finish_frames(reason);
        self.close().await;
        frames
    }

    fn drain_sieve(&mut self, out: &mut Vec<Bytes>) {
        let Some(sieve) = self.sieve.as_mut() else {
            return;
        };
        if self.final_text_fallback && !self.emitter.tool_calls_emitted() {
            let calls = parse_standalone_tool_calls(&self.output_text, sieve.tool_names());
            if !calls.is_empty() {
                debug!(
                    session_id = %self.session_id,
                    calls = calls.len(),
                    "tool calls recovered from final output text"
                );
                out.extend(self.emitter.tool_calls(&calls));
                return;
            }
        }
        sieve.flush_into(&mut self.events);
        emit_sieve_events(&mut self.emitter, &mut self.events, out);
    }

    /// Serve the session as an SSE body stream.
    ///
    /// Frames are yielded in production order. An upstream error after the
    /// headers went out finishes the stream with `stop`. Dropping the stream
    /// (client disconnect) drops the upstream reader with it and releases the
    /// lease in the background.
    pub fn into_sse_stream<S, E>(self, frames: S) -> impl Stream<Item = Result<Bytes, Infallible>> + Send
    where
        S: Stream<Item = Result<UpstreamFrame, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let state = ConsumerState {
            session: self,
            frames: Box::pin(frames),
            pending: VecDeque::new(),
            scratch: Vec::new(),
        };

        futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(frame) = state.pending.pop_front() {
                    return Some((Ok(frame), state));
                }
                match state.session.phase {
                    SessionPhase::Active => {}
                    SessionPhase::Finishing => {
                        state.session.close().await;
                        return None;
                    }
                    SessionPhase::Finished => return None,
                }

                let finish = match state.frames.next().await {
                    Some(Ok(UpstreamFrame::Chunk(chunk))) => {
                        state.session.handle_chunk(&chunk, &mut state.scratch)
                    }
                    Some(Ok(UpstreamFrame::Done)) | None => Some(FinishReason::Stop),
                    Some(Err(err)) => {
                        warn!(
                            session_id = %state.session.session_id,
                            error = %err,
                            "upstream stream failed mid-response"
                        );
                        Some(FinishReason::Stop)
                    }
                };
                state.pending.extend(state.scratch.drain(..));
                if let Some(reason) = finish {
                    let closing = state.session.finish_frames(reason);
                    state.pending.extend(closing);
                }
            }
        })
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.phase == SessionPhase::Active {
            debug!(
                session_id = %self.session_id,
                lease_held = self.lease.is_held(),
                "client disconnected before stream finished"
            );
        }
    }
}

struct ConsumerState<S> {
    session: StreamSession,
    frames: Pin<Box<S>>,
    pending: VecDeque<Bytes>,
    scratch: Vec<Bytes>,
}

fn emit_sieve_events(emitter: &mut FrameEmitter, events: &mut SieveEvents, out: &mut Vec<Bytes>) {
    for event in events.drain(..) {
        let frame = match event {
            SieveEvent::Text(text) => emitter.content(&text),
            SieveEvent::ToolCallDeltas(deltas) => emitter.tool_call_deltas(&deltas),
            SieveEvent::ToolCalls(calls) => emitter.tool_calls(&calls),
        };
        out.extend(frame);
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
