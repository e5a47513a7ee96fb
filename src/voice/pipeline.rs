//! Turns incrementally-arriving reply text into an ordered, cancellable
//! queue of spoken sentences.
//!
//! The pump is a single consumer behind a reentrancy guard: at most one
//! sentence is ever in flight to the voice. Cancellation is by generation:
//! a completion captured under generation G releases the guard and does
//! nothing else once the live generation has moved past G. Every playback
//! call is bounded by a timeout so a hung provider can delay the queue but
//! never deadlock it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::capture::{PlaybackHalt, SpeakingSink};
use crate::context::SessionContext;
use crate::error::TtsError;

use super::VoiceRouter;

struct PipeState {
    generation: u64,
    queue: VecDeque<String>,
    buffer: String,
    response_id: Option<String>,
    response_done: bool,
    /// Reentrancy guard: one sentence in flight at a time.
    in_flight: bool,
    /// Whether this generation has claimed the assistant-speaking flag.
    speaking_marked: bool,
}

pub struct StreamingPipeline {
    ctx: SessionContext,
    voice: Arc<VoiceRouter>,
    speaking: Arc<dyn SpeakingSink>,
    weak: Weak<StreamingPipeline>,
    inner: Mutex<PipeState>,
}

impl StreamingPipeline {
    pub fn new(
        ctx: SessionContext,
        voice: Arc<VoiceRouter>,
        speaking: Arc<dyn SpeakingSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ctx,
            voice,
            speaking,
            weak: weak.clone(),
            inner: Mutex::new(PipeState {
                generation: 0,
                queue: VecDeque::new(),
                buffer: String::new(),
                response_id: None,
                response_done: false,
                in_flight: false,
                speaking_marked: false,
            }),
        })
    }

    fn me(&self) -> Arc<Self> {
        self.weak.upgrade().expect("pipeline alive")
    }

    /// Append a delta for `response_id`. A different id means a new turn:
    /// the generation advances, which strands any in-flight completion from
    /// the previous one.
    pub fn push_delta(&self, response_id: &str, delta: &str) {
        let stale_speaking = {
            let mut p = self.inner.lock().expect("pipeline lock");
            let mut stale = false;
            if p.response_id.as_deref() != Some(response_id) {
                p.generation += 1;
                p.queue.clear();
                p.buffer.clear();
                p.response_done = false;
                p.response_id = Some(response_id.to_string());
                stale = p.speaking_marked;
                p.speaking_marked = false;
            }
            p.buffer.push_str(delta);
            let sentences = extract_sentences(&mut p.buffer);
            p.queue.extend(sentences);
            stale
        };
        if stale_speaking {
            self.speaking.set_assistant_speaking(false);
        }
        self.pump();
    }

    /// The upstream turn is complete: flush whatever partial text remains as
    /// a final sentence, then let the queue drain.
    pub fn finish_turn(&self) {
        {
            let mut p = self.inner.lock().expect("pipeline lock");
            let rest = p.buffer.trim().to_string();
            p.buffer.clear();
            if !rest.is_empty() {
                p.queue.push_back(rest);
            }
            p.response_done = true;
        }
        if !self.maybe_finish() {
            self.pump();
        }
    }

    /// Did streaming playback handle this response? Decides whether the
    /// fallback whole-reply voice path runs at turn completion.
    pub fn is_streaming(&self, response_id: &str) -> bool {
        self.inner
            .lock()
            .expect("pipeline lock")
            .response_id
            .as_deref()
            == Some(response_id)
    }

    /// User interruption or teardown: invalidate the live generation, drop
    /// everything queued, halt audio, release the speaking flag.
    pub fn interrupt(&self) {
        let was_speaking = {
            let mut p = self.inner.lock().expect("pipeline lock");
            p.generation += 1;
            p.queue.clear();
            p.buffer.clear();
            p.response_done = false;
            p.response_id = None;
            let was = p.speaking_marked;
            p.speaking_marked = false;
            was
        };
        self.voice.halt();
        if was_speaking {
            self.speaking.set_assistant_speaking(false);
        }
    }

    fn pump(&self) {
        let (sentence, generation, mark) = {
            let mut p = self.inner.lock().expect("pipeline lock");
            if p.in_flight {
                return;
            }
            let Some(sentence) = p.queue.pop_front() else {
                return;
            };
            p.in_flight = true;
            let mark = if p.speaking_marked {
                false
            } else {
                p.speaking_marked = true;
                true
            };
            (sentence, p.generation, mark)
        };

        if mark {
            self.speaking.set_assistant_speaking(true);
        }

        self.ctx.ui.log(&format!(
            "[streaming] speaking: {}",
            sentence.chars().take(50).collect::<String>()
        ));

        let me = self.me();
        tokio::spawn(async move {
            let result = tokio::time::timeout(
                me.voice.tuning_sentence_timeout(),
                me.voice.speak_streaming(&sentence),
            )
            .await;
            me.complete(generation, result);
        });
    }

    fn complete(
        &self,
        generation: u64,
        result: Result<Result<(), TtsError>, tokio::time::error::Elapsed>,
    ) {
        let stale = {
            let mut p = self.inner.lock().expect("pipeline lock");
            // Always release the guard, even for a stale generation;
            // otherwise the next generation can never pump.
            p.in_flight = false;
            p.generation != generation
        };

        // A stale completion acts on nothing of its own; it only frees the
        // guard so the live generation can make progress below.
        if !stale {
            match result {
                Err(_) => {
                    // Provider never signalled completion; force the queue on.
                    self.ctx
                        .ui
                        .log("[streaming] sentence timed out, advancing queue");
                    self.voice.halt();
                }
                Ok(Err(_)) => {
                    // Router already surfaced the error; an error is still a
                    // completed sentence.
                }
                Ok(Ok(())) => {}
            }
        }

        if !self.maybe_finish() {
            self.pump();
        }
    }

    /// When the queue is fully drained with nothing in flight and the turn
    /// is complete, the pipeline (and only the pipeline, in streaming mode)
    /// clears the assistant-speaking flag.
    fn maybe_finish(&self) -> bool {
        let (finished, clear) = {
            let mut p = self.inner.lock().expect("pipeline lock");
            let finished = !p.in_flight
                && p.queue.is_empty()
                && p.response_done
                && p.buffer.trim().is_empty();
            let clear = finished && p.speaking_marked;
            if clear {
                p.speaking_marked = false;
            }
            (finished, clear)
        };
        if clear {
            self.speaking.set_assistant_speaking(false);
        }
        finished
    }
}

impl PlaybackHalt for StreamingPipeline {
    fn halt(&self) {
        self.interrupt();
    }
}

/// Extract complete sentences from the front of `buffer`, leaving the
/// incomplete tail in place. A sentence ends at terminal punctuation,
/// tolerating a run of terminals and a trailing quote.
pub(crate) fn extract_sentences(buffer: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut consumed = 0usize;
    let mut chars = buffer.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            let mut end = i + ch.len_utf8();
            while let Some(&(j, c)) = chars.peek() {
                if matches!(c, '.' | '!' | '?' | '"' | '\'' | '\u{201d}' | '\u{2019}') {
                    end = j + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            while let Some(&(j, c)) = chars.peek() {
                if c.is_whitespace() {
                    end = j + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let sentence = buffer[consumed..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            consumed = end;
        }
    }

    if consumed > 0 {
        *buffer = buffer[consumed..].to_string();
    }
    sentences
}
