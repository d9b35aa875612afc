//! Token stream classifier
//!
//! Splits one model output channel into reasoning, content and tool-call
//! deltas. Native thought annotations are trusted as-is; plain text may also
//! switch kinds with `<think>` / `</think>` markers, which may arrive split
//! across chunks. Markers are structural and never part of a payload; every
//! other byte is emitted exactly once, in production order.

use crate::llm::ModelChunk;
use crate::models::{ClassifiedDelta, DeltaKind};
use tracing::debug;

const OPEN_MARKER: &str = "<think>";
const CLOSE_MARKER: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierPhase {
    Deliberating,
    Answering,
}

#[derive(Debug)]
pub struct StreamClassifier {
    inside_marker: bool,
    /// Tail of plain text that may be the start of a marker
    held: String,
    phase: ClassifierPhase,
}

impl Default for StreamClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClassifier {
    pub fn new() -> Self {
        Self {
            inside_marker: false,
            held: String::new(),
            phase: ClassifierPhase::Deliberating,
        }
    }

    pub fn phase(&self) -> ClassifierPhase {
        self.phase
    }

    /// Classify one raw chunk.
    pub fn push(&mut self, chunk: ModelChunk) -> Vec<ClassifiedDelta> {
        let mut out = Vec::new();

        match chunk {
            ModelChunk::ToolCall(request) => {
                self.release_held(&mut out);
                out.push(ClassifiedDelta::ToolCall(request));
            }
            ModelChunk::Text { text, thought: true } => {
                self.release_held(&mut out);
                self.emit(&mut out, DeltaKind::Reasoning, &text);
            }
            ModelChunk::Text { text, thought: false } => {
                let mut buffer = std::mem::take(&mut self.held);
                buffer.push_str(&text);
                self.scan(&mut out, buffer);
            }
        }

        out
    }

    /// Flush whatever is held back at end of stream.
    pub fn finish(&mut self) -> Vec<ClassifiedDelta> {
        let mut out = Vec::new();
        self.release_held(&mut out);
        out
    }

    fn marker(&self) -> &'static str {
        if self.inside_marker {
            CLOSE_MARKER
        } else {
            OPEN_MARKER
        }
    }

    fn text_kind(&self) -> DeltaKind {
        if self.inside_marker {
            DeltaKind::Reasoning
        } else {
            DeltaKind::Content
        }
    }

    fn scan(&mut self, out: &mut Vec<ClassifiedDelta>, mut buffer: String) {
        loop {
            let marker = self.marker();
            if let Some(pos) = buffer.find(marker) {
                let kind = self.text_kind();
                self.emit(out, kind, &buffer[..pos]);
                self.inside_marker = !self.inside_marker;
                buffer.drain(..pos + marker.len());
                continue;
            }

            let partial = partial_marker_len(&buffer, marker);
            let split = buffer.len() - partial;
            let kind = self.text_kind();
            self.emit(out, kind, &buffer[..split]);
            self.held = buffer.split_off(split);
            return;
        }
    }

    fn release_held(&mut self, out: &mut Vec<ClassifiedDelta>) {
        if self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        let kind = self.text_kind();
        self.emit(out, kind, &held);
    }

    fn emit(&mut self, out: &mut Vec<ClassifiedDelta>, kind: DeltaKind, text: &str) {
        if text.is_empty() {
            return;
        }

        match kind {
            DeltaKind::Content => self.phase = ClassifierPhase::Answering,
            DeltaKind::Reasoning if self.phase == ClassifierPhase::Answering => {
                debug!("reasoning arrived after the answer started");
            }
            _ => {}
        }

        let merged = match (out.last_mut(), kind) {
            (Some(ClassifiedDelta::Reasoning(prev)), DeltaKind::Reasoning)
            | (Some(ClassifiedDelta::Content(prev)), DeltaKind::Content) => {
                prev.push_str(text);
                true
            }
            _ => false,
        };
        if !merged {
            out.push(match kind {
                DeltaKind::Reasoning => ClassifiedDelta::Reasoning(text.to_string()),
                _ => ClassifiedDelta::Content(text.to_string()),
            });
        }
    }
}

/// Length of the longest suffix of `buffer` that is a proper prefix of `marker`.
fn partial_marker_len(buffer: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&len| buffer.ends_with(&marker[..len]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolCallRequest;
    use serde_json::json;

    fn run(chunks: Vec<ModelChunk>) -> Vec<ClassifiedDelta> {
        let mut classifier = StreamClassifier::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(classifier.push(chunk));
        }
        out.extend(classifier.finish());
        out
    }

    fn partition(deltas: &[ClassifiedDelta]) -> (String, String) {
        let mut reasoning = String::new();
        let mut content = String::new();
        for delta in deltas {
            match delta {
                ClassifiedDelta::Reasoning(text) => reasoning.push_str(text),
                ClassifiedDelta::Content(text) => content.push_str(text),
                ClassifiedDelta::ToolCall(_) => {}
            }
        }
        (reasoning, content)
    }

    #[test]
    fn test_zero_transitions_content_only() {
        let deltas = run(vec![
            ModelChunk::text("Index funds "),
            ModelChunk::text("spread risk <b>broadly</b>."),
        ]);
        let (reasoning, content) = partition(&deltas);
        assert!(reasoning.is_empty());
        assert_eq!(content, "Index funds spread risk <b>broadly</b>.");
    }

    #[test]
    fn test_reasoning_only_stream() {
        let deltas = run(vec![ModelChunk::thought("step one. "), ModelChunk::thought("step two.")]);
        assert_eq!(
            deltas,
            vec![
                ClassifiedDelta::Reasoning("step one. ".into()),
                ClassifiedDelta::Reasoning("step two.".into()),
            ]
        );
    }

    #[test]
    fn test_one_transition_at_every_split_point() {
        let raw = "<think>compare fees\n</think>Pick the cheaper fund.";
        for split in 0..=raw.len() {
            let deltas = run(vec![
                ModelChunk::text(&raw[..split]),
                ModelChunk::text(&raw[split..]),
            ]);
            let (reasoning, content) = partition(&deltas);
            assert_eq!(reasoning, "compare fees\n", "split at {}", split);
            assert_eq!(content, "Pick the cheaper fund.", "split at {}", split);

            let first_content = deltas.iter().position(|d| d.kind() == DeltaKind::Content);
            let last_reasoning = deltas.iter().rposition(|d| d.kind() == DeltaKind::Reasoning);
            assert!(last_reasoning < first_content, "split at {}", split);
        }
    }

    #[test]
    fn test_many_transitions_byte_by_byte() {
        let raw = "a<think>b</think>c<think>dd</think>eee";
        let chunks = raw.chars().map(|c| ModelChunk::text(c.to_string())).collect();
        let deltas = run(chunks);
        let (reasoning, content) = partition(&deltas);
        assert_eq!(reasoning, "bdd");
        assert_eq!(content, "aceee");
    }

    #[test]
    fn test_native_thoughts_mixed_with_markers_keep_order() {
        let call = ToolCallRequest::new("get_market_overview", json!({}));
        let deltas = run(vec![
            ModelChunk::thought("need market context"),
            ModelChunk::text("<think>indices first"),
            ModelChunk::text("</think>Checking"),
            ModelChunk::ToolCall(call.clone()),
        ]);

        assert_eq!(
            deltas,
            vec![
                ClassifiedDelta::Reasoning("need market context".into()),
                ClassifiedDelta::Reasoning("indices first".into()),
                ClassifiedDelta::Content("Checking".into()),
                ClassifiedDelta::ToolCall(call),
            ]
        );
    }

    #[test]
    fn test_unfinished_marker_prefix_is_flushed_as_text() {
        let deltas = run(vec![ModelChunk::text("5 < 6 and <thi")]);
        let (reasoning, content) = partition(&deltas);
        assert!(reasoning.is_empty());
        assert_eq!(content, "5 < 6 and <thi");
    }

    #[test]
    fn test_held_prefix_released_before_tool_call() {
        let call = ToolCallRequest::new("web_search", json!({"query": "cpi"}));
        let deltas = run(vec![ModelChunk::text("see <"), ModelChunk::ToolCall(call.clone())]);
        assert_eq!(
            deltas,
            vec![
                ClassifiedDelta::Content("see ".into()),
                ClassifiedDelta::Content("<".into()),
                ClassifiedDelta::ToolCall(call),
            ]
        );
    }

    #[test]
    fn test_phase_moves_to_answering() {
        let mut classifier = StreamClassifier::new();
        classifier.push(ModelChunk::thought("thinking"));
        assert_eq!(classifier.phase(), ClassifierPhase::Deliberating);
        classifier.push(ModelChunk::text("answer"));
        assert_eq!(classifier.phase(), ClassifierPhase::Answering);
    }
}
