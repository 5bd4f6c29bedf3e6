//! Reconciliation of streamed status batches into renderable buffers.
//!
//! The server re-sends the entire output of the current run with every
//! `status` push, so each accepted batch replaces what is displayed instead of
//! being appended to it.

use log::debug;
use serde::Serialize;

use crate::protocol::{StatusBatch, StatusKind, StatusMessage};

/// The single image shown for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSlot {
    pub src: String,
    /// Scale without smoothing (`image_nn`).
    pub nearest_neighbor: bool,
}

/// One renderable piece of output, in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputBlock {
    Text { text: String },
    /// Position of the image slot within the output.
    Image,
    Audio { src: String },
}

/// Everything the presentation layer renders for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputBuffers {
    pub blocks: Vec<OutputBlock>,
    pub errors: Vec<String>,
    /// Set as soon as one stderr entry is seen.
    pub has_errors: bool,
    pub image: Option<ImageSlot>,
}

impl OutputBuffers {
    /// Concatenated text output.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                OutputBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Error lines as displayed, one per stderr entry.
    pub fn error_text(&self) -> String {
        self.errors.join("\n")
    }

    pub fn audio(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().filter_map(|block| match block {
            OutputBlock::Audio { src } => Some(src.as_str()),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.errors.is_empty() && self.image.is_none()
    }
}

/// Turns status batches into [`OutputBuffers`].
#[derive(Debug, Default)]
pub struct OutputReconciler {
    buffers: OutputBuffers,
}

impl OutputReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffers(&self) -> &OutputBuffers {
        &self.buffers
    }

    /// Drop all output, including the image slot. Called when a run is submitted.
    pub fn clear(&mut self) {
        self.buffers = OutputBuffers::default();
    }

    /// Apply a batch if it belongs to `current_session`.
    ///
    /// Returns whether the batch was applied.
    pub fn apply(&mut self, batch: &StatusBatch, current_session: Option<&str>) -> bool {
        match (batch.session.as_deref(), current_session) {
            (Some(tag), Some(current)) if tag == current => {}
            (tag, current) => {
                debug!(
                    "[output] Discarding status batch for session {:?} (current {:?})",
                    tag, current
                );
                return false;
            }
        }

        self.rebuild(&batch.data);
        true
    }

    fn rebuild(&mut self, messages: &[StatusMessage]) {
        let previous_image = self.buffers.image.take();
        let mut image: Option<ImageSlot> = None;
        let mut blocks = Vec::new();
        let mut errors = Vec::new();

        for message in messages {
            match message.kind {
                StatusKind::Image | StatusKind::ImageNn => {
                    let nearest_neighbor = message.kind == StatusKind::ImageNn;
                    match image.as_mut() {
                        // A second image in the same batch redraws the first.
                        Some(slot) => {
                            slot.src.clone_from(&message.value);
                            slot.nearest_neighbor = nearest_neighbor;
                        }
                        None => {
                            // Reuse the slot from the previous batch so the
                            // image is refreshed in place.
                            let mut slot = previous_image.clone().unwrap_or(ImageSlot {
                                src: String::new(),
                                nearest_neighbor: false,
                            });
                            slot.src.clone_from(&message.value);
                            slot.nearest_neighbor = nearest_neighbor;
                            image = Some(slot);
                            blocks.push(OutputBlock::Image);
                        }
                    }
                }
                StatusKind::Stderr => errors.push(message.value.clone()),
                StatusKind::Audio => blocks.push(OutputBlock::Audio {
                    src: message.value.clone(),
                }),
                StatusKind::Stdout | StatusKind::Text => match blocks.last_mut() {
                    Some(OutputBlock::Text { text }) => text.push_str(&message.value),
                    _ => blocks.push(OutputBlock::Text {
                        text: message.value.clone(),
                    }),
                },
            }
        }

        self.buffers = OutputBuffers {
            has_errors: !errors.is_empty(),
            blocks,
            errors,
            image,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(session: &str, data: Vec<StatusMessage>) -> StatusBatch {
        StatusBatch {
            session: Some(session.to_string()),
            data,
        }
    }

    #[test]
    fn test_text_is_concatenated_in_order() {
        let mut reconciler = OutputReconciler::new();
        let applied = reconciler.apply(
            &batch(
                "s1",
                vec![
                    StatusMessage::new(StatusKind::Stdout, "1\n"),
                    StatusMessage::new(StatusKind::Text, "2\n"),
                    StatusMessage::new(StatusKind::Stdout, "3"),
                ],
            ),
            Some("s1"),
        );
        assert!(applied);
        assert_eq!(reconciler.buffers().text(), "1\n2\n3");
        assert!(!reconciler.buffers().has_errors);
    }

    #[test]
    fn test_stderr_goes_to_error_buffer() {
        let mut reconciler = OutputReconciler::new();
        reconciler.apply(
            &batch(
                "s1",
                vec![
                    StatusMessage::new(StatusKind::Stdout, "partial"),
                    StatusMessage::new(StatusKind::Stderr, "oops"),
                    StatusMessage::new(StatusKind::Stderr, "line 2"),
                ],
            ),
            Some("s1"),
        );
        let buffers = reconciler.buffers();
        assert_eq!(buffers.errors, vec!["oops", "line 2"]);
        assert_eq!(buffers.error_text(), "oops\nline 2");
        assert!(buffers.has_errors);
        assert_eq!(buffers.text(), "partial");
    }

    #[test]
    fn test_each_batch_replaces_previous_output() {
        let mut reconciler = OutputReconciler::new();
        reconciler.apply(
            &batch("s1", vec![StatusMessage::new(StatusKind::Stderr, "old")]),
            Some("s1"),
        );
        reconciler.apply(
            &batch(
                "s1",
                vec![
                    StatusMessage::new(StatusKind::Stdout, "a"),
                    StatusMessage::new(StatusKind::Stdout, "b"),
                ],
            ),
            Some("s1"),
        );
        let buffers = reconciler.buffers();
        assert_eq!(buffers.text(), "ab");
        assert!(buffers.errors.is_empty());
        assert!(!buffers.has_errors);
    }

    #[test]
    fn test_applying_same_batch_twice_is_idempotent() {
        let status = batch(
            "s1",
            vec![
                StatusMessage::new(StatusKind::Stdout, "x"),
                StatusMessage::new(StatusKind::Image, "data:image/png;base64,AA"),
                StatusMessage::new(StatusKind::Audio, "data:audio/wav;base64,BB"),
                StatusMessage::new(StatusKind::Stderr, "e"),
            ],
        );
        let mut reconciler = OutputReconciler::new();
        reconciler.apply(&status, Some("s1"));
        let first = reconciler.buffers().clone();
        reconciler.apply(&status, Some("s1"));
        assert_eq!(reconciler.buffers(), &first);
    }

    #[test]
    fn test_foreign_session_is_discarded() {
        let mut reconciler = OutputReconciler::new();
        reconciler.apply(
            &batch("s1", vec![StatusMessage::new(StatusKind::Stdout, "mine")]),
            Some("s1"),
        );
        let before = reconciler.buffers().clone();

        let applied = reconciler.apply(
            &batch("other", vec![StatusMessage::new(StatusKind::Stdout, "theirs")]),
            Some("s1"),
        );
        assert!(!applied);
        assert_eq!(reconciler.buffers(), &before);

        let untagged = StatusBatch {
            session: None,
            data: vec![StatusMessage::new(StatusKind::Stdout, "x")],
        };
        assert!(!reconciler.apply(&untagged, Some("s1")));
        assert!(!reconciler.apply(&batch("s1", vec![]), None));
    }

    #[test]
    fn test_image_refreshed_in_place() {
        let mut reconciler = OutputReconciler::new();
        reconciler.apply(
            &batch("s1", vec![StatusMessage::new(StatusKind::Image, "first")]),
            Some("s1"),
        );
        assert_eq!(
            reconciler.buffers().image,
            Some(ImageSlot {
                src: "first".into(),
                nearest_neighbor: false,
            })
        );

        reconciler.apply(
            &batch("s1", vec![StatusMessage::new(StatusKind::ImageNn, "second")]),
            Some("s1"),
        );
        let buffers = reconciler.buffers();
        let images = buffers
            .blocks
            .iter()
            .filter(|b| matches!(b, OutputBlock::Image))
            .count();
        assert_eq!(images, 1);
        let slot = buffers.image.as_ref().unwrap();
        assert_eq!(slot.src, "second");
        assert!(slot.nearest_neighbor);
    }

    #[test]
    fn test_multiple_images_in_batch_share_one_slot() {
        let mut reconciler = OutputReconciler::new();
        reconciler.apply(
            &batch(
                "s1",
                vec![
                    StatusMessage::new(StatusKind::ImageNn, "frame-1"),
                    StatusMessage::new(StatusKind::Stdout, "between"),
                    StatusMessage::new(StatusKind::Image, "frame-2"),
                ],
            ),
            Some("s1"),
        );
        let buffers = reconciler.buffers();
        assert_eq!(
            buffers.blocks,
            vec![
                OutputBlock::Image,
                OutputBlock::Text {
                    text: "between".into()
                },
            ]
        );
        let slot = buffers.image.as_ref().unwrap();
        assert_eq!(slot.src, "frame-2");
        assert!(!slot.nearest_neighbor);
    }

    #[test]
    fn test_audio_entries_are_not_deduplicated() {
        let mut reconciler = OutputReconciler::new();
        reconciler.apply(
            &batch(
                "s1",
                vec![
                    StatusMessage::new(StatusKind::Audio, "a.wav"),
                    StatusMessage::new(StatusKind::Audio, "a.wav"),
                ],
            ),
            Some("s1"),
        );
        assert_eq!(reconciler.buffers().audio().count(), 2);
    }

    #[test]
    fn test_clear() {
        let mut reconciler = OutputReconciler::new();
        reconciler.apply(
            &batch("s1", vec![StatusMessage::new(StatusKind::Image, "img")]),
            Some("s1"),
        );
        reconciler.clear();
        assert!(reconciler.buffers().is_empty());
    }
}
