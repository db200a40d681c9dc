//! Per-client video transforms.
//!
//! The server's record may carry a transform description keyed by client
//! id. The stages expand into a fixed-order step list the pipeline inserts
//! before its video sink: crop, then rotate, then scale, then box. The box
//! stage comes from `offset`, with insets negated so that a displacement
//! becomes grown canvas on the opposite edges.

use unison_proto::{SyncRecord, TransformSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStep {
    Crop {
        left: u32,
        right: u32,
        top: u32,
        bottom: u32,
    },
    Rotate {
        degrees: u32,
    },
    Scale {
        width: u32,
        height: u32,
    },
    /// Canvas insets; negative values grow the canvas, which is what
    /// produces letterboxing and pillarboxing.
    Box {
        left: i32,
        top: i32,
    },
}

/// Expands a transform set into ordered steps. Absent stages are skipped.
pub fn expand(set: &TransformSet) -> Vec<TransformStep> {
    let mut steps = Vec::new();
    if let Some(crop) = set.crop {
        steps.push(TransformStep::Crop {
            left: crop.left,
            right: crop.right,
            top: crop.top,
            bottom: crop.bottom,
        });
    }
    if let Some(rotate) = set.rotate {
        steps.push(TransformStep::Rotate {
            degrees: rotate.degrees % 360,
        });
    }
    if let Some(scale) = set.scale {
        steps.push(TransformStep::Scale {
            width: scale.width,
            height: scale.height,
        });
    }
    if let Some(offset) = set.offset {
        steps.push(TransformStep::Box {
            left: -offset.left,
            top: -offset.top,
        });
    }
    steps
}

/// The steps one record prescribes for one client; empty when the record
/// carries nothing for that id.
pub fn steps_for(record: &SyncRecord, client_id: &str) -> Vec<TransformStep> {
    record
        .transform_for(client_id)
        .map(expand)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use unison_proto::{Crop, Offset, Rotate, Scale};

    #[test]
    fn stages_expand_in_fixed_order() {
        let set = TransformSet {
            crop: Some(Crop {
                left: 10,
                right: 20,
                top: 0,
                bottom: 0,
            }),
            rotate: Some(Rotate { degrees: 90 }),
            scale: Some(Scale {
                width: 1280,
                height: 720,
            }),
            offset: Some(Offset { left: 5, top: -8 }),
        };

        let steps = expand(&set);
        assert_eq!(
            steps,
            vec![
                TransformStep::Crop {
                    left: 10,
                    right: 20,
                    top: 0,
                    bottom: 0
                },
                TransformStep::Rotate { degrees: 90 },
                TransformStep::Scale {
                    width: 1280,
                    height: 720
                },
                TransformStep::Box { left: -5, top: 8 },
            ]
        );
    }

    #[test]
    fn absent_stages_are_skipped() {
        let set = TransformSet {
            scale: Some(Scale {
                width: 1280,
                height: 720,
            }),
            ..Default::default()
        };
        assert_eq!(
            expand(&set),
            vec![TransformStep::Scale {
                width: 1280,
                height: 720
            }]
        );
        assert!(expand(&TransformSet::default()).is_empty());
    }

    #[test]
    fn rotation_wraps_full_turns() {
        let set = TransformSet {
            rotate: Some(Rotate { degrees: 450 }),
            ..Default::default()
        };
        assert_eq!(expand(&set), vec![TransformStep::Rotate { degrees: 90 }]);
    }
}
