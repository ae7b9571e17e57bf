// src/object_detection.rs
//
// Raw detector output → bounded, class-aware NMS result.
//
// Two export layouts reach this module:
//
//   Fused   [batch, n, 4 + classes]   boxes already (y_min, x_min, y_max, x_max),
//                                     normalized to [0, 1]
//   Split   [batch, n, 4] (cx, cy, w, h) in input pixels
//           [batch, n, classes]       class confidences
//
// Split outputs go through a light pre-filter (best class score >= 0.25) and
// are converted to the fused box convention before suppression.

use crate::error::DecodeError;
use crate::types::{BoundingBox, Detection, DetectionConfig, DetectionSet, ModelConfig, ModelVariant};
use ndarray::{s, Array2, ArrayD, ArrayView2, Axis, Ix3};
use tracing::debug;

/// Best-class score a split-head candidate needs to reach NMS at all.
pub const PREFILTER_SCORE: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLayout {
    Fused,
    Split { boxes_first: bool },
}

impl HeadLayout {
    pub fn from_model(config: &ModelConfig) -> Self {
        if config.fused_output {
            return HeadLayout::Fused;
        }
        // yolov3-tiny exports its confidence tensor first
        let swapped = config.tiny && config.variant == ModelVariant::Yolov3;
        HeadLayout::Split {
            boxes_first: !swapped,
        }
    }
}

/// Per-image boxes `(n, 4)` and class scores `(n, classes)`.
#[derive(Debug, Clone)]
pub struct ImagePredictions {
    boxes: Array2<f32>,
    scores: Array2<f32>,
}

impl ImagePredictions {
    pub fn new(boxes: Array2<f32>, scores: Array2<f32>) -> Result<Self, DecodeError> {
        check_shapes(boxes.view(), scores.view())?;
        Ok(Self { boxes, scores })
    }

    pub fn len(&self) -> usize {
        self.boxes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_classes(&self) -> usize {
        self.scores.ncols()
    }
}

/// Raw detector output reshaped to one prediction list per image.
#[derive(Debug, Clone)]
pub struct RawDetections {
    pub images: Vec<ImagePredictions>,
}

impl RawDetections {
    pub fn from_outputs(
        outputs: Vec<ArrayD<f32>>,
        layout: HeadLayout,
        input_size: u32,
    ) -> Result<Self, DecodeError> {
        match layout {
            HeadLayout::Fused => {
                let tensor = outputs.into_iter().next().ok_or_else(|| {
                    DecodeError::ShapeMismatch("fused layout expects one output tensor".into())
                })?;
                let tensor = into_rank3(tensor, "fused output")?;
                if tensor.shape()[2] < 5 {
                    return Err(DecodeError::ShapeMismatch(format!(
                        "fused output needs 4 box columns plus at least one class, got {:?}",
                        tensor.shape()
                    )));
                }

                let images = tensor
                    .outer_iter()
                    .map(|image| {
                        ImagePredictions::new(
                            image.slice(s![.., 0..4]).to_owned(),
                            image.slice(s![.., 4..]).to_owned(),
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self { images })
            }
            HeadLayout::Split { boxes_first } => {
                let count = outputs.len();
                let mut iter = outputs.into_iter();
                let (Some(first), Some(second)) = (iter.next(), iter.next()) else {
                    return Err(DecodeError::ShapeMismatch(format!(
                        "split layout expects two output tensors, got {}",
                        count
                    )));
                };
                let (boxes, scores) = if boxes_first {
                    (first, second)
                } else {
                    (second, first)
                };
                let boxes = into_rank3(boxes, "box output")?;
                let scores = into_rank3(scores, "score output")?;
                if boxes.shape()[0] != scores.shape()[0] {
                    return Err(DecodeError::ShapeMismatch(format!(
                        "batch size differs between boxes {:?} and scores {:?}",
                        boxes.shape(),
                        scores.shape()
                    )));
                }

                let images = boxes
                    .outer_iter()
                    .zip(scores.outer_iter())
                    .map(|(b, c)| filter_boxes(b, c, PREFILTER_SCORE, input_size as f32))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self { images })
            }
        }
    }
}

fn into_rank3(
    tensor: ArrayD<f32>,
    what: &str,
) -> Result<ndarray::Array3<f32>, DecodeError> {
    let shape = tensor.shape().to_vec();
    tensor.into_dimensionality::<Ix3>().map_err(|_| {
        DecodeError::ShapeMismatch(format!("{} must be rank 3, got {:?}", what, shape))
    })
}

fn check_shapes(boxes: ArrayView2<f32>, scores: ArrayView2<f32>) -> Result<(), DecodeError> {
    if boxes.ncols() != 4 {
        return Err(DecodeError::ShapeMismatch(format!(
            "boxes must have 4 coordinates, got {}",
            boxes.ncols()
        )));
    }
    if boxes.nrows() != scores.nrows() {
        return Err(DecodeError::ShapeMismatch(format!(
            "{} boxes but {} score rows",
            boxes.nrows(),
            scores.nrows()
        )));
    }
    Ok(())
}

/// Drop weak candidates and convert `(cx, cy, w, h)` pixel boxes into
/// normalized `(y_min, x_min, y_max, x_max)`.
fn filter_boxes(
    boxes: ArrayView2<f32>,
    scores: ArrayView2<f32>,
    threshold: f32,
    input_size: f32,
) -> Result<ImagePredictions, DecodeError> {
    check_shapes(boxes, scores)?;

    let keep: Vec<usize> = scores
        .outer_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().copied().fold(f32::NEG_INFINITY, f32::max) >= threshold)
        .map(|(i, _)| i)
        .collect();

    let mut out_boxes = Array2::<f32>::zeros((keep.len(), 4));
    for (row, &i) in keep.iter().enumerate() {
        let (cx, cy, w, h) = (boxes[[i, 0]], boxes[[i, 1]], boxes[[i, 2]], boxes[[i, 3]]);
        out_boxes[[row, 0]] = (cy - h / 2.0) / input_size;
        out_boxes[[row, 1]] = (cx - w / 2.0) / input_size;
        out_boxes[[row, 2]] = (cy + h / 2.0) / input_size;
        out_boxes[[row, 3]] = (cx + w / 2.0) / input_size;
    }
    let out_scores = scores.select(Axis(0), &keep);

    ImagePredictions::new(out_boxes, out_scores)
}

pub struct DetectionDecoder {
    config: DetectionConfig,
}

impl DetectionDecoder {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Run combined NMS for every image in the batch.
    pub fn decode(&self, raw: &RawDetections) -> Result<Vec<DetectionSet>, DecodeError> {
        for image in &raw.images {
            check_shapes(image.boxes.view(), image.scores.view())?;
        }

        Ok(raw
            .images
            .iter()
            .map(|image| self.decode_image(image.boxes.view(), image.scores.view()))
            .collect())
    }

    fn decode_image(&self, boxes: ArrayView2<f32>, scores: ArrayView2<f32>) -> DetectionSet {
        let cfg = &self.config;
        let bbox_at = |i: usize| {
            BoundingBox::new(boxes[[i, 0]], boxes[[i, 1]], boxes[[i, 2]], boxes[[i, 3]])
        };

        // (original index, detection)
        let mut selected: Vec<(usize, Detection)> = Vec::new();

        for class_id in 0..scores.ncols() {
            // Candidates under score_threshold never enter suppression
            let mut candidates: Vec<usize> = (0..boxes.nrows())
                .filter(|&i| scores[[i, class_id]] >= cfg.score_threshold)
                .collect();
            candidates.sort_by(|&a, &b| {
                scores[[b, class_id]]
                    .total_cmp(&scores[[a, class_id]])
                    .then(a.cmp(&b))
            });

            let mut kept: Vec<usize> = Vec::new();
            for i in candidates {
                if kept.len() >= cfg.max_output_size_per_class {
                    break;
                }
                let current = bbox_at(i);
                let overlaps = kept
                    .iter()
                    .any(|&k| calculate_iou(&current, &bbox_at(k)) > cfg.iou_threshold);
                if !overlaps {
                    kept.push(i);
                }
            }

            selected.extend(kept.into_iter().map(|i| {
                (
                    i,
                    Detection {
                        bbox: bbox_at(i).clipped(),
                        class_id,
                        score: scores[[i, class_id]],
                    },
                )
            }));
        }

        selected.sort_by(|(ia, a), (ib, b)| {
            b.score
                .total_cmp(&a.score)
                .then(ia.cmp(ib))
                .then(a.class_id.cmp(&b.class_id))
        });
        selected.truncate(cfg.max_total_size);
        selected.retain(|(_, d)| d.score >= cfg.score_threshold);

        let mut set = DetectionSet::empty(cfg.max_total_size);
        set.valid_count = selected.len();
        for (slot, (_, detection)) in set.entries.iter_mut().zip(selected) {
            *slot = detection;
        }

        debug!(
            "NMS kept {} of {} candidates across {} classes",
            set.valid_count,
            boxes.nrows(),
            scores.ncols()
        );
        set
    }
}

pub fn calculate_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let (ay1, ay2) = (a.y_min.min(a.y_max), a.y_min.max(a.y_max));
    let (ax1, ax2) = (a.x_min.min(a.x_max), a.x_min.max(a.x_max));
    let (by1, by2) = (b.y_min.min(b.y_max), b.y_min.max(b.y_max));
    let (bx1, bx2) = (b.x_min.min(b.x_max), b.x_min.max(b.x_max));

    let inter_h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let inter_w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let intersection = inter_h * inter_w;

    let area_a = (ay2 - ay1) * (ax2 - ax1);
    let area_b = (by2 - by1) * (bx2 - bx1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3, IxDyn};

    fn decoder(iou: f32, score: f32, per_class: usize, total: usize) -> DetectionDecoder {
        DetectionDecoder::new(DetectionConfig {
            iou_threshold: iou,
            score_threshold: score,
            max_output_size_per_class: per_class,
            max_total_size: total,
        })
    }

    fn single(boxes: Array2<f32>, scores: Array2<f32>) -> RawDetections {
        RawDetections {
            images: vec![ImagePredictions::new(boxes, scores).unwrap()],
        }
    }

    #[test]
    fn test_overlapping_same_class_keeps_higher_score() {
        let raw = single(
            array![[0.1, 0.1, 0.5, 0.5], [0.12, 0.12, 0.52, 0.52]],
            array![[0.7], [0.9]],
        );
        let sets = decoder(0.45, 0.5, 10, 10).decode(&raw).unwrap();
        let set = &sets[0];
        assert_eq!(set.valid_count, 1);
        assert_eq!(set.entries[0].score, 0.9);
        assert_eq!(set.entries[0].bbox.y_min, 0.12);
    }

    #[test]
    fn test_overlap_in_different_classes_is_kept() {
        let raw = single(
            array![[0.1, 0.1, 0.5, 0.5], [0.1, 0.1, 0.5, 0.5]],
            array![[0.9, 0.0], [0.0, 0.8]],
        );
        let set = &decoder(0.45, 0.5, 10, 10).decode(&raw).unwrap()[0];
        assert_eq!(set.valid_count, 2);
        assert_eq!(set.entries[0].class_id, 0);
        assert_eq!(set.entries[1].class_id, 1);
    }

    #[test]
    fn test_output_is_padded_to_capacity() {
        let raw = single(array![[0.1, 0.1, 0.2, 0.2]], array![[0.9]]);
        let set = &decoder(0.45, 0.5, 10, 8).decode(&raw).unwrap()[0];
        assert_eq!(set.capacity(), 8);
        assert_eq!(set.valid_count, 1);
        assert!(set.entries[1..].iter().all(|d| *d == Detection::default()));
    }

    #[test]
    fn test_score_threshold_above_everything_yields_nothing() {
        let raw = single(
            array![[0.1, 0.1, 0.2, 0.2], [0.5, 0.5, 0.7, 0.7]],
            array![[0.6, 0.3], [0.2, 0.8]],
        );
        let set = &decoder(0.45, 0.95, 10, 10).decode(&raw).unwrap()[0];
        assert_eq!(set.valid_count, 0);
        assert_eq!(set.capacity(), 10);
    }

    #[test]
    fn test_caps_per_class_and_total() {
        // 6 disjoint boxes, 2 classes, all scoring
        let mut boxes = Array2::<f32>::zeros((6, 4));
        for i in 0..6 {
            let o = i as f32 * 0.15;
            boxes.row_mut(i).assign(&array![o, o, o + 0.1, o + 0.1]);
        }
        let scores = Array2::from_shape_fn((6, 2), |(i, c)| 0.6 + 0.01 * (i + c * 6) as f32);
        let raw = single(boxes, scores);

        let set = &decoder(0.45, 0.5, 2, 3).decode(&raw).unwrap()[0];
        assert_eq!(set.valid_count, 3);
        for class_id in 0..2 {
            let per_class = set.valid().iter().filter(|d| d.class_id == class_id).count();
            assert!(per_class <= 2);
        }
        // Globally sorted by score
        assert!(set.valid().windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let raw = single(
            array![[0.1, 0.1, 0.5, 0.5], [0.1, 0.1, 0.5, 0.5], [0.6, 0.6, 0.9, 0.9]],
            array![[0.8], [0.8], [0.8]],
        );
        let set = &decoder(0.45, 0.5, 10, 10).decode(&raw).unwrap()[0];
        assert_eq!(set.valid_count, 2);
        assert_eq!(set.entries[0].bbox.y_min, 0.1);
        assert_eq!(set.entries[1].bbox.y_min, 0.6);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let raw = single(
            array![[0.1, 0.1, 0.5, 0.5], [0.2, 0.2, 0.6, 0.6], [0.3, 0.0, 0.9, 0.4]],
            array![[0.7, 0.1], [0.7, 0.9], [0.55, 0.9]],
        );
        let d = decoder(0.3, 0.5, 5, 5);
        assert_eq!(d.decode(&raw).unwrap(), d.decode(&raw).unwrap());
    }

    #[test]
    fn test_boxes_are_clipped() {
        let raw = single(array![[-0.2, 0.5, 0.4, 1.3]], array![[0.9]]);
        let set = &decoder(0.45, 0.5, 10, 10).decode(&raw).unwrap()[0];
        let bbox = set.entries[0].bbox;
        assert_eq!(bbox.y_min, 0.0);
        assert_eq!(bbox.x_max, 1.0);
    }

    #[test]
    fn test_mismatched_counts_rejected() {
        let result = ImagePredictions::new(Array2::zeros((3, 4)), Array2::zeros((2, 80)));
        assert!(matches!(result, Err(DecodeError::ShapeMismatch(_))));
    }

    #[test]
    fn test_fused_layout_splits_columns() {
        let mut tensor = Array3::<f32>::zeros((1, 2, 6));
        tensor
            .slice_mut(s![0, 0, ..])
            .assign(&array![0.1, 0.1, 0.4, 0.4, 0.9, 0.1]);
        tensor
            .slice_mut(s![0, 1, ..])
            .assign(&array![0.5, 0.5, 0.8, 0.8, 0.2, 0.7]);

        let raw =
            RawDetections::from_outputs(vec![tensor.into_dyn()], HeadLayout::Fused, 416).unwrap();
        assert_eq!(raw.images.len(), 1);
        assert_eq!(raw.images[0].len(), 2);
        assert_eq!(raw.images[0].num_classes(), 2);

        let set = &decoder(0.45, 0.5, 10, 10).decode(&raw).unwrap()[0];
        assert_eq!(set.valid_count, 2);
        assert_eq!(set.entries[0].class_id, 0);
        assert_eq!(set.entries[1].class_id, 1);
    }

    #[test]
    fn test_split_layout_prefilters_and_normalizes() {
        let boxes = ArrayD::from_shape_vec(
            IxDyn(&[1, 2, 4]),
            vec![208.0, 104.0, 104.0, 52.0, 10.0, 10.0, 4.0, 4.0],
        )
        .unwrap();
        let scores =
            ArrayD::from_shape_vec(IxDyn(&[1, 2, 2]), vec![0.9, 0.1, 0.1, 0.2]).unwrap();

        // Confidence tensor first, as yolov3-tiny emits it
        let raw = RawDetections::from_outputs(
            vec![scores, boxes],
            HeadLayout::Split { boxes_first: false },
            416,
        )
        .unwrap();
        let image = &raw.images[0];
        assert_eq!(image.len(), 1);
        let b = image.boxes.row(0);
        assert!((b[0] - 78.0 / 416.0).abs() < 1e-6);
        assert!((b[1] - 156.0 / 416.0).abs() < 1e-6);
        assert!((b[2] - 130.0 / 416.0).abs() < 1e-6);
        assert!((b[3] - 260.0 / 416.0).abs() < 1e-6);
    }

    #[test]
    fn test_head_layout_from_model_flags() {
        let mut model = ModelConfig::default();
        assert_eq!(HeadLayout::from_model(&model), HeadLayout::Fused);

        model.fused_output = false;
        assert_eq!(
            HeadLayout::from_model(&model),
            HeadLayout::Split { boxes_first: true }
        );

        model.variant = ModelVariant::Yolov3;
        model.tiny = true;
        assert_eq!(
            HeadLayout::from_model(&model),
            HeadLayout::Split { boxes_first: false }
        );
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BoundingBox::new(0.0, 0.0, 0.5, 0.5);
        let b = BoundingBox::new(0.6, 0.6, 0.9, 0.9);
        assert!((calculate_iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(calculate_iou(&a, &b), 0.0);
        let zero = BoundingBox::default();
        assert_eq!(calculate_iou(&zero, &zero), 0.0);
    }
}
