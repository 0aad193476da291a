use crate::errors::{Result, SparseInstError};
use crate::ops::avg_pool2d;
use crate::structures::{FeatureMap, LossMap, RawOutput, TargetRecord};
use crate::targets::MASK_STRIDE;
use crate::traits::{Backbone, Criterion, Decoder, Encoder, InstanceNetwork};
use ndarray::prelude::*;
use parking_lot::Mutex;

/// テスト用のバックボーン：ストライド4の平均プーリングのみ
#[derive(Debug, Clone, Default)]
pub struct MockBackbone;

impl Backbone for MockBackbone {
    fn forward(&self, images: ArrayView4<f32>) -> Result<FeatureMap> {
        let mut features = FeatureMap::new();
        features.insert("res2".to_string(), avg_pool2d(images, MASK_STRIDE));
        Ok(features)
    }
}

/// `res2` をそのまま返すエンコーダー
#[derive(Debug, Clone, Default)]
pub struct MockEncoder;

impl Encoder for MockEncoder {
    fn forward(&self, mut features: FeatureMap) -> Result<Array4<f32>> {
        features
            .remove("res2")
            .ok_or_else(|| SparseInstError::validation("features", "missing res2"))
    }
}

/// テスト用のデコーダー
///
/// 全スロットが特徴量のチャネル平均をマスクのロジットとして出力する。
/// クラスとオブジェクトネスのロジットは定数
#[derive(Debug, Clone)]
pub struct MockDecoder {
    pub num_slots: usize,
    pub num_classes: usize,
    pub class_logit: f32,
    pub objectness_logit: f32,
}

impl MockDecoder {
    pub const fn new(num_slots: usize, num_classes: usize) -> Self {
        Self {
            num_slots,
            num_classes,
            class_logit: 0.0,
            objectness_logit: 0.0,
        }
    }
}

impl Decoder for MockDecoder {
    fn forward(&self, features: ArrayView4<f32>) -> Result<RawOutput> {
        let (batch, _, height, width) = features.dim();
        let mean = features
            .mean_axis(Axis(1))
            .ok_or_else(|| SparseInstError::validation("features", "has no channels"))?;
        let mut pred_masks = Array4::<f32>::zeros((batch, self.num_slots, height, width));
        for (mut slots, plane) in pred_masks.outer_iter_mut().zip(mean.outer_iter()) {
            for mut slot in slots.outer_iter_mut() {
                slot.assign(&plane);
            }
        }

        let slots = (batch, self.num_slots);
        Ok(RawOutput {
            pred_logits: Array3::from_elem((slots.0, slots.1, self.num_classes), self.class_logit),
            pred_masks,
            pred_scores: Array3::from_elem((slots.0, slots.1, 1), self.objectness_logit),
        })
    }
}

/// 入力を無視して常に `output` を返すネットワーク
#[derive(Debug, Clone)]
pub struct FixedOutputNetwork {
    pub output: RawOutput,
}

impl FixedOutputNetwork {
    pub const fn new(output: RawOutput) -> Self {
        Self { output }
    }
}

impl InstanceNetwork for FixedOutputNetwork {
    fn forward(&self, _images: ArrayView4<f32>) -> Result<RawOutput> {
        Ok(self.output.clone())
    }
}

/// 呼び出し内容を記録するクライテリオン
///
/// `num_instances` と、インスタンスごとに複製した色類似度の平均
/// `color_similarity` を返す
#[derive(Debug, Default)]
pub struct RecordingCriterion {
    pub calls: Mutex<Vec<(Vec<TargetRecord>, (usize, usize))>>,
}

impl RecordingCriterion {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Criterion for RecordingCriterion {
    fn losses(
        &self,
        _output: &RawOutput,
        targets: &[TargetRecord],
        max_shape: (usize, usize),
    ) -> Result<LossMap> {
        let (sum, count) = targets
            .iter()
            .map(|t| t.color_similarity_per_instance())
            .fold((0.0f32, 0usize), |(sum, count), per_instance| {
                (sum + per_instance.sum(), count + per_instance.len())
            });
        let instances: usize = targets.iter().map(TargetRecord::len).sum();

        self.calls.lock().push((targets.to_vec(), max_shape));

        let mut losses = LossMap::new();
        losses.insert("num_instances".to_string(), instances as f32);
        losses.insert(
            "color_similarity".to_string(),
            if count == 0 { 0.0 } else { sum / count as f32 },
        );
        Ok(losses)
    }
}
