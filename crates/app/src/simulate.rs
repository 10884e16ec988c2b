//! Synthetic sources and a deterministic stand-in model for exercising the
//! orchestrator end to end without an inference server.

use ndarray::{Array4, ArrayD, Axis, IxDyn};
use tessera_core::reshape::TilePrompt;

/// `(batch, channels, height, width)` image of coarse diagonal bands.
pub fn synthetic_source(
    seed: usize,
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
) -> Array4<f32> {
    Array4::from_shape_fn((batch, channels, height, width), |(b, c, y, x)| {
        let band = (y / 16 + x / 16 + b + seed) % channels.max(1);
        if band == c {
            1.0
        } else {
            0.1
        }
    })
}

/// Score for class `k` is the mean over the prompt's tensors of channel
/// `k % channels`. Returns `(1, classes, h, w)` per prompt, the shape a
/// pooling model hands back.
pub fn stand_in_model(prompts: &[TilePrompt], classes: usize) -> Vec<ArrayD<f32>> {
    prompts
        .iter()
        .map(|prompt| {
            let tensors: Vec<_> = prompt.tensors.values().collect();
            let Some(first) = tensors.first() else {
                return ArrayD::zeros(IxDyn(&[1, classes, 0, 0]));
            };
            let (h, w) = (first.shape()[2], first.shape()[3]);
            let mut scores = ArrayD::<f32>::zeros(IxDyn(&[1, classes, h, w]));
            for class in 0..classes {
                let mut class_scores = scores.index_axis_mut(Axis(1), class);
                for tensor in &tensors {
                    let channels = tensor.shape()[1];
                    let channel = tensor.index_axis(Axis(1), class % channels);
                    class_scores.zip_mut_with(&channel, |dst, src| {
                        *dst += src.to_f32() / tensors.len() as f32;
                    });
                }
            }
            scores
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use half::f16;

    use super::*;

    #[test]
    fn stand_in_model_maps_channels_to_classes() {
        let tensor = ArrayD::from_shape_fn(IxDyn(&[1, 2, 2, 2]), |idx| {
            f16::from_f32(if idx[1] == 1 { 1.0 } else { 0.0 })
        });
        let mut tensors = BTreeMap::new();
        tensors.insert("image".to_string(), tensor);
        let prompt = TilePrompt {
            image_index: 0,
            tile_index: 0,
            tensors,
        };

        let outputs = stand_in_model(&[prompt], 3);
        assert_eq!(outputs[0].shape(), &[1, 3, 2, 2]);
        assert_eq!(outputs[0][[0, 0, 0, 0]], 0.0);
        assert_eq!(outputs[0][[0, 1, 1, 1]], 1.0);
        assert_eq!(outputs[0][[0, 2, 0, 1]], 0.0);
    }

    #[test]
    fn synthetic_source_has_requested_shape() {
        let source = synthetic_source(3, 2, 4, 40, 24);
        assert_eq!(source.dim(), (2, 4, 40, 24));
        assert!(source.iter().all(|&v| v == 1.0 || v == 0.1));
    }
}
