//! Per-model-family adaptation of generic tiles into named model inputs.
//!
//! The orchestrator only sees [`TileReshaper`]; which strategy applies is
//! decided by whoever wires the inference boundary, usually through
//! [`ReshaperRegistry`].

use std::collections::{BTreeMap, HashMap};

use half::f16;
use ndarray::{s, ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};
use crate::splitter::TileInput;

/// Named half-precision tensors for one tile, in the form the model expects.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePrompt {
    pub image_index: usize,
    pub tile_index: usize,
    pub tensors: BTreeMap<String, ArrayD<f16>>,
}

pub trait TileReshaper: Send + Sync {
    fn family(&self) -> &str;
    fn reshape(&self, tile: &TileInput) -> TilingResult<TilePrompt>;
}

fn to_batched_f16(view: ndarray::ArrayView3<'_, f32>) -> ArrayD<f16> {
    view.mapv(f16::from_f32).insert_axis(Axis(0)).into_dyn()
}

/// Passes the whole tile through as one `(1, C, h, w)` tensor.
pub struct SingleTensorReshaper {
    name: String,
}

impl SingleTensorReshaper {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TileReshaper for SingleTensorReshaper {
    fn family(&self) -> &str {
        "single"
    }

    fn reshape(&self, tile: &TileInput) -> TilingResult<TilePrompt> {
        let mut tensors = BTreeMap::new();
        tensors.insert(self.name.clone(), to_batched_f16(tile.data.view()));
        Ok(TilePrompt {
            image_index: tile.image_index,
            tile_index: tile.tile_index,
            tensors,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityChannels {
    pub name: String,
    pub channels: usize,
}

/// Splits the channel axis into consecutive ranges, one tensor per modality.
pub struct ModalitySplitReshaper {
    modalities: Vec<ModalityChannels>,
}

impl ModalitySplitReshaper {
    pub fn new(modalities: Vec<ModalityChannels>) -> TilingResult<Self> {
        if modalities.is_empty() {
            return Err(TilingError::Config(
                "modality split needs at least one modality".to_string(),
            ));
        }
        if let Some(empty) = modalities.iter().find(|m| m.channels == 0) {
            return Err(TilingError::Config(format!(
                "modality '{}' declares zero channels",
                empty.name
            )));
        }
        Ok(Self { modalities })
    }

    fn total_channels(&self) -> usize {
        self.modalities.iter().map(|m| m.channels).sum()
    }
}

impl TileReshaper for ModalitySplitReshaper {
    fn family(&self) -> &str {
        "modality_split"
    }

    fn reshape(&self, tile: &TileInput) -> TilingResult<TilePrompt> {
        let channels = tile.data.dim().0;
        if channels != self.total_channels() {
            return Err(TilingError::Config(format!(
                "modalities declare {} channels but tile has {channels}",
                self.total_channels()
            )));
        }

        let mut tensors = BTreeMap::new();
        let mut start = 0usize;
        for modality in &self.modalities {
            let end = start + modality.channels;
            let part = tile.data.slice(s![start..end, .., ..]);
            tensors.insert(modality.name.clone(), to_batched_f16(part));
            start = end;
        }

        Ok(TilePrompt {
            image_index: tile.image_index,
            tile_index: tile.tile_index,
            tensors,
        })
    }
}

pub type ReshaperParams = HashMap<String, serde_json::Value>;
type ReshaperFactory = dyn Fn(&ReshaperParams) -> TilingResult<Box<dyn TileReshaper>> + Send + Sync;

/// Model family name -> reshaper factory.
pub struct ReshaperRegistry {
    factories: HashMap<String, Box<ReshaperFactory>>,
}

impl ReshaperRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, family: &str, factory: F)
    where
        F: Fn(&ReshaperParams) -> TilingResult<Box<dyn TileReshaper>> + Send + Sync + 'static,
    {
        self.factories.insert(family.to_string(), Box::new(factory));
    }

    pub fn create(
        &self,
        family: &str,
        params: &ReshaperParams,
    ) -> TilingResult<Box<dyn TileReshaper>> {
        let factory = self
            .factories
            .get(family)
            .ok_or_else(|| TilingError::Config(format!("unknown model family: {family}")))?;

        factory(params)
    }

    pub fn list_families(&self) -> Vec<&str> {
        let mut families: Vec<&str> = self.factories.keys().map(|v| v.as_str()).collect();
        families.sort_unstable();
        families
    }
}

impl Default for ReshaperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the built-in strategies.
///
/// `single` takes an optional `name` param (default `pixel_values`);
/// `modality_split` requires `modalities: [{"name": .., "channels": ..}]`.
pub fn register_builtin_reshapers(registry: &mut ReshaperRegistry) {
    registry.register("single", |params| {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("pixel_values");
        Ok(Box::new(SingleTensorReshaper::new(name)))
    });
    registry.register("modality_split", |params| {
        let raw = params
            .get("modalities")
            .ok_or_else(|| TilingError::Config("modality_split requires 'modalities'".into()))?;
        let modalities: Vec<ModalityChannels> = serde_json::from_value(raw.clone())
            .map_err(|e| TilingError::Config(format!("invalid modalities: {e}")))?;
        Ok(Box::new(ModalitySplitReshaper::new(modalities)?))
    });
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;
    use crate::geometry::TilePlacement;

    fn tile(channels: usize) -> TileInput {
        TileInput {
            image_index: 1,
            tile_index: 4,
            placement: TilePlacement {
                row_offset: 0,
                col_offset: 0,
                height: 2,
                width: 3,
                row_index: 0,
                col_index: 0,
            },
            data: Array3::from_shape_fn((channels, 2, 3), |(c, y, x)| {
                (c * 10 + y * 3 + x) as f32
            }),
        }
    }

    #[test]
    fn test_single_reshaper_adds_batch_axis() {
        let reshaper = SingleTensorReshaper::new("image");
        let prompt = reshaper.reshape(&tile(4)).unwrap();

        assert_eq!(prompt.image_index, 1);
        assert_eq!(prompt.tile_index, 4);
        let tensor = &prompt.tensors["image"];
        assert_eq!(tensor.shape(), &[1, 4, 2, 3]);
        assert_eq!(tensor[[0, 2, 1, 2]], f16::from_f32(25.0));
    }

    #[test]
    fn test_modality_split_slices_channel_ranges() {
        let reshaper = ModalitySplitReshaper::new(vec![
            ModalityChannels {
                name: "S2L2A".to_string(),
                channels: 3,
            },
            ModalityChannels {
                name: "DEM".to_string(),
                channels: 1,
            },
        ])
        .unwrap();

        let prompt = reshaper.reshape(&tile(4)).unwrap();
        assert_eq!(prompt.tensors["S2L2A"].shape(), &[1, 3, 2, 3]);
        assert_eq!(prompt.tensors["DEM"].shape(), &[1, 1, 2, 3]);
        assert_eq!(prompt.tensors["DEM"][[0, 0, 0, 0]], f16::from_f32(30.0));
    }

    #[test]
    fn test_modality_split_rejects_channel_mismatch() {
        let reshaper = ModalitySplitReshaper::new(vec![ModalityChannels {
            name: "S2L2A".to_string(),
            channels: 12,
        }])
        .unwrap();
        assert!(matches!(reshaper.reshape(&tile(4)), Err(TilingError::Config(_))));
    }

    #[test]
    fn test_registry_creates_builtin_families() {
        let mut registry = ReshaperRegistry::new();
        register_builtin_reshapers(&mut registry);
        assert_eq!(registry.list_families(), vec!["modality_split", "single"]);

        let single = registry.create("single", &HashMap::new()).unwrap();
        assert_eq!(single.family(), "single");

        let mut params = HashMap::new();
        params.insert(
            "modalities".to_string(),
            serde_json::json!([{"name": "S1GRD", "channels": 2}, {"name": "DEM", "channels": 2}]),
        );
        let split = registry.create("modality_split", &params).unwrap();
        let prompt = split.reshape(&tile(4)).unwrap();
        assert_eq!(prompt.tensors.len(), 2);
    }

    #[test]
    fn test_registry_unknown_family() {
        let registry = ReshaperRegistry::default();
        let err = registry.create("prithvi", &HashMap::new()).err().unwrap();
        assert!(err.to_string().contains("unknown model family"));
    }
}
