//! PyTorch チェックポイント (.pth) から重みファイルへの変換
//!
//! state_dict のキーを Burn のレイヤー名に付け替え、Linear の重みを
//! PyTorch の `[out, in]` から Burn の `[in, out]` に転置します。

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use burn::tensor::backend::Backend;
use candle_core::{pickle, DType};

use crate::ml::{export_model, ChromiumCnn, ModelConfig, ParameterTensor, ParameterTensors};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerKind {
    Conv,
    Linear,
}

/// state_dict のキー接頭辞 -> レイヤー名
///
/// features: Conv(0) ReLU(1) Pool(2) Conv(3) ReLU(4) Pool(5) Conv(6) ...
/// classifier: Flatten(0) Linear(1) ReLU(2) Dropout(3) Linear(4)
const LAYER_NAMES: [(&str, &str, LayerKind); 5] = [
    ("features.0", "conv1", LayerKind::Conv),
    ("features.3", "conv2", LayerKind::Conv),
    ("features.6", "conv3", LayerKind::Conv),
    ("classifier.1", "fc1", LayerKind::Linear),
    ("classifier.4", "fc2", LayerKind::Linear),
];

/// `.pth` ファイルの state_dict を読み込む（値は f32 に変換）
pub fn read_state_dict(path: &Path) -> Result<ParameterTensors> {
    let tensors = pickle::read_all(path)
        .with_context(|| format!("Failed to read PyTorch checkpoint: {}", path.display()))?;

    let mut state_dict = ParameterTensors::new();
    for (name, tensor) in tensors {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .with_context(|| format!("Failed to convert tensor {name}"))?;
        state_dict.insert(name, ParameterTensor { shape, values });
    }

    log::info!("[Convert] {} 個のテンソルを読み込みました", state_dict.len());
    Ok(state_dict)
}

/// PyTorch のキーとレイアウトを Burn のものに変換
pub fn remap_state_dict(state_dict: ParameterTensors) -> Result<ParameterTensors> {
    let mut remapped = ParameterTensors::new();

    for (key, tensor) in state_dict {
        // DataParallel で保存された state_dict
        let name = key.strip_prefix("module.").unwrap_or(key.as_str());
        let (prefix, suffix) = name
            .rsplit_once('.')
            .ok_or_else(|| anyhow!("unexpected parameter {key:?}"))?;
        if suffix != "weight" && suffix != "bias" {
            bail!("unexpected parameter {key:?}");
        }
        let (layer, kind) = LAYER_NAMES
            .iter()
            .find(|(from, _, _)| *from == prefix)
            .map(|(_, layer, kind)| (*layer, *kind))
            .ok_or_else(|| anyhow!("unexpected parameter {key:?}"))?;

        let tensor = match (kind, suffix) {
            (LayerKind::Linear, "weight") => {
                transpose(&tensor).with_context(|| format!("parameter {key:?}"))?
            }
            _ => tensor,
        };
        remapped.insert(format!("{layer}.{suffix}"), tensor);
    }

    Ok(remapped)
}

fn transpose(tensor: &ParameterTensor) -> Result<ParameterTensor> {
    let (rows, cols) = match tensor.shape.as_slice() {
        &[rows, cols] => (rows, cols),
        shape => bail!("expected a 2D tensor, found shape {shape:?}"),
    };
    if tensor.values.len() != rows * cols {
        bail!(
            "{} values do not fit shape {:?}",
            tensor.values.len(),
            tensor.shape
        );
    }

    let mut values = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            values[c * rows + r] = tensor.values[r * cols + c];
        }
    }

    Ok(ParameterTensor {
        shape: vec![cols, rows],
        values,
    })
}

/// state_dict から推論モードのモデルを構築
pub fn model_from_state_dict<B: Backend>(
    state_dict: ParameterTensors,
    device: &B::Device,
) -> Result<ChromiumCnn<B>> {
    let tensors = remap_state_dict(state_dict)?;
    let model = ModelConfig::chromium()
        .init::<B>(device)
        .with_parameters(&tensors, device)
        .map_err(|reason| anyhow!("checkpoint does not match the architecture: {reason}"))?;
    Ok(model.eval())
}

/// state_dict を重みファイルとして書き出す
pub fn convert_state_dict<B: Backend>(
    state_dict: ParameterTensors,
    output_path: &Path,
    source_checkpoint: Option<String>,
    device: &B::Device,
) -> Result<PathBuf> {
    let model = model_from_state_dict::<B>(state_dict, device)?;
    export_model(&model, output_path, source_checkpoint)
}

/// `.pth` チェックポイントを重みファイルに変換
///
/// 実際に書き込んだパスを返します。
pub fn convert_checkpoint<B: Backend>(
    checkpoint: &Path,
    output_path: &Path,
    device: &B::Device,
) -> Result<PathBuf> {
    let state_dict = read_state_dict(checkpoint)?;
    let source = checkpoint
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let path = convert_state_dict::<B>(state_dict, output_path, source, device)?;
    log::info!(
        "[Convert] {} -> {}",
        checkpoint.display(),
        path.display()
    );
    Ok(path)
}
