//! クロム分類の推論コア
//!
//! 画像のバイト列 -> 前処理 -> CNN -> デコード -> クラスラベル

mod error;
mod types;

pub mod ml;
pub mod model;

pub use error::{ClassifierError, Result};
pub use ml::{CpuBackend, InferenceEngine, ModelLoader};
pub use model::{AppConfig, DeviceType, ModelMetadata};
pub use types::{ImageTensor, Prediction, ScoreVector};

use std::sync::OnceLock;

use burn::tensor::backend::Backend;

static DEFAULT_LOADER: OnceLock<ModelLoader<CpuBackend>> = OnceLock::new();

/// プロセス共通のローダー
///
/// 初回呼び出し時に `config.json` からモデルパスを決定します（重みの読み込みは
/// 最初の推論まで行いません）。
pub fn default_loader() -> &'static ModelLoader<CpuBackend> {
    DEFAULT_LOADER.get_or_init(|| {
        let config = AppConfig::load_or_default();
        ModelLoader::new(config.model_path())
    })
}

/// 画像のバイト列（JPEG / PNG）を分類してクラスラベルを返す
///
/// 表示側から呼ばれる推論の入口です。モデルはプロセス内で一度だけ読み込まれます。
pub fn predict_label(image_bytes: &[u8]) -> Result<String> {
    predict_label_with(default_loader(), image_bytes)
}

/// 指定したローダーのモデルで分類してクラスラベルを返す
pub fn predict_label_with<B: Backend>(loader: &ModelLoader<B>, image_bytes: &[u8]) -> Result<String> {
    let engine = loader.get()?;
    let prediction = engine.classify_bytes(image_bytes)?;
    Ok(prediction.label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::test_support::{fixture_archive, png_bytes};
    use crate::ml::CLASS_NAMES;
    use tempfile::tempdir;

    #[test]
    fn test_default_loader_is_process_wide() {
        assert!(std::ptr::eq(default_loader(), default_loader()));
    }

    #[test]
    fn test_predict_label_returns_class_name() {
        let loader = ModelLoader::<CpuBackend>::new(fixture_archive());
        let bytes = png_bytes(150, 90);

        let label = predict_label_with(&loader, &bytes).unwrap();
        assert!(CLASS_NAMES.contains(&label.as_str()));
        assert_eq!(predict_label_with(&loader, &bytes).unwrap(), label);
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn test_predict_label_errors() {
        let loader = ModelLoader::<CpuBackend>::new(fixture_archive());
        assert!(matches!(
            predict_label_with(&loader, b""),
            Err(ClassifierError::Decode(_))
        ));
        assert!(loader.is_loaded());

        let dir = tempdir().unwrap();
        let missing = ModelLoader::<CpuBackend>::new(dir.path().join("missing.tar.gz"));
        assert!(matches!(
            predict_label_with(&missing, &png_bytes(8, 8)),
            Err(ClassifierError::Load { .. })
        ));
        assert!(!missing.is_loaded());
    }
}
