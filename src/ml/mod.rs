pub mod ml_model;
pub mod checkpoint;
pub mod decoder;
pub mod inference;
pub mod loader;
pub mod preprocess;

pub use ml_model::{
    compare_shapes, expected_parameter_shapes, ChromiumCnn, ModelConfig, ParameterShapes,
    ParameterTensor, ParameterTensors, ARCHITECTURE, CHANNELS, CLASS_NAMES, FEATURE_CHANNELS,
    FLATTENED_FEATURES, HIDDEN_UNITS, IMAGE_SIZE, NUM_CLASSES,
};
pub use checkpoint::convert_checkpoint;
pub use inference::{export_model, InferenceEngine};
pub use loader::ModelLoader;

/// CPU バックエンド
pub type CpuBackend = burn::backend::NdArray<f32>;

/// GPU バックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn::backend::Wgpu;

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Cursor;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use tempfile::TempDir;

    use super::{export_model, CpuBackend, ModelConfig};

    static FIXTURE: OnceLock<(TempDir, PathBuf)> = OnceLock::new();

    /// ランダム初期化したモデルの重みファイル（テストプロセスで1つだけ作成）
    pub fn fixture_archive() -> &'static Path {
        let (_, path) = FIXTURE.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            let device = Default::default();
            let model = ModelConfig::chromium().init::<CpuBackend>(&device);
            let path = export_model(&model, &dir.path().join("fixture"), None).unwrap();
            (dir, path)
        });
        path
    }

    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x ^ y) % 256) as u8])
        }));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }
}
