//! 画像前処理
//!
//! 任意サイズの画像を 3x128x128 の正規化済みテンソルに変換します。

use image::{imageops::FilterType, DynamicImage, RgbImage};

use crate::error::Result;
use crate::ml::{CHANNELS, IMAGE_SIZE};
use crate::types::ImageTensor;

/// チャネルごとの平均
pub const NORMALIZE_MEAN: [f32; CHANNELS] = [0.5, 0.5, 0.5];

/// チャネルごとの標準偏差
pub const NORMALIZE_STD: [f32; CHANNELS] = [0.5, 0.5, 0.5];

/// リサイズ時の補間方法（バイリニア、縮小時はアンチエイリアス付き）
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// アップロードされた画像ファイルの拡張子として受け付けるもの
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// バイト列をデコードしてテンソルに変換
///
/// 画像として解釈できない場合は `ClassifierError::Decode` を返します。
pub fn preprocess_bytes(bytes: &[u8]) -> Result<ImageTensor> {
    let image = image::load_from_memory(bytes)?;
    log::debug!(
        "デコード完了: {}x{} ({:?})",
        image.width(),
        image.height(),
        image.color()
    );
    preprocess_image(&image)
}

/// デコード済み画像をテンソルに変換
///
/// RGB以外（アルファ付き・グレースケールなど）はRGBに変換してからリサイズします。
pub fn preprocess_image(image: &DynamicImage) -> Result<ImageTensor> {
    let rgb = image.to_rgb8();
    let resized = if rgb.dimensions() == (IMAGE_SIZE as u32, IMAGE_SIZE as u32) {
        rgb
    } else {
        image::imageops::resize(&rgb, IMAGE_SIZE as u32, IMAGE_SIZE as u32, RESIZE_FILTER)
    };

    ImageTensor::new(normalize(&resized), ImageTensor::SHAPE)
}

// (C, H, W) の順で平坦化: (pixel / 255 - mean) / std
fn normalize(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(CHANNELS * (width * height) as usize);

    for channel in 0..CHANNELS {
        for y in 0..height {
            for x in 0..width {
                let value = img.get_pixel(x, y)[channel] as f32 / 255.0;
                data.push((value - NORMALIZE_MEAN[channel]) / NORMALIZE_STD[channel]);
            }
        }
    }

    data
}

/// 拡張子がアップロード対象 (jpg / jpeg / png) かどうか
pub fn is_supported_image_path(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}
