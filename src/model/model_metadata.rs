//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{ParameterShapes, ARCHITECTURE, CLASS_NAMES, IMAGE_SIZE};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// アーキテクチャ名（"chromium_cnn"）
    pub architecture: String,

    /// 全クラスラベル（インデックス順）
    /// 例: ["1", "2", ..., "9"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（CNNへの入力解像度、128x128）
    pub model_input_size: u32,

    /// パラメータ名 -> 形状
    /// model.bin に含まれるべきパラメータの一覧
    pub parameters: ParameterShapes,

    /// 変換元チェックポイント名（あれば）
    #[serde(default)]
    pub source_checkpoint: Option<String>,

    /// 書き出し時刻（ISO8601形式）
    pub exported_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(parameters: ParameterShapes, source_checkpoint: Option<String>) -> Self {
        let exported_at = chrono::Local::now().to_rfc3339();

        Self {
            architecture: ARCHITECTURE.to_string(),
            class_labels: CLASS_NAMES.iter().map(|name| name.to_string()).collect(),
            model_input_size: IMAGE_SIZE as u32,
            parameters,
            source_checkpoint,
            exported_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
