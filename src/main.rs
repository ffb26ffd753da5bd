//! クロム分類CLI
//!
//! 画像ファイルを1枚受け取り、予測されたクラスを表示します。

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::tensor::backend::Backend;
use clap::{Parser, Subcommand, ValueEnum};

use chromium_classifier::ml::preprocess::is_supported_image_path;
use chromium_classifier::ml::{convert_checkpoint, CLASS_NAMES};
use chromium_classifier::model::load_metadata;
use chromium_classifier::{AppConfig, CpuBackend, DeviceType, ModelLoader, ModelMetadata, Prediction};

#[derive(Parser, Debug)]
#[command(name = "chromium-classifier", version, about = "Chromium class image classifier")]
struct Cli {
    /// 設定ファイル（省略時は ./config.json、なければデフォルト設定）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 重みファイル（設定ファイルより優先）
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// 計算デバイス（設定ファイルより優先）
    #[arg(long, global = true, value_enum)]
    device: Option<DeviceArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 画像を1枚分類する
    Predict {
        /// 画像ファイル (jpg / jpeg / png)
        image: PathBuf,

        /// クラスごとのロジットも表示
        #[arg(long)]
        scores: bool,

        /// 結果をJSONで出力
        #[arg(long)]
        json: bool,
    },
    /// 重みファイルのメタデータを表示する
    Info,
    /// PyTorch チェックポイント (.pth) を重みファイルに変換する
    Convert {
        /// 学習済みの state_dict (.pth)
        checkpoint: PathBuf,

        /// 出力先（省略時は設定の model_path）
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DeviceArg {
    Cpu,
    Wgpu,
}

impl From<DeviceArg> for DeviceType {
    fn from(device: DeviceArg) -> Self {
        match device {
            DeviceArg::Cpu => DeviceType::Cpu,
            DeviceArg::Wgpu => DeviceType::Wgpu,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match &cli.command {
        Command::Predict {
            image,
            scores,
            json,
        } => predict(&config, image, *scores, *json),
        Command::Info => info(&config),
        Command::Convert { checkpoint, output } => {
            convert(&config, checkpoint, output.as_deref())
        }
    }
}

/// 設定ファイルを読み込み、コマンドライン引数で上書きする
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };
    if let Some(model) = &cli.model {
        config.set_model_path(model);
    }
    if let Some(device) = cli.device {
        config.set_device_type(device.into());
    }
    Ok(config)
}

fn predict(config: &AppConfig, image: &Path, show_scores: bool, json: bool) -> Result<()> {
    let prediction = classify_file(config, image)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&prediction)?);
        return Ok(());
    }

    println!("Predicted Chromium Class: {}", prediction.label);
    if show_scores {
        for (label, score) in CLASS_NAMES.iter().zip(prediction.scores.as_slice()) {
            println!("  {}: {:.4}", label, score);
        }
    }

    Ok(())
}

fn classify_file(config: &AppConfig, image: &Path) -> Result<Prediction> {
    if !is_supported_image_path(image) {
        bail!(
            "unsupported file type: {} (expected jpg, jpeg or png)",
            image.display()
        );
    }

    let bytes = std::fs::read(image)
        .with_context(|| format!("Failed to read image: {}", image.display()))?;

    log::info!("計算デバイス: {}", config.device_type);
    match config.device_type {
        DeviceType::Cpu => classify::<CpuBackend>(config, &bytes),
        DeviceType::Wgpu => classify_on_gpu(config, &bytes),
    }
}

fn classify<B: Backend>(config: &AppConfig, bytes: &[u8]) -> Result<Prediction> {
    let loader = ModelLoader::<B>::new(config.model_path());
    let engine = loader.get()?;
    Ok(engine.classify_bytes(bytes)?)
}

#[cfg(feature = "wgpu")]
fn classify_on_gpu(config: &AppConfig, bytes: &[u8]) -> Result<Prediction> {
    classify::<chromium_classifier::ml::GpuBackend>(config, bytes)
}

#[cfg(not(feature = "wgpu"))]
fn classify_on_gpu(config: &AppConfig, bytes: &[u8]) -> Result<Prediction> {
    log::warn!("wgpu feature が無効なビルドです。CPUで推論します");
    classify::<CpuBackend>(config, bytes)
}

fn convert(config: &AppConfig, checkpoint: &Path, output: Option<&Path>) -> Result<()> {
    let model_path = config.model_path();
    let output = output.unwrap_or(model_path.as_path());

    let device = Default::default();
    let path = convert_checkpoint::<CpuBackend>(checkpoint, output, &device)?;
    println!("重みファイルを書き出しました: {}", path.display());
    Ok(())
}

fn info(config: &AppConfig) -> Result<()> {
    let model_path = config.model_path();
    let metadata = load_metadata(&model_path)
        .with_context(|| format!("Failed to read model metadata: {}", model_path.display()))?;

    println!("重みファイル: {}", model_path.display());
    print_metadata_info(&metadata);
    Ok(())
}

/// メタデータをコンソールに表示
fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("アーキテクチャ: {}", metadata.architecture);
    println!("クラスラベル: {}", metadata.class_labels.join(", "));
    println!(
        "モデル入力サイズ: {}x{}",
        metadata.model_input_size, metadata.model_input_size
    );
    if let Some(source) = &metadata.source_checkpoint {
        println!("変換元: {}", source);
    }
    println!("書き出し日時: {}", metadata.exported_at);
    println!("パラメータ:");
    for (name, shape) in &metadata.parameters {
        println!("  {}: {:?}", name, shape);
    }
    println!("========================");
}
