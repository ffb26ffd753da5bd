//! モデルの一度だけの読み込みとキャッシュ

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use burn::tensor::backend::Backend;

use crate::error::Result;
use crate::ml::InferenceEngine;

/// 重みファイルを最初の呼び出し時にだけ読み込み、以降は同じインスタンスを返すローダー
///
/// 初回の読み込みは `Mutex` で保護されるため、並行して呼ばれても読み込みは1回だけです。
/// 読み込みに失敗した場合は何もキャッシュされず、次の呼び出しで再試行されます。
pub struct ModelLoader<B: Backend> {
    model_path: PathBuf,
    device: B::Device,
    cached: Mutex<Option<Arc<InferenceEngine<B>>>>,
    load_count: AtomicUsize,
}

impl<B: Backend> ModelLoader<B> {
    /// デフォルトデバイスで作成
    pub fn new<P: Into<PathBuf>>(model_path: P) -> Self {
        Self::with_device(model_path, B::Device::default())
    }

    pub fn with_device<P: Into<PathBuf>>(model_path: P, device: B::Device) -> Self {
        Self {
            model_path: model_path.into(),
            device,
            cached: Mutex::new(None),
            load_count: AtomicUsize::new(0),
        }
    }

    /// 推論エンジンを取得（初回のみ重みファイルを読み込む）
    pub fn get(&self) -> Result<Arc<InferenceEngine<B>>> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(engine) = cached.as_ref() {
            return Ok(Arc::clone(engine));
        }

        self.load_count.fetch_add(1, Ordering::SeqCst);
        let engine = match InferenceEngine::load(&self.model_path, self.device.clone()) {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                log::error!("モデルの読み込みに失敗しました: {}", e);
                return Err(e);
            }
        };

        *cached = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// キャッシュ済みかどうか
    pub fn is_loaded(&self) -> bool {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 重みファイルを読み込んだ回数
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifierError;
    use crate::ml::test_support::{fixture_archive, png_bytes};
    use crate::ml::CpuBackend;
    use tempfile::tempdir;

    #[test]
    fn test_repeated_calls_return_same_instance() {
        let loader = ModelLoader::<CpuBackend>::new(fixture_archive());
        assert!(!loader.is_loaded());

        let first = loader.get().unwrap();
        for _ in 0..5 {
            let again = loader.get().unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }

        assert!(loader.is_loaded());
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn test_parallel_first_access_loads_once() {
        let loader = Arc::new(ModelLoader::<CpuBackend>::new(fixture_archive()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let loader = Arc::clone(&loader);
                std::thread::spawn(move || loader.get().unwrap())
            })
            .collect();
        let engines: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for engine in &engines[1..] {
            assert!(Arc::ptr_eq(&engines[0], engine));
        }
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn test_shared_engine_serves_concurrent_requests() {
        let loader = ModelLoader::<CpuBackend>::new(fixture_archive());
        let engine = loader.get().unwrap();
        let bytes = png_bytes(64, 48);
        let expected = engine.classify_bytes(&bytes).unwrap();

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|_| scope.spawn(|| engine.classify_bytes(&bytes).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().all(|prediction| *prediction == expected));
    }

    #[test]
    fn test_missing_file_caches_nothing() {
        let dir = tempdir().unwrap();
        let loader = ModelLoader::<CpuBackend>::new(dir.path().join("missing.tar.gz"));

        assert!(matches!(loader.get(), Err(ClassifierError::Load { .. })));
        assert!(!loader.is_loaded());

        // 失敗はキャッシュされず、次の呼び出しで再試行する
        assert!(loader.get().is_err());
        assert_eq!(loader.load_count(), 2);
    }

    #[test]
    fn test_decode_error_does_not_affect_cache() {
        let loader = ModelLoader::<CpuBackend>::new(fixture_archive());
        let engine = loader.get().unwrap();

        assert!(matches!(
            engine.classify_bytes(b"not an image"),
            Err(ClassifierError::Decode(_))
        ));
        assert!(Arc::ptr_eq(&engine, &loader.get().unwrap()));
        assert_eq!(loader.load_count(), 1);
    }
}
