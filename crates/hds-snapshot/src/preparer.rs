//! スナップショットプリペアラ
//!
//! ## スレッドモデル
//!
//! ```text
//! consumer loop                         worker thread (Files のみ)
//!   start() ──spawn──────────────────▶  InProgress
//!      │                                 checkpoint ── abort? → 解放して終了
//!      │                                 連結 / zip / サイズ確認
//!      │                                 checkpoint
//!      │   ◀──PrepareEvent(Ready|Cancel)─ 状態更新と送信は同じロック内
//!   poll() → on_ready / on_cancel
//! ```
//!
//! 共有するのは `Shared`（データ状態・中断フラグ・解放済みフラグ・ソース）だけで、
//! 1 つの `parking_lot::Mutex` で守る。コンテキストの「解放」は
//! `released = true` とソースの破棄を 1 回のクリティカルセクションで行い、
//! ワーカーと消費側のどちらが先でも 1 回しか起きない。
//!
//! LogBuffer バックエンドはスレッドを作らず `start()` の中で完了するが、
//! 結果は同じチャンネル経由で届ける。

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use hds_proto::{SnapshotFormat, SnapshotMetadata, SnapshotType, UrlParameter};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::SnapshotError;
use crate::log_buffer::SharedLogBuffer;
use crate::source::{FileSource, RingSource, SnapshotSource};
use crate::storage::Storage;

/// 連結ログを実効最大サイズのこの割合まで削る（zip ヘッダ等の余裕）
pub const DEFAULT_SIZE_TOLERANCE: f64 = 0.8;

/// Manufacturer スナップショットに付けるタイムスタンプのキー
pub const SIGNED_TIMESTAMP_KEY: &str = "signed-timestamp";

/// 準備の進行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Idle,
    InProgress,
    Ready,
    Error,
}

/// ワーカーから消費ループへの通知
#[derive(Debug, Clone, PartialEq)]
pub enum PrepareEvent {
    /// 準備完了（サイズと最初のチャンクに付ける URL パラメータ）
    Ready {
        size: u64,
        url_parameters: Option<Vec<UrlParameter>>,
    },
    /// 準備失敗
    Cancel,
}

impl PrepareEvent {
    /// 対応するコールバックを呼ぶ
    pub fn dispatch<C: PrepareCallbacks + ?Sized>(self, callbacks: &mut C) {
        match self {
            PrepareEvent::Ready {
                size,
                url_parameters,
            } => callbacks.on_ready(size, url_parameters),
            PrepareEvent::Cancel => callbacks.on_cancel(),
        }
    }
}

/// 準備結果の受け手
///
/// `start()` 1 回につきどちらか一方だけが、消費ループ上で呼ばれる。
pub trait PrepareCallbacks {
    fn on_ready(&mut self, size: u64, url_parameters: Option<Vec<UrlParameter>>);
    fn on_cancel(&mut self);
}

/// 消費ループを起こすフック（イベント送信直後に呼ばれる）
pub type Wake = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct Shared {
    data_state: DataState,
    abort_requested: bool,
    released: bool,
    source: Option<SnapshotSource>,
}

impl Shared {
    fn release(&mut self) {
        self.released = true;
        self.source = None;
    }
}

/// `start()` が返す準備中コンテキストのハンドル
///
/// 消費ループ側の唯一の所有者。`abort()` と `complete()` は何度呼んでもよい。
#[derive(Debug)]
pub struct PrepareContext {
    shared: Arc<Mutex<Shared>>,
    metadata: SnapshotMetadata,
}

impl PrepareContext {
    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn data_state(&self) -> DataState {
        self.shared.lock().data_state
    }

    /// 既に解放されたか
    pub fn is_released(&self) -> bool {
        self.shared.lock().released
    }

    /// 準備を中断する
    ///
    /// Ready / Error ならその場で解放する。Idle / InProgress なら中断フラグを立て、
    /// ワーカーが次のチェックポイントで解放する（保留中の通知は送られない）。
    /// 解放済みなら何もしない。
    pub fn abort(&self) {
        let mut shared = self.shared.lock();
        if shared.released {
            return;
        }
        match shared.data_state {
            DataState::Ready | DataState::Error => {
                shared.release();
                info!("diagnostics data transfer aborted, context released");
            }
            DataState::Idle | DataState::InProgress => {
                shared.abort_requested = true;
                info!("diagnostics data transfer aborted, worker will stop at next checkpoint");
            }
        }
    }

    /// 転送完了後にコンテキストを解放する
    pub fn complete(&self) {
        let mut shared = self.shared.lock();
        if !shared.released {
            shared.release();
            info!("diagnostics data transfer completed");
        }
    }

    /// 次のチャンクを読む（Ready 後、消費ループからのみ）
    ///
    /// # 戻り値
    /// `(読んだバイト数, 最後のバイトまで読んだか)`
    ///
    /// # エラー
    /// - `SnapshotError::NotReady`: Ready でない、または解放済み
    /// - 読み出し失敗（データ状態は Error になる）
    pub fn get_bytes_to_upload(&self, buf: &mut [u8]) -> Result<(usize, bool), SnapshotError> {
        let mut shared = self.shared.lock();
        if shared.data_state != DataState::Ready {
            return Err(SnapshotError::NotReady);
        }
        let Some(source) = shared.source.as_mut() else {
            return Err(SnapshotError::NotReady);
        };
        match source.read_chunk(buf) {
            Ok(read) => Ok(read),
            Err(e) => {
                shared.data_state = DataState::Error;
                shared.source = None;
                Err(e)
            }
        }
    }
}

/// 準備の実行方式
#[derive(Clone)]
pub enum PreparerBackend {
    /// 診断フォルダからワーカースレッドで組み立てる
    Files {
        storage: Arc<dyn Storage>,
    },
    /// 共有リングバッファをその場で freeze する
    LogBuffer {
        buffer: SharedLogBuffer,
    },
}

impl fmt::Debug for PreparerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreparerBackend::Files { storage } => f.debug_struct("Files").field("storage", storage).finish(),
            PreparerBackend::LogBuffer { buffer } => {
                f.debug_struct("LogBuffer").field("buffer", buffer).finish()
            }
        }
    }
}

/// スナップショットを組み立てて `PrepareContext` を渡す
#[derive(Clone)]
pub struct SnapshotPreparer {
    backend: PreparerBackend,
    /// Manufacturer スナップショットに付ける固定の URL パラメータ
    static_url_parameters: Vec<UrlParameter>,
    /// テキスト形式の末尾に追記するアクセサリ構成文字列
    accessory_config: String,
    size_tolerance: f64,
    wake: Option<Wake>,
}

impl fmt::Debug for SnapshotPreparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotPreparer")
            .field("backend", &self.backend)
            .field("static_url_parameters", &self.static_url_parameters)
            .field("size_tolerance", &self.size_tolerance)
            .finish_non_exhaustive()
    }
}

impl SnapshotPreparer {
    pub fn new(backend: PreparerBackend) -> Self {
        SnapshotPreparer {
            backend,
            static_url_parameters: Vec::new(),
            accessory_config: String::new(),
            size_tolerance: DEFAULT_SIZE_TOLERANCE,
            wake: None,
        }
    }

    pub fn with_url_parameters(mut self, params: Vec<UrlParameter>) -> Self {
        self.static_url_parameters = params;
        self
    }

    pub fn with_accessory_config(mut self, config: impl Into<String>) -> Self {
        self.accessory_config = config.into();
        self
    }

    pub fn with_size_tolerance(mut self, tolerance: f64) -> Self {
        self.size_tolerance = tolerance;
        self
    }

    pub fn with_wake(mut self, wake: Wake) -> Self {
        self.wake = Some(wake);
        self
    }

    /// 準備を開始する
    ///
    /// # 引数
    /// - `metadata`: 検証済みの open パラメータ（max_log_size は実効値）
    /// - `issued_at_ms`: Manufacturer の `signed-timestamp` に使う時刻
    ///
    /// # 戻り値
    /// コンテキストと、Ready/Cancel が 1 つだけ届くチャンネル
    ///
    /// # エラー
    /// - `SnapshotError::WorkerSpawn`: ワーカースレッドを起動できない
    pub fn start(
        &self,
        metadata: SnapshotMetadata,
        issued_at_ms: u64,
    ) -> Result<(PrepareContext, Receiver<PrepareEvent>), SnapshotError> {
        let shared = Arc::new(Mutex::new(Shared {
            data_state: DataState::Idle,
            abort_requested: false,
            released: false,
            source: None,
        }));
        let (tx, rx) = bounded(1);
        let job = Job {
            shared: shared.clone(),
            poster: EventPoster {
                tx,
                wake: self.wake.clone(),
            },
            metadata,
            url_parameters: self.url_parameters_for(metadata.snapshot_type, issued_at_ms),
            accessory_config: self.accessory_config.clone(),
            size_tolerance: self.size_tolerance,
        };
        info!(
            snapshot_type = ?metadata.snapshot_type,
            format = ?metadata.format,
            max_log_size = metadata.max_log_size,
            "preparing diagnostics data"
        );

        match &self.backend {
            PreparerBackend::Files { storage } => {
                let storage = storage.clone();
                thread::Builder::new()
                    .name("hds-snapshot-collect".to_owned())
                    .spawn(move || job.run_files(storage))
                    .map_err(|e| {
                        error!(error = %e, "failed to create diagnostic data collection thread");
                        SnapshotError::WorkerSpawn(e)
                    })?;
            }
            PreparerBackend::LogBuffer { buffer } => job.run_log_buffer(buffer),
        }

        Ok((PrepareContext { shared, metadata }, rx))
    }

    fn url_parameters_for(&self, snapshot_type: SnapshotType, issued_at_ms: u64) -> Option<Vec<UrlParameter>> {
        match snapshot_type {
            SnapshotType::Adk => None,
            SnapshotType::Manufacturer => {
                let mut params = Vec::with_capacity(self.static_url_parameters.len() + 1);
                params.push(UrlParameter::new(SIGNED_TIMESTAMP_KEY, issued_at_ms.to_string()));
                params.extend(self.static_url_parameters.iter().cloned());
                Some(params)
            }
        }
    }
}

/// 単一スロットのチャンネルで 1 回だけ通知する
struct EventPoster {
    tx: Sender<PrepareEvent>,
    wake: Option<Wake>,
}

impl EventPoster {
    fn post(&self, event: PrepareEvent) {
        if self.tx.try_send(event).is_err() {
            // 受け手が既にいない（セッション終了後）
            debug!("prepare event dropped, no receiver");
            return;
        }
        if let Some(wake) = &self.wake {
            wake();
        }
    }
}

struct Job {
    shared: Arc<Mutex<Shared>>,
    poster: EventPoster,
    metadata: SnapshotMetadata,
    url_parameters: Option<Vec<UrlParameter>>,
    accessory_config: String,
    size_tolerance: f64,
}

impl Job {
    fn set_state(&self, state: DataState) {
        let mut shared = self.shared.lock();
        shared.data_state = state;
        debug!(?state, "updated data collection state");
    }

    /// 中断要求があれば解放して `Aborted` を返す
    fn checkpoint(&self) -> Result<(), SnapshotError> {
        let mut shared = self.shared.lock();
        if shared.abort_requested {
            shared.release();
            return Err(SnapshotError::Aborted);
        }
        Ok(())
    }

    fn finish(self, result: Result<(u64, SnapshotSource), SnapshotError>) {
        let mut shared = self.shared.lock();
        if shared.abort_requested {
            shared.release();
            info!("diagnostics data collection aborted");
            return;
        }
        match result {
            Ok((size, source)) => {
                shared.data_state = DataState::Ready;
                shared.source = Some(source);
                info!(size, "diagnostics data ready");
                self.poster.post(PrepareEvent::Ready {
                    size,
                    url_parameters: self.url_parameters.clone(),
                });
            }
            Err(SnapshotError::Aborted) => {
                shared.release();
            }
            Err(e) => {
                shared.data_state = DataState::Error;
                error!(error = %e, "diagnostics data collection failed");
                self.poster.post(PrepareEvent::Cancel);
            }
        }
    }

    fn run_files(self, storage: Arc<dyn Storage>) {
        debug!("diagnostics data collection thread started");
        self.set_state(DataState::InProgress);
        let result = self
            .assemble_files(storage.as_ref())
            .map(|(size, path)| (size, SnapshotSource::File(FileSource::new(storage.clone(), path, size))));
        self.finish(result);
        debug!("exiting diagnostic data collection thread");
    }

    fn assemble_files(&self, storage: &dyn Storage) -> Result<(u64, PathBuf), SnapshotError> {
        self.checkpoint()?;
        if !storage.folder_exists() {
            return Err(SnapshotError::FolderMissing);
        }

        let format = self.metadata.format;
        let output = storage.output_path(format);
        storage.remove_if_exists(&output)?;
        self.checkpoint()?;

        if format == SnapshotFormat::Text && !self.accessory_config.is_empty() {
            storage.append_to_log(self.accessory_config.as_bytes())?;
        }
        storage.flush_log()?;

        let max = self.metadata.max_log_size;
        let trim_to = (max as f64 * self.size_tolerance) as u64;
        let concatenated = storage.rotate_or_concatenate(trim_to)?;

        match format {
            SnapshotFormat::Zip => {
                storage.archive(self.metadata.snapshot_type, concatenated.as_deref(), &output)?;
                if let Some(joined) = &concatenated {
                    storage.remove_if_exists(joined)?;
                }
            }
            SnapshotFormat::Text => {
                if let Some(joined) = &concatenated {
                    storage.rename(joined, &output)?;
                }
            }
        }

        let size = storage.file_size(&output)?;
        if size > max {
            return Err(SnapshotError::TooLarge { size, max });
        }
        self.checkpoint()?;
        Ok((size, output))
    }

    fn run_log_buffer(self, buffer: &SharedLogBuffer) {
        self.set_state(DataState::InProgress);
        let result = self.assemble_log_buffer(buffer);
        self.finish(result);
    }

    fn assemble_log_buffer(&self, buffer: &SharedLogBuffer) -> Result<(u64, SnapshotSource), SnapshotError> {
        self.checkpoint()?;
        if self.metadata.format != SnapshotFormat::Text {
            warn!(format = ?self.metadata.format, "log buffer backend only supports text snapshots");
            return Err(SnapshotError::UnsupportedFormat(self.metadata.format));
        }
        if !self.accessory_config.is_empty() {
            // 大きすぎる構成文字列は載せない
            if let Err(e) = buffer.write_record(self.accessory_config.as_bytes()) {
                warn!(error = %e, "accessory configuration not added to log buffer");
            }
        }

        let source = RingSource::freeze(buffer.clone());
        let size = source.size() as u64;
        if size > self.metadata.max_log_size {
            return Err(SnapshotError::TooLarge {
                size,
                max: self.metadata.max_log_size,
            });
        }
        Ok((size, SnapshotSource::LogBuffer(source)))
    }
}
