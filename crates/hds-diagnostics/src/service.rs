//! 診断サービスの組み立て
//!
//! 設定から保存先・プリペアラ・セッションマネージャを 1 回だけ作り、
//! ディスパッチャから届くバイト列をデコードしてマネージャへ渡す。
//!
//! ```text
//! DiagnosticsConfig ─▶ FsStorage / SharedLogBuffer ─▶ SnapshotPreparer
//!                                                            │
//! Dispatcher, Timer, Clock ──────────────────────────▶ DiagnosticsSessionManager
//! ```

use std::sync::Arc;

use hds_proto::{AckEvent, CloseEvent, OpenRequest, ProtoError, MIB};
use hds_session::{
    Clock, DiagnosticsSessionManager, Dispatcher, OpenOutcome, SessionStats, StreamHandle, Timer, TransportKind,
};
use hds_snapshot::{FsStorage, PreparerBackend, RotatingLogFile, SharedLogBuffer, SnapshotPreparer, Wake};
use tracing::{debug, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::{DiagnosticsConfig, SnapshotBackend};
use crate::error::DiagnosticsError;

/// アクセサリのログを流し込む先
#[derive(Debug, Clone)]
pub enum CaptureSink {
    File(RotatingLogFile),
    Buffer(SharedLogBuffer),
}

impl CaptureSink {
    /// fmt レイヤーに渡す書き込み側
    pub fn make_writer(&self) -> BoxMakeWriter {
        match self {
            CaptureSink::File(log) => BoxMakeWriter::new(log.clone()),
            CaptureSink::Buffer(buffer) => BoxMakeWriter::new(buffer.clone()),
        }
    }
}

/// 診断スナップショットエンジン一式
pub struct DiagnosticsService<D, T, C> {
    manager: DiagnosticsSessionManager<D, T, C>,
    storage: Option<Arc<FsStorage>>,
    capture: CaptureSink,
}

impl<D: Dispatcher, T: Timer, C: Clock> DiagnosticsService<D, T, C> {
    /// 設定を検証して一式を組み立てる
    ///
    /// Files バックエンドでは診断フォルダを作り、ログキャプチャを開始する。
    ///
    /// # 引数
    /// - `wake`: 準備イベントが届いたときに消費ループを起こすフック
    ///
    /// # エラー
    /// - `DiagnosticsError::Config`: 設定が不正
    /// - `DiagnosticsError::Snapshot`: ログキャプチャを開始できない
    /// - `DiagnosticsError::LogBuffer`: リングバッファを作れない
    pub fn new(
        config: &DiagnosticsConfig,
        dispatcher: D,
        timer: T,
        clock: C,
        wake: Option<Wake>,
    ) -> Result<Self, DiagnosticsError> {
        config.validate()?;

        let (backend, storage, capture) = match config.snapshot.backend {
            SnapshotBackend::Files => {
                let storage = Arc::new(FsStorage::new(config.storage_layout()));
                let log = storage.start_log_capture(config.storage.log_capture_mib.saturating_mul(MIB))?;
                (
                    PreparerBackend::Files {
                        storage: storage.clone(),
                    },
                    Some(storage),
                    CaptureSink::File(log),
                )
            }
            SnapshotBackend::LogBuffer => {
                let buffer = SharedLogBuffer::new(config.buffer.capacity_bytes)?;
                (
                    PreparerBackend::LogBuffer {
                        buffer: buffer.clone(),
                    },
                    None,
                    CaptureSink::Buffer(buffer),
                )
            }
        };

        let mut preparer = SnapshotPreparer::new(backend)
            .with_url_parameters(config.url_parameters())
            .with_accessory_config(config.snapshot.accessory_config.as_str())
            .with_size_tolerance(config.snapshot.size_tolerance);
        if let Some(wake) = wake {
            preparer = preparer.with_wake(wake);
        }

        let manager = DiagnosticsSessionManager::new(config.engine_settings(), preparer, dispatcher, timer, clock);
        info!(
            backend = ?config.snapshot.backend,
            format = ?config.snapshot.format,
            "diagnostics service ready"
        );
        Ok(DiagnosticsService {
            manager,
            storage,
            capture,
        })
    }

    /// request:open のバイト列を処理する
    ///
    /// # エラー
    /// - `ProtoError::DecodeFailed`: デコード失敗（応答はディスパッチャ側の責任）
    pub fn handle_open(
        &mut self,
        stream: StreamHandle,
        transport: TransportKind,
        payload: &[u8],
    ) -> Result<OpenOutcome, ProtoError> {
        let request = OpenRequest::decode_from_bytes(payload)?;
        debug!(stream = stream.0, stream_type = %request.r#type, "open request received");
        Ok(self.manager.try_open(stream, transport, &request))
    }

    /// event:ack のバイト列を処理する
    pub fn handle_ack(&mut self, stream: StreamHandle, payload: &[u8]) -> Result<(), ProtoError> {
        let ack = AckEvent::decode_from_bytes(payload)?;
        self.manager.on_ack(stream, ack.end_of_stream);
        Ok(())
    }

    /// コントローラからの event:close のバイト列を処理する
    pub fn handle_close(&mut self, stream: StreamHandle, payload: &[u8]) -> Result<(), ProtoError> {
        let close = CloseEvent::decode_from_bytes(payload)?;
        self.manager.on_stream_closed(stream, close.close_reason());
        Ok(())
    }

    pub fn poll(&mut self) -> usize {
        self.manager.poll()
    }

    pub fn stats(&self) -> SessionStats {
        self.manager.stats()
    }

    pub fn manager(&self) -> &DiagnosticsSessionManager<D, T, C> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut DiagnosticsSessionManager<D, T, C> {
        &mut self.manager
    }
}

impl<D, T, C> DiagnosticsService<D, T, C> {
    pub fn capture(&self) -> &CaptureSink {
        &self.capture
    }

    /// Files バックエンドの保存先
    pub fn storage(&self) -> Option<&Arc<FsStorage>> {
        self.storage.as_ref()
    }

    /// ログキャプチャを止める（何度呼んでもよい）
    pub fn shutdown(&self) {
        if let Some(storage) = &self.storage {
            storage.stop_log_capture();
        }
    }
}

impl<D, T, C> Drop for DiagnosticsService<D, T, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
