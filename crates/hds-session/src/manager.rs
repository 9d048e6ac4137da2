//! 診断セッションマネージャ
//!
//! 同時に高々 1 つの `DiagnosticsSession` を `Option` で持つ。
//! open の検証、プリペアラ・ウォッチドッグ・アップローダの結線、
//! 終了経路（準備失敗・タイムアウト・送信失敗・close 通知）をすべて扱う。
//!
//! 終了は 2 段階:
//! 1. `teardown()`: ウォッチドッグ解除 → `PrepareContext::abort()` →
//!    `Dispatcher::cancel()` → `Closing`（1 セッションにつき 1 回だけ）
//! 2. `on_stream_closed()`: スロットから `take()` してセッションを破棄
//!    （2 回目の通知はスロットが空なので何もしない）

use hds_proto::{
    CloseReason, OpenMetadata, OpenRequest, RejectReason, SnapshotFormat, SnapshotMetadata, SnapshotOptions,
    SnapshotType, SnapshotTypes, UrlParameter, DEFAULT_MAX_LOG_SIZE, MAX_LOG_SIZE_LIMIT,
};
use hds_snapshot::{EventReceiver, PrepareCallbacks, PrepareContext, PrepareEvent, SnapshotPreparer};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Clock, Dispatcher, StreamHandle, Timer, TimerId, TransportKind};
use crate::error::SessionError;
use crate::stats::SessionStats;
use crate::uploader::{ChunkedUploader, TransferSizes};
use crate::watchdog::AbortWatchdog;
use crate::PREPARE_TIMEOUT_MS;

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// open を受理し、ストリームの確立待ち
    Accepting,
    /// スナップショット準備中（ウォッチドッグ稼働中）
    Preparing,
    /// チャンク送信中
    Streaming,
    /// close 通知待ち
    Closing,
}

/// `try_open` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// エンジンの能力と転送パラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// アクセサリが広告するスナップショット種別
    pub supported_types: SnapshotTypes,
    pub options: SnapshotOptions,
    /// アクセサリが決めるスナップショット形式
    pub format: SnapshotFormat,
    /// 既定の最大サイズ（maxLogSize を指定する場合の下限）
    pub default_max_log_size: u64,
    pub transfer: TransferSizes,
    pub prepare_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            supported_types: [SnapshotType::Manufacturer, SnapshotType::Adk].into_iter().collect(),
            options: SnapshotOptions::CONFIGURABLE_MAX_LOG_SIZE,
            format: SnapshotFormat::Zip,
            default_max_log_size: DEFAULT_MAX_LOG_SIZE,
            transfer: TransferSizes::FILE_BACKED,
            prepare_timeout_ms: PREPARE_TIMEOUT_MS,
        }
    }
}

/// 唯一のアクティブな転送
#[derive(Debug)]
struct DiagnosticsSession {
    stream: StreamHandle,
    transport: TransportKind,
    state: SessionState,
    metadata: SnapshotMetadata,
    prepare: Option<PrepareContext>,
    events: Option<EventReceiver<PrepareEvent>>,
    uploader: Option<ChunkedUploader>,
    /// 最終チャンク送出後に end-of-stream の ack を受け取った
    ack_received: bool,
}

/// 診断スナップショット転送の状態機械
///
/// # 型引数
/// - `D`: dataSend ディスパッチャ
/// - `T`: ウォッチドッグ用タイマー
/// - `C`: 時計
pub struct DiagnosticsSessionManager<D, T, C> {
    settings: EngineSettings,
    preparer: SnapshotPreparer,
    dispatcher: D,
    timer: T,
    clock: C,
    watchdog: AbortWatchdog,
    session: Option<DiagnosticsSession>,
    sessions_opened: u64,
    sessions_rejected: u64,
    sessions_completed: u64,
}

impl<D: Dispatcher, T: Timer, C: Clock> DiagnosticsSessionManager<D, T, C> {
    pub fn new(settings: EngineSettings, preparer: SnapshotPreparer, dispatcher: D, timer: T, clock: C) -> Self {
        let watchdog = AbortWatchdog::new(settings.prepare_timeout_ms);
        DiagnosticsSessionManager {
            settings,
            preparer,
            dispatcher,
            timer,
            clock,
            watchdog,
            session: None,
            sessions_opened: 0,
            sessions_rejected: 0,
            sessions_completed: 0,
        }
    }

    /// request:open を検証し、受理ならセッションを作る
    ///
    /// 検証順: ストリーム種別 → 使用中 → メタデータ。
    /// 結果に応じて `Dispatcher::accept` / `Dispatcher::reject` を呼ぶ。
    /// 拒否ではセッションを作らず、既存セッションにも触れない。
    ///
    /// # 引数
    /// - `stream`: ディスパッチャが割り当てたストリーム
    /// - `transport`: チャンクサイズを決めるトランスポート種別
    /// - `request`: デコード済みの request:open
    pub fn try_open(&mut self, stream: StreamHandle, transport: TransportKind, request: &OpenRequest) -> OpenOutcome {
        match self.validate_open(request) {
            Ok(metadata) => {
                self.session = Some(DiagnosticsSession {
                    stream,
                    transport,
                    state: SessionState::Accepting,
                    metadata,
                    prepare: None,
                    events: None,
                    uploader: None,
                    ack_received: false,
                });
                self.sessions_opened += 1;
                info!(
                    stream = stream.0,
                    ?transport,
                    snapshot_type = ?metadata.snapshot_type,
                    max_log_size = metadata.max_log_size,
                    "accepted diagnostics snapshot stream"
                );
                self.dispatcher.accept(stream);
                OpenOutcome::Accepted
            }
            Err(reason) => {
                self.sessions_rejected += 1;
                warn!(stream = stream.0, %reason, "rejected diagnostics snapshot stream");
                self.dispatcher.reject(stream, reason);
                OpenOutcome::Rejected(reason)
            }
        }
    }

    /// ストリームが確立した: ウォッチドッグを仕掛けて準備を始める
    pub fn on_stream_open(&mut self, stream: StreamHandle) {
        let metadata = match &self.session {
            Some(s) if s.stream == stream && s.state == SessionState::Accepting => s.metadata,
            _ => {
                debug!(stream = stream.0, "stream open for no accepting session, ignored");
                return;
            }
        };

        let now_ms = self.clock.now_ms();
        if let Err(e) = self.watchdog.arm(&mut self.timer, now_ms) {
            error!(error = %e, "cannot guard diagnostics preparation");
            self.teardown(CloseReason::UnexpectedFailure);
            return;
        }

        match self.preparer.start(metadata, now_ms) {
            Ok((ctx, events)) => {
                if let Some(session) = self.session.as_mut() {
                    session.prepare = Some(ctx);
                    session.events = Some(events);
                    session.state = SessionState::Preparing;
                }
            }
            Err(e) => {
                error!(error = %e, "failed to start diagnostics data preparation");
                self.teardown(CloseReason::UnexpectedFailure);
            }
        }
    }

    /// 届いている準備イベントを処理する（消費ループのスケジューリング点で呼ぶ）
    ///
    /// # 戻り値
    /// 処理したイベント数
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = self
                .session
                .as_ref()
                .and_then(|s| s.events.as_ref())
                .and_then(|rx| rx.try_recv().ok());
            let Some(event) = event else {
                return handled;
            };
            event.dispatch(self);
            handled += 1;
        }
    }

    /// ウォッチドッグのタイマーが発火した
    pub fn on_timer_fired(&mut self, id: TimerId) {
        if !self.watchdog.fired(id) {
            debug!(timer = id.0, "stale timer ignored");
            return;
        }
        warn!(
            timeout_ms = self.watchdog.timeout_ms(),
            "diagnostics data preparation timed out"
        );
        self.teardown(CloseReason::UnexpectedFailure);
    }

    /// 送信完了の通知
    ///
    /// # 引数
    /// - `result`: `Err` は下位層でのストリーム無効化
    pub fn on_send_complete(&mut self, stream: StreamHandle, result: Result<(), SessionError>) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.stream == stream && s.state == SessionState::Streaming)
        else {
            debug!(stream = stream.0, "send completion for no streaming session, ignored");
            return;
        };
        let Some(last) = session.uploader.as_mut().and_then(ChunkedUploader::on_send_complete) else {
            warn!(stream = stream.0, "send completion with no chunk in flight");
            return;
        };

        if let Err(e) = result {
            warn!(stream = stream.0, error = %e, "diagnostics data send failed");
            self.on_transport_invalidated(stream);
            return;
        }

        if last {
            if let Some(ctx) = &session.prepare {
                ctx.complete();
            }
            info!(
                stream = stream.0,
                bytes_sent = session.uploader.as_ref().map_or(0, ChunkedUploader::bytes_sent),
                ack_received = session.ack_received,
                "diagnostics data transfer complete"
            );
            if session.ack_received {
                self.close_normally();
            }
            return;
        }
        self.upload_next();
    }

    /// 下位層がストリームを無効化した
    pub fn on_transport_invalidated(&mut self, stream: StreamHandle) {
        if self.session.as_ref().is_some_and(|s| s.stream == stream) {
            self.teardown(CloseReason::UnexpectedFailure);
        }
    }

    /// event:ack を受け取った
    ///
    /// 最終チャンクを送出した後の `end_of_stream = true` を記録する。
    /// 最終チャンクの送信完了と ack の、後に来た方で close(Normal) する。
    pub fn on_ack(&mut self, stream: StreamHandle, end_of_stream: bool) {
        let Some(session) = self.session.as_mut().filter(|s| s.stream == stream) else {
            debug!(stream = stream.0, "ack for unknown stream, ignored");
            return;
        };
        if !end_of_stream {
            debug!(stream = stream.0, "intermediate ack");
            return;
        }
        let eof = match (&session.state, &session.uploader) {
            (SessionState::Streaming, Some(uploader)) if uploader.is_eof_sent() => uploader,
            _ => {
                warn!(stream = stream.0, state = ?session.state, "end-of-stream ack outside final chunk, ignored");
                return;
            }
        };
        if eof.is_in_flight() {
            debug!(stream = stream.0, "end-of-stream ack before last send completed");
            session.ack_received = true;
            return;
        }
        self.close_normally();
    }

    /// ストリームが閉じた: セッションを破棄してスロットを空にする
    ///
    /// 同じストリームの 2 回目以降の通知は何もしない。
    pub fn on_stream_closed(&mut self, stream: StreamHandle, reason: CloseReason) {
        if !self.session.as_ref().is_some_and(|s| s.stream == stream) {
            debug!(stream = stream.0, %reason, "close for no active session, ignored");
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };

        if self.watchdog.disarm(&mut self.timer) {
            debug!("stream closed while preparation was guarded");
        }
        if let Some(ctx) = &session.prepare {
            ctx.abort();
        }
        info!(stream = stream.0, %reason, state = ?session.state, "diagnostics stream closed");
    }

    pub fn stats(&self) -> SessionStats {
        let uploader = self.session.as_ref().and_then(|s| s.uploader.as_ref());
        SessionStats {
            state: self.state(),
            sequence_number: uploader.map_or(0, ChunkedUploader::sequence_number),
            bytes_sent: uploader.map_or(0, ChunkedUploader::bytes_sent),
            remaining_bytes: uploader.map_or(0, ChunkedUploader::remaining_bytes),
            sessions_opened: self.sessions_opened,
            sessions_rejected: self.sessions_rejected,
            sessions_completed: self.sessions_completed,
        }
    }

    pub fn state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|s| s.state)
    }

    pub fn active_stream(&self) -> Option<StreamHandle> {
        self.session.as_ref().map(|s| s.stream)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    // ===== Private メソッド =====

    fn validate_open(&self, request: &OpenRequest) -> Result<SnapshotMetadata, RejectReason> {
        if !request.is_diagnostics_snapshot() {
            warn!(stream_type = %request.r#type, "unsupported stream type");
            return Err(RejectReason::Unsupported);
        }
        if self.session.is_some() {
            warn!("diagnostics session already in progress");
            return Err(RejectReason::Busy);
        }
        let requested = request.metadata_or_err().map_err(|e| {
            warn!(error = %e, "invalid open request");
            RejectReason::InvalidConfiguration
        })?;
        self.validate_metadata(&requested)
    }

    /// open メタデータを検証し、実効値に直す
    fn validate_metadata(&self, requested: &OpenMetadata) -> Result<SnapshotMetadata, RejectReason> {
        let min = self.settings.default_max_log_size;
        if requested.max_log_size != 0 {
            if !self
                .settings
                .options
                .contains(SnapshotOptions::CONFIGURABLE_MAX_LOG_SIZE)
            {
                warn!(
                    max_log_size = requested.max_log_size,
                    "max log size is not configurable"
                );
                return Err(RejectReason::InvalidConfiguration);
            }
            if requested.max_log_size < min || requested.max_log_size > MAX_LOG_SIZE_LIMIT {
                warn!(
                    max_log_size = requested.max_log_size,
                    min,
                    max = MAX_LOG_SIZE_LIMIT,
                    "requested max log size out of range"
                );
                return Err(RejectReason::InvalidConfiguration);
            }
        }

        let snapshot_type = SnapshotType::from_bits(requested.snapshot_type)
            .filter(|ty| self.settings.supported_types.contains(*ty))
            .ok_or_else(|| {
                warn!(
                    requested = requested.snapshot_type,
                    supported = self.settings.supported_types.bits(),
                    "unsupported snapshot type"
                );
                RejectReason::InvalidConfiguration
            })?;

        Ok(SnapshotMetadata::new(
            requested.max_log_size.max(min),
            snapshot_type,
            self.settings.format,
        ))
    }

    fn ready(&mut self, size: u64, url_parameters: Option<Vec<UrlParameter>>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state != SessionState::Preparing {
            debug!(state = ?session.state, "ready event outside preparation, ignored");
            return;
        }
        self.watchdog.disarm(&mut self.timer);
        session.state = SessionState::Streaming;
        session.uploader = Some(ChunkedUploader::new(
            session.stream,
            &self.settings.transfer,
            session.transport,
            size,
            url_parameters,
        ));
        info!(stream = session.stream.0, size, "streaming diagnostics snapshot");
        self.upload_next();
    }

    fn upload_next(&mut self) {
        let result = match self.session.as_mut() {
            Some(DiagnosticsSession {
                state: SessionState::Streaming,
                prepare: Some(ctx),
                uploader: Some(uploader),
                ..
            }) => uploader.upload_next(ctx, &mut self.dispatcher),
            _ => return,
        };
        if let Err(e) = result {
            error!(error = %e, "failed to upload diagnostics chunk");
            self.teardown(CloseReason::UnexpectedFailure);
        }
    }

    /// 転送を正常終了させる（ack と最終チャンクの送信完了がそろったとき）
    fn close_normally(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state != SessionState::Streaming {
            return;
        }
        session.state = SessionState::Closing;
        self.sessions_completed += 1;
        info!(stream = session.stream.0, "diagnostics snapshot acknowledged, closing stream");
        self.dispatcher.cancel(session.stream, CloseReason::Normal);
    }

    /// セッションを異常終了させる（Closing 以降は何もしない）
    fn teardown(&mut self, reason: CloseReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == SessionState::Closing {
            return;
        }
        self.watchdog.disarm(&mut self.timer);
        if let Some(ctx) = &session.prepare {
            ctx.abort();
        }
        session.state = SessionState::Closing;
        warn!(stream = session.stream.0, %reason, "cancelling diagnostics stream");
        self.dispatcher.cancel(session.stream, reason);
    }
}

impl<D: Dispatcher, T: Timer, C: Clock> PrepareCallbacks for DiagnosticsSessionManager<D, T, C> {
    fn on_ready(&mut self, size: u64, url_parameters: Option<Vec<UrlParameter>>) {
        self.ready(size, url_parameters);
    }

    fn on_cancel(&mut self) {
        match self.state() {
            Some(SessionState::Preparing) => {
                warn!("diagnostics data preparation failed");
                self.teardown(CloseReason::UnexpectedFailure);
            }
            state => debug!(?state, "cancel event outside preparation, ignored"),
        }
    }
}
