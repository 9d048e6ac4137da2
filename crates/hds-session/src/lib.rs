//! # hds-session
//!
//! 診断スナップショット転送セッションの状態機械。
//!
//! ## セッションの状態遷移
//!
//! ```text
//! (なし) ──try_open: 受理──▶ Accepting ──on_stream_open──▶ Preparing
//!    │                          │                             │ on_ready
//!    │ try_open: 拒否           │ close                       ▼
//!    ▼                          │                         Streaming ──EOF 送信完了 + ack──▶ Closing
//! Rejected（セッションは作らない）                            │                               │
//!                               │      on_cancel / watchdog / 送信失敗 ──▶ Closing            │
//!                               ▼                                                             ▼
//!                            (なし) ◀─────────────────── on_stream_closed ────────────────── (なし)
//! ```
//!
//! セッションは同時に 1 つだけ。2 つ目の open は待たせずに `Busy` で拒否する。
//!
//! すべての操作は単一の消費ループから呼ばれる前提で、セッション状態自体は
//! ロックしない。ワーカースレッドとの境界は `hds-snapshot` の
//! `PrepareContext` とイベントチャンネルだけ。

pub mod collaborators;
pub mod error;
pub mod manager;
pub mod stats;
pub mod uploader;
pub mod watchdog;

pub use collaborators::{Clock, Dispatcher, StreamHandle, Timer, TimerId, TransportKind};
pub use error::SessionError;
pub use manager::{DiagnosticsSessionManager, EngineSettings, OpenOutcome, SessionState};
pub use stats::SessionStats;
pub use uploader::{ChunkedUploader, TransferSizes};
pub use watchdog::AbortWatchdog;

/// ストリーム型トランスポート（IP）のチャンクサイズ
pub const STREAM_CHUNK_BYTES: usize = 400 * 1024;

/// ストリーム型トランスポートのスクラッチバッファ
///
/// チャンク本体 + event:data のエンベロープが収まる大きさ。
pub const SCRATCH_BYTES: usize = 500 * 1024;

/// 制約ターゲット（メモリ上のリングバッファ）での IP チャンクサイズ
pub const CONSTRAINED_CHUNK_BYTES: usize = 2 * 1024;

/// 制約ターゲットのスクラッチバッファ
pub const CONSTRAINED_SCRATCH_BYTES: usize = 3 * 1024;

/// 低 MTU トランスポート（BLE / Thread）のチャンクサイズ
pub const LOW_MTU_CHUNK_BYTES: usize = 1024;

/// 準備フェーズ全体の期限（15 分）
pub const PREPARE_TIMEOUT_MS: u64 = 15 * 60 * 1000;
