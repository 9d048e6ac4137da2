//! # hds-diagnostics
//!
//! 診断スナップショットエンジンのプロセス側の結線。
//!
//! - `config`: TOML 設定（`DiagnosticsConfig`）
//! - `service`: 設定から保存先・プリペアラ・マネージャを組み立てる `DiagnosticsService`
//! - `init_logging`: tracing subscriber の初期化（診断ストアへの tee を含む）
//!
//! ```text
//! let config = DiagnosticsConfig::from_file(path)?;
//! let service = DiagnosticsService::new(&config, dispatcher, timer, clock, Some(wake))?;
//! init_logging(&config.logging, Some(service.capture().make_writer()))?;
//! ```

pub mod config;
pub mod error;
pub mod service;

pub use config::{DiagnosticsConfig, LoggingConfig, SnapshotBackend};
pub use error::{ConfigError, DiagnosticsError};
pub use service::{CaptureSink, DiagnosticsService};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// グローバル subscriber を設定する
///
/// フィルタは `RUST_LOG` があればそれを、なければ `config.filter` を使う。
/// 標準エラーへの fmt レイヤーに加え、`capture` を渡し `config.capture` が
/// 有効なら同じイベントを ANSI なしで診断ストアにも書く。
///
/// # エラー
/// - `DiagnosticsError::Logging`: フィルタが不正、または既に初期化済み
pub fn init_logging(config: &LoggingConfig, capture: Option<BoxMakeWriter>) -> Result<(), DiagnosticsError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| DiagnosticsError::Logging(e.to_string()))?;

    let capture_layer = capture
        .filter(|_| config.capture)
        .map(|writer| tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(capture_layer)
        .try_init()
        .map_err(|e| DiagnosticsError::Logging(e.to_string()))
}
