//! 診断エンジンの設定
//!
//! TOML の各セクションはすべて省略可能で、省略時は既定値になる。
//!
//! ```toml
//! [logging]
//! filter = "info,hds_session=debug"
//!
//! [snapshot]
//! backend = "files"          # files | log-buffer
//! format = "zip"             # zip | text
//! supported_types = ["manufacturer", "adk"]
//!
//! [storage]
//! folder = "/var/lib/accessory/diagnostics"
//! log_capture_mib = 5
//!
//! [[url_parameters]]
//! key = "MAC"
//! value = "00:11:22:33:44:55"
//! ```

use std::path::{Path, PathBuf};

use hds_logbuf::EVICTION_GRANULE;
use hds_proto::{
    SnapshotFormat, SnapshotOptions, SnapshotType, SnapshotTypes, UrlParameter, MAX_LOG_SIZE_LIMIT, MIB,
};
use hds_session::{EngineSettings, TransferSizes, PREPARE_TIMEOUT_MS};
use hds_snapshot::{StorageLayout, DEFAULT_SIZE_TOLERANCE};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 設定全体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Manufacturer スナップショットに付ける固定パラメータ
    #[serde(default)]
    pub url_parameters: Vec<UrlParameterConfig>,
}

impl DiagnosticsConfig {
    /// TOML ファイルから読み込む
    ///
    /// # エラー
    /// - `ConfigError::Io`: 読み込み失敗
    /// - `ConfigError::Parse`: TOML として不正
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// 組み合わせとして成り立たない値を弾く
    ///
    /// # エラー
    /// - `ConfigError::Validation`: 最初に見つかった問題
    pub fn validate(&self) -> Result<(), ConfigError> {
        let snapshot = &self.snapshot;
        if snapshot.supported_types.is_empty() {
            return invalid("snapshot.supported_types must not be empty");
        }
        let default_max = snapshot.default_max_log_size_mib.checked_mul(MIB);
        if snapshot.default_max_log_size_mib == 0 || default_max.map_or(true, |max| max > MAX_LOG_SIZE_LIMIT) {
            return invalid("snapshot.default_max_log_size_mib must be between 1 and 1024");
        }
        if !(snapshot.size_tolerance > 0.0 && snapshot.size_tolerance <= 1.0) {
            return invalid("snapshot.size_tolerance must be in (0, 1]");
        }

        match snapshot.backend {
            SnapshotBackend::Files => {
                if self.storage.num_log_files == 0 {
                    return invalid("storage.num_log_files must be at least 1");
                }
                if self.storage.log_capture_mib == 0 {
                    return invalid("storage.log_capture_mib must be at least 1");
                }
                if self.storage.log_file_name.is_empty() {
                    return invalid("storage.log_file_name must not be empty");
                }
            }
            SnapshotBackend::LogBuffer => {
                if snapshot.format == SnapshotFormat::Zip {
                    return invalid("the log-buffer backend only produces text snapshots");
                }
                if self.buffer.capacity_bytes < EVICTION_GRANULE {
                    return Err(ConfigError::Validation(format!(
                        "buffer.capacity_bytes must be at least {EVICTION_GRANULE}"
                    )));
                }
            }
        }

        let sizes = self.transfer_sizes();
        if sizes.stream_chunk_bytes == 0 || sizes.low_mtu_chunk_bytes == 0 {
            return invalid("transfer chunk sizes must not be zero");
        }
        if sizes.stream_chunk_bytes >= sizes.scratch_bytes || sizes.low_mtu_chunk_bytes >= sizes.scratch_bytes {
            return invalid("transfer.scratch_bytes must exceed every chunk size");
        }
        if self.transfer.prepare_timeout_secs == 0 {
            return invalid("transfer.prepare_timeout_secs must not be zero");
        }
        Ok(())
    }

    /// セッションマネージャ用の設定
    pub fn engine_settings(&self) -> EngineSettings {
        let options = if self.snapshot.configurable_max_log_size {
            SnapshotOptions::CONFIGURABLE_MAX_LOG_SIZE
        } else {
            SnapshotOptions::none()
        };
        EngineSettings {
            supported_types: self.supported_types(),
            options,
            format: self.snapshot.format,
            default_max_log_size: self.snapshot.default_max_log_size_mib * MIB,
            transfer: self.transfer_sizes(),
            prepare_timeout_ms: self.transfer.prepare_timeout_secs.saturating_mul(1000),
        }
    }

    pub fn supported_types(&self) -> SnapshotTypes {
        self.snapshot.supported_types.iter().copied().collect()
    }

    /// バックエンドの既定値に個別指定を上書きしたチャンク・スクラッチの大きさ
    pub fn transfer_sizes(&self) -> TransferSizes {
        let preset = match self.snapshot.backend {
            SnapshotBackend::Files => TransferSizes::FILE_BACKED,
            SnapshotBackend::LogBuffer => TransferSizes::CONSTRAINED,
        };
        TransferSizes {
            stream_chunk_bytes: self.transfer.stream_chunk_bytes.unwrap_or(preset.stream_chunk_bytes),
            low_mtu_chunk_bytes: self.transfer.low_mtu_chunk_bytes.unwrap_or(preset.low_mtu_chunk_bytes),
            scratch_bytes: self.transfer.scratch_bytes.unwrap_or(preset.scratch_bytes),
        }
    }

    pub fn storage_layout(&self) -> StorageLayout {
        let storage = &self.storage;
        StorageLayout {
            folder: storage.folder.clone(),
            log_file_name: storage.log_file_name.clone(),
            num_log_files: storage.num_log_files,
            excluded_folders: storage.excluded_folders.clone(),
            zip_file: storage.zip_file.clone(),
            text_file: storage.text_file.clone(),
        }
    }

    pub fn url_parameters(&self) -> Vec<UrlParameter> {
        self.url_parameters
            .iter()
            .map(|p| UrlParameter::new(p.key.as_str(), p.value.as_str()))
            .collect()
    }
}

fn invalid<T>(message: &str) -> Result<T, ConfigError> {
    Err(ConfigError::Validation(message.to_owned()))
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` の既定ディレクティブ（`RUST_LOG` が優先）
    #[serde(default = "default_filter")]
    pub filter: String,
    /// アクセサリのログを診断ストアにも書き込むか
    #[serde(default = "default_true")]
    pub capture: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: default_filter(),
            capture: true,
        }
    }
}

/// スナップショットの保存先の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotBackend {
    /// 診断フォルダ + ローテーションログ
    #[default]
    Files,
    /// メモリ上のリングバッファ
    LogBuffer,
}

/// `[snapshot]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub backend: SnapshotBackend,
    #[serde(default)]
    pub format: SnapshotFormat,
    #[serde(default = "default_supported_types")]
    pub supported_types: Vec<SnapshotType>,
    /// コントローラによる maxLogSize 指定を許すか
    #[serde(default = "default_true")]
    pub configurable_max_log_size: bool,
    #[serde(default = "default_max_log_size_mib")]
    pub default_max_log_size_mib: u64,
    /// 連結ログを最大サイズのこの割合まで削る
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: f64,
    /// テキスト形式の末尾に付けるアクセサリ構成
    #[serde(default)]
    pub accessory_config: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            backend: SnapshotBackend::default(),
            format: SnapshotFormat::default(),
            supported_types: default_supported_types(),
            configurable_max_log_size: true,
            default_max_log_size_mib: default_max_log_size_mib(),
            size_tolerance: default_size_tolerance(),
            accessory_config: String::new(),
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_folder")]
    pub folder: PathBuf,
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
    #[serde(default = "default_num_log_files")]
    pub num_log_files: usize,
    /// 全セグメント合計の大きさ
    #[serde(default = "default_log_capture_mib")]
    pub log_capture_mib: u64,
    /// Manufacturer スナップショットから外すサブフォルダ
    #[serde(default = "default_excluded_folders")]
    pub excluded_folders: Vec<String>,
    #[serde(default = "default_zip_file")]
    pub zip_file: PathBuf,
    #[serde(default = "default_text_file")]
    pub text_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            folder: default_folder(),
            log_file_name: default_log_file_name(),
            num_log_files: default_num_log_files(),
            log_capture_mib: default_log_capture_mib(),
            excluded_folders: default_excluded_folders(),
            zip_file: default_zip_file(),
            text_file: default_text_file(),
        }
    }
}

/// `[buffer]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            capacity_bytes: default_capacity_bytes(),
        }
    }
}

/// `[transfer]`
///
/// チャンク・スクラッチは省略時にバックエンドの既定値を使う。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_chunk_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_mtu_chunk_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_bytes: Option<usize>,
    #[serde(default = "default_prepare_timeout_secs")]
    pub prepare_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            stream_chunk_bytes: None,
            low_mtu_chunk_bytes: None,
            scratch_bytes: None,
            prepare_timeout_secs: default_prepare_timeout_secs(),
        }
    }
}

/// `[[url_parameters]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlParameterConfig {
    pub key: String,
    pub value: String,
}

fn default_filter() -> String {
    "info".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_supported_types() -> Vec<SnapshotType> {
    vec![SnapshotType::Manufacturer, SnapshotType::Adk]
}

fn default_max_log_size_mib() -> u64 {
    5
}

fn default_size_tolerance() -> f64 {
    DEFAULT_SIZE_TOLERANCE
}

fn default_folder() -> PathBuf {
    PathBuf::from("diagnostics")
}

fn default_log_file_name() -> String {
    "adk.log".to_owned()
}

fn default_num_log_files() -> usize {
    4
}

fn default_log_capture_mib() -> u64 {
    5
}

fn default_excluded_folders() -> Vec<String> {
    vec!["audio".to_owned(), "bt".to_owned()]
}

fn default_zip_file() -> PathBuf {
    PathBuf::from("diagnostics.zip")
}

fn default_text_file() -> PathBuf {
    PathBuf::from("diagnostics.txt")
}

fn default_capacity_bytes() -> usize {
    16 * 1024
}

fn default_prepare_timeout_secs() -> u64 {
    PREPARE_TIMEOUT_MS / 1000
}
