//! スナップショットのメタデータ（種別・フォーマット・オプション）

use serde::{Deserialize, Serialize};

/// スナップショット種別（open メタデータの snapshotType の 1 ビット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    /// メーカー診断（URL パラメータ付き、除外フォルダあり）
    Manufacturer,
    /// ADK 診断（フォルダ全体、URL パラメータなし）
    Adk,
}

impl SnapshotType {
    /// ビット値
    pub const fn bits(self) -> u32 {
        match self {
            SnapshotType::Manufacturer => 1 << 0,
            SnapshotType::Adk => 1 << 1,
        }
    }

    /// ちょうど 1 ビットだけ立った既知の値から種別を得る
    ///
    /// 複数ビット・未知ビット・0 は `None`。
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            b if b == SnapshotType::Manufacturer.bits() => Some(SnapshotType::Manufacturer),
            b if b == SnapshotType::Adk.bits() => Some(SnapshotType::Adk),
            _ => None,
        }
    }
}

/// アクセサリが広告するサポート種別の集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotTypes(u32);

impl SnapshotTypes {
    pub const fn empty() -> Self {
        SnapshotTypes(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        SnapshotTypes(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// 種別を加えた集合を返す
    pub const fn with(self, ty: SnapshotType) -> Self {
        SnapshotTypes(self.0 | ty.bits())
    }

    pub const fn contains(self, ty: SnapshotType) -> bool {
        self.0 & ty.bits() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<SnapshotType> for SnapshotTypes {
    fn from_iter<I: IntoIterator<Item = SnapshotType>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SnapshotTypes::empty(), |acc, ty| acc.with(ty))
    }
}

/// スナップショットの形式（アクセサリ側が決める）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    /// フォルダを zip アーカイブにまとめる
    #[default]
    Zip,
    /// 連結したログをそのままテキストで送る
    Text,
}

/// エンジンの能力フラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotOptions(u32);

impl SnapshotOptions {
    /// コントローラが maxLogSize を指定できる
    pub const CONFIGURABLE_MAX_LOG_SIZE: SnapshotOptions = SnapshotOptions(1 << 1);

    pub const fn none() -> Self {
        SnapshotOptions(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SnapshotOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for SnapshotOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        SnapshotOptions(self.0 | rhs.0)
    }
}

/// 検証済みの open パラメータ
///
/// `max_log_size` は既に実効値（要求値とエンジン既定の大きい方）になっている。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub max_log_size: u64,
    pub snapshot_type: SnapshotType,
    pub format: SnapshotFormat,
}

impl SnapshotMetadata {
    pub fn new(max_log_size: u64, snapshot_type: SnapshotType, format: SnapshotFormat) -> Self {
        SnapshotMetadata {
            max_log_size,
            snapshot_type,
            format,
        }
    }
}
