//! # hds-logbuf
//!
//! 制約ターゲットで診断ログの保存先として使う固定容量のリングバッファ。
//!
//! ## 構造
//!
//! ```text
//!  storage: [ . . . o o o o o o . . . ]
//!                   ^head       ^tail
//!  used = tail - head (mod total)
//!  remaining = total - used
//! ```
//!
//! - 書き込みは末尾（tail）へ、読み出しは先頭（head）から（FIFO）
//! - 空きが足りないときは古いバイトから捨てる（最大 100 バイトずつ）
//! - バッファ全体より大きい書き込みは丸ごと拒否する
//! - 生成後に容量は変えない

#![no_std]
extern crate alloc;

pub mod error;
pub mod ring;

pub use error::LogBufferError;
pub use ring::CircularLogBuffer;

/// 追い出し 1 回あたりの最大バイト数
pub const EVICTION_GRANULE: usize = 100;
