//! Persistent Heap.
//!
//! `permheap`は、メモリマップドファイル上に構築された永続ヒープ.
//!
//! # 特徴
//!
//! - ファイル群をアドレス空間にマッピングした「セグメント」から、任意サイズの領域を割り当てる
//! - 割り当てたオブジェクトは、ストアのクローズ後も保持され、次回のオープン時にそのまま利用可能
//! - オブジェクトを名前(または型)で登録・検索するためのディレクトリを備える
//! - セグメントはバッキングファイルを追加することで伸長し、既存のオブジェクトのアドレスは変わらない
//! - オブジェクトキャッシュが無効であれば、同じ順序の要求に対して常に同じオフセットが割り当てられる
//! - ストアが正常にクローズされたかどうかを記録し、異常終了を検出できる
//!
//! # モジュールの依存関係
//!
//! ```text
//! partition => manager => {allocator, directory, consistency} => segment
//!                          allocator => size_class
//! ```
//!
//! - [manager]モジュール:
//!   - 主に[Manager]構造体を提供
//!   - `permheap`の利用者が直接触るのはこの構造体
//!   - ストアのライフサイクルと、割当・オブジェクト操作の入口を担当する
//! - [allocator]モジュール:
//!   - セグメント内のチャンクとスロットの割当を担当する
//!   - [size_class]モジュールが定めるサイズクラスに基づいて、小オブジェクトと大オブジェクトを振り分ける
//! - [directory]モジュール:
//!   - キー付きオブジェクトの索引
//! - [consistency]モジュール:
//!   - ストアが正常にクローズされたかどうかのマーク
//! - [segment]モジュール:
//!   - 予約済みの仮想アドレス空間と、そこにマッピングされるバッキングファイル群
//! - [collections]モジュール:
//!   - セグメント内に格納可能な型を表す[Persistent]トレイトと、オフセットベースのコンテナ
//! - [partition]モジュール:
//!   - 複数の参加者でストアを分割して保持するための層
//!
//! # ディスク上のレイアウト
//!
//! ```text
//! <path>/datastore/header                ヘッダ (マジックナンバー"pmhp"、バージョン、パラメータ、UUID)
//! <path>/datastore/segment-000000 ...    セグメントのバッキングファイル群
//! <path>/datastore/chunk_directory       チャンクの状態とスロットのビットマップ
//! <path>/datastore/object_directory      オブジェクトディレクトリ
//! <path>/datastore/properly_closed_mark  存在すれば正常にクローズされている
//! ```
//!
//! [manager]: ./manager/index.html
//! [Manager]: ./manager/struct.Manager.html
//! [allocator]: ./allocator/index.html
//! [size_class]: ./size_class/index.html
//! [directory]: ./directory/index.html
//! [consistency]: ./consistency/index.html
//! [segment]: ./segment/index.html
//! [collections]: ./collections/index.html
//! [Persistent]: ./collections/trait.Persistent.html
//! [partition]: ./partition/index.html
#![warn(missing_docs)]
extern crate adler32;
extern crate byteorder;
#[cfg(feature = "futures")]
extern crate futures;
extern crate libc;
extern crate prometrics;
#[cfg(test)]
extern crate tempdir;
#[macro_use]
extern crate trackable;
extern crate uuid;
#[macro_use]
extern crate slog;

pub use crate::collections::{Persistent, SegmentVec};
pub use crate::error::{Error, ErrorKind};
pub use crate::manager::{Key, Manager, ManagerBuilder};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod allocator;
pub mod collections;
pub mod consistency;
pub mod directory;
pub mod manager;
pub mod metrics;
pub mod partition;
pub mod segment;
pub mod size_class;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
