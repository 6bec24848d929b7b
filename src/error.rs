use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(e) = e.get_ref().and_then(|e| e.downcast_ref::<Error>()).cloned() {
            e
        } else if e.kind() == std::io::ErrorKind::InvalidInput {
            ErrorKind::InvalidInput.cause(e).into()
        } else {
            ErrorKind::Io.cause(e).into()
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        if *e.kind() == ErrorKind::InvalidInput {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        } else {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }
    }
}
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ErrorKind::InconsistentState.cause(e.to_string()).into()
    }
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// セグメントに空き領域がなく、拡張もできない.
    ///
    /// 予約済みの仮想アドレス空間を使い切った場合や、
    /// ファイルシステムの容量不足等でバッキングファイルを拡張できなかった場合に返される.
    ///
    /// # 典型的な対応策
    ///
    /// - 不要なオブジェクトを解放してからリトライする
    /// - より小さいサイズで割当を試みる
    /// - `ManagerBuilder::vm_reserve_size`を増やしてストアを開き直す
    OutOfSpace,

    /// 同じキーを持つオブジェクトが既にディレクトリに登録されている.
    ///
    /// 名前付きオブジェクトおよびユニークオブジェクトの構築時にのみ返される.
    ///
    /// # 典型的な対応策
    ///
    /// - `find`や`find_or_construct`を代わりに使う
    /// - 別のキーを選ぶ
    KeyAlreadyExists,

    /// ストアが正常にクローズされていない.
    ///
    /// 前回のセッションが異常終了した(またはまだ開かれたままである)ことを示している.
    /// 管理データとセグメントの内容が食い違っている可能性がある.
    ///
    /// # 典型的な対応策
    ///
    /// - スナップショット等から復旧する
    /// - 内容を検証した上で`ManagerBuilder::accept_inconsistent`を指定して開き直す
    InconsistentStore,

    /// 指定されたパスにストアが存在しない.
    StoreNotFound,

    /// 指定されたパスに既にストアが存在する.
    StoreAlreadyExists,

    /// ストアの管理データが破損している.
    ///
    /// マジックナンバーやチェックサムの検証に失敗した場合、
    /// あるいはヘッダに記録されたパラメータとこのビルドの互換性がない場合に返される.
    ///
    /// # 典型的な対応策
    ///
    /// - もし人手で復旧可能な場合には復旧する
    /// - それが無理であれば、諦めてストアを削除する
    StorageCorrupted,

    /// 入力が不正.
    ///
    /// 読み込み専用で開いたストアに対する更新操作も、このエラーとなる.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// プログラムにバグがあることを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    InconsistentState,

    /// 下位のストレージ(ファイルやメモリマッピング)の操作に失敗した.
    ///
    /// 現在の操作は失敗扱いとなる.
    /// 永続化できない状態で更新を続けるのは危険なので、以後はストアの使用を中止するのが望ましい.
    Io,
}
impl trackable::error::ErrorKind for ErrorKind {}
