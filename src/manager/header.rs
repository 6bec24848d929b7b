use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use trackable::error::ErrorKindExt;
use uuid::Uuid;

use crate::size_class::SizeClassTable;
use crate::{ErrorKind, Result};

/// ヘッダファイルの先頭に書き込まれるマジックナンバー.
pub const MAGIC_NUMBER: [u8; 4] = *b"pmhp";

/// ストアフォーマットのメジャーバージョン.
pub const MAJOR_VERSION: u16 = 1;

/// ストアフォーマットのマイナーバージョン.
pub const MINOR_VERSION: u16 = 0;

/// ヘッダを表現するのに必要なバイト数.
const HEADER_SIZE: u16 =
    2 /* major_version */ +
    2 /* minor_version */ +
    16 /* UUID */ +
    8 /* chunk_size */ +
    8 /* max_size */ +
    4 /* num_classes */;

/// ストアのヘッダ情報.
///
/// ストアの作成時に書き込まれ、以後は変更されない.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    /// メジャーバージョン.
    ///
    /// メジャーバージョンが異なるストア同士のデータ形式には互換性が無い.
    ///
    /// なお、オブジェクトディレクトリに記録される型タグは`std::any::type_name`に基づくため、
    /// バージョンが同じでも、異なるツールチェインでビルドした場合には、
    /// `Key::Unique`や型付きの検索が既存のオブジェクトを見つけられなくなることがある.
    pub major_version: u16,

    /// マイナーバージョン.
    ///
    /// マイナーバージョンには、後方互換性がある.
    pub minor_version: u16,

    /// ストアの特定のインスタンスを識別するためのUUID.
    pub instance_uuid: Uuid,

    /// チャンクサイズ(バイト単位).
    pub chunk_size: u64,

    /// 一回の割当で要求可能な最大サイズ(バイト単位).
    pub max_size: u64,

    /// 小オブジェクト用のサイズクラスの数.
    ///
    /// サイズクラスの刻み方が変わっていないかの検証に使われる.
    pub num_classes: u32,
}
impl StoreHeader {
    /// 現在のバージョンのヘッダを生成する.
    pub fn new(instance_uuid: Uuid, table: &SizeClassTable) -> Self {
        StoreHeader {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            instance_uuid,
            chunk_size: table.chunk_size(),
            max_size: table.max_size(),
            num_classes: table.num_classes() as u32,
        }
    }

    /// ヘッダに記録されたパラメータからサイズクラステーブルを構築する.
    ///
    /// クラス数が一致しない場合には`ErrorKind::StorageCorrupted`エラーが返される.
    pub fn size_class_table(&self) -> Result<SizeClassTable> {
        let table = track!(SizeClassTable::new(self.chunk_size, self.max_size)
            .map_err(|e| ErrorKind::StorageCorrupted.cause(e)))?;
        track_assert_eq!(
            table.num_classes() as u32,
            self.num_classes,
            ErrorKind::StorageCorrupted,
            "Incompatible size class table"
        );
        Ok(table)
    }

    /// ヘッダ情報を`reader`から読み込む.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        // magic number
        let mut magic_number = [0; 4];
        track_io!(reader.read_exact(&mut magic_number))?;
        track_assert_eq!(magic_number, MAGIC_NUMBER, ErrorKind::StorageCorrupted);

        // header size
        let header_size = track_io!(reader.read_u16::<BigEndian>())?;
        let mut reader = reader.take(u64::from(header_size));

        // versions
        let major_version = track_io!(reader.read_u16::<BigEndian>())?;
        let minor_version = track_io!(reader.read_u16::<BigEndian>())?;
        track_assert_eq!(
            major_version,
            MAJOR_VERSION,
            ErrorKind::StorageCorrupted,
            "Unsupported major version",
        );
        track_assert!(
            minor_version <= MINOR_VERSION,
            ErrorKind::StorageCorrupted,
            "Unsupported minor version: actual={}, supported={}",
            minor_version,
            MINOR_VERSION
        );

        // UUID
        let mut instance_uuid = [0; 16];
        track_io!(reader.read_exact(&mut instance_uuid))?;
        let instance_uuid = Uuid::from_bytes(instance_uuid);

        // parameters
        let chunk_size = track_io!(reader.read_u64::<BigEndian>())?;
        let max_size = track_io!(reader.read_u64::<BigEndian>())?;
        let num_classes = track_io!(reader.read_u32::<BigEndian>())?;

        track_assert_eq!(reader.limit(), 0, ErrorKind::StorageCorrupted);
        Ok(StoreHeader {
            major_version,
            minor_version,
            instance_uuid,
            chunk_size,
            max_size,
            num_classes,
        })
    }

    /// ヘッダ情報を`writer`に書き込む.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        track_io!(writer.write_all(&MAGIC_NUMBER[..]))?;
        track_io!(writer.write_u16::<BigEndian>(HEADER_SIZE))?;
        track_io!(writer.write_u16::<BigEndian>(self.major_version))?;
        track_io!(writer.write_u16::<BigEndian>(self.minor_version))?;
        track_io!(writer.write_all(self.instance_uuid.as_bytes()))?;
        track_io!(writer.write_u64::<BigEndian>(self.chunk_size))?;
        track_io!(writer.write_u64::<BigEndian>(self.max_size))?;
        track_io!(writer.write_u32::<BigEndian>(self.num_classes))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;
    use uuid::Uuid;

    use super::*;

    fn header(major_version: u16, minor_version: u16) -> StoreHeader {
        StoreHeader {
            major_version,
            minor_version,
            instance_uuid: Uuid::new_v4(),
            chunk_size: 1 << 21,
            max_size: 1 << 40,
            num_classes: 75,
        }
    }

    #[test]
    fn it_works() -> TestResult {
        let table = track!(SizeClassTable::new(1 << 21, 1 << 40))?;
        let header = StoreHeader::new(Uuid::new_v4(), &table);

        let mut buf = Vec::new();
        track!(header.write_to(&mut buf))?;
        assert_eq!(buf.len(), 4 + 2 + HEADER_SIZE as usize);

        let h = track!(StoreHeader::read_from(&buf[..]))?;
        assert_eq!(h, header);

        let restored = track!(h.size_class_table())?;
        assert_eq!(restored.num_classes(), table.num_classes());
        Ok(())
    }

    #[test]
    fn compatibility_check_works() -> TestResult {
        // Current version: OK
        let h = header(MAJOR_VERSION, MINOR_VERSION);
        let mut buf = Vec::new();
        track!(h.write_to(&mut buf))?;
        let h = track!(StoreHeader::read_from(&buf[..]))?;
        assert_eq!(h.minor_version, MINOR_VERSION);

        // Higher minor version: NG
        let h = header(MAJOR_VERSION, MINOR_VERSION + 1);
        let mut buf = Vec::new();
        track!(h.write_to(&mut buf))?;
        assert!(StoreHeader::read_from(&buf[..]).is_err());

        // Higher major version: NG
        let h = header(MAJOR_VERSION + 1, MINOR_VERSION);
        let mut buf = Vec::new();
        track!(h.write_to(&mut buf))?;
        assert!(StoreHeader::read_from(&buf[..]).is_err());
        Ok(())
    }

    #[test]
    fn incompatible_size_class_table() -> TestResult {
        let mut h = header(MAJOR_VERSION, MINOR_VERSION);
        h.num_classes = 3;
        assert_eq!(
            h.size_class_table().err().map(|e| *e.kind()),
            Some(ErrorKind::StorageCorrupted)
        );

        h.chunk_size = 1000;
        assert!(h.size_class_table().is_err());
        Ok(())
    }
}
