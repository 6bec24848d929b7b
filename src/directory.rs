//! Persistent Object Directory.
//!
//! セグメント内に構築されたオブジェクトを、キーから引くための索引.
//!
//! キーには以下の三種類がある:
//!
//! - 名前付き: 任意の文字列. 型に関わらず、同じ名前のオブジェクトは一つしか登録できない
//! - ユニーク: 型そのものがキーとなる. 一つの型につき一つのみ
//! - 匿名: 検索はできず、オフセットでのみ追跡される
//!
//! ディレクトリはメモリ上に保持され、ストアのクローズ(またはフラッシュ)時にファイルに書き出される.
use adler32::RollingAdler32;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use trackable::error::ErrorKindExt;

use crate::{ErrorKind, Result};

/// オブジェクトディレクトリファイルの先頭に書き込まれるマジックナンバー.
const MAGIC_NUMBER: [u8; 4] = *b"pmod";

/// オブジェクトディレクトリのフォーマットバージョン.
const FORMAT_VERSION: u16 = 1;

const KIND_NAMED: u8 = 0;
const KIND_UNIQUE: u8 = 1;
const KIND_ANONYMOUS: u8 = 2;

/// ディレクトリのエントリを識別するためのキー.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKey {
    /// 名前付きオブジェクト.
    Named(String),

    /// ユニークオブジェクト (値は型タグ).
    Unique(String),

    /// 匿名オブジェクト (値はオブジェクトのオフセット).
    Anonymous(u64),
}

/// ディレクトリのエントリ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// オブジェクトの型を識別するためのタグ.
    pub type_tag: String,

    /// オブジェクトのセグメント内でのオフセット.
    pub offset: u64,

    /// 要素数 (配列ではない場合は`1`).
    pub length: u64,
}

/// オブジェクトディレクトリ.
#[derive(Debug, Clone, Default)]
pub struct ObjectDirectory {
    named: BTreeMap<String, ObjectEntry>,
    unique: BTreeMap<String, ObjectEntry>,
    anonymous: BTreeMap<u64, ObjectEntry>,
    offset_to_key: BTreeMap<u64, EntryKey>,
}
impl ObjectDirectory {
    /// 空のディレクトリを生成する.
    pub fn new() -> Self {
        Self::default()
    }

    /// エントリを登録する.
    ///
    /// # Errors
    ///
    /// `key`が既に登録済みの場合には`ErrorKind::KeyAlreadyExists`エラーが返される.
    ///
    /// 同じオフセットを持つエントリが既に存在する場合には`ErrorKind::InconsistentState`エラーが返される.
    pub fn insert(&mut self, key: EntryKey, entry: ObjectEntry) -> Result<()> {
        track_assert!(
            !self.contains(&key),
            ErrorKind::KeyAlreadyExists,
            "key={:?}",
            key
        );
        track_assert!(
            !self.offset_to_key.contains_key(&entry.offset),
            ErrorKind::InconsistentState,
            "Duplicate offset: {}",
            entry.offset
        );
        if let EntryKey::Anonymous(offset) = &key {
            track_assert_eq!(*offset, entry.offset, ErrorKind::InvalidInput);
        }

        self.offset_to_key.insert(entry.offset, key.clone());
        match key {
            EntryKey::Named(name) => {
                self.named.insert(name, entry);
            }
            EntryKey::Unique(tag) => {
                self.unique.insert(tag, entry);
            }
            EntryKey::Anonymous(offset) => {
                self.anonymous.insert(offset, entry);
            }
        }
        Ok(())
    }

    /// `key`が登録済みかどうか.
    pub fn contains(&self, key: &EntryKey) -> bool {
        self.get(key).is_some()
    }

    /// `key`に対応するエントリを返す.
    pub fn get(&self, key: &EntryKey) -> Option<&ObjectEntry> {
        match key {
            EntryKey::Named(name) => self.named.get(name),
            EntryKey::Unique(tag) => self.unique.get(tag),
            EntryKey::Anonymous(offset) => self.anonymous.get(offset),
        }
    }

    /// `key`に対応するエントリを削除する.
    pub fn remove(&mut self, key: &EntryKey) -> Option<ObjectEntry> {
        let entry = match key {
            EntryKey::Named(name) => self.named.remove(name),
            EntryKey::Unique(tag) => self.unique.remove(tag),
            EntryKey::Anonymous(offset) => self.anonymous.remove(offset),
        }?;
        self.offset_to_key.remove(&entry.offset);
        Some(entry)
    }

    /// `offset`に配置されているオブジェクトのキーを返す.
    pub fn key_of(&self, offset: u64) -> Option<&EntryKey> {
        self.offset_to_key.get(&offset)
    }

    /// 名前付きオブジェクトの数.
    pub fn num_named(&self) -> usize {
        self.named.len()
    }

    /// ユニークオブジェクトの数.
    pub fn num_unique(&self) -> usize {
        self.unique.len()
    }

    /// 匿名オブジェクトの数.
    pub fn num_anonymous(&self) -> usize {
        self.anonymous.len()
    }

    /// 名前付きオブジェクトを名前の昇順で返す.
    pub fn named(&self) -> impl Iterator<Item = (&str, &ObjectEntry)> {
        self.named.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// ユニークオブジェクトを型タグの昇順で返す.
    pub fn unique(&self) -> impl Iterator<Item = (&str, &ObjectEntry)> {
        self.unique.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// 全てのエントリを返す.
    pub fn entries(&self) -> impl Iterator<Item = (EntryKey, &ObjectEntry)> {
        let named = self
            .named
            .iter()
            .map(|(k, v)| (EntryKey::Named(k.clone()), v));
        let unique = self
            .unique
            .iter()
            .map(|(k, v)| (EntryKey::Unique(k.clone()), v));
        let anonymous = self
            .anonymous
            .iter()
            .map(|(k, v)| (EntryKey::Anonymous(*k), v));
        named.chain(unique).chain(anonymous)
    }

    /// ディレクトリの内容を`writer`に書き込む.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let mut buf = Vec::new();
        track_io!(buf.write_u16::<BigEndian>(FORMAT_VERSION))?;
        track_io!(buf.write_u64::<BigEndian>(self.offset_to_key.len() as u64))?;
        for (key, entry) in self.entries() {
            match key {
                EntryKey::Named(name) => {
                    track_io!(buf.write_u8(KIND_NAMED))?;
                    track!(write_str(&mut buf, &name))?;
                }
                EntryKey::Unique(tag) => {
                    track_io!(buf.write_u8(KIND_UNIQUE))?;
                    track!(write_str(&mut buf, &tag))?;
                }
                EntryKey::Anonymous(offset) => {
                    track_io!(buf.write_u8(KIND_ANONYMOUS))?;
                    track_io!(buf.write_u64::<BigEndian>(offset))?;
                }
            }
            track!(write_str(&mut buf, &entry.type_tag))?;
            track_io!(buf.write_u64::<BigEndian>(entry.offset))?;
            track_io!(buf.write_u64::<BigEndian>(entry.length))?;
        }

        let mut adler32 = RollingAdler32::new();
        adler32.update_buffer(&buf);

        track_io!(writer.write_all(&MAGIC_NUMBER[..]))?;
        track_io!(writer.write_all(&buf))?;
        track_io!(writer.write_u32::<BigEndian>(adler32.hash()))?;
        Ok(())
    }

    /// `write_to`で書き込まれたディレクトリを`reader`から読み込む.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic_number = [0; 4];
        track_io!(reader.read_exact(&mut magic_number))?;
        track_assert_eq!(magic_number, MAGIC_NUMBER, ErrorKind::StorageCorrupted);

        let mut buf = Vec::new();
        track_io!(reader.read_to_end(&mut buf))?;
        track_assert!(buf.len() >= 4, ErrorKind::StorageCorrupted);
        let (body, checksum) = buf.split_at(buf.len() - 4);
        let mut adler32 = RollingAdler32::new();
        adler32.update_buffer(body);
        track_assert_eq!(
            adler32.hash(),
            BigEndian::read_u32(checksum),
            ErrorKind::StorageCorrupted,
            "Object directory checksum mismatch"
        );

        let mut reader = Cursor::new(body);
        let version = track_io!(reader.read_u16::<BigEndian>())?;
        track_assert_eq!(
            version,
            FORMAT_VERSION,
            ErrorKind::StorageCorrupted,
            "Unsupported object directory version"
        );
        let count = track_io!(reader.read_u64::<BigEndian>())?;

        let mut directory = ObjectDirectory::new();
        for _ in 0..count {
            let kind = track_io!(reader.read_u8())?;
            let key = match kind {
                KIND_NAMED => EntryKey::Named(track!(read_str(&mut reader))?),
                KIND_UNIQUE => EntryKey::Unique(track!(read_str(&mut reader))?),
                KIND_ANONYMOUS => EntryKey::Anonymous(track_io!(reader.read_u64::<BigEndian>())?),
                _ => track_panic!(
                    ErrorKind::StorageCorrupted,
                    "Unknown entry kind: {}",
                    kind
                ),
            };
            let type_tag = track!(read_str(&mut reader))?;
            let offset = track_io!(reader.read_u64::<BigEndian>())?;
            let length = track_io!(reader.read_u64::<BigEndian>())?;
            let entry = ObjectEntry {
                type_tag,
                offset,
                length,
            };
            track!(directory
                .insert(key, entry)
                .map_err(|e| ErrorKind::StorageCorrupted.cause(e)))?;
        }
        track_assert_eq!(
            reader.position(),
            body.len() as u64,
            ErrorKind::StorageCorrupted
        );
        Ok(directory)
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    track_assert!(
        s.len() <= u32::max_value() as usize,
        ErrorKind::InvalidInput,
        "Too long string: {} bytes",
        s.len()
    );
    track_io!(buf.write_u32::<BigEndian>(s.len() as u32))?;
    track_io!(buf.write_all(s.as_bytes()))?;
    Ok(())
}

fn read_str<R: Read>(mut reader: R) -> Result<String> {
    let len = track_io!(reader.read_u32::<BigEndian>())?;
    let mut bytes = vec![0; len as usize];
    track_io!(reader.read_exact(&mut bytes))?;
    let s = track!(String::from_utf8(bytes).map_err(|e| ErrorKind::StorageCorrupted.cause(e)))?;
    Ok(s)
}
