use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::Buf;
use rustc_hash::FxHashMap;

use crate::crtp::crtp_message::CrtpPort;
use crate::toc::toc_types::{LogVarType, ParamVarType, ValueType};
use crate::util::buf_ext::BufExt;


/// The Crazyflie has two tables of contents with the same structure: one for log variables and
///  one for parameters
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TocKind {
    Log,
    Param,
}
impl TocKind {
    pub fn port(&self) -> CrtpPort {
        match self {
            TocKind::Log => CrtpPort::Logging,
            TocKind::Param => CrtpPort::Param,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TocKind::Log => "log",
            TocKind::Param => "param",
        }
    }

    /// interprets an element's type byte, returning the value type and the access mode
    pub fn parse_type_byte(&self, type_byte: u8) -> anyhow::Result<(ValueType, Access)> {
        match self {
            TocKind::Log => {
                let var_type = LogVarType::try_from(type_byte & !LogVarType::ACCESS_FLAG)
                    .map_err(|_| anyhow!("unknown log variable type {:#04x}", type_byte))?;
                let access = if type_byte & LogVarType::ACCESS_FLAG != 0 {
                    Access::ReadWrite
                }
                else {
                    Access::ReadOnly
                };
                Ok((var_type.value_type(), access))
            }
            TocKind::Param => {
                let var_type = ParamVarType::try_from(type_byte & ParamVarType::TYPE_MASK)
                    .map_err(|_| anyhow!("unknown parameter type {:#04x}", type_byte))?;
                let access = if type_byte & ParamVarType::READ_ONLY_FLAG != 0 {
                    Access::ReadOnly
                }
                else {
                    Access::ReadWrite
                };
                Ok((var_type.value_type(), access))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TocEntry {
    pub id: u16,
    pub group: String,
    pub name: String,
    /// the raw type byte including flags, kept for writing the cache
    pub type_byte: u8,
    pub value_type: ValueType,
    pub access: Access,
}
impl TocEntry {
    /// Decodes the part of a TOC element reply after the command byte:
    ///
    /// ```ascii
    /// 0:     id (u8 or u16 LE)
    /// 1 / 2: type byte
    /// *:     group, null terminated
    /// *:     name, null terminated
    /// ```
    pub fn decode(kind: TocKind, wide_ids: bool, buf: &mut impl Buf) -> anyhow::Result<TocEntry> {
        let id = buf.try_read_id(wide_ids)?;
        let type_byte = buf.try_read_u8()?;
        let group = buf.try_read_cstring()?;
        let name = buf.try_read_cstring()?;
        Self::new(kind, id, type_byte, group, name)
    }

    pub fn new(kind: TocKind, id: u16, type_byte: u8, group: String, name: String) -> anyhow::Result<TocEntry> {
        let (value_type, access) = kind.parse_type_byte(type_byte)?;
        Ok(TocEntry {
            id,
            group,
            name,
            type_byte,
            value_type,
            access,
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }

    pub fn is_read_only(&self) -> bool {
        self.access == Access::ReadOnly
    }
}


/// An immutable snapshot of one of the copter's tables of contents, identified by the CRC the
///  copter reports for it
pub struct Toc {
    kind: TocKind,
    crc: u32,
    entries: Vec<TocEntry>,
    by_name: FxHashMap<String, usize>,
    by_id: FxHashMap<u16, usize>,
}
impl Toc {
    pub fn new(kind: TocKind, crc: u32, entries: Vec<TocEntry>) -> Toc {
        let by_name = entries.iter()
            .enumerate()
            .map(|(idx, e)| (e.full_name(), idx))
            .collect();
        let by_id = entries.iter()
            .enumerate()
            .map(|(idx, e)| (e.id, idx))
            .collect();

        Toc {
            kind,
            crc,
            entries,
            by_name,
            by_id,
        }
    }

    pub fn kind(&self) -> TocKind {
        self.kind
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn entries(&self) -> &[TocEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u16) -> Option<&TocEntry> {
        self.by_id.get(&id)
            .map(|&idx| &self.entries[idx])
    }

    /// looks up an entry by its full name, i.e. `group.name`
    pub fn find(&self, full_name: &str) -> Option<&TocEntry> {
        self.by_name.get(full_name)
            .map(|&idx| &self.entries[idx])
    }
}
impl Debug for Toc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Toc{{{:?} crc:{:08X} #{}}}", self.kind, self.crc, self.entries.len())
    }
}
impl PartialEq for Toc {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.crc == other.crc && self.entries == other.entries
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::param_rw(TocKind::Param, 0x08, ValueType::U8, Access::ReadWrite)]
    #[case::param_ro(TocKind::Param, 0x46, ValueType::F32, Access::ReadOnly)]
    #[case::param_other_flags(TocKind::Param, 0x1a, ValueType::U32, Access::ReadWrite)]
    #[case::log_plain(TocKind::Log, 0x07, ValueType::F32, Access::ReadOnly)]
    #[case::log_flag(TocKind::Log, 0x12, ValueType::U16, Access::ReadWrite)]
    fn test_parse_type_byte(#[case] kind: TocKind, #[case] type_byte: u8, #[case] value_type: ValueType, #[case] access: Access) {
        assert_eq!(kind.parse_type_byte(type_byte).unwrap(), (value_type, access));
    }

    #[rstest]
    #[case::param(TocKind::Param, 0x04)]
    #[case::log(TocKind::Log, 0x00)]
    #[case::log_out_of_range(TocKind::Log, 0x09)]
    fn test_unknown_type_byte(#[case] kind: TocKind, #[case] type_byte: u8) {
        assert!(kind.parse_type_byte(type_byte).is_err());
    }

    #[rstest]
    #[case::v1(false, b"\x03\x08pid\0rate\0", 3)]
    #[case::v2(true, b"\x03\x01\x08pid\0rate\0", 0x103)]
    fn test_decode_entry(#[case] wide: bool, #[case] mut buf: &[u8], #[case] expected_id: u16) {
        let entry = TocEntry::decode(TocKind::Param, wide, &mut buf).unwrap();
        assert_eq!(entry.id, expected_id);
        assert_eq!(entry.full_name(), "pid.rate");
        assert_eq!(entry.value_type, ValueType::U8);
        assert!(!entry.is_read_only());
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf: &[u8] = b"\x03";
        assert!(TocEntry::decode(TocKind::Param, false, &mut buf).is_err());
    }

    #[test]
    fn test_lookup() {
        let toc = Toc::new(TocKind::Param, 0x1234, vec![
            TocEntry::new(TocKind::Param, 0, 0x08, "pid".into(), "rate".into()).unwrap(),
            TocEntry::new(TocKind::Param, 1, 0x46, "sys".into(), "id".into()).unwrap(),
        ]);

        assert_eq!(toc.len(), 2);
        assert_eq!(toc.find("sys.id").map(|e| e.id), Some(1));
        assert_eq!(toc.get(0).map(|e| e.full_name()), Some("pid.rate".to_string()));
        assert!(toc.find("sys").is_none());
        assert!(toc.get(2).is_none());
    }
}
