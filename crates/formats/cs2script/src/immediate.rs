use serde::{Deserialize, Serialize};

use crate::cursor::{Cursor, Writer};
use crate::error::{Error, Result};

/// Shape of the immediate that follows an opcode in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImmediateKind {
    /// One unsigned byte.
    Byte,
    /// Four-byte signed int.
    Int,
    /// Three-byte unsigned int.
    Tribyte,
    /// Tag byte (0 int, 1 long, 2 string) followed by the tagged payload.
    /// Used by `pushconst`; named after the switch-like dispatch on the tag.
    Switch,
    /// Eight-byte long, two u32 halves.
    Long,
    /// Null-terminated latin1 string.
    String,
}

impl ImmediateKind {
    /// Kinds that can be told apart by byte layout alone during calibration.
    pub const DETECTABLE: [ImmediateKind; 4] = [
        ImmediateKind::Byte,
        ImmediateKind::Int,
        ImmediateKind::Tribyte,
        ImmediateKind::Switch,
    ];
}

impl std::fmt::Display for ImmediateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImmediateKind::Byte => "byte",
            ImmediateKind::Int => "int",
            ImmediateKind::Tribyte => "tribyte",
            ImmediateKind::Switch => "switch",
            ImmediateKind::Long => "long",
            ImmediateKind::String => "string",
        };
        f.write_str(name)
    }
}

/// Payload carried next to the integer immediate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Payload {
    #[default]
    None,
    Int(i32),
    Long(i64),
    String(String),
}

/// Read one immediate of the given kind. Returns `(imm, payload)`.
///
/// For `Switch` the tag ends up in `imm` and the constant in the payload,
/// for `Long`/`String` the value is the payload and `imm` is 0.
pub fn read_immediate(cursor: &mut Cursor<'_>, kind: ImmediateKind) -> Result<(i32, Payload)> {
    match kind {
        ImmediateKind::Byte => Ok((cursor.read_u8()? as i32, Payload::None)),
        ImmediateKind::Int => Ok((cursor.read_i32()?, Payload::None)),
        ImmediateKind::Tribyte => Ok((cursor.read_u24()? as i32, Payload::None)),
        ImmediateKind::Long => Ok((0, Payload::Long(cursor.read_i64()?))),
        ImmediateKind::String => Ok((0, Payload::String(cursor.read_cstring()?))),
        ImmediateKind::Switch => {
            let offset = cursor.offset();
            let tag = cursor.read_u8()?;
            let payload = match tag {
                0 => Payload::Int(cursor.read_i32()?),
                1 => Payload::Long(cursor.read_i64()?),
                2 => Payload::String(cursor.read_cstring()?),
                tag => return Err(Error::InvalidConstTag { offset, tag }),
            };
            Ok((tag as i32, payload))
        }
    }
}

/// Non-failing variant used while guessing kinds: `None` when the bytes at
/// `offset` cannot hold an immediate of this kind. Returns the end offset.
pub fn try_read_immediate(
    data: &[u8],
    offset: usize,
    kind: ImmediateKind,
) -> Option<(i32, Payload, usize)> {
    let mut cursor = Cursor::at(data, offset);
    let (imm, payload) = read_immediate(&mut cursor, kind).ok()?;
    Some((imm, payload, cursor.offset()))
}

pub fn write_immediate(
    w: &mut Writer,
    kind: ImmediateKind,
    imm: i32,
    payload: &Payload,
) -> Result<()> {
    match (kind, payload) {
        (ImmediateKind::Byte, _) => w.write_u8(imm as u8),
        (ImmediateKind::Int, _) => w.write_i32(imm),
        (ImmediateKind::Tribyte, _) => w.write_u24(imm as u32),
        (ImmediateKind::Long, Payload::Long(v)) => w.write_i64(*v),
        (ImmediateKind::String, Payload::String(s)) => w.write_cstring(s),
        (ImmediateKind::Switch, Payload::Int(v)) => {
            w.write_u8(0);
            w.write_i32(*v);
        }
        (ImmediateKind::Switch, Payload::Long(v)) => {
            w.write_u8(1);
            w.write_i64(*v);
        }
        (ImmediateKind::Switch, Payload::String(s)) => {
            w.write_u8(2);
            w.write_cstring(s);
        }
        (kind, payload) => {
            return Err(Error::Parse {
                context: "immediate",
                message: format!("{kind} immediate cannot carry payload {payload:?}"),
            })
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_constants() {
        let mut w = Writer::new();
        write_immediate(&mut w, ImmediateKind::Switch, 2, &Payload::String("hi".into())).unwrap();
        write_immediate(&mut w, ImmediateKind::Switch, 0, &Payload::Int(-7)).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..4], &[2, b'h', b'i', 0]);

        let mut c = Cursor::new(&bytes);
        let (tag, payload) = read_immediate(&mut c, ImmediateKind::Switch).unwrap();
        assert_eq!((tag, payload), (2, Payload::String("hi".into())));
        let (tag, payload) = read_immediate(&mut c, ImmediateKind::Switch).unwrap();
        assert_eq!((tag, payload), (0, Payload::Int(-7)));
    }

    #[test]
    fn bad_tag_is_rejected() {
        let data = [5u8, 0, 0, 0, 0];
        let mut c = Cursor::new(&data);
        assert!(matches!(
            read_immediate(&mut c, ImmediateKind::Switch),
            Err(Error::InvalidConstTag { tag: 5, .. })
        ));
        assert!(try_read_immediate(&data, 0, ImmediateKind::Switch).is_none());
    }

    #[test]
    fn try_read_reports_end() {
        let data = [0u8, 1, 0x12, 0x34, 0x56];
        assert_eq!(
            try_read_immediate(&data, 2, ImmediateKind::Tribyte),
            Some((0x123456, Payload::None, 5))
        );
        assert_eq!(try_read_immediate(&data, 2, ImmediateKind::Int), None);
        assert_eq!(
            try_read_immediate(&data, 1, ImmediateKind::Byte),
            Some((1, Payload::None, 2))
        );
    }

    #[test]
    fn mismatched_payload() {
        let mut w = Writer::new();
        assert!(write_immediate(&mut w, ImmediateKind::Long, 0, &Payload::None).is_err());
    }
}
