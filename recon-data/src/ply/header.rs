//! PLY header parsing.
//!
//! The header is plain text terminated by an `end_header` line. Everything
//! after the sentinel is binary payload whose layout the header declares.

use crate::ply::PlyError;
use tracing::debug;

/// Line that terminates the textual header.
pub const HEADER_SENTINEL: &str = "end_header";

/// Payload encoding declared on the `format` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyFormat {
    BinaryLittleEndian,
    BinaryBigEndian,
    Ascii,
}

impl PlyFormat {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "binary_little_endian" => Some(Self::BinaryLittleEndian),
            "binary_big_endian" => Some(Self::BinaryBigEndian),
            "ascii" => Some(Self::Ascii),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::BinaryLittleEndian => "binary_little_endian",
            Self::BinaryBigEndian => "binary_big_endian",
            Self::Ascii => "ascii",
        }
    }
}

/// Scalar types a PLY property may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ScalarType {
    /// Parse both the classic (`uchar`, `float`) and sized (`uint8`, `float32`) spellings.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "char" | "int8" => Some(Self::I8),
            "uchar" | "uint8" => Some(Self::U8),
            "short" | "int16" => Some(Self::I16),
            "ushort" | "uint16" => Some(Self::U16),
            "int" | "int32" => Some(Self::I32),
            "uint" | "uint32" => Some(Self::U32),
            "float" | "float32" => Some(Self::F32),
            "double" | "float64" => Some(Self::F64),
            _ => None,
        }
    }

    /// Size of one value in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Keyword used when writing headers.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::I8 => "char",
            Self::U8 => "uchar",
            Self::I16 => "short",
            Self::U16 => "ushort",
            Self::I32 => "int",
            Self::U32 => "uint",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }

    /// Decode a little-endian value as f64. `bytes` must hold at least `size()` bytes.
    pub(crate) fn read_le(&self, bytes: &[u8]) -> f64 {
        match self {
            Self::I8 => bytes[0] as i8 as f64,
            Self::U8 => bytes[0] as f64,
            Self::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            Self::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            Self::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            Self::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            Self::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            Self::F64 => f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
        }
    }
}

/// Kind of a declared property: a fixed scalar or a counted list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Scalar(ScalarType),
    List { count: ScalarType, item: ScalarType },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlyProperty {
    pub name: String,
    pub kind: PropertyKind,
}

impl PlyProperty {
    pub fn scalar(name: impl Into<String>, ty: ScalarType) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Scalar(ty),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlyElement {
    pub name: String,
    pub count: usize,
    pub properties: Vec<PlyProperty>,
}

impl PlyElement {
    /// Byte width of one record, or `None` when a list property makes it variable.
    pub fn record_size(&self) -> Option<usize> {
        self.properties.iter().try_fold(0usize, |acc, p| match p.kind {
            PropertyKind::Scalar(ty) => Some(acc + ty.size()),
            PropertyKind::List { .. } => None,
        })
    }
}

/// Parsed header plus the byte offset at which the payload starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlyHeader {
    pub format: PlyFormat,
    pub elements: Vec<PlyElement>,
    pub data_offset: usize,
}

impl PlyHeader {
    pub fn element(&self, name: &str) -> Option<&PlyElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Parse the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, PlyError> {
        let mut offset = 0usize;
        let mut format = None;
        let mut elements: Vec<PlyElement> = Vec::new();
        let mut first = true;

        loop {
            let Some(rel_end) = bytes[offset..].iter().position(|&b| b == b'\n') else {
                return Err(PlyError::MissingSentinel);
            };
            let raw = &bytes[offset..offset + rel_end];
            let line_offset = offset;
            offset += rel_end + 1;

            let line = String::from_utf8_lossy(raw);
            let line = line.trim_end_matches('\r').trim();

            if first {
                if line != "ply" {
                    return Err(PlyError::MissingHeader);
                }
                first = false;
                continue;
            }

            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("format") => {
                    let token = tokens.next().unwrap_or_default();
                    format = Some(
                        PlyFormat::parse(token)
                            .ok_or_else(|| PlyError::UnsupportedFormat(token.to_string()))?,
                    );
                }
                Some("element") => {
                    let name = tokens.next().ok_or(PlyError::MalformedHeader {
                        offset: line_offset,
                        line: line.to_string(),
                    })?;
                    let count = tokens
                        .next()
                        .and_then(|c| c.parse::<usize>().ok())
                        .ok_or(PlyError::MalformedHeader {
                            offset: line_offset,
                            line: line.to_string(),
                        })?;
                    elements.push(PlyElement {
                        name: name.to_string(),
                        count,
                        properties: Vec::new(),
                    });
                }
                Some("property") => {
                    let property = parse_property(&mut tokens).ok_or_else(|| {
                        PlyError::MalformedHeader {
                            offset: line_offset,
                            line: line.to_string(),
                        }
                    })??;
                    let element = elements.last_mut().ok_or(PlyError::MalformedHeader {
                        offset: line_offset,
                        line: line.to_string(),
                    })?;
                    element.properties.push(property);
                }
                Some(HEADER_SENTINEL) => break,
                Some("comment") | Some("obj_info") | None => {}
                Some(_) => {
                    return Err(PlyError::MalformedHeader {
                        offset: line_offset,
                        line: line.to_string(),
                    });
                }
            }
        }

        let format = format.ok_or_else(|| PlyError::UnsupportedFormat("<missing>".to_string()))?;
        debug!(
            "PLY header: format {}, {} elements, payload at byte {}",
            format.keyword(),
            elements.len(),
            offset
        );

        Ok(Self {
            format,
            elements,
            data_offset: offset,
        })
    }
}

// Outer None: structurally malformed line. Inner Err: unknown type keyword.
fn parse_property<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
) -> Option<Result<PlyProperty, PlyError>> {
    let first = tokens.next()?;
    if first == "list" {
        let count = tokens.next()?;
        let item = tokens.next()?;
        let name = tokens.next()?;
        let Some(count) = ScalarType::parse(count) else {
            return Some(Err(PlyError::UnknownPropertyType(count.to_string())));
        };
        let Some(item) = ScalarType::parse(item) else {
            return Some(Err(PlyError::UnknownPropertyType(item.to_string())));
        };
        return Some(Ok(PlyProperty {
            name: name.to_string(),
            kind: PropertyKind::List { count, item },
        }));
    }

    let name = tokens.next()?;
    Some(match ScalarType::parse(first) {
        Some(ty) => Ok(PlyProperty::scalar(name, ty)),
        None => Err(PlyError::UnknownPropertyType(first.to_string())),
    })
}
