use crate::dfu_file::{ParseError, SUFFIX_LEN, field};
use crate::extract::Element;
use byteorder::{ByteOrder, LE};
use log::{debug, trace, warn};
use std::borrow::Cow;

/// Length of the DfuSe prefix at the start of the file.
pub const PREFIX_LEN: usize = 11;

/// Length of the fixed header preceding each target's elements.
pub const TARGET_HEADER_LEN: usize = 274;

const ELEMENT_HEADER_LEN: usize = 8;
const NAME_LEN: usize = 255;

const PREFIX_SIGNATURE: &[u8; 5] = b"DfuSe";
const TARGET_SIGNATURE: &[u8; 6] = b"Target";

/// Leading record of a DfuSe file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Prefix {
    pub version: u8,
    /// Total file size as declared by the file, suffix excluded.
    pub image_size: u32,
    pub target_count: u8,
}

/// A named group of elements, usually one per USB alternate setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub alt_setting: u8,
    /// Raw name with trailing NUL padding removed.
    pub name: Vec<u8>,
    /// Declared size of all element records in this target, headers included.
    pub size: u32,
    pub elements: Vec<Element>,
}

impl Target {
    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

/// Whether `data` starts with the DfuSe magic. This alone decides which decode path is taken.
pub fn is_dfuse(data: &[u8]) -> bool {
    data.starts_with(PREFIX_SIGNATURE)
}

/// Parse the DfuSe prefix. A missing signature is not an error: it means the file is plain DFU and
/// `None` is returned.
pub fn parse_prefix(data: &[u8]) -> Result<Option<Prefix>, ParseError> {
    if data.len() < PREFIX_LEN + SUFFIX_LEN {
        return Err(ParseError::TooSmall {
            region: "DfuSe prefix and DFU suffix",
            minimum: PREFIX_LEN + SUFFIX_LEN,
            actual: data.len(),
        });
    }

    if !is_dfuse(data) {
        return Ok(None);
    }

    Ok(Some(Prefix {
        version: data[5],
        image_size: LE::read_u32(&data[6..10]),
        target_count: data[10],
    }))
}

/// Decode the prefix and every target of a DfuSe file. If the prefix turns out to be absent, there
/// are no targets to report: the result is `(None, [])`.
pub fn parse_targets(data: &[u8]) -> Result<(Option<Prefix>, Vec<Target>), ParseError> {
    match parse_prefix(data)? {
        Some(prefix) => Ok((Some(prefix), walk_targets(data, &prefix)?)),
        None => {
            debug!("No DfuSe prefix found; reporting no targets");
            Ok((None, vec![]))
        }
    }
}

/// Walk the `prefix.target_count` targets that follow the prefix, in file order.
pub fn walk_targets(data: &[u8], prefix: &Prefix) -> Result<Vec<Target>, ParseError> {
    debug!(
        "DfuSe v{} image: {} bytes declared, {} targets",
        prefix.version, prefix.image_size, prefix.target_count
    );

    let mut targets = Vec::with_capacity(prefix.target_count as usize);
    let mut offset = PREFIX_LEN;

    for _ in 0..prefix.target_count {
        let (target, next) = read_target(data, offset)?;
        offset = next;
        targets.push(target);
    }

    // Whatever sits between the last element and the suffix is ignored.
    let payload_end = data.len().saturating_sub(SUFFIX_LEN);
    if offset < payload_end {
        warn!(
            "Ignoring {} bytes after last DfuSe target",
            payload_end - offset
        );
    }

    Ok(targets)
}

/// Read one target header and all its elements starting at `offset`. Returns the target and the
/// offset just past its last element.
fn read_target(data: &[u8], mut offset: usize) -> Result<(Target, usize), ParseError> {
    let header = field(data, offset, TARGET_HEADER_LEN)?;

    if &header[0..6] != TARGET_SIGNATURE {
        let mut found = [0u8; 6];
        found.copy_from_slice(&header[0..6]);
        return Err(ParseError::InvalidTargetSignature { offset, found });
    }

    // Bytes 7..11 are bTargetNamed, which we don't need: an unnamed target is all NULs anyway.
    let alt_setting = header[6];
    let name = trim_nuls(&header[11..11 + NAME_LEN]).to_vec();
    let size = LE::read_u32(&header[266..270]);
    let element_count = LE::read_u32(&header[270..274]);

    trace!(
        "Target at {offset:#x}: alt {alt_setting}, {:?}, {size} bytes, {element_count} elements",
        String::from_utf8_lossy(&name)
    );
    offset += TARGET_HEADER_LEN;

    // Don't trust element_count for preallocation; a corrupt file could claim billions.
    let mut elements = Vec::new();
    let mut consumed = 0u64;
    for _ in 0..element_count {
        let element_header = field(data, offset, ELEMENT_HEADER_LEN)?;
        let address = LE::read_u32(&element_header[0..4]);
        let element_size = LE::read_u32(&element_header[4..8]) as usize;
        offset += ELEMENT_HEADER_LEN;

        let payload = field(data, offset, element_size)?;
        trace!("Element at {offset:#x}: address {address:#010x}, {element_size} bytes");
        offset += element_size;
        consumed += (ELEMENT_HEADER_LEN + element_size) as u64;

        elements.push(Element {
            address,
            data: payload.to_vec(),
        });
    }

    if consumed != size as u64 {
        warn!(
            "Target {:?} declares {size} bytes but its elements occupy {consumed}; continuing",
            String::from_utf8_lossy(&name)
        );
    }

    Ok((
        Target {
            alt_setting,
            name,
            size,
            elements,
        },
        offset,
    ))
}

fn trim_nuls(raw: &[u8]) -> &[u8] {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &raw[..end]
}
