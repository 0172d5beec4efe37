use byteorder::{ByteOrder, LE};
use log::warn;
use std::fmt::{Display, LowerHex, UpperHex, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Length of the trailing DFU suffix. Also the only `bLength` value we fully understand.
pub const SUFFIX_LEN: usize = 16;

const SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";

/// A 16-bit ID from the suffix that may be unset (0xffff). Has functions for pretty-printing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OptionalId(pub Option<u16>);

impl OptionalId {
    fn fmt_helper<F>(&self, f: &mut std::fmt::Formatter, delegate: F) -> std::fmt::Result
    where
        F: FnOnce(&u16, &mut std::fmt::Formatter) -> std::fmt::Result,
    {
        match self.0 {
            Some(id) => delegate(&id, f),
            None => {
                for _ in 0..f.width().unwrap_or(4) {
                    f.write_char('?')?
                }
                Ok(())
            }
        }
    }
}

impl Display for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, Display::fmt)
    }
}

impl LowerHex for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, LowerHex::fmt)
    }
}

impl UpperHex for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, UpperHex::fmt)
    }
}

/// Convert from an ID field in a DFU suffix.
impl From<u16> for OptionalId {
    fn from(val: u16) -> Self {
        OptionalId(match val {
            0xffff => None,
            i => Some(i),
        })
    }
}

/// The fixed 16-byte record at the end of every DFU file. All fields are stored little-endian.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Suffix {
    /// `bcdDevice`: firmware release number of the target device.
    pub device_version: u16,
    pub product_id: u16,
    pub vendor_id: u16,
    /// `bcdDFU`: version of the DFU spec the file follows.
    pub dfu_version: u16,
    /// `bLength`: declared length of the suffix.
    pub length: u8,
    /// `dwCRC` as stored in the file. Decoded but never enforced; see [Suffix::has_valid_crc].
    pub crc: u32,
}

impl Suffix {
    pub fn vendor(&self) -> OptionalId {
        self.vendor_id.into()
    }

    pub fn product(&self) -> OptionalId {
        self.product_id.into()
    }

    pub fn release(&self) -> OptionalId {
        self.device_version.into()
    }

    /// Compare the stored CRC against one computed over `file`, which must be the entire DFU file
    /// this suffix was read from.
    pub fn has_valid_crc(&self, file: &[u8]) -> bool {
        match file.len().checked_sub(4) {
            Some(end) => compute_crc(&file[..end]) == self.crc,
            None => false,
        }
    }

    /// Encode the suffix back into its on-disk form.
    pub fn to_bytes(&self) -> [u8; SUFFIX_LEN] {
        let mut out = [0u8; SUFFIX_LEN];
        LE::write_u16(&mut out[0..2], self.device_version);
        LE::write_u16(&mut out[2..4], self.product_id);
        LE::write_u16(&mut out[4..6], self.vendor_id);
        LE::write_u16(&mut out[6..8], self.dfu_version);
        out[8..11].copy_from_slice(SUFFIX_SIGNATURE);
        out[11] = self.length;
        LE::write_u32(&mut out[12..16], self.crc);
        out
    }
}

/// Parse errors for any part of a DFU or DfuSe file.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("file is too small to contain {region}: expected at least {minimum} bytes, got {actual}")]
    TooSmall {
        region: &'static str,
        minimum: usize,
        actual: usize,
    },

    #[error(
        "DFU signature is not present (expected \"UFD\", found {found:02x?}); are you sure this is a DFU file?"
    )]
    InvalidSignature { found: [u8; 3] },

    #[error("invalid target signature at offset {offset:#x}: expected \"Target\", found {found:02x?}")]
    InvalidTargetSignature { offset: usize, found: [u8; 6] },

    #[error(
        "truncated data at offset {offset:#x}: needed {needed} bytes, only {available} available"
    )]
    TruncatedData {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// All errors (parse and I/O) that can happen while extracting a DFU file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid firmware file")]
    ParseError(#[from] ParseError),

    #[error("I/O error")]
    IoError(#[from] std::io::Error),

    #[error("refusing to overwrite input file {} with extracted firmware", .0.display())]
    WouldOverwriteInput(PathBuf),
}

/// Borrow `len` bytes at `offset`, failing with [ParseError::TruncatedData] instead of panicking
/// if the range runs past the end of `data`.
pub(crate) fn field(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(ParseError::TruncatedData {
            offset,
            needed: len,
            available: data.len().saturating_sub(offset),
        })
}

/// Compute the CRC used by USB DFU 1.1 over the given bytes. Does not strip the CRC field from the
/// suffix automatically.
pub fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    !hasher.finalize() // DFU's CRC algorithm is a bitwise NOT of IEEE's.
}

/// Parse the trailing 16 bytes of `data` as a DFU suffix.
pub fn parse_suffix(data: &[u8]) -> Result<Suffix, ParseError> {
    let start = match data.len().checked_sub(SUFFIX_LEN) {
        Some(i) => i,
        None => {
            return Err(ParseError::TooSmall {
                region: "DFU suffix",
                minimum: SUFFIX_LEN,
                actual: data.len(),
            });
        }
    };
    let suffix = &data[start..];

    let mut signature = [0u8; 3];
    signature.copy_from_slice(&suffix[8..11]);
    if &signature != SUFFIX_SIGNATURE {
        return Err(ParseError::InvalidSignature { found: signature });
    }

    let length = suffix[11];
    if length as usize != SUFFIX_LEN {
        warn!("DFU suffix declares length {length}, expected {SUFFIX_LEN}; continuing");
    }

    Ok(Suffix {
        device_version: LE::read_u16(&suffix[0..2]),
        product_id: LE::read_u16(&suffix[2..4]),
        vendor_id: LE::read_u16(&suffix[4..6]),
        dfu_version: LE::read_u16(&suffix[6..8]),
        length,
        crc: LE::read_u32(&suffix[12..16]),
    })
}

/// Parse the suffix for callers that can do without one. If it's unusable, log why and return
/// [None].
pub fn parse_suffix_lenient(data: &[u8]) -> Option<Suffix> {
    match parse_suffix(data) {
        Ok(suffix) => Some(suffix),
        Err(e) => {
            warn!("{e}; continuing without DFU suffix");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_suffix() -> Suffix {
        Suffix {
            device_version: 0x0200,
            product_id: 0xdf11,
            vendor_id: 0x0483,
            dfu_version: 0x011a,
            length: SUFFIX_LEN as u8,
            crc: 0xdead_beef,
        }
    }

    #[test]
    fn short_buffers_are_too_small() {
        for len in 0..SUFFIX_LEN {
            let data = vec![0u8; len];
            assert!(matches!(
                parse_suffix(&data),
                Err(ParseError::TooSmall { minimum: 16, actual, .. }) if actual == len
            ));
        }
    }

    #[test]
    fn parses_little_endian_fields() {
        let mut data = b"payload".to_vec();
        data.extend_from_slice(&[
            0x00, 0x02, 0x11, 0xdf, 0x83, 0x04, 0x1a, 0x01, b'U', b'F', b'D', 0x10, 0xef, 0xbe,
            0xad, 0xde,
        ]);
        assert_eq!(parse_suffix(&data).unwrap(), sample_suffix());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut data = sample_suffix().to_bytes().to_vec();
        data[9] = b'X';
        assert_eq!(
            parse_suffix(&data),
            Err(ParseError::InvalidSignature { found: *b"UXD" })
        );
    }

    #[test]
    fn unusual_length_is_accepted() {
        let suffix = Suffix {
            length: 0x20,
            ..sample_suffix()
        };
        assert_eq!(parse_suffix(&suffix.to_bytes()).unwrap().length, 0x20);
    }

    #[test]
    fn crc_matches_dfu_algorithm() {
        // IEEE CRC-32 of "123456789" is 0xcbf43926.
        assert_eq!(compute_crc(b"123456789"), !0xcbf4_3926);

        let mut file = b"firmware bytes".to_vec();
        let mut suffix = sample_suffix();
        file.extend_from_slice(&suffix.to_bytes()[..12]);
        suffix.crc = compute_crc(&file);
        file.extend_from_slice(&suffix.crc.to_le_bytes());

        let parsed = parse_suffix(&file).unwrap();
        assert!(parsed.has_valid_crc(&file));

        file[0] ^= 0xff;
        assert!(!parsed.has_valid_crc(&file));
    }

    #[test]
    fn unset_ids_print_as_wildcards() {
        let suffix = Suffix {
            vendor_id: 0xffff,
            ..sample_suffix()
        };
        assert_eq!(format!("{:04X}", suffix.vendor()), "????");
        assert_eq!(format!("{:04X}", suffix.product()), "DF11");
        assert_eq!(format!("{:04x}", suffix.release()), "0200");
    }

    #[test]
    fn lenient_suffix_tolerates_bad_files() {
        assert_eq!(parse_suffix_lenient(b"tiny"), None);
        assert_eq!(parse_suffix_lenient(&[0x42u8; 40]), None);

        let mut data = b"firmware".to_vec();
        data.extend_from_slice(&sample_suffix().to_bytes());
        assert_eq!(parse_suffix_lenient(&data), Some(sample_suffix()));
    }

    #[test]
    fn field_reports_truncation() {
        let data = [0u8; 10];
        assert_eq!(field(&data, 2, 8).unwrap().len(), 8);
        assert_eq!(
            field(&data, 4, 8),
            Err(ParseError::TruncatedData {
                offset: 4,
                needed: 8,
                available: 6
            })
        );
        assert_eq!(
            field(&data, usize::MAX, 2),
            Err(ParseError::TruncatedData {
                offset: usize::MAX,
                needed: 2,
                available: 0
            })
        );
    }
}
