use crate::dfu_file::{ParseError, SUFFIX_LEN};
use crate::dfuse::{self, Prefix, Target};
use log::debug;

/// A contiguous firmware payload and the address it should be loaded at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Decoded contents of a DFU file, keeping DfuSe target grouping intact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Firmware {
    /// Plain DFU: everything before the suffix, loaded at address 0.
    Raw(Element),
    /// DfuSe: `prefix` is [None] only if the prefix couldn't be decoded, in which case there are
    /// no targets either.
    DfuSe {
        prefix: Option<Prefix>,
        targets: Vec<Target>,
    },
}

impl Firmware {
    /// All elements in file order, regardless of which target they belong to.
    pub fn elements(&self) -> impl Iterator<Item = &Element> + '_ {
        let (raw, targets) = match self {
            Firmware::Raw(element) => (Some(element), &[][..]),
            Firmware::DfuSe { targets, .. } => (None, targets.as_slice()),
        };
        raw.into_iter()
            .chain(targets.iter().flat_map(|t| t.elements.iter()))
    }

    pub fn into_elements(self) -> Vec<Element> {
        match self {
            Firmware::Raw(element) => vec![element],
            Firmware::DfuSe { targets, .. } => {
                targets.into_iter().flat_map(|t| t.elements).collect()
            }
        }
    }
}

/// Treat everything but the trailing suffix as a single firmware image at address 0. The suffix
/// itself is not validated.
pub fn extract_raw(data: &[u8]) -> Result<Element, ParseError> {
    let end = data
        .len()
        .checked_sub(SUFFIX_LEN)
        .ok_or(ParseError::TooSmall {
            region: "DFU suffix",
            minimum: SUFFIX_LEN,
            actual: data.len(),
        })?;

    Ok(Element {
        address: 0,
        data: data[..end].to_vec(),
    })
}

/// Decode `data` as DfuSe if it starts with the DfuSe magic, or as plain DFU otherwise.
pub fn parse(data: &[u8]) -> Result<Firmware, ParseError> {
    if !dfuse::is_dfuse(data) {
        debug!("No DfuSe prefix; extracting raw DFU payload");
        return extract_raw(data).map(Firmware::Raw);
    }

    let (prefix, targets) = dfuse::parse_targets(data)?;
    Ok(Firmware::DfuSe { prefix, targets })
}

/// Extract every `(address, payload)` pair from a DFU file, in file order.
pub fn extract(data: &[u8]) -> Result<Vec<Element>, ParseError> {
    parse(data).map(Firmware::into_elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu_file::{Suffix, compute_crc, parse_suffix};
    use crate::dfuse::tests::build_dfuse;

    fn build_raw(payload: &[u8]) -> Vec<u8> {
        let mut out = payload.to_vec();
        let suffix = Suffix {
            device_version: 0x0100,
            product_id: 0x5740,
            vendor_id: 0x0483,
            dfu_version: 0x0100,
            length: SUFFIX_LEN as u8,
            crc: 0,
        };
        out.extend_from_slice(&suffix.to_bytes()[..12]);
        let crc = compute_crc(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    #[test]
    fn raw_dfu_is_single_element_at_zero() {
        let data = build_raw(b"\x00\x20\x00\x20\x41\x01\x00\x08firmware");
        assert_eq!(
            extract(&data).unwrap(),
            vec![Element {
                address: 0,
                data: data[..data.len() - SUFFIX_LEN].to_vec(),
            }]
        );
    }

    #[test]
    fn raw_dfu_suffix_is_not_validated() {
        let data = [0x42u8; 40];
        let elements = extract(&data).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].data, vec![0x42u8; 24]);

        assert_eq!(extract(&[0u8; 16]).unwrap()[0].data, b"");
    }

    #[test]
    fn raw_dfu_too_small() {
        assert!(matches!(
            extract(b"short"),
            Err(ParseError::TooSmall { actual: 5, .. })
        ));
    }

    #[test]
    fn dfuse_elements_in_file_order() {
        let data = build_dfuse(&[(
            0,
            "Internal Flash",
            vec![
                (0x0800_0000, vec![1, 2, 3, 4]),
                (0x0800_0004, vec![5, 6, 7, 8, 9, 10, 11, 12]),
            ],
        )]);

        assert_eq!(
            extract(&data).unwrap(),
            vec![
                Element {
                    address: 0x0800_0000,
                    data: vec![1, 2, 3, 4],
                },
                Element {
                    address: 0x0800_0004,
                    data: vec![5, 6, 7, 8, 9, 10, 11, 12],
                },
            ]
        );
    }

    #[test]
    fn dfuse_keeps_target_grouping() {
        let data = build_dfuse(&[
            (0, "Flash", vec![(0x0800_0000, vec![1; 4])]),
            (
                1,
                "EEPROM",
                vec![(0x0808_0000, vec![2; 2]), (0x0808_0010, vec![3; 2])],
            ),
        ]);

        let firmware = parse(&data).unwrap();
        let Firmware::DfuSe { prefix, targets } = &firmware else {
            panic!("expected DfuSe, got {firmware:?}");
        };
        assert_eq!(prefix.map(|p| p.target_count), Some(2));
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].elements.len(), 2);

        let addresses: Vec<u32> = firmware.elements().map(|e| e.address).collect();
        assert_eq!(addresses, [0x0800_0000, 0x0808_0000, 0x0808_0010]);
        assert_eq!(firmware.into_elements().len(), 3);
    }

    #[test]
    fn short_dfuse_is_too_small() {
        let mut data = b"DfuSe".to_vec();
        data.resize(20, 0);
        assert!(matches!(
            extract(&data),
            Err(ParseError::TooSmall { minimum: 27, actual: 20, .. })
        ));
    }

    #[test]
    fn dfuse_errors_propagate() {
        let mut data = build_dfuse(&[(0, "Flash", vec![(0x0800_0000, vec![1; 4])])]);
        data[11] = b't';
        assert!(matches!(
            extract(&data),
            Err(ParseError::InvalidTargetSignature { offset: 11, .. })
        ));
    }

    #[test]
    fn reappending_suffix_round_trips() {
        let data = build_raw(&[0xa5; 100]);
        let suffix = parse_suffix(&data).unwrap();
        let elements = extract(&data).unwrap();

        let mut rebuilt = elements[0].data.clone();
        let mut recomputed = suffix;
        rebuilt.extend_from_slice(&recomputed.to_bytes()[..12]);
        recomputed.crc = compute_crc(&rebuilt);
        rebuilt.extend_from_slice(&recomputed.crc.to_le_bytes());

        assert_eq!(rebuilt[..data.len() - SUFFIX_LEN], data[..data.len() - SUFFIX_LEN]);
        assert_eq!(rebuilt, data);
        assert!(parse_suffix(&rebuilt).unwrap().has_valid_crc(&rebuilt));
    }

    #[test]
    fn extraction_is_idempotent() {
        let data = build_dfuse(&[(0, "Flash", vec![(0x0800_0000, vec![9; 32])])]);
        assert_eq!(extract(&data), extract(&data));

        let raw = build_raw(b"abc");
        assert_eq!(extract(&raw), extract(&raw));
    }
}
