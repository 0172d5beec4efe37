use crate::dfu_file::{Error, parse_suffix};
use crate::extract::{self, Element, Firmware};
use colored::{ColoredString, Colorize};
use log::{debug, warn};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Maximum number of bytes shown by [hex_preview].
pub const PREVIEW_LEN: usize = 32;

/// How console output should be decorated. Passed explicitly to everything that prints.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Style {
    color: bool,
}

impl Style {
    pub const PLAIN: Style = Style { color: false };
    pub const COLORED: Style = Style { color: true };

    fn paint(&self, text: &str, f: impl FnOnce(&str) -> ColoredString) -> String {
        if self.color {
            f(text).to_string()
        } else {
            text.to_owned()
        }
    }

    fn heading(&self, text: &str) -> String {
        self.paint(text, |s| s.yellow().bold())
    }

    fn success(&self, text: &str) -> String {
        self.paint(text, |s| s.green().bold())
    }

    fn label(&self, text: &str) -> String {
        self.paint(text, |s| s.cyan())
    }

    fn value(&self, text: &str) -> String {
        self.paint(text, |s| s.bright_green())
    }

    fn dim(&self, text: &str) -> String {
        self.paint(text, |s| s.purple())
    }
}

/// Output prefix used when none is given: the input path minus its extension.
pub fn default_prefix(input: &Path) -> PathBuf {
    input.with_extension("")
}

/// File names for `count` extracted elements. A lone element gets `PREFIX.bin`; otherwise each is
/// numbered from zero as `PREFIX_<i>.bin`.
pub fn output_paths(prefix: &Path, count: usize) -> Vec<PathBuf> {
    let with_suffix = |suffix: &str| {
        let mut name = OsString::from(prefix.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    };

    if count == 1 {
        vec![with_suffix(".bin")]
    } else {
        (0..count).map(|i| with_suffix(&format!("_{i}.bin"))).collect()
    }
}

/// Format `n` with comma thousands separators.
fn group_digits(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Render up to [PREVIEW_LEN] bytes of `data` as a hex line and an ASCII line.
pub fn hex_preview(data: &[u8]) -> (String, String) {
    let shown = &data[..data.len().min(PREVIEW_LEN)];
    let hex = shown
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    let ascii = shown
        .iter()
        .map(|&b| match b {
            0x20..=0x7e => b as char,
            _ => '.',
        })
        .collect();
    (hex, ascii)
}

fn write_row(
    out: &mut impl Write,
    style: &Style,
    name: &str,
    value: String,
) -> std::io::Result<()> {
    writeln!(out, "  {} {}", style.label(&format!("{name:<15}")), style.value(&value))
}

fn write_preview(out: &mut impl Write, data: &[u8], style: &Style) -> std::io::Result<()> {
    let (hex, ascii) = hex_preview(data);
    writeln!(out, "{} {}", style.dim("  hex:  "), style.label(&hex))?;
    writeln!(out, "{} {}", style.dim("  ascii:"), style.dim(&ascii))
}

/// Whether `a` and `b` name the same file. Falls back to comparing the paths as given when either
/// can't be resolved, e.g. because it doesn't exist yet.
fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Write each element to its own file under `prefix` and print a summary of what was written to
/// `out`. Returns the paths written, in element order. Nothing is written if any output path would
/// replace `input`.
pub fn write_elements(
    elements: &[Element],
    prefix: &Path,
    input: &Path,
    preview: bool,
    style: &Style,
    out: &mut impl Write,
) -> Result<Vec<PathBuf>, Error> {
    if elements.is_empty() {
        warn!("No firmware elements found; nothing to write");
        return Ok(vec![]);
    }

    let paths = output_paths(prefix, elements.len());
    if let Some(path) = paths.iter().find(|p| same_file(p, input)) {
        return Err(Error::WouldOverwriteInput(path.clone()));
    }
    let single = elements.len() == 1;

    for (i, (element, path)) in elements.iter().zip(&paths).enumerate() {
        std::fs::write(path, &element.data)?;
        debug!("Wrote {} bytes to {}", element.data.len(), path.display());

        let title = match single {
            true => "Extracted firmware".to_owned(),
            false => format!("Extracted element {}/{}", i + 1, elements.len()),
        };
        writeln!(out, "{}", style.success(&title))?;
        writeln!(
            out,
            "  {} {}",
            style.label("File:        "),
            style.value(&path.display().to_string())
        )?;
        writeln!(
            out,
            "  {} {}",
            style.label("Size:        "),
            style.value(&format!("{} bytes", group_digits(element.data.len())))
        )?;
        // A raw image at 0 has no meaningful load address.
        if !single || element.address != 0 {
            writeln!(
                out,
                "  {} {}",
                style.label("Load address:"),
                style.value(&format!("0x{:08X}", element.address))
            )?;
        }

        if preview && i == 0 {
            write_preview(out, &element.data, style)?;
        }
    }

    Ok(paths)
}

/// Print everything known about the DFU file in `data`: suffix fields, format and, for DfuSe, the
/// layout of every target.
pub fn write_info(data: &[u8], style: &Style, out: &mut impl Write) -> Result<(), Error> {
    let suffix = parse_suffix(data)?;

    writeln!(out, "{}", style.heading("DFU file"))?;
    write_row(out, style, "Vendor ID:", format!("0x{:04X}", suffix.vendor()))?;
    write_row(out, style, "Product ID:", format!("0x{:04X}", suffix.product()))?;
    write_row(out, style, "Device version:", format!("0x{:04X}", suffix.release()))?;
    write_row(out, style, "DFU version:", format!("0x{:04X}", suffix.dfu_version))?;
    write_row(out, style, "Suffix length:", suffix.length.to_string())?;
    let crc_note = match suffix.has_valid_crc(data) {
        true => "matches contents",
        false => "does not match contents",
    };
    write_row(out, style, "CRC:", format!("0x{:08X} ({crc_note})", suffix.crc))?;

    match extract::parse(data)? {
        Firmware::Raw(element) => {
            write_row(out, style, "Format:", "Raw DFU".to_owned())?;
            write_row(
                out,
                style,
                "Payload:",
                format!("{} bytes", group_digits(element.data.len())),
            )?;
        }
        Firmware::DfuSe { prefix, targets } => {
            write_row(out, style, "Format:", "DfuSe (ST extensions)".to_owned())?;
            if let Some(prefix) = prefix {
                write_row(out, style, "DfuSe version:", format!("0x{:02X}", prefix.version))?;
                write_row(
                    out,
                    style,
                    "Image size:",
                    format!("{} bytes", group_digits(prefix.image_size as usize)),
                )?;
                write_row(out, style, "Targets:", prefix.target_count.to_string())?;
            }

            for target in &targets {
                writeln!(
                    out,
                    "{}",
                    style.heading(&format!(
                        "Target {} {:?}: {} bytes, {} elements",
                        target.alt_setting,
                        target.name(),
                        group_digits(target.size as usize),
                        target.elements.len()
                    ))
                )?;
                for element in &target.elements {
                    let end = element.address as u64 + element.data.len() as u64;
                    writeln!(
                        out,
                        "  {} {}",
                        style.label(&format!("0x{:08X}..0x{end:08X}", element.address)),
                        style.value(&format!("{} bytes", group_digits(element.data.len())))
                    )?;
                }
            }
        }
    }

    Ok(())
}
