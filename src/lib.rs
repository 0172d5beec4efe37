/// Decode the DFU suffix shared by every DFU file, and the errors all decoders report.
pub mod dfu_file;

/// Walk the prefix, targets and elements of ST's DfuSe extension.
pub mod dfuse;

/// Pick a decode path for a DFU file and pull out its firmware images.
pub mod extract;

/// Write extracted images to disk and describe them on the console.
pub mod output;

pub use extract::{Element, Firmware, extract};
