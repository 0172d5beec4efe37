use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dfu_extract::dfu_file::parse_suffix_lenient;
use dfu_extract::output::{Style, default_prefix, write_elements, write_info};
use log::info;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "dfu-extract", version, about)]
struct Opt {
    /// When to colorize console output
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto, global = true)]
    color: ColorChoice,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the suffix, format and target layout of a DFU file
    Info { file: PathBuf },

    /// Write every firmware image in a DFU file to its own .bin file
    Extract {
        file: PathBuf,

        /// Output file prefix (default: input path without its extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Don't print a hex preview of the first image
        #[arg(long)]
        no_preview: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn style(self) -> Style {
        match self {
            ColorChoice::Auto if std::io::stdout().is_terminal() => Style::COLORED,
            ColorChoice::Always => {
                // colored otherwise drops escapes when stdout isn't a TTY.
                colored::control::set_override(true);
                Style::COLORED
            }
            _ => Style::PLAIN,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("DFU_EXTRACT_LOG", "info")
            .write_style("DFU_EXTRACT_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();
    let style = opt.color.style();
    let mut stdout = std::io::stdout().lock();

    match opt.command {
        Command::Info { file } => {
            let data = read_file(&file)?;
            write_info(&data, &style, &mut stdout)?;
        }
        Command::Extract {
            file,
            output,
            no_preview,
        } => {
            let data = read_file(&file)?;

            // Extraction doesn't depend on the suffix, so a broken one isn't fatal here.
            if let Some(suffix) = parse_suffix_lenient(&data) {
                info!("DFU file for device {:04x}:{:04x}", suffix.vendor(), suffix.product());
            }

            let elements = dfu_extract::extract(&data)?;
            let prefix = output.unwrap_or_else(|| default_prefix(&file));
            write_elements(&elements, &prefix, &file, !no_preview, &style, &mut stdout)?;
        }
    };

    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    info!("Read {} bytes from {}", data.len(), path.display());
    Ok(data)
}
