//! Flash command implementation.

use {
    crate::{Cli, CliError, config::Config, open_client, use_fancy_output},
    anyhow::{Context, Result},
    canflash::{FirmwareImage, Flasher, target::DEFAULT_PAGE_SIZE},
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, theme::ColorfulTheme},
    indicatif::{ProgressBar, ProgressStyle},
    log::warn,
    std::{fs, io::IsTerminal, path::Path},
};

/// Whole-flash attempts when nothing is configured.
const DEFAULT_ATTEMPTS: u32 = 1;

/// Whether `path` looks like a raw firmware binary.
fn is_bin_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"))
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Flash cancelled".to_string()).into()
            } else {
                CliError::Usage(format!("Prompt failed: {io_err}")).into()
            }
        },
    }
}

/// Ask before flashing something that is not a `.bin` file.
///
/// Returns `false` if the user declined.
fn confirm_firmware(cli: &Cli, firmware: &Path) -> Result<bool> {
    if is_bin_file(firmware) {
        return Ok(true);
    }

    if cli.non_interactive {
        warn!(
            "{} does not have a .bin extension, flashing anyway",
            firmware.display()
        );
        return Ok(true);
    }

    if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
        return Err(CliError::Usage(format!(
            "{} does not have a .bin extension; confirm in a terminal or pass --non-interactive",
            firmware.display()
        ))
        .into());
    }

    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "{} does not look like a .bin file. Flash it anyway?",
            firmware.display()
        ))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .ok_or_else(|| CliError::Cancelled("Flash cancelled".to_string()).into())
}

fn progress_bar(cli: &Cli, pages: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(pages as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    board: u8,
    firmware: &Path,
    page_retries: Option<u32>,
    attempts: Option<u32>,
) -> Result<()> {
    if !confirm_firmware(cli, firmware)? {
        eprintln!("{} Flash cancelled", style("✗").yellow());
        return Ok(());
    }

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let data = fs::read(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;

    let image = FirmwareImage::new(data, DEFAULT_PAGE_SIZE)
        .with_context(|| format!("Invalid firmware {}", firmware.display()))?;

    let (client, _bus) = open_client(cli, config)?;

    let mut flasher = Flasher::new(client);
    if let Some(retries) = page_retries {
        flasher = flasher.with_page_retries(retries);
    }
    let attempts = attempts.unwrap_or(DEFAULT_ATTEMPTS).max(1);

    if !cli.quiet {
        eprintln!(
            "{} {} bytes in {} pages, flashing board {}",
            style("ℹ").blue(),
            image.len(),
            image.page_count(),
            style(board).cyan()
        );
    }

    let pb = progress_bar(cli, image.page_count());
    let mut attempt = 1;
    let report = loop {
        match flasher.flash(board, &image, |done, _total| pb.set_position(done as u64)) {
            Ok(report) => break report,
            Err(e) if attempt < attempts && e.is_device_error() => {
                warn!("Flash attempt {attempt}/{attempts} failed: {e}");
                pb.reset();
                attempt += 1;
            },
            Err(e) => {
                pb.abandon();
                return Err(e).with_context(|| format!("Flashing board {board} failed"));
            },
        }
    };
    pb.finish_with_message("done");

    if !cli.quiet {
        eprintln!(
            "\n{} Board {} flashed: {} pages, image CRC 0x{:08X}",
            style("🎉").green().bold(),
            board,
            report.page_count,
            report.image_crc
        );
        if report.page_retries_used > 0 {
            eprintln!(
                "  {} {} page attempt(s) had to be repeated",
                style("•").dim(),
                report.page_retries_used
            );
        }
    }

    Ok(())
}
