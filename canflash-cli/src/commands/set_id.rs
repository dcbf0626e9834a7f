//! Board address assignment.

use {
    crate::{Cli, CliError, config::Config, open_client},
    anyhow::{Context, Result},
    console::style,
};

/// Set-id command implementation.
pub(crate) fn cmd_set_id(cli: &Cli, config: &Config, board: u8, new_id: u16) -> Result<()> {
    // Reject bad addresses before touching the adapter
    if new_id > u16::from(canflash::protocol::MAX_ASSIGNABLE_ADDRESS) {
        return Err(canflash::Error::InvalidAddress(new_id).into());
    }

    let (mut client, bus) = open_client(cli, config)?;

    if !cli.quiet {
        eprintln!("{} Waiting for board {board}...", style("⏳").yellow());
    }
    if !client.connect(board)? {
        return Err(CliError::Device(format!(
            "Board {board} is not answering on {}",
            bus.port
        ))
        .into());
    }

    client
        .set_address(board, new_id)
        .with_context(|| format!("Changing address of board {board} failed"))?;

    if !cli.quiet {
        eprintln!(
            "{} Board {} is now at address {}",
            style("✓").green(),
            board,
            style(new_id).cyan().bold()
        );
    }
    Ok(())
}
