//! Bus discovery.

use {
    crate::{Cli, config::Config, open_client},
    anyhow::Result,
    canflash::protocol::BROADCAST_ADDRESS,
    console::style,
};

/// List command implementation.
pub(crate) fn cmd_list(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let (mut client, _bus) = open_client(cli, config)?;
    let boards = client.discover_default()?;

    if json {
        let list: Vec<u8> = boards.iter().copied().collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    eprintln!("{}", style("Bootloader nodes").bold().underlined());
    if boards.is_empty() {
        eprintln!("  {}", style("No boards answered").dim());
        return Ok(());
    }

    for board in &boards {
        eprintln!("  {} {}", style("•").green(), style(board).cyan());
    }

    if boards.contains(&BROADCAST_ADDRESS) {
        eprintln!(
            "\n{} A board answered at address 0. It probably runs a freshly programmed \
             bootloader; give it an address with `canflash set-id -b 0 -i <id>` before flashing.",
            style("⚠").yellow().bold()
        );
    }
    Ok(())
}
