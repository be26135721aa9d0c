use crate::client::ApiClient;
use anyhow::{bail, Result};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Table};
use livedraw_core::{iso_utc, ConfigUpdate};

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Change the schedule from the next round on
    Config {
        /// Samples drawn per round
        #[arg(short, long)]
        samples: Option<u32>,
        /// Seconds before the final that the preview is published
        #[arg(short, long)]
        preview_offset: Option<u32>,
    },
    /// Publish a preview of the current round now
    ForcePreview,
    /// Lock the current round now
    ForceFinal,
}

pub async fn handle_admin_command(cmd: AdminCommands, client: &ApiClient) -> Result<()> {
    match cmd {
        AdminCommands::Config {
            samples,
            preview_offset,
        } => {
            if samples.is_none() && preview_offset.is_none() {
                bail!("Nothing to change: pass --samples and/or --preview-offset");
            }

            let update = ConfigUpdate {
                samples_planned: samples,
                preview_offset_secs: preview_offset,
            };
            let config = client.update_config(&update).await?;

            println!("Schedule updated (applies from the next round):");
            println!("  Samples per round: {}", config.samples_planned);
            println!("  Preview offset: {}s", config.preview_offset_secs);
        }

        AdminCommands::ForcePreview => {
            client.force_preview().await?;
            println!("Preview published");
        }

        AdminCommands::ForceFinal => {
            let sealed = client.force_final().await?;

            println!(
                "Round {} locked at {}",
                iso_utc(sealed.minute_start),
                iso_utc(sealed.locked_at)
            );
            println!("Final digit: {}", sealed.final_digit);

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Digit", "Count"]);
            for (digit, count) in sealed.counts.iter() {
                table.add_row(vec![digit.to_string(), count.to_string()]);
            }
            println!("{}", table);
        }
    }

    Ok(())
}
