use crate::client::ApiClient;
use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use livedraw_core::{iso_utc, DigitCounts};

fn counts_table(counts: &DigitCounts) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Digit", "Count"]);
    for (digit, count) in counts.iter() {
        table.add_row(vec![digit.to_string(), count.to_string()]);
    }
    table
}

pub async fn handle_status_command(client: &ApiClient, json: bool) -> Result<()> {
    let status = client.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Server time: {}", iso_utc(status.now));
    println!("Engine: {:?}, phase: {:?}", status.status, status.phase);
    println!(
        "Schedule: {} samples, preview {}s before final",
        status.config.samples_planned, status.config.preview_offset_secs
    );
    println!("Observers: {}", status.observers);
    println!();

    match status.minute_start {
        Some(start) => {
            println!("Current round ({}):", iso_utc(start));
            println!(
                "  Samples: {}/{}",
                status.samples_taken, status.samples_planned
            );
            println!("  Preview in: {}s", status.seconds_until_preview);
            println!("  Final in: {}s", status.seconds_until_final);
            println!("{}", counts_table(&status.counts));
        }
        None => {
            println!("No round in progress");
            println!("  Next final in: {}s", status.seconds_until_final);
        }
    }

    if let Some(previous) = status.previous_result {
        println!();
        println!(
            "Previous round ({}): final digit {}",
            iso_utc(previous.minute_start),
            previous.final_digit
        );
        println!(
            "  Locked at {}, {}/{} samples",
            iso_utc(previous.locked_at),
            previous.samples_taken,
            previous.samples_planned
        );
    }

    Ok(())
}
