const USAGE: &str = "usage: pos-sync-agent [run]
       pos-sync-agent sync
       pos-sync-agent configure <admin-url> <terminal-id> <api-key>
       pos-sync-agent reset";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        [] | ["run"] => pos_order_sync::run().await,
        ["sync"] => {
            let status = pos_order_sync::sync_once().await?;
            println!(
                "Sync cycle finished: {} operation(s) still queued, {} rejected, {} conflicts",
                status.queue_depth, status.rejected_total, status.conflicts_total
            );
            Ok(())
        }
        ["configure", admin_url, terminal_id, api_key] => {
            pos_order_sync::configure(admin_url, terminal_id, api_key)?;
            println!("Terminal credentials stored");
            Ok(())
        }
        ["reset"] => {
            pos_order_sync::reset()?;
            println!("Terminal credentials removed");
            Ok(())
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}
