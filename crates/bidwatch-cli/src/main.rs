use anyhow::Result;
use bidwatch_adapters::NoticeFilter;
use bidwatch_sync::SyncRequest;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bidwatch")]
#[command(about = "Procurement notice crawler and vendor extractor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl, enrich, normalize and persist one run.
    Sync {
        /// Search keyword; empty matches everything.
        keyword: Option<String>,
        /// Notice filter key, e.g. `daDongThau` or `coNhaThauTrungThau`.
        notice: Option<NoticeFilter>,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "bidwatch=info".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        keyword: None,
        notice: None,
    }) {
        Commands::Sync { keyword, notice } => {
            let request = SyncRequest {
                keyword: keyword.filter(|k| !k.trim().is_empty()),
                notice: notice.unwrap_or(NoticeFilter::All),
            };
            let summary = bidwatch_sync::run_sync_once_from_env(request).await?;
            println!(
                "sync complete: run_id={} pages={} bids={} vendors={} links={} manifest={}",
                summary.run_id,
                summary.pages_fetched,
                summary.bids_persisted,
                summary.vendors_persisted,
                summary.links_persisted,
                summary.manifest
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            bidwatch_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_takes_positional_keyword_and_notice() {
        let cli = Cli::try_parse_from(["bidwatch", "sync", "firewall", "daDongThau"]).unwrap();
        match cli.command {
            Some(Commands::Sync { keyword, notice }) => {
                assert_eq!(keyword.as_deref(), Some("firewall"));
                assert_eq!(notice, Some(NoticeFilter::Closed));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_notice_key_is_rejected() {
        assert!(Cli::try_parse_from(["bidwatch", "sync", "firewall", "khongTonTai"]).is_err());
    }
}
