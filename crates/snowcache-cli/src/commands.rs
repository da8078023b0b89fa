//! Subcommand handlers
//!
//! Every handler prints JSON on stdout so the output can be piped into `jq`.

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::Context;
use serde::Serialize;
use snowcache_engine::prelude::*;
use tracing::info;

use crate::cli::Command;

/// Run one subcommand against an open engine
pub async fn dispatch(engine: &Engine, user: &str, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            statement,
            limit,
            download_only,
            page_size,
        } => {
            let mut options = ExecuteOptions::default();
            if let Some(limit) = limit {
                options = options.with_limit(limit);
            }
            if download_only {
                options = options.download_only();
            }
            let outcome = engine.execute_with(&statement, user, &options).await?;
            print_json(&outcome)?;
            if let (Some(id), false) = (outcome.session_id(), download_only) {
                let page = engine.read(id, &PageQuery::new(1, page_size))?;
                print_json(&page)?;
            }
        }
        Command::Read {
            session,
            page,
            page_size,
            scan,
        } => {
            let query = PageQuery {
                page,
                page_size,
                scan: scan.to_scan()?,
            };
            print_json(&engine.read(&session, &query)?)?;
        }
        Command::Unique {
            session,
            column,
            limit,
            scan,
        } => {
            let values = engine.unique_values(&session, &column, limit, &scan.to_scan()?)?;
            print_json(&values)?;
        }
        Command::Export {
            session,
            format,
            filename,
            output_dir,
            scan,
        } => {
            let mut request = ExportRequest::new(format.into()).with_scan(scan.to_scan()?);
            if let Some(name) = filename {
                request = request.with_filename(name);
            }
            // Encode into a temporary name first; the final name is only
            // known once the engine has sanitized it.
            let staging = output_dir.join(format!(".{}.partial", session));
            let file = File::create(&staging)
                .with_context(|| format!("creating {}", staging.display()))?;
            let (summary, mut out) =
                match engine.export_to(&session, &request, BufWriter::new(file)) {
                    Ok(done) => done,
                    Err(e) => {
                        let _ = std::fs::remove_file(&staging);
                        return Err(e.into());
                    }
                };
            out.flush()
                .with_context(|| format!("writing {}", staging.display()))?;
            drop(out);
            let target = output_dir.join(&summary.filename);
            std::fs::rename(&staging, &target)
                .with_context(|| format!("writing {}", target.display()))?;
            info!(path = %target.display(), rows = summary.rows, "export written");
            print_json(&summary)?;
        }
        Command::Sessions => print_json(&engine.list_sessions(user))?,
        Command::Status { session } => print_json(&engine.status(&session)?)?,
        Command::Cancel { session } => {
            engine.cancel(&session)?;
            print_json(&engine.status(&session)?)?;
        }
        Command::Cleanup { session, all } => {
            let removed = match (session, all) {
                (Some(id), _) => {
                    engine.cleanup(&id)?;
                    1
                }
                (None, true) => engine.cleanup_user(user)?,
                (None, false) => anyhow::bail!("pass a session id or --all"),
            };
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Command::Sweep => print_json(&engine.sweep().await?)?,
        Command::Janitor => {
            engine.start_janitor();
            eprintln!(
                "janitor running every {}s, press Ctrl+C to stop",
                engine.config().janitor_sweep.as_secs()
            );
            tokio::signal::ctrl_c()
                .await
                .context("installing Ctrl+C handler")?;
            info!("shutdown signal received");
        }
        Command::Ping => {
            let ok = engine.test_upstream().await;
            print_json(&serde_json::json!({ "upstream": ok }))?;
            if !ok {
                anyhow::bail!("upstream is not reachable");
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
