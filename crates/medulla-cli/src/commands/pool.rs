//! `medulla pool` - connection pool inspection

use crate::core::app::App;
use anyhow::Result;
use tracing::warn;

pub async fn run(app: &App, probe: bool) -> Result<()> {
    if probe {
        for host in &app.deploy_config.production_hosts {
            match app.pool.acquire(host).await {
                Ok(_) => {
                    app.pool.release(host).await;
                    println!("{}: reachable", host.pool_key());
                }
                Err(e) => {
                    warn!(host = %host.pool_key(), error = %e, "probe failed");
                    println!("{}: {e}", host.pool_key());
                }
            }
        }
    }

    let status = app.pool.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    app.pool.close_all().await;
    Ok(())
}
