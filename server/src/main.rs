//! Standalone LiveCap server binary. Configuration comes from LC_* env vars.
//! Exit codes: 0 success, 1 operational failure, 2 configuration error.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use common::config::Config;
use common::models::CapabilityProbe;
use common::retention::RetentionPolicy;
use common::supervisor::{ManagerOptions, SessionManager};

fn main() -> ExitCode {
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[LiveCap] configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[LiveCap] failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[LiveCap] server failed: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(cfg: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let manager = SessionManager::new(ManagerOptions::from_config(&cfg));
    manager.clone().spawn_background();
    manager.clone().spawn_retention_sweeper(
        RetentionPolicy {
            ttl_seconds: cfg.retention_ttl_secs,
            max_bytes: cfg.retention_max_bytes,
        },
        Duration::from_secs(cfg.retention_sweep_secs.max(1)),
    );

    let probe = Arc::new(CapabilityProbe::new());
    server::run_web_server(&cfg, manager, probe).await
}
