//! CLI wrapper for POST /admin/cache/clear on a running LiveCap server.
//!
//! Usage:
//!   LC_ADMIN_TOKEN=secret livecap-clear-cache
//!   livecap-clear-cache --url http://127.0.0.1:8000 --token secret
//!
//! Exit codes: 0 on 200, 1 on any other response or transport failure,
//! 2 when no token is configured.

use std::process::ExitCode;

fn main() -> ExitCode {
    let mut url = std::env::var("LC_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".into());
    let mut token = std::env::var("LC_ADMIN_TOKEN").ok();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--url" && i + 1 < args.len() {
            url = args[i + 1].clone();
            i += 2;
            continue;
        }
        if args[i] == "--token" && i + 1 < args.len() {
            token = Some(args[i + 1].clone());
            i += 2;
            continue;
        }
        i += 1;
    }

    let Some(token) = token.filter(|t| !t.is_empty()) else {
        eprintln!("No admin token provided. Set LC_ADMIN_TOKEN or pass --token.");
        return ExitCode::from(2);
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(clear_cache(&url, &token)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Request failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn clear_cache(url: &str, token: &str) -> anyhow::Result<bool> {
    let endpoint = format!("{}/admin/cache/clear", url.trim_end_matches('/'));
    let resp = reqwest::Client::new()
        .post(&endpoint)
        .bearer_auth(token)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await?;
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    println!("{} {}", status.as_u16(), body);
    Ok(status.is_success())
}
