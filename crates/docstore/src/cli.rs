//! Client subcommands

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;

use docstore_bus::BusClient;

fn parse_pattern(pattern: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(pattern).context("pattern must be valid JSON")?;
    anyhow::ensure!(value.is_object(), "pattern must be a JSON object");
    Ok(value)
}

/// Send one pattern and print its reply
pub async fn act(address: &str, pattern: &str, timeout_ms: u64) -> Result<()> {
    let pattern = parse_pattern(pattern)?;
    let client = BusClient::connect(address)
        .await
        .with_context(|| format!("failed to connect to {}", address))?
        .with_timeout(Duration::from_millis(timeout_ms));

    match client.act(pattern).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", serde_json::to_string_pretty(&e)?);
            anyhow::bail!("{}", e)
        }
    }
}

/// Print every reply of a streaming pattern until it ends or Ctrl-C
pub async fn subscribe(address: &str, pattern: &str) -> Result<()> {
    let pattern = parse_pattern(pattern)?;
    let client = BusClient::connect(address)
        .await
        .with_context(|| format!("failed to connect to {}", address))?;
    let mut replies = client.subscribe(pattern).await?;

    loop {
        let reply = tokio::select! {
            reply = replies.next() => reply,
            _ = tokio::signal::ctrl_c() => break,
        };
        match reply {
            Some(Ok(value)) => println!("{}", serde_json::to_string(&value)?),
            Some(Err(e)) => {
                eprintln!("{}", serde_json::to_string(&e)?);
                anyhow::bail!("{}", e);
            }
            None => break,
        }
    }
    Ok(())
}
