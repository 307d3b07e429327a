use anyhow::Context;
use farm_core::{Config, Paths};
use farm_rpc::RpcClient;
use serde_json::Value;
use std::time::Duration;

async fn connect(paths: &Paths, address: Option<String>) -> anyhow::Result<RpcClient> {
    let config = Config::load_or_default(paths)?;
    let address =
        address.unwrap_or_else(|| format!("unix:{}", config.local_socket(paths).display()));
    let timeout = Duration::from_secs(config.transport.request_timeout_secs.max(1));
    RpcClient::connect(&address, timeout)
        .await
        .with_context(|| format!("no agent reachable at {}", address))
}

pub async fn status(paths: &Paths, address: Option<String>, json: bool) -> anyhow::Result<()> {
    let client = connect(paths, address).await?;
    let status = client.call("status", Value::Null).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    };

    println!("farmd status");
    println!("============");
    println!("Agent:       {}", text(&status["agentId"]));
    println!("Version:     {}", text(&status["version"]));
    println!("State:       {}", text(&status["state"]));
    println!("Working for: {}", text(&status["workingFor"]));
    println!("Trust:       {}", text(&status["trust"]["status"]));
    println!("Address:     {}", text(&status["address"]));
    println!("Uptime:      {}s", text(&status["uptimeSecs"]));
    println!();

    let connections = status["connections"].as_array().map(|c| c.len()).unwrap_or(0);
    println!("Connections: {}", connections);
    let jobs = &status["jobs"];
    println!(
        "Jobs:        {} pending, {} distributed, {} executing, {} completed, {} failed ({} hosted)",
        text(&jobs["pending"]),
        text(&jobs["distributed"]),
        text(&jobs["executing"]),
        text(&jobs["completed"]),
        text(&jobs["failed"]),
        text(&jobs["hosted"]),
    );
    let cache = &status["cache"];
    if cache.is_null() {
        println!("Cache:       not open");
    } else {
        println!(
            "Cache:       {} entries, {} bytes, {} pinned ({})",
            text(&cache["entries"]),
            text(&cache["bytes"]),
            text(&cache["pinnedEntries"]),
            text(&cache["root"]),
        );
    }
    println!(
        "Load:        {} avg ({})",
        text(&status["load"]["average"]),
        text(&status["load"]["verdict"]),
    );

    println!();
    println!("Transports:");
    for endpoint in status["transports"].as_array().into_iter().flatten() {
        println!("  {}", text(endpoint));
    }
    Ok(())
}

pub async fn shutdown(paths: &Paths) -> anyhow::Result<()> {
    let client = connect(paths, None).await?;
    client.call("requestShutdown", Value::Null).await?;
    println!("Shutdown requested; the agent drains before exiting.");
    Ok(())
}

pub async fn admin(paths: &Paths, method: &str, params: Value) -> anyhow::Result<()> {
    let client = connect(paths, None).await?;
    let queued: bool = client.call_as(method, params).await?;
    if queued {
        println!("{} queued; it runs on the agent's next maintenance tick.", method);
    } else {
        println!("{} was refused.", method);
    }
    Ok(())
}
