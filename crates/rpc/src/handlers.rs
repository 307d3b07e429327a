//! One function per RPC method. Parameters arrive as camelCase JSON
//! objects; validation faults come back as `false`, never as errors.
//! A handle is only honoured on the session that opened it.

use farm_agent::{AdminCommand, JobSpec};
use farm_core::message::base64_bytes;
use farm_core::{ConnectionHandle, Error, Result, TransportKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::session::SessionContext;

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| Error::Protocol(format!("invalid params: {}", e)))
}

fn reply<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitParams {
    #[serde(default)]
    owner_pid: Option<u32>,
}

pub async fn init(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: InitParams = parse(params)?;
    reply(ctx.agent.init(p.owner_pid).await?)
}

pub async fn destroy(ctx: Arc<SessionContext>, _params: Value) -> Result<Value> {
    ctx.agent.destroy().await;
    Ok(Value::Null)
}

pub async fn shutting_down(ctx: Arc<SessionContext>, _params: Value) -> Result<Value> {
    reply(ctx.agent.shutting_down())
}

pub async fn restarting(ctx: Arc<SessionContext>, _params: Value) -> Result<Value> {
    reply(ctx.agent.restarting())
}

pub async fn request_shutdown(ctx: Arc<SessionContext>, _params: Value) -> Result<Value> {
    ctx.agent.request_shutdown();
    Ok(Value::Null)
}

pub async fn status(ctx: Arc<SessionContext>, _params: Value) -> Result<Value> {
    reply(ctx.agent.status().await)
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenParams {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    process_id: Option<u32>,
}

pub async fn open_connection(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: OpenParams = parse(params)?;
    let mut remote = ctx.remote.clone();
    if p.agent_id.is_some() {
        remote.agent_id = p.agent_id;
    }
    // Peer credentials win; a pid claimed over the network means nothing here.
    if remote.process_id.is_none() && remote.transport != TransportKind::Network {
        remote.process_id = p.process_id;
    }
    let handle = ctx.agent.open_connection(remote, Some(ctx.push_sender())).await?;
    reply(handle)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandleParams {
    handle: ConnectionHandle,
}

pub async fn close_connection(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: HandleParams = parse(params)?;
    if !ctx.owns(p.handle).await {
        return reply(false);
    }
    reply(ctx.agent.close_connection(p.handle).await)
}

pub async fn test_connection(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: HandleParams = parse(params)?;
    reply(ctx.owns(p.handle).await)
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendChannelParams {
    handle: ConnectionHandle,
    #[serde(default)]
    job_guid: Option<Uuid>,
    name: String,
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
}

pub async fn send_channel(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: SendChannelParams = parse(params)?;
    if !ctx.owns(p.handle).await {
        return reply(false);
    }
    reply(ctx.agent.send_channel(p.handle, p.job_guid, &p.name, &p.data).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkParams {
    handle: ConnectionHandle,
    #[serde(default)]
    job_guid: Option<Uuid>,
    name: String,
    offset: u64,
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
    #[serde(default)]
    last: bool,
    #[serde(default)]
    hash: Option<String>,
}

pub async fn send_channel_chunk(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: ChunkParams = parse(params)?;
    if !ctx.owns(p.handle).await {
        return reply(false);
    }
    let accepted = ctx
        .agent
        .send_channel_chunk(
            p.handle,
            p.job_guid,
            &p.name,
            p.offset,
            &p.data,
            p.last,
            p.hash.as_deref(),
        )
        .await;
    reply(accepted)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelParams {
    handle: ConnectionHandle,
    #[serde(default)]
    job_guid: Option<Uuid>,
    name: String,
}

pub async fn request_channel(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: ChannelParams = parse(params)?;
    if !ctx.owns(p.handle).await {
        return reply(false);
    }
    reply(ctx.agent.request_channel(p.handle, p.job_guid, &p.name).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateParams {
    handle: ConnectionHandle,
    #[serde(default)]
    job_guid: Option<Uuid>,
    name: String,
    remote_hash: String,
}

pub async fn validate_channel(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: ValidateParams = parse(params)?;
    if !ctx.owns(p.handle).await {
        return reply(false);
    }
    reply(
        ctx.agent
            .validate_channel(p.handle, p.job_guid, &p.name, &p.remote_hash)
            .await,
    )
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddJobParams {
    handle: ConnectionHandle,
    job: JobSpec,
}

pub async fn add_job(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: AddJobParams = parse(params)?;
    if !ctx.owns(p.handle).await {
        return reply(false);
    }
    reply(ctx.agent.add_job(p.handle, p.job).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobParams {
    job_guid: Uuid,
}

pub async fn query_job(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: JobParams = parse(params)?;
    reply(ctx.agent.query_job(p.job_guid).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelParams {
    handle: ConnectionHandle,
    job_guid: Uuid,
}

pub async fn cancel_job(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: CancelParams = parse(params)?;
    if !ctx.owns(p.handle).await {
        return reply(false);
    }
    reply(ctx.agent.cancel_job(p.handle, p.job_guid).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteParams {
    job: JobSpec,
    origin: String,
}

pub async fn execute_job(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: ExecuteParams = parse(params)?;
    reply(ctx.agent.execute_job(p.job, p.origin).await)
}

// ---------------------------------------------------------------------------
// Admin (local scope)
// ---------------------------------------------------------------------------

pub async fn cache_clear(ctx: Arc<SessionContext>, _params: Value) -> Result<Value> {
    ctx.agent.enqueue_admin(AdminCommand::CacheClear).await;
    reply(true)
}

pub async fn cache_validate(ctx: Arc<SessionContext>, _params: Value) -> Result<Value> {
    ctx.agent.enqueue_admin(AdminCommand::CacheValidate).await;
    reply(true)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelocateParams {
    path: PathBuf,
}

pub async fn cache_relocate(ctx: Arc<SessionContext>, params: Value) -> Result<Value> {
    let p: RelocateParams = parse(params)?;
    if p.path.as_os_str().is_empty() {
        return Err(Error::Validation("relocation target must not be empty".into()));
    }
    ctx.agent.enqueue_admin(AdminCommand::CacheRelocate(p.path)).await;
    reply(true)
}

pub async fn restart(ctx: Arc<SessionContext>, _params: Value) -> Result<Value> {
    ctx.agent.enqueue_admin(AdminCommand::Restart).await;
    reply(true)
}
