use farm_core::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::handlers;
use crate::session::SessionContext;

pub type Handler = fn(Arc<SessionContext>, Value) -> BoxFuture<'static, Result<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Reachable over every transport.
    Any,
    /// Local socket and in-process callers only.
    Local,
}

#[derive(Clone, Copy)]
pub struct Route {
    pub handler: Handler,
    pub scope: Scope,
}

/// Static method table, built once at startup and shared by all sessions.
pub struct CommandRegistry {
    routes: HashMap<&'static str, Route>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, scope: Scope, handler: Handler) {
        self.routes.insert(name, Route { handler, scope });
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("init", Scope::Any, |c, p| handlers::init(c, p).boxed());
        registry.register("destroy", Scope::Local, |c, p| handlers::destroy(c, p).boxed());
        registry.register("shuttingDown", Scope::Any, |c, p| handlers::shutting_down(c, p).boxed());
        registry.register("restarting", Scope::Any, |c, p| handlers::restarting(c, p).boxed());
        registry.register("requestShutdown", Scope::Local, |c, p| {
            handlers::request_shutdown(c, p).boxed()
        });
        registry.register("status", Scope::Any, |c, p| handlers::status(c, p).boxed());

        registry.register("openConnection", Scope::Any, |c, p| {
            handlers::open_connection(c, p).boxed()
        });
        registry.register("closeConnection", Scope::Any, |c, p| {
            handlers::close_connection(c, p).boxed()
        });
        registry.register("testConnection", Scope::Any, |c, p| {
            handlers::test_connection(c, p).boxed()
        });

        registry.register("sendChannel", Scope::Any, |c, p| handlers::send_channel(c, p).boxed());
        registry.register("sendChannelChunk", Scope::Any, |c, p| {
            handlers::send_channel_chunk(c, p).boxed()
        });
        registry.register("requestChannel", Scope::Any, |c, p| {
            handlers::request_channel(c, p).boxed()
        });
        registry.register("validateChannel", Scope::Any, |c, p| {
            handlers::validate_channel(c, p).boxed()
        });

        registry.register("addJob", Scope::Any, |c, p| handlers::add_job(c, p).boxed());
        registry.register("queryJob", Scope::Any, |c, p| handlers::query_job(c, p).boxed());
        registry.register("cancelJob", Scope::Any, |c, p| handlers::cancel_job(c, p).boxed());
        registry.register("executeJob", Scope::Any, |c, p| handlers::execute_job(c, p).boxed());

        registry.register("admin.cacheClear", Scope::Local, |c, p| {
            handlers::cache_clear(c, p).boxed()
        });
        registry.register("admin.cacheValidate", Scope::Local, |c, p| {
            handlers::cache_validate(c, p).boxed()
        });
        registry.register("admin.cacheRelocate", Scope::Local, |c, p| {
            handlers::cache_relocate(c, p).boxed()
        });
        registry.register("admin.restart", Scope::Local, |c, p| handlers::restart(c, p).boxed());

        registry
    }

    pub fn route(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.routes.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, ctx: Arc<SessionContext>, method: &str, params: Value) -> Result<Value> {
        let route = self
            .routes
            .get(method)
            .ok_or_else(|| Error::Protocol(format!("unknown method {}", method)))?;
        if route.scope == Scope::Local && !ctx.is_local() {
            return Err(Error::Protocol(format!(
                "{} is only available on the local transport",
                method
            )));
        }
        (route.handler)(ctx, params).await
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_agent::{Agent, AgentDeps};
    use farm_core::{Config, Paths, RemoteIdentity};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn context(dir: &TempDir, remote: RemoteIdentity) -> Arc<SessionContext> {
        let mut config = Config::default();
        config.agent.tick_interval_ms = 60_000;
        let agent = Agent::new(
            config,
            Paths::with_base(dir.path().to_path_buf()),
            AgentDeps::standalone(),
        );
        agent.init(None).await.unwrap();
        session_on(agent, remote)
    }

    fn session_on(agent: Arc<Agent>, remote: RemoteIdentity) -> Arc<SessionContext> {
        let (push, _rx) = mpsc::channel(8);
        Arc::new(SessionContext::new(agent, remote, push))
    }

    #[test]
    fn test_default_table_covers_surface() {
        let registry = CommandRegistry::with_defaults();
        for name in [
            "init",
            "destroy",
            "shuttingDown",
            "restarting",
            "requestShutdown",
            "openConnection",
            "closeConnection",
            "testConnection",
            "sendChannel",
            "sendChannelChunk",
            "requestChannel",
            "validateChannel",
            "addJob",
            "queryJob",
            "cancelJob",
            "executeJob",
            "status",
        ] {
            assert!(registry.route(name).is_some(), "missing {}", name);
        }
        assert_eq!(registry.route("admin.cacheClear").unwrap().scope, Scope::Local);

        let names = registry.names();
        assert_eq!(names.len(), 21);
        let local: Vec<_> = names
            .iter()
            .filter(|n| registry.route(n).unwrap().scope == Scope::Local)
            .collect();
        assert_eq!(
            local,
            [
                &"admin.cacheClear",
                &"admin.cacheRelocate",
                &"admin.cacheValidate",
                &"admin.restart",
                &"destroy",
                &"requestShutdown"
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, RemoteIdentity::in_process("t")).await;
        let err = CommandRegistry::with_defaults()
            .dispatch(ctx, "frobnicate", Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown method"));
    }

    #[tokio::test]
    async fn test_admin_refused_over_network() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, RemoteIdentity::network("10.1.2.3:5000")).await;
        let registry = CommandRegistry::with_defaults();
        assert!(registry
            .dispatch(ctx.clone(), "admin.cacheClear", Value::Null)
            .await
            .is_err());
        assert!(registry
            .dispatch(ctx, "requestShutdown", Value::Null)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_send_and_validate_through_table() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, RemoteIdentity::in_process("t")).await;
        let registry = CommandRegistry::with_defaults();

        let handle = registry
            .dispatch(ctx.clone(), "openConnection", Value::Null)
            .await
            .unwrap();
        let sent = registry
            .dispatch(
                ctx.clone(),
                "sendChannel",
                json!({"handle": handle, "name": "scene", "data": "aGVsbG8="}),
            )
            .await
            .unwrap();
        assert_eq!(sent, json!(true));

        let hash = farm_storage::content_hash(b"hello");
        let valid = registry
            .dispatch(
                ctx.clone(),
                "validateChannel",
                json!({"handle": handle, "name": "scene", "remoteHash": hash}),
            )
            .await
            .unwrap();
        assert_eq!(valid, json!(true));

        let missing = registry
            .dispatch(ctx, "validateChannel", json!({"handle": handle, "name": "scene"}))
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_handles_stay_with_their_session() {
        let dir = TempDir::new().unwrap();
        let owner = context(&dir, RemoteIdentity::local(None)).await;
        let stranger = session_on(Arc::clone(&owner.agent), RemoteIdentity::network("10.9.9.9:4000"));
        assert_ne!(owner.session_id(), stranger.session_id());
        let registry = CommandRegistry::with_defaults();

        let handle = registry
            .dispatch(owner.clone(), "openConnection", Value::Null)
            .await
            .unwrap();
        let params = json!({ "handle": handle });

        for (method, extra) in [
            ("testConnection", json!({})),
            ("sendChannel", json!({ "name": "scene", "data": "aGVsbG8=" })),
            ("sendChannelChunk", json!({ "name": "scene", "offset": 0, "data": "aGVsbG8=", "last": true })),
            ("requestChannel", json!({ "name": "scene" })),
            ("validateChannel", json!({ "name": "scene", "remoteHash": "00" })),
            ("cancelJob", json!({ "jobGuid": uuid::Uuid::new_v4() })),
            ("closeConnection", json!({})),
        ] {
            let mut call = params.clone();
            call.as_object_mut().unwrap().extend(extra.as_object().unwrap().clone());
            let answer = registry.dispatch(stranger.clone(), method, call).await.unwrap();
            assert_eq!(answer, json!(false), "{} honoured a foreign handle", method);
        }

        assert_eq!(owner.agent.status().await.cache.unwrap().entries, 0);
        let alive = registry
            .dispatch(owner.clone(), "testConnection", params.clone())
            .await
            .unwrap();
        assert_eq!(alive, json!(true));
        let closed = registry.dispatch(owner, "closeConnection", params).await.unwrap();
        assert_eq!(closed, json!(true));
    }
}
