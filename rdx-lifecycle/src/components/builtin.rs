//! Stand-ins for the subsystems of the IDE server.
//!
//! They carry no protocol logic (no real HTTP listener, token signing or
//! socket transport); they exist so the dispatcher drives a catalog with the
//! same ids, dependency declarations and failure modes as the real server,
//! and so the bus channels see realistic traffic.
//!
//! Start dependencies are declared once in [`START_DEPENDENCIES`]; `stop` and
//! `destroy` use the reverse edges, so a service is torn down before the
//! registries it was started after.

use super::catalog::{ComponentCatalog, ComponentEnv};
use crate::bus::{channels, Channel, Message};
use crate::common::{ComponentId, Phase};
use crate::component::{Component, ComponentLookup, PhaseContext, PhaseFuture};
use crate::config::ServerConfig;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const TOKEN_FACTORY: &str = "token-factory";
pub const AUTHENTICATOR: &str = "authenticator";
pub const WORKSPACE_REGISTRY: &str = "workspace-registry";
pub const ALIAS_REGISTRY: &str = "alias-registry";
pub const SESSION_REGISTRY: &str = "session-registry";
pub const HTTP_SERVICE: &str = "http-service";
pub const SOCKET_SERVICE: &str = "socket-service";

/// Components that may only start after others have started.
pub const START_DEPENDENCIES: &[(&str, &[&str])] = &[
    (
        HTTP_SERVICE,
        &[
            SESSION_REGISTRY,
            WORKSPACE_REGISTRY,
            ALIAS_REGISTRY,
            AUTHENTICATOR,
            TOKEN_FACTORY,
        ],
    ),
    (SOCKET_SERVICE, &[SESSION_REGISTRY, AUTHENTICATOR, HTTP_SERVICE]),
];

const DEFAULT_SERVICE_URL: &str = "http://localhost:5000";

/// Registers every builtin kind, in the order the server registers them.
pub(crate) fn register_all(catalog: &mut ComponentCatalog) {
    catalog
        .register(TOKEN_FACTORY, |env| Ok(Arc::new(TokenFactory::new(env)) as Arc<dyn Component>))
        .register(AUTHENTICATOR, |env| Ok(Arc::new(Authenticator::new(env)) as Arc<dyn Component>))
        .register(WORKSPACE_REGISTRY, |env| {
            Ok(Arc::new(WorkspaceRegistry::new(env)) as Arc<dyn Component>)
        })
        .register(ALIAS_REGISTRY, |env| Ok(Arc::new(AliasRegistry::new(env)) as Arc<dyn Component>))
        .register(SESSION_REGISTRY, |env| {
            Ok(Arc::new(SessionRegistry::new(env)) as Arc<dyn Component>)
        })
        .register(HTTP_SERVICE, |env| Ok(Arc::new(HttpService::new(env)?) as Arc<dyn Component>))
        .register(SOCKET_SERVICE, |env| Ok(Arc::new(SocketService::new(env)) as Arc<dyn Component>));
}

/// Per-phase dependencies of a builtin component.
#[derive(Debug, Clone, Default)]
struct Dependencies {
    start: Vec<ComponentId>,
    teardown: Vec<ComponentId>,
}

impl Dependencies {
    /// Teardown edges only point at kinds the configuration keeps enabled, so
    /// disabling a service does not leave its providers waiting for it.
    fn of(id: &str, config: &ServerConfig) -> Self {
        let start: Vec<ComponentId> = START_DEPENDENCIES
            .iter()
            .find(|(owner, _)| *owner == id)
            .map(|(_, deps)| deps.iter().map(|d| d.to_string()).collect())
            .unwrap_or_default();
        let teardown: Vec<ComponentId> = START_DEPENDENCIES
            .iter()
            .filter(|(owner, deps)| deps.contains(&id) && config.is_enabled(owner))
            .map(|(owner, _)| owner.to_string())
            .collect();
        Self { start, teardown }
    }

    fn get(&self, phase: Phase) -> Vec<ComponentId> {
        match phase {
            Phase::Init => Vec::new(),
            Phase::Start => self.start.clone(),
            Phase::Stop | Phase::Destroy => self.teardown.clone(),
        }
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// --- token-factory ---

/// Holds the token signing secret.
///
/// The secret is read once, on the first successful `start`; a different
/// secret on a later restart is ignored with a warning.
pub struct TokenFactory {
    deps: Dependencies,
    configured: Option<String>,
    secret: Mutex<Option<String>>,
}

impl TokenFactory {
    pub fn new(env: &ComponentEnv) -> Self {
        let configured = env
            .config()
            .token_secret
            .clone()
            .or_else(|| env.option("secret").map(str::to_string))
            .filter(|s| !s.is_empty());
        Self {
            deps: Dependencies::of(TOKEN_FACTORY, env.config()),
            configured,
            secret: Mutex::new(None),
        }
    }

    pub fn has_secret(&self) -> bool {
        lock(&self.secret).is_some()
    }

    fn apply_secret(&self) -> anyhow::Result<Value> {
        let mut secret = lock(&self.secret);
        let current = secret.clone();
        match (current.as_deref(), self.configured.as_deref()) {
            (None, Some(new)) => {
                debug!("applies new token secret");
                *secret = Some(new.to_string());
            }
            (Some(current), Some(new)) if current != new => {
                warn!("changing token secret requires whole process restart");
            }
            _ => {}
        }
        match secret.as_ref() {
            Some(_) => Ok(json!({ "secret": "configured" })),
            None => anyhow::bail!("invalid server config - no token secret"),
        }
    }
}

impl Component for TokenFactory {
    fn id(&self) -> &str {
        TOKEN_FACTORY
    }

    fn dependencies(&self, phase: Phase) -> Vec<ComponentId> {
        self.deps.get(phase)
    }

    fn start(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move { self.apply_secret() })
    }
}

// --- authenticator ---

/// Checks login credentials against the configured ones.
pub struct Authenticator {
    deps: Dependencies,
    login: Option<(String, String)>,
}

impl Authenticator {
    pub fn new(env: &ComponentEnv) -> Self {
        let login = match (env.option("login_id"), env.option("login_password")) {
            (Some(id), Some(password)) => Some((id.to_string(), password.to_string())),
            _ => None,
        };
        Self {
            deps: Dependencies::of(AUTHENTICATOR, env.config()),
            login,
        }
    }

    /// Fails when the server was not configured for logins.
    pub fn authenticate(&self, login_id: &str, password: &str) -> anyhow::Result<bool> {
        match &self.login {
            Some((id, pw)) => Ok(id == login_id && pw == password),
            None => anyhow::bail!("server has not configured to login"),
        }
    }
}

impl Component for Authenticator {
    fn id(&self) -> &str {
        AUTHENTICATOR
    }

    fn dependencies(&self, phase: Phase) -> Vec<ComponentId> {
        self.deps.get(phase)
    }

    fn start(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move { Ok(json!({ "login": self.login.is_some() })) })
    }
}

// --- workspace-registry ---

/// A workspace known to the server.
#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: String,
    pub root: PathBuf,
}

type WorkspaceTable = Arc<Mutex<BTreeMap<String, Workspace>>>;

/// Maps filesystem paths to workspaces and answers `workspace.lookup`
/// requests on the `workspace` channel while started.
///
/// Every option of `[components.workspace-registry.options]` declares one
/// workspace: the key is its id, the value its root directory. Without
/// options a single `default` workspace rooted at the working directory is
/// registered.
pub struct WorkspaceRegistry {
    deps: Dependencies,
    declared: Vec<Workspace>,
    workspaces: WorkspaceTable,
    channel: Arc<Channel>,
}

impl WorkspaceRegistry {
    pub const LOOKUP: &'static str = "workspace.lookup";
    pub const LIST: &'static str = "workspace.list";

    pub fn new(env: &ComponentEnv) -> Self {
        let mut declared: Vec<Workspace> = env
            .config()
            .component(WORKSPACE_REGISTRY)
            .map(|settings| {
                settings
                    .options
                    .iter()
                    .map(|(id, root)| Workspace {
                        id: id.clone(),
                        root: PathBuf::from(root),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if declared.is_empty() {
            let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            declared.push(Workspace {
                id: "default".to_string(),
                root,
            });
        }
        Self {
            deps: Dependencies::of(WORKSPACE_REGISTRY, env.config()),
            declared,
            workspaces: Arc::new(Mutex::new(BTreeMap::new())),
            channel: env.bus().channel(channels::WORKSPACE),
        }
    }

    pub fn get(&self, id: &str) -> Option<Workspace> {
        lock(&self.workspaces).get(id).cloned()
    }

    /// The workspace with the longest root containing `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<Workspace> {
        find_by_path(&lock(&self.workspaces), path)
    }

    fn serve(&self) {
        let table = self.workspaces.clone();
        let lookup = crate::bus::callback(move |msg, env| {
            let Some(responder) = env.responder() else {
                return Ok(());
            };
            let Some(path) = requested_path(msg) else {
                responder.reject("expected a path");
                return Ok(());
            };
            match find_by_path(&lock(&table), Path::new(&path)) {
                Some(ws) => {
                    let relative = Path::new(&path)
                        .strip_prefix(&ws.root)
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    responder.resolve(Message::Data(json!({
                        "workspace": ws.id,
                        "root": ws.root.display().to_string(),
                        "relative": relative,
                    })));
                }
                None => {
                    responder.reject(format!("no workspace contains '{}'", path));
                }
            }
            Ok(())
        });
        let table = self.workspaces.clone();
        let list = crate::bus::callback(move |_msg, env| {
            if let Some(responder) = env.responder() {
                let all: Vec<Workspace> = lock(&table).values().cloned().collect();
                responder.resolve(Message::Data(serde_json::to_value(all)?));
            }
            Ok(())
        });
        self.channel
            .subscribe(WORKSPACE_REGISTRY, [(Self::LOOKUP, lookup), (Self::LIST, list)]);
    }
}

fn requested_path(msg: &Message) -> Option<String> {
    match msg.data()? {
        Value::String(path) => Some(path.clone()),
        Value::Object(map) => map.get("path")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn find_by_path(table: &BTreeMap<String, Workspace>, path: &Path) -> Option<Workspace> {
    table
        .values()
        .filter(|ws| path.starts_with(&ws.root))
        .max_by_key(|ws| ws.root.components().count())
        .cloned()
}

impl Component for WorkspaceRegistry {
    fn id(&self) -> &str {
        WORKSPACE_REGISTRY
    }

    fn dependencies(&self, phase: Phase) -> Vec<ComponentId> {
        self.deps.get(phase)
    }

    fn init(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            let mut table = lock(&self.workspaces);
            for ws in &self.declared {
                table.insert(ws.id.clone(), ws.clone());
            }
            info!("{} workspace(s) loaded.", table.len());
            Ok(json!({ "workspaces": table.len() }))
        })
    }

    fn start(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            self.serve();
            Ok(Value::Null)
        })
    }

    fn stop(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            self.channel.unsubscribe(WORKSPACE_REGISTRY);
            Ok(Value::Null)
        })
    }

    fn destroy(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            let mut table = lock(&self.workspaces);
            let flushed = table.len();
            table.clear();
            Ok(json!({ "flushed": flushed }))
        })
    }

    fn dispose(&self) {
        self.channel.unsubscribe(WORKSPACE_REGISTRY);
    }
}

// --- alias-registry ---

/// Short names for workspace paths, declared as options
/// (`<alias> = <source path>`).
pub struct AliasRegistry {
    deps: Dependencies,
    declared: BTreeMap<String, String>,
    aliases: Mutex<BTreeMap<String, String>>,
}

impl AliasRegistry {
    pub fn new(env: &ComponentEnv) -> Self {
        Self {
            deps: Dependencies::of(ALIAS_REGISTRY, env.config()),
            declared: env
                .config()
                .component(ALIAS_REGISTRY)
                .map(|settings| settings.options.clone())
                .unwrap_or_default(),
            aliases: Mutex::new(BTreeMap::new()),
        }
    }

    /// The source path an alias points to.
    pub fn get(&self, alias: &str) -> Option<String> {
        lock(&self.aliases).get(alias).cloned()
    }
}

impl Component for AliasRegistry {
    fn id(&self) -> &str {
        ALIAS_REGISTRY
    }

    fn dependencies(&self, phase: Phase) -> Vec<ComponentId> {
        self.deps.get(phase)
    }

    fn init(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            let mut aliases = lock(&self.aliases);
            aliases.extend(self.declared.clone());
            Ok(json!({ "aliases": aliases.len() }))
        })
    }

    fn destroy(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            lock(&self.aliases).clear();
            Ok(Value::Null)
        })
    }
}

// --- session-registry ---

type SessionTable = Arc<Mutex<HashMap<String, Value>>>;

/// Tracks client sessions from the `session.opened` and `session.closed`
/// messages of the `session` channel, and answers `session.count` requests.
pub struct SessionRegistry {
    deps: Dependencies,
    sessions: SessionTable,
    channel: Arc<Channel>,
}

impl SessionRegistry {
    pub const OPENED: &'static str = "session.opened";
    pub const CLOSED: &'static str = "session.closed";
    pub const COUNT: &'static str = "session.count";

    pub fn new(env: &ComponentEnv) -> Self {
        Self {
            deps: Dependencies::of(SESSION_REGISTRY, env.config()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            channel: env.bus().channel(channels::SESSION),
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn listen(&self) {
        let opened = self.sessions.clone();
        let closed = self.sessions.clone();
        let counted = self.sessions.clone();
        self.channel.subscribe(
            SESSION_REGISTRY,
            [
                (
                    Self::OPENED,
                    crate::bus::callback(move |msg, _env| {
                        let id = session_id(msg)?;
                        debug!("add session {}", id);
                        lock(&opened).insert(id, msg.clone().into_value());
                        Ok(())
                    }),
                ),
                (
                    Self::CLOSED,
                    crate::bus::callback(move |msg, _env| {
                        let id = session_id(msg)?;
                        if lock(&closed).remove(&id).is_some() {
                            debug!("removed session {}", id);
                        }
                        Ok(())
                    }),
                ),
                (
                    Self::COUNT,
                    crate::bus::callback(move |_msg, env| {
                        if let Some(responder) = env.responder() {
                            responder.resolve(Message::Data(json!(lock(&counted).len())));
                        }
                        Ok(())
                    }),
                ),
            ],
        );
    }
}

fn session_id(msg: &Message) -> anyhow::Result<String> {
    msg.data()
        .and_then(|data| data.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("session message without an id"))
}

impl Component for SessionRegistry {
    fn id(&self) -> &str {
        SESSION_REGISTRY
    }

    fn dependencies(&self, phase: Phase) -> Vec<ComponentId> {
        self.deps.get(phase)
    }

    fn start(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            self.listen();
            Ok(Value::Null)
        })
    }

    fn stop(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            self.channel.unsubscribe(SESSION_REGISTRY);
            Ok(json!({ "sessions": self.session_count() }))
        })
    }

    fn destroy(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            lock(&self.sessions).clear();
            Ok(Value::Null)
        })
    }

    fn dispose(&self) {
        self.channel.unsubscribe(SESSION_REGISTRY);
    }
}

// --- http-service ---

/// Resolves the service URL and port; "listens" between `start` and `stop`.
pub struct HttpService {
    deps: Dependencies,
    url: String,
    port: u16,
    listening: AtomicBool,
}

impl HttpService {
    pub fn new(env: &ComponentEnv) -> anyhow::Result<Self> {
        let url = env
            .option("url")
            .unwrap_or(DEFAULT_SERVICE_URL)
            .trim_end_matches('/')
            .to_string();
        let port = service_port(&url)?;
        Ok(Self {
            deps: Dependencies::of(HTTP_SERVICE, env.config()),
            url,
            port,
            listening: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

/// The explicit port of `url`, or the scheme's default one.
pub fn service_port(url: &str) -> anyhow::Result<u16> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("illegal service url in server config : {}", url))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if let Some((_, port)) = authority.rsplit_once(':') {
        return port
            .parse()
            .map_err(|_| anyhow::anyhow!("illegal service url in server config : {}", url));
    }
    match scheme {
        "http" => Ok(80),
        "https" => Ok(443),
        _ => anyhow::bail!("illegal service url in server config : {}", url),
    }
}

impl Component for HttpService {
    fn id(&self) -> &str {
        HTTP_SERVICE
    }

    fn dependencies(&self, phase: Phase) -> Vec<ComponentId> {
        self.deps.get(phase)
    }

    fn start(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            self.listening.store(true, Ordering::SeqCst);
            info!("http service listening on port {}", self.port);
            Ok(json!({ "url": self.url, "port": self.port }))
        })
    }

    fn stop(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            self.listening.store(false, Ordering::SeqCst);
            Ok(Value::Null)
        })
    }
}

// --- socket-service ---

/// Accepts client sessions while started and announces them on the
/// `session` channel.
pub struct SocketService {
    deps: Dependencies,
    sessions: Arc<Channel>,
    socket: Arc<Channel>,
    lookup: Mutex<Option<ComponentLookup>>,
    open: Mutex<Vec<String>>,
    listening: AtomicBool,
}

impl SocketService {
    pub const LISTENING: &'static str = "socket.listening";
    pub const CLOSED: &'static str = "socket.closed";

    pub fn new(env: &ComponentEnv) -> Self {
        Self {
            deps: Dependencies::of(SOCKET_SERVICE, env.config()),
            sessions: env.bus().channel(channels::SESSION),
            socket: env.bus().channel(channels::SOCKET),
            lookup: Mutex::new(None),
            open: Mutex::new(Vec::new()),
            listening: AtomicBool::new(false),
        }
    }

    /// Accepts a client session and publishes `session.opened`.
    pub fn open_session(&self, session_id: &str, workspace_id: &str) -> anyhow::Result<()> {
        if !self.listening.load(Ordering::SeqCst) {
            anyhow::bail!("socket service is not started");
        }
        let mut open = lock(&self.open);
        if open.iter().any(|s| s == session_id) {
            anyhow::bail!("duplicated connection on session '{}'", session_id);
        }
        open.push(session_id.to_string());
        drop(open);
        self.sessions.publish(
            SessionRegistry::OPENED,
            Message::Data(json!({ "id": session_id, "workspace": workspace_id })),
        );
        Ok(())
    }

    /// Drops a client session and publishes `session.closed`. Returns `false`
    /// for unknown sessions.
    pub fn close_session(&self, session_id: &str) -> bool {
        let removed = {
            let mut open = lock(&self.open);
            let before = open.len();
            open.retain(|s| s != session_id);
            open.len() != before
        };
        if removed {
            self.sessions
                .publish(SessionRegistry::CLOSED, Message::Data(json!({ "id": session_id })));
        }
        removed
    }
}

impl Component for SocketService {
    fn id(&self) -> &str {
        SOCKET_SERVICE
    }

    fn dependencies(&self, phase: Phase) -> Vec<ComponentId> {
        self.deps.get(phase)
    }

    fn attach(&self, lookup: ComponentLookup) {
        *lock(&self.lookup) = Some(lookup);
    }

    fn start(&self, ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            let has_sessions = lock(&self.lookup)
                .as_ref()
                .and_then(|lookup| lookup.get(SESSION_REGISTRY))
                .is_some();
            if !has_sessions {
                warn!("no session registry; client sessions will not be tracked");
            }
            let url = ctx
                .dependency(HTTP_SERVICE)
                .and_then(|http| http.get("url"))
                .cloned()
                .unwrap_or(Value::Null);
            self.listening.store(true, Ordering::SeqCst);
            self.socket
                .publish(Self::LISTENING, Message::Data(json!({ "url": url })));
            Ok(json!({ "url": url }))
        })
    }

    fn stop(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        Box::pin(async move {
            self.listening.store(false, Ordering::SeqCst);
            let open: Vec<String> = lock(&self.open).clone();
            for session in &open {
                self.close_session(session);
            }
            self.socket.publish(Self::CLOSED, Message::Empty);
            Ok(json!({ "closed_sessions": open.len() }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::error::BusError;

    fn env(kind: &str, toml: &str) -> ComponentEnv {
        let config = ServerConfig::from_toml(toml).unwrap();
        ComponentEnv::new(kind, Arc::new(EventBus::new()), Arc::new(config))
    }

    #[test]
    fn test_teardown_dependencies_reverse_start_dependencies() {
        let config = ServerConfig::default();
        let tokens = Dependencies::of(TOKEN_FACTORY, &config);
        assert!(tokens.get(Phase::Start).is_empty());
        assert_eq!(tokens.get(Phase::Stop), vec![HTTP_SERVICE]);
        let sessions = Dependencies::of(SESSION_REGISTRY, &config);
        assert_eq!(sessions.get(Phase::Destroy), vec![HTTP_SERVICE, SOCKET_SERVICE]);
        let socket = Dependencies::of(SOCKET_SERVICE, &config);
        assert_eq!(socket.get(Phase::Start), vec![SESSION_REGISTRY, AUTHENTICATOR, HTTP_SERVICE]);
        assert!(socket.get(Phase::Stop).is_empty());

        let without_socket =
            ServerConfig::from_toml("[components.socket-service]\nenabled = false").unwrap();
        let sessions = Dependencies::of(SESSION_REGISTRY, &without_socket);
        assert_eq!(sessions.get(Phase::Stop), vec![HTTP_SERVICE]);
    }

    #[tokio::test]
    async fn test_token_factory_requires_a_secret() {
        let missing = TokenFactory::new(&env(TOKEN_FACTORY, ""));
        let err = missing.start(PhaseContext::new(Phase::Start)).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid server config - no token secret");

        let ok = TokenFactory::new(&env(TOKEN_FACTORY, "token_secret = \"abc\""));
        ok.start(PhaseContext::new(Phase::Start)).await.unwrap();
        assert!(ok.has_secret());
    }

    #[test]
    fn test_service_port_defaults_by_scheme() {
        assert_eq!(service_port("http://example.com").unwrap(), 80);
        assert_eq!(service_port("https://example.com/api").unwrap(), 443);
        assert_eq!(service_port("http://localhost:5000").unwrap(), 5000);
        assert!(service_port("ftp://example.com").is_err());
        assert!(service_port("localhost").is_err());
    }

    #[tokio::test]
    async fn test_workspace_registry_answers_lookups_while_started() {
        let env = env(
            WORKSPACE_REGISTRY,
            "[components.workspace-registry.options]\nprojects = \"/srv/ws\"\ndeep = \"/srv/ws/deep\"",
        );
        let registry = WorkspaceRegistry::new(&env);
        let channel = env.bus().channel(channels::WORKSPACE);
        registry.init(PhaseContext::new(Phase::Init)).await.unwrap();

        let err = channel
            .request(WorkspaceRegistry::LOOKUP, Message::Data(json!("/srv/ws/a.txt")))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponder { .. }));

        registry.start(PhaseContext::new(Phase::Start)).await.unwrap();
        let reply = channel
            .request(
                WorkspaceRegistry::LOOKUP,
                Message::Data(json!({ "path": "/srv/ws/deep/src/lib.rs" })),
            )
            .await
            .unwrap();
        assert_eq!(reply.data().unwrap()["workspace"], "deep");
        assert_eq!(reply.data().unwrap()["relative"], "src/lib.rs");

        let err = channel
            .request(WorkspaceRegistry::LOOKUP, Message::Data(json!("/etc/passwd")))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Rejected { .. }));

        registry.stop(PhaseContext::new(Phase::Stop)).await.unwrap();
        assert_eq!(channel.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_socket_sessions_are_counted_by_session_registry() {
        let bus = Arc::new(EventBus::new());
        let config = Arc::new(ServerConfig::default());
        let registry = SessionRegistry::new(&ComponentEnv::new(SESSION_REGISTRY, bus.clone(), config.clone()));
        let socket = SocketService::new(&ComponentEnv::new(SOCKET_SERVICE, bus.clone(), config));

        assert!(socket.open_session("s1", "default").is_err());
        registry.start(PhaseContext::new(Phase::Start)).await.unwrap();
        socket.start(PhaseContext::new(Phase::Start)).await.unwrap();

        socket.open_session("s1", "default").unwrap();
        socket.open_session("s2", "default").unwrap();
        assert!(socket.open_session("s1", "default").is_err());
        assert_eq!(registry.session_count(), 2);
        let count = bus
            .channel(channels::SESSION)
            .request(SessionRegistry::COUNT, Message::Empty)
            .await
            .unwrap();
        assert_eq!(count.data(), Some(&json!(2)));

        assert!(socket.close_session("s1"));
        assert!(!socket.close_session("s1"));
        assert_eq!(registry.session_count(), 1);

        socket.stop(PhaseContext::new(Phase::Stop)).await.unwrap();
        assert_eq!(registry.session_count(), 0);
    }
}
