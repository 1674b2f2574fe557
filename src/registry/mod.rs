pub mod catalog;
pub mod handlers;
pub mod manifest;
pub mod params;
pub mod validation;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bridge::EngineBridge;
use crate::error::BridgeError;
use crate::mutation::SceneMutation;
use crate::settings::{BridgeSettings, ReconcilePolicy};
use crate::state::{HistoryEntry, SceneStore};

use catalog::Catalog;
use manifest::Manifest;
use validation::Validator;

// ── Command metadata ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub enum CommandCategory {
    Entity,
    Script,
    Compound,
    History,
    Query,
    Document,
    Security,
    Viewport,
}

impl CommandCategory {
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Script => "script",
            Self::Compound => "compound",
            Self::History => "history",
            Self::Query => "query",
            Self::Document => "document",
            Self::Security => "security",
            Self::Viewport => "viewport",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Entity => "Create, delete, rename, move and transform entities",
            Self::Script => "Write scripts and attach them to entities",
            Self::Compound => "Multi-step edits recorded as one undo step",
            Self::History => "Undo and redo",
            Self::Query => "Inspect the scene graph and entities",
            Self::Document => "Start or load a scene document",
            Self::Security => "Static checks over the project",
            Self::Viewport => "Selection, camera and simulation controls",
        }
    }

    pub fn all() -> &'static [CommandCategory] {
        &[
            Self::Entity,
            Self::Script,
            Self::Compound,
            Self::History,
            Self::Query,
            Self::Document,
            Self::Security,
            Self::Viewport,
        ]
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.slug().eq_ignore_ascii_case(slug))
    }
}

/// How a handler touches state. Query calls never need approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub enum HandlerKind {
    /// One primitive edit, one history entry.
    Mutating,
    Query,
    /// Several edits recorded as one batch entry.
    Compound,
    /// Forwarded to the engine unchanged. No local state, no history.
    Legacy,
}

// ── Command output ──────────────────────────────────────────────

/// What a handler returns. `message` serves the model and CLI, `data`
/// carries structured results for a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutput {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandOutput {
    pub fn unit(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn data(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Result of one invocation as surfaced to a UI or the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub command: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
}

impl ToolOutcome {
    pub fn ok(command: &str, output: CommandOutput) -> Self {
        Self {
            command: command.to_string(),
            success: true,
            message: output.message,
            result: output.data,
            error: None,
        }
    }

    pub fn failed(command: &str, error: BridgeError) -> Self {
        Self {
            command: command.to_string(),
            success: false,
            message: error.to_string(),
            result: None,
            error: Some(error),
        }
    }

    /// Text for the model's tool_result block. Failures carry `is_error`.
    pub fn render_for_model(&self) -> (String, bool) {
        if self.success {
            (self.message.clone(), false)
        } else {
            (format!("Error: {}", self.message), true)
        }
    }
}

// ── Handlers ────────────────────────────────────────────────────

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// `args` have already passed the manifest validator.
    async fn call(
        &self,
        command: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<CommandOutput, BridgeError>;
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<CommandOutput, BridgeError>> + Send>>;

/// Adapts a plain function returning a boxed future into a [`ToolHandler`].
pub struct FnHandler<F> {
    kind: HandlerKind,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(ToolContext, Value) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(kind: HandlerKind, f: F) -> Self {
        Self { kind, f }
    }
}

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(ToolContext, Value) -> HandlerFuture + Send + Sync + 'static,
{
    fn kind(&self) -> HandlerKind {
        self.kind
    }

    async fn call(
        &self,
        _command: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<CommandOutput, BridgeError> {
        (self.f)(ctx.clone(), args).await
    }
}

/// One command name bound to its handler.
pub struct HandlerBinding {
    pub name: &'static str,
    pub category: CommandCategory,
    pub handler: Arc<dyn ToolHandler>,
    /// JSON schema of the handler's typed params, when it has them.
    pub param_schema: Option<Value>,
}

impl HandlerBinding {
    pub fn new(name: &'static str, category: CommandCategory, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name,
            category,
            handler,
            param_schema: None,
        }
    }

    /// Bind an async fn taking typed params. Validated args are deserialized
    /// into `P` before the call.
    pub fn typed<P, F, Fut>(
        name: &'static str,
        category: CommandCategory,
        kind: HandlerKind,
        f: F,
    ) -> Self
    where
        P: DeserializeOwned + schemars::JsonSchema + Send + 'static,
        F: Fn(ToolContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandOutput, BridgeError>> + Send + 'static,
    {
        let handler = FnHandler::new(kind, move |ctx: ToolContext, args: Value| -> HandlerFuture {
            match serde_json::from_value::<P>(args) {
                Ok(params) => Box::pin(f(ctx, params)),
                Err(e) => {
                    let err = BridgeError::validation(format!("Invalid arguments for {name}: {e}"));
                    Box::pin(async move { Err(err) })
                }
            }
        });
        Self {
            name,
            category,
            handler: Arc::new(handler),
            param_schema: Some(catalog::schema_value::<P>()),
        }
    }
}

// ── Tool context ────────────────────────────────────────────────

/// Everything a handler may touch. Cheap to clone.
#[derive(Clone)]
pub struct ToolContext {
    store: Arc<SceneStore>,
    bridge: Arc<EngineBridge>,
    settings: Arc<BridgeSettings>,
    catalog: Arc<Catalog>,
    cancel: CancellationToken,
}

impl ToolContext {
    pub fn store(&self) -> &Arc<SceneStore> {
        &self.store
    }

    pub fn bridge(&self) -> &Arc<EngineBridge> {
        &self.bridge
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Same context, different cancellation scope.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub async fn dispatch(&self, command: &str, args: Value) -> Result<Value, BridgeError> {
        self.bridge
            .dispatch_with_cancel(command, args, &self.cancel)
            .await
    }

    async fn dispatch_all(&self, commands: Vec<(String, Value)>) -> Result<(), BridgeError> {
        for (command, args) in commands {
            if self.cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            self.dispatch(&command, args).await?;
        }
        Ok(())
    }

    /// Apply `mutation` optimistically, then make it authoritative on the
    /// engine. A dispatch failure is handled per the reconcile policy and
    /// then returned.
    pub async fn commit(&self, mutation: SceneMutation) -> Result<HistoryEntry, BridgeError> {
        let entry = self.store.apply(mutation)?;
        if let Err(e) = self.dispatch_all(entry.forward.engine_commands()).await {
            self.reconcile(&e, &entry.description, || self.store.revert(&entry));
            return Err(e);
        }
        Ok(entry)
    }

    pub async fn undo(&self) -> Result<HistoryEntry, BridgeError> {
        let entry = self.store.undo()?;
        if let Err(e) = self.dispatch_all(entry.inverse.engine_commands()).await {
            self.reconcile(&e, &entry.description, || self.store.rollback_undo(&entry));
            return Err(e);
        }
        Ok(entry)
    }

    pub async fn redo(&self) -> Result<HistoryEntry, BridgeError> {
        let entry = self.store.redo()?;
        if let Err(e) = self.dispatch_all(entry.forward.engine_commands()).await {
            self.reconcile(&e, &entry.description, || self.store.rollback_redo(&entry));
            return Err(e);
        }
        Ok(entry)
    }

    fn reconcile<F>(&self, error: &BridgeError, description: &str, rollback: F)
    where
        F: FnOnce() -> Result<(), BridgeError>,
    {
        match self.settings.reconcile {
            ReconcilePolicy::Revert => {
                tracing::warn!(edit = description, %error, "engine rejected edit, reverting locally");
                if let Err(e) = rollback() {
                    tracing::error!(edit = description, error = %e, "local revert failed");
                }
            }
            ReconcilePolicy::AwaitAuthoritative => {
                tracing::warn!(
                    edit = description,
                    %error,
                    "engine rejected edit, keeping local state until the next scene push"
                );
            }
        }
    }
}

// ── Registry ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Commands without a handler: {}", .0.join(", "))]
    MissingBindings(Vec<String>),
    #[error("Command bound twice: {0}")]
    DuplicateBinding(String),
    #[error("Handler bound to a command not in the manifest: {0}")]
    UnknownBinding(String),
    #[error(transparent)]
    Manifest(#[from] BridgeError),
}

/// Where a command name resolved to.
pub enum Resolution<'a> {
    Primary(&'a Arc<dyn ToolHandler>),
    Legacy(&'a Arc<dyn ToolHandler>),
    Unknown,
}

/// A handler whose typed params disagree with the manifest about required fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingMismatch {
    pub command: String,
    pub typed_required: Vec<String>,
    pub manifest_required: Vec<String>,
}

/// Collects handler bindings and checks them against a manifest.
pub struct RegistryBuilder {
    manifest: Arc<Manifest>,
    primary: Vec<HandlerBinding>,
    fallback: Vec<HandlerBinding>,
}

impl RegistryBuilder {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest: Arc::new(manifest),
            primary: Vec::new(),
            fallback: Vec::new(),
        }
    }

    pub fn bind(mut self, bindings: Vec<HandlerBinding>) -> Self {
        self.primary.extend(bindings);
        self
    }

    pub fn fallback(mut self, bindings: Vec<HandlerBinding>) -> Self {
        self.fallback.extend(bindings);
        self
    }

    /// Every manifest entry must resolve to exactly one handler.
    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut primary = HashMap::new();
        let mut fallback = HashMap::new();
        let mut categories = HashMap::new();
        let mut kinds = HashMap::new();
        let mut typed_schemas = HashMap::new();

        let tiers = self
            .primary
            .into_iter()
            .map(|b| (b, false))
            .chain(self.fallback.into_iter().map(|b| (b, true)));
        for (binding, legacy) in tiers {
            let name = binding.name.to_string();
            if !self.manifest.contains(&name) {
                return Err(RegistryError::UnknownBinding(name));
            }
            if categories.contains_key(&name) {
                return Err(RegistryError::DuplicateBinding(name));
            }
            categories.insert(name.clone(), binding.category);
            kinds.insert(name.clone(), binding.handler.kind());
            if let Some(schema) = binding.param_schema {
                typed_schemas.insert(name.clone(), schema);
            }
            if legacy {
                fallback.insert(name, binding.handler);
            } else {
                primary.insert(name, binding.handler);
            }
        }

        let missing: Vec<String> = self
            .manifest
            .iter()
            .filter(|c| !categories.contains_key(&c.name))
            .map(|c| c.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingBindings(missing));
        }

        let validators = self
            .manifest
            .iter()
            .map(|c| (c.name.clone(), validation::compile(&c.parameters)))
            .collect();

        let registry = Registry {
            catalog: Arc::new(Catalog::new(Arc::clone(&self.manifest), categories, kinds)),
            primary,
            fallback,
            validators,
            typed_schemas,
        };
        for m in registry.binding_mismatches() {
            tracing::warn!(
                command = %m.command,
                typed = ?m.typed_required,
                manifest = ?m.manifest_required,
                "typed params disagree with manifest"
            );
        }
        tracing::debug!(
            primary = registry.primary.len(),
            legacy = registry.fallback.len(),
            "tool registry built"
        );
        Ok(registry)
    }
}

/// The two-tier command table. Built once, shared by `Arc`.
pub struct Registry {
    catalog: Arc<Catalog>,
    primary: HashMap<String, Arc<dyn ToolHandler>>,
    fallback: HashMap<String, Arc<dyn ToolHandler>>,
    validators: HashMap<String, Validator>,
    typed_schemas: HashMap<String, Value>,
}

impl Registry {
    /// Built-in manifest with every built-in handler module bound.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::with_manifest(Manifest::builtin()?)
    }

    pub fn with_manifest(manifest: Manifest) -> Result<Self, RegistryError> {
        RegistryBuilder::new(manifest)
            .bind(handlers::entity::handlers())
            .bind(handlers::compound::handlers())
            .bind(handlers::history::handlers())
            .bind(handlers::query::handlers())
            .bind(handlers::document::handlers())
            .bind(handlers::security::handlers())
            .fallback(handlers::legacy::handlers())
            .build()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn manifest(&self) -> &Manifest {
        self.catalog.manifest()
    }

    pub fn context(
        &self,
        store: Arc<SceneStore>,
        bridge: Arc<EngineBridge>,
        settings: Arc<BridgeSettings>,
    ) -> ToolContext {
        ToolContext {
            store,
            bridge,
            settings,
            catalog: Arc::clone(&self.catalog),
            cancel: CancellationToken::new(),
        }
    }

    pub fn resolve(&self, name: &str) -> Resolution<'_> {
        if let Some(h) = self.primary.get(name) {
            Resolution::Primary(h)
        } else if let Some(h) = self.fallback.get(name) {
            Resolution::Legacy(h)
        } else {
            Resolution::Unknown
        }
    }

    pub fn kind_of(&self, name: &str) -> Option<HandlerKind> {
        self.catalog.kind_of(name)
    }

    /// Validate, resolve and run one command. Per-command failures come back
    /// as a failed outcome; only channel-level errors are returned as `Err`.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, BridgeError> {
        let (handler, legacy) = match self.resolve(name) {
            Resolution::Primary(h) => (h, false),
            Resolution::Legacy(h) => (h, true),
            Resolution::Unknown => {
                tracing::error!(command = name, "unknown command");
                return Ok(ToolOutcome::failed(
                    name,
                    BridgeError::UnknownCommand {
                        command: name.to_string(),
                    },
                ));
            }
        };

        let args = match self.validators.get(name) {
            Some(validator) => match validator.validate(&args) {
                Ok(coerced) => coerced,
                Err(e) => {
                    tracing::debug!(command = name, error = %e, "arguments rejected");
                    return Ok(ToolOutcome::failed(name, e.into()));
                }
            },
            None => args,
        };

        let started = Instant::now();
        match handler.call(name, args, ctx).await {
            Ok(output) => {
                tracing::debug!(command = name, legacy, elapsed = ?started.elapsed(), "command ok");
                Ok(ToolOutcome::ok(name, output))
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(command = name, error = %e, "command hit a channel failure");
                Err(e)
            }
            Err(e) => {
                tracing::info!(command = name, legacy, error = %e, "command failed");
                Ok(ToolOutcome::failed(name, e))
            }
        }
    }

    /// Handlers whose typed required fields differ from the manifest's.
    pub fn binding_mismatches(&self) -> Vec<BindingMismatch> {
        let mut out = Vec::new();
        for descriptor in self.manifest().iter() {
            let Some(schema) = self.typed_schemas.get(&descriptor.name) else {
                continue;
            };
            let typed: BTreeSet<String> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let declared: BTreeSet<String> =
                descriptor.parameters.required.iter().cloned().collect();
            if typed != declared {
                out.push(BindingMismatch {
                    command: descriptor.name.clone(),
                    typed_required: typed.into_iter().collect(),
                    manifest_required: declared.into_iter().collect(),
                });
            }
        }
        out
    }
}
