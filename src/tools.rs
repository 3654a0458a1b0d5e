//! Function tools: declarations, handlers and the tool-call dispatcher
//!
//! Tools are registered with a [`ToolRegistry`] before connecting. Once a
//! session is up, a [`ToolDispatcher`] answers every `toolCall` with exactly
//! one `toolResponse` batch covering each call id once.

use crate::events::{EventKind, FunctionCall, InboundEvent, OutboundChunk, Subscription};
use crate::gemini::{FunctionResponse, LiveError, Result};
use crate::gemini_client::Session;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaType {
    Object,
    String,
    Number,
    Integer,
    Boolean,
    Array,
}

/// OpenAPI-style parameter schema as accepted by function declarations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

impl Schema {
    fn of(schema_type: SchemaType) -> Self {
        Self {
            schema_type,
            description: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
            items: None,
            enum_values: Vec::new(),
        }
    }

    pub fn object() -> Self {
        Self::of(SchemaType::Object)
    }

    pub fn string() -> Self {
        Self::of(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::of(SchemaType::Number)
    }

    pub fn integer() -> Self {
        Self::of(SchemaType::Integer)
    }

    pub fn boolean() -> Self {
        Self::of(SchemaType::Boolean)
    }

    pub fn array(items: Schema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of(SchemaType::Array)
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn property(mut self, name: &str, schema: Schema) -> Self {
        self.properties.insert(name.to_string(), schema);
        self
    }

    pub fn require(mut self, name: &str) -> Self {
        self.required.push(name.to_string());
        self
    }

    /// Restrict a string to a fixed set of values.
    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    /// Check `value` against this schema. The error names the offending path.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        self.validate_at("$", value)
    }

    fn validate_at(&self, path: &str, value: &Value) -> std::result::Result<(), String> {
        let type_ok = match self.schema_type {
            SchemaType::Object => value.is_object(),
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value.is_i64() || value.is_u64(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Array => value.is_array(),
        };
        if !type_ok {
            return Err(format!("{path}: expected {:?}, got {}", self.schema_type, json_type(value)));
        }

        if let (false, Some(s)) = (self.enum_values.is_empty(), value.as_str()) {
            if !self.enum_values.iter().any(|v| v == s) {
                return Err(format!("{path}: `{s}` is not one of {:?}", self.enum_values));
            }
        }

        if let Some(object) = value.as_object() {
            if let Some(missing) = self.required.iter().find(|name| !object.contains_key(*name)) {
                return Err(format!("{path}: missing required property `{missing}`"));
            }
            for (name, schema) in &self.properties {
                if let Some(field) = object.get(name) {
                    schema.validate_at(&format!("{path}.{name}"), field)?;
                }
            }
        }

        if let (Some(items), Some(array)) = (&self.items, value.as_array()) {
            for (i, item) in array.iter().enumerate() {
                items.validate_at(&format!("{path}[{i}]"), item)?;
            }
        }

        Ok(())
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Schema>,
}

impl ToolDeclaration {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Schema) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Executes one tool. The returned value becomes the response `output`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl ToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

struct RegisteredTool {
    declaration: ToolDeclaration,
    handler: Arc<dyn ToolHandler>,
}

/// Declared tools and their handlers, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with [`LiveError::DuplicateTool`] when the name is taken.
    pub fn register(&mut self, declaration: ToolDeclaration, handler: impl ToolHandler + 'static) -> Result<()> {
        if self.get(&declaration.name).is_some() {
            return Err(LiveError::DuplicateTool(declaration.name));
        }
        debug!("Registered tool {}", declaration.name);
        self.tools.push(RegisteredTool {
            declaration,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Declarations for the setup frame.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.iter().map(|t| t.declaration.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<(&ToolDeclaration, Arc<dyn ToolHandler>)> {
        self.tools
            .iter()
            .find(|t| t.declaration.name == name)
            .map(|t| (&t.declaration, t.handler.clone()))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Run a single call to completion and build its response.
pub async fn dispatch_call(registry: &ToolRegistry, call: &FunctionCall, timeout: Duration) -> FunctionResponse {
    match invoke(registry, call, timeout).await {
        Ok(output) => {
            info!("Tool call {} ({}) succeeded", call.id, call.name);
            FunctionResponse::success(call.id.clone(), output)
        }
        Err(e) => {
            warn!("Tool call {} ({}) failed: {}", call.id, call.name, e);
            FunctionResponse::failure(call.id.clone(), &e)
        }
    }
}

async fn invoke(registry: &ToolRegistry, call: &FunctionCall, timeout: Duration) -> Result<Value> {
    let (declaration, handler) = registry
        .get(&call.name)
        .ok_or_else(|| LiveError::UnroutableToolCall(call.name.clone()))?;

    // Calls without arguments arrive with `args` absent.
    let args = if call.args.is_null() {
        Value::Object(Default::default())
    } else {
        call.args.clone()
    };
    if let Some(schema) = &declaration.parameters {
        schema.validate(&args).map_err(|reason| LiveError::InvalidArguments {
            name: call.name.clone(),
            reason,
        })?;
    }

    match tokio::time::timeout(timeout, handler.call(args)).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(LiveError::Handler {
            name: call.name.clone(),
            message: format!("{e:#}"),
        }),
        Err(_) => Err(LiveError::HandlerTimeout {
            name: call.name.clone(),
            timeout,
        }),
    }
}

/// Run every call of a batch concurrently. Responses keep call order.
pub async fn dispatch_batch(registry: &ToolRegistry, calls: &[FunctionCall], timeout: Duration) -> Vec<FunctionResponse> {
    join_all(calls.iter().map(|call| dispatch_call(registry, call, timeout))).await
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound for a single handler
    pub handler_timeout: Duration,
    /// Pause between finishing a batch and sending its response
    pub response_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(10),
            response_delay: Duration::from_millis(200),
        }
    }
}

/// Answers the tool calls of one session. Stops when dropped or when the
/// session ends.
pub struct ToolDispatcher {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ToolDispatcher {
    pub fn spawn(session: &Session, registry: Arc<ToolRegistry>, config: DispatcherConfig) -> Self {
        let cancel = CancellationToken::new();
        let events = session.subscribe(&[EventKind::ToolCall, EventKind::ToolCallCancellation]);
        let task = tokio::spawn(run_dispatcher(
            session.clone(),
            events,
            registry,
            config,
            cancel.clone(),
        ));
        Self { cancel, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ToolDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Ids of unanswered calls, and which of them the server has cancelled.
#[derive(Debug, Default)]
struct InFlight {
    pending: HashMap<String, usize>,
    cancelled: HashSet<String>,
}

impl InFlight {
    fn begin(&mut self, calls: &[FunctionCall]) {
        for call in calls {
            *self.pending.entry(call.id.clone()).or_default() += 1;
        }
    }

    /// Only ids still awaiting an answer are recorded.
    fn cancel(&mut self, ids: Vec<String>) {
        for id in ids {
            if self.pending.contains_key(&id) {
                self.cancelled.insert(id);
            } else {
                debug!("Ignoring cancellation of unknown or answered call {}", id);
            }
        }
    }

    /// Retire a batch, returning the ids that must not be answered.
    fn finish(&mut self, calls: &[FunctionCall]) -> HashSet<String> {
        let mut skipped = HashSet::new();
        for call in calls {
            if self.cancelled.contains(&call.id) {
                skipped.insert(call.id.clone());
            }
            if let Some(count) = self.pending.get_mut(&call.id) {
                *count -= 1;
                if *count == 0 {
                    self.pending.remove(&call.id);
                    self.cancelled.remove(&call.id);
                }
            }
        }
        skipped
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.cancelled.is_empty()
    }
}

async fn run_dispatcher(
    session: Session,
    mut events: Subscription,
    registry: Arc<ToolRegistry>,
    config: DispatcherConfig,
    cancel: CancellationToken,
) {
    let in_flight: Arc<Mutex<InFlight>> = Arc::default();
    let mut batches = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(joined) = batches.join_next(), if !batches.is_empty() => {
                if let Err(e) = joined {
                    error!("Tool batch task failed: {}", e);
                }
            }
            event = events.recv() => match event {
                Some(InboundEvent::ToolCall { function_calls }) => {
                    if function_calls.is_empty() {
                        continue;
                    }
                    info!("Received tool call batch of {}", function_calls.len());
                    in_flight.lock().unwrap_or_else(|e| e.into_inner()).begin(&function_calls);
                    batches.spawn(answer_batch(
                        session.clone(),
                        registry.clone(),
                        function_calls,
                        config.clone(),
                        in_flight.clone(),
                    ));
                }
                Some(InboundEvent::ToolCallCancellation { ids }) => {
                    info!("Server cancelled tool calls {:?}", ids);
                    in_flight.lock().unwrap_or_else(|e| e.into_inner()).cancel(ids);
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    batches.abort_all();
    debug!("Tool dispatcher stopped");
}

async fn answer_batch(
    session: Session,
    registry: Arc<ToolRegistry>,
    calls: Vec<FunctionCall>,
    config: DispatcherConfig,
    in_flight: Arc<Mutex<InFlight>>,
) {
    let responses = dispatch_batch(&registry, &calls, config.handler_timeout).await;
    tokio::time::sleep(config.response_delay).await;

    let skipped = in_flight.lock().unwrap_or_else(|e| e.into_inner()).finish(&calls);
    let responses: Vec<_> = responses.into_iter().filter(|r| !skipped.contains(&r.id)).collect();
    if responses.is_empty() {
        debug!("Every call in the batch was cancelled; nothing to send");
        return;
    }

    let count = responses.len();
    match session.send(OutboundChunk::ToolResponse(responses)) {
        Ok(()) => debug!("Sent tool response batch of {}", count),
        Err(e) => warn!("Could not send tool response: {}", e),
    }
}
