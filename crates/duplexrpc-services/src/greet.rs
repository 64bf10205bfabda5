//! Greeter service: one method per call shape plus a deadline-aware unary.

use std::time::Duration;

use duplexrpc_transport::{
    CallOptions, ConfigError, DuplexSession, MemTransport, MemTransportConfig, RpcClient,
    ServerCall, ServerStreaming, Status,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Unary greeting.
pub const GREET: &str = "greet.GreetService/Greet";
/// Server-streaming greeting.
pub const GREET_MANY_TIMES: &str = "greet.GreetService/GreetManyTimes";
/// Client-streaming greeting.
pub const LONG_GREET: &str = "greet.GreetService/LongGreet";
/// Bidirectional greeting.
pub const GREET_EVERYONE: &str = "greet.GreetService/GreetEveryone";
/// Slow unary greeting that honours the caller's deadline.
pub const GREET_WITH_DEADLINE: &str = "greet.GreetService/GreetWithDeadline";

/// Name of the person to greet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// First name.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
}

impl Greeting {
    /// Creates a greeting.
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

/// Request shared by all greeter methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetRequest {
    /// Who to greet.
    pub greeting: Greeting,
}

/// Response shared by all greeter methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetResponse {
    /// The greeting text.
    pub result: String,
}

/// Greeter tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GreeterConfig {
    /// Responses produced by `GreetManyTimes` (default: 10).
    pub many_times: u32,
    /// Pause between `GreetManyTimes` responses (default: 1000).
    pub stream_interval_ms: u64,
    /// Work iterations of `GreetWithDeadline` (default: 3).
    pub deadline_iterations: u32,
    /// Length of one `GreetWithDeadline` iteration (default: 1000).
    pub deadline_step_ms: u64,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            many_times: 10,
            stream_interval_ms: 1000,
            deadline_iterations: 3,
            deadline_step_ms: 1000,
        }
    }
}

impl GreeterConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: GreeterConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deadline_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "deadline_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn hello(greeting: &Greeting) -> String {
    format!("Hello {}", greeting.first_name)
}

async fn greet(mut call: ServerCall<GreetRequest, GreetResponse>) -> Result<(), Status> {
    let request = call.request().await?;
    debug!(first_name = %request.greeting.first_name, "Greet invoked");
    call.send(GreetResponse {
        result: hello(&request.greeting),
    })
    .await
}

async fn greet_many_times(
    mut call: ServerCall<GreetRequest, GreetResponse>,
    config: GreeterConfig,
) -> Result<(), Status> {
    let request = call.request().await?;
    let interval = Duration::from_millis(config.stream_interval_ms);
    for i in 0..config.many_times {
        if i > 0 {
            call.sleep(interval).await?;
        }
        call.send(GreetResponse {
            result: format!("{} number {}", hello(&request.greeting), i),
        })
        .await?;
    }
    Ok(())
}

async fn long_greet(mut call: ServerCall<GreetRequest, GreetResponse>) -> Result<(), Status> {
    let mut result = String::new();
    while let Some(request) = call.recv().await? {
        result.push_str(&hello(&request.greeting));
        result.push_str("! ");
    }
    call.send(GreetResponse { result }).await
}

async fn greet_everyone(mut call: ServerCall<GreetRequest, GreetResponse>) -> Result<(), Status> {
    while let Some(request) = call.recv().await? {
        call.send(GreetResponse {
            result: format!("{}! ", hello(&request.greeting)),
        })
        .await?;
    }
    Ok(())
}

async fn greet_with_deadline(
    mut call: ServerCall<GreetRequest, GreetResponse>,
    config: GreeterConfig,
) -> Result<(), Status> {
    let request = call.request().await?;
    let step = Duration::from_millis(config.deadline_step_ms);
    for iteration in 0..config.deadline_iterations {
        if let Err(status) = call.check() {
            info!(iteration, code = %status.code(), "client gave up on GreetWithDeadline");
            return Err(status);
        }
        call.sleep(step).await?;
    }
    call.send(GreetResponse {
        result: hello(&request.greeting),
    })
    .await
}

/// Builds the greeter's routes on an in-memory transport.
pub fn greeter_transport(
    config: GreeterConfig,
    transport: MemTransportConfig,
) -> MemTransport<GreetRequest, GreetResponse> {
    MemTransport::new(transport)
        .route(GREET, greet)
        .route(GREET_MANY_TIMES, move |call| greet_many_times(call, config))
        .route(LONG_GREET, long_greet)
        .route(GREET_EVERYONE, greet_everyone)
        .route(GREET_WITH_DEADLINE, move |call| {
            greet_with_deadline(call, config)
        })
}

/// Typed client for the greeter.
pub struct GreeterClient {
    rpc: RpcClient<MemTransport<GreetRequest, GreetResponse>>,
}

impl GreeterClient {
    /// Wraps an RPC client bound to the greeter transport.
    pub fn new(rpc: RpcClient<MemTransport<GreetRequest, GreetResponse>>) -> Self {
        Self { rpc }
    }

    /// Unary greeting.
    pub async fn greet(&self, greeting: Greeting, options: CallOptions) -> Result<String, Status> {
        let response: GreetResponse = self
            .rpc
            .unary(GREET, GreetRequest { greeting }, options)
            .await?;
        Ok(response.result)
    }

    /// Stream of greetings for one name.
    pub async fn greet_many_times(
        &self,
        greeting: Greeting,
        options: CallOptions,
    ) -> Result<ServerStreaming<GreetResponse>, Status> {
        self.rpc
            .server_streaming(GREET_MANY_TIMES, GreetRequest { greeting }, options)
            .await
    }

    /// One greeting for many names.
    pub async fn long_greet(
        &self,
        greetings: Vec<Greeting>,
        options: CallOptions,
    ) -> Result<String, Status> {
        let mut call = self
            .rpc
            .client_streaming::<GreetRequest, GreetResponse>(LONG_GREET, options)
            .await?;
        for greeting in greetings {
            call.send(GreetRequest { greeting }).await?;
        }
        Ok(call.close_and_recv().await?.result)
    }

    /// Opens the bidirectional greeting stream.
    pub async fn greet_everyone(
        &self,
        options: CallOptions,
    ) -> Result<DuplexSession<GreetRequest, GreetResponse>, Status> {
        self.rpc.duplex(GREET_EVERYONE, options).await
    }

    /// Slow greeting bounded by `timeout`.
    pub async fn greet_with_deadline(
        &self,
        greeting: Greeting,
        timeout: Duration,
    ) -> Result<String, Status> {
        let response: GreetResponse = self
            .rpc
            .unary(
                GREET_WITH_DEADLINE,
                GreetRequest { greeting },
                CallOptions::new().timeout(timeout),
            )
            .await?;
        Ok(response.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello() {
        assert_eq!(hello(&Greeting::new("Ada", "Lovelace")), "Hello Ada");
    }

    #[test]
    fn test_config_defaults() {
        let config = GreeterConfig::default();
        assert_eq!(config.many_times, 10);
        assert_eq!(config.deadline_iterations, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config = GreeterConfig::from_json_str(r#"{"many_times": 2}"#).unwrap();
        assert_eq!(config.many_times, 2);
        assert_eq!(config.stream_interval_ms, 1000);
        assert!(GreeterConfig::from_json_str(r#"{"deadline_iterations": 0}"#).is_err());
    }

    #[test]
    fn test_transport_routes() {
        let transport = greeter_transport(GreeterConfig::default(), MemTransportConfig::default());
        let mut methods: Vec<_> = transport.methods().collect();
        methods.sort_unstable();
        assert_eq!(methods.len(), 5);
        assert!(methods.contains(&GREET_WITH_DEADLINE));
    }
}
