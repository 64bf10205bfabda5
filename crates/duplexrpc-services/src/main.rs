#![warn(missing_docs)]

//! duplexrpc demo: runs one call of each shape against the in-process
//! greeter and calculator.

use std::time::Duration;

use duplexrpc_services::{
    greeter_transport, CalculatorClient, CalculatorTransport, GreeterClient, GreeterConfig,
    Greeting,
};
use duplexrpc_transport::{CallOptions, ClientConfig, MemTransportConfig, RpcClient};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    info!("duplexrpc demo starting...");

    let transport_config = MemTransportConfig::default();
    let greeter_config = GreeterConfig {
        stream_interval_ms: 100,
        ..GreeterConfig::default()
    };
    let greeter = GreeterClient::new(RpcClient::new(
        greeter_transport(greeter_config, transport_config.clone()),
        ClientConfig::default(),
    ));
    let calculator = CalculatorClient::new(RpcClient::new(
        CalculatorTransport::new(transport_config),
        ClientConfig::default(),
    ));

    let hello = greeter
        .greet(Greeting::new("Stephane", "Maarek"), CallOptions::new())
        .await?;
    info!(result = %hello, "Greet");

    let mut many = Box::pin(
        greeter
            .greet_many_times(Greeting::new("Stephane", "Maarek"), CallOptions::new())
            .await?
            .into_stream(),
    );
    while let Some(response) = many.next().await {
        info!(result = %response?.result, "GreetManyTimes");
    }

    let names = ["Stephane", "John", "Lucy", "Mark", "Piper"]
        .into_iter()
        .map(|name| Greeting::new(name, ""))
        .collect();
    let long = greeter.long_greet(names, CallOptions::new()).await?;
    info!(result = %long, "LongGreet");

    for timeout in [Duration::from_secs(5), Duration::from_secs(1)] {
        match greeter
            .greet_with_deadline(Greeting::new("Stephane", "Maarek"), timeout)
            .await
        {
            Ok(result) => info!(?timeout, result = %result, "GreetWithDeadline"),
            Err(status) => warn!(?timeout, code = %status.code(), "GreetWithDeadline failed"),
        }
    }

    let sum = calculator.sum(5, 40, CallOptions::new()).await?;
    info!(sum, "Sum");

    let mut factors = calculator
        .prime_number_decomposition(12, CallOptions::new())
        .await?;
    while let Some(response) = factors.message().await? {
        info!(prime_factor = response.prime_factor, "PrimeNumberDecomposition");
    }

    let average = calculator
        .compute_average([3, 4, 5, 6], CallOptions::new())
        .await?;
    info!(average, "ComputeAverage");

    let maxima = calculator
        .find_maximum(vec![4, 7, 1, 5, 19, 34], CallOptions::new())
        .await?;
    info!(?maxima, "FindMaximum");

    for number in [10, -10] {
        match calculator.square_root(number, CallOptions::new()).await {
            Ok(root) => info!(number, root, "SquareRoot"),
            Err(status) => warn!(number, code = %status.code(), message = status.message(), "SquareRoot failed"),
        }
    }

    Ok(())
}
