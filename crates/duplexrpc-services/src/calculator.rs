//! Calculator service.
//!
//! Each method has its own payload types, so the calculator transport
//! implements [`Transport`] once per request/response pair and hands the
//! stream to the matching route table.

use async_trait::async_trait;
use duplexrpc_transport::{
    CallMeta, CallOptions, Failure, MemTransport, MemTransportConfig, RpcClient, ServerCall,
    ServerStreaming, Status, StreamHandle, Transport,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Unary sum of two numbers.
pub const SUM: &str = "calculator.CalculatorService/Sum";
/// Server-streaming prime factorisation.
pub const PRIME_NUMBER_DECOMPOSITION: &str =
    "calculator.CalculatorService/PrimeNumberDecomposition";
/// Client-streaming average.
pub const COMPUTE_AVERAGE: &str = "calculator.CalculatorService/ComputeAverage";
/// Bidirectional running maximum.
pub const FIND_MAXIMUM: &str = "calculator.CalculatorService/FindMaximum";
/// Unary square root; negative input is rejected.
pub const SQUARE_ROOT: &str = "calculator.CalculatorService/SquareRoot";

/// `Sum` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumRequest {
    /// Left operand.
    pub first_number: i32,
    /// Right operand.
    pub second_number: i32,
}

/// `Sum` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumResponse {
    /// The sum.
    pub sum_result: i64,
}

/// `PrimeNumberDecomposition` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeNumberDecompositionRequest {
    /// Number to factorise.
    pub number: i64,
}

/// One factor of a `PrimeNumberDecomposition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeNumberDecompositionResponse {
    /// A prime factor; repeated factors are sent repeatedly.
    pub prime_factor: i64,
}

/// One number of a `ComputeAverage` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeAverageRequest {
    /// The number.
    pub number: i32,
}

/// `ComputeAverage` response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComputeAverageResponse {
    /// Arithmetic mean of the numbers received.
    pub average: f64,
}

/// One number of a `FindMaximum` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindMaximumRequest {
    /// The number.
    pub number: i32,
}

/// A new maximum seen by `FindMaximum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindMaximumResponse {
    /// Largest number received so far.
    pub maximum: i32,
}

/// `SquareRoot` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquareRootRequest {
    /// Radicand; must not be negative.
    pub number: i32,
}

/// `SquareRoot` response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SquareRootResponse {
    /// The root.
    pub number_root: f64,
}

/// Trial divisions the decomposition handler runs between cancellation
/// checks.
const DIVISIONS_PER_CHECK: u32 = 1 << 16;

/// Result of a bounded round of trial division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Division {
    /// The next prime factor.
    Factor(i64),
    /// The budget ran out before a factor was found.
    Searching,
    /// Every factor has been produced.
    Done,
}

/// Incremental trial-division factorisation, yielding prime factors in
/// ascending order with multiplicity. Non-positive and unit inputs have no
/// factors.
#[derive(Debug, Clone)]
pub struct PrimeFactors {
    n: i64,
    k: i64,
}

impl PrimeFactors {
    /// Starts factorising `n`.
    pub fn new(n: i64) -> Self {
        Self { n, k: 2 }
    }

    /// Runs at most `budget` trial divisions.
    pub fn step(&mut self, budget: u32) -> Division {
        for _ in 0..budget {
            if self.n <= 1 {
                return Division::Done;
            }
            // k > n / k rather than k * k > n, which overflows near i64::MAX
            if self.k > self.n / self.k {
                let prime = self.n;
                self.n = 1;
                return Division::Factor(prime);
            }
            if self.n % self.k == 0 {
                self.n /= self.k;
                return Division::Factor(self.k);
            }
            self.k += if self.k == 2 { 1 } else { 2 };
        }
        Division::Searching
    }
}

impl Iterator for PrimeFactors {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        loop {
            match self.step(u32::MAX) {
                Division::Factor(prime) => return Some(prime),
                Division::Searching => {}
                Division::Done => return None,
            }
        }
    }
}

/// Prime factors of `n` in ascending order, with multiplicity.
pub fn prime_factors(n: i64) -> Vec<i64> {
    PrimeFactors::new(n).collect()
}

/// Square root of a non-negative number.
pub fn square_root(number: i32) -> Result<f64, Status> {
    if number < 0 {
        return Err(Status::from(Failure::Precondition(format!(
            "received a negative number: {number}"
        ))));
    }
    Ok(f64::from(number).sqrt())
}

/// Mean of `numbers`; an empty input has no mean.
pub fn average(numbers: &[i32]) -> Result<f64, Status> {
    if numbers.is_empty() {
        return Err(Status::from(Failure::Precondition(
            "no numbers received".to_string(),
        )));
    }
    let sum: i64 = numbers.iter().map(|&n| i64::from(n)).sum();
    Ok(sum as f64 / numbers.len() as f64)
}

async fn sum(mut call: ServerCall<SumRequest, SumResponse>) -> Result<(), Status> {
    let request = call.request().await?;
    call.send(SumResponse {
        sum_result: i64::from(request.first_number) + i64::from(request.second_number),
    })
    .await
}

async fn prime_number_decomposition(
    mut call: ServerCall<PrimeNumberDecompositionRequest, PrimeNumberDecompositionResponse>,
) -> Result<(), Status> {
    let request = call.request().await?;
    if request.number < 1 {
        return Err(Status::from(Failure::Precondition(format!(
            "cannot decompose {}",
            request.number
        ))));
    }
    let mut factors = PrimeFactors::new(request.number);
    loop {
        call.check()?;
        match factors.step(DIVISIONS_PER_CHECK) {
            Division::Factor(prime_factor) => {
                call.send(PrimeNumberDecompositionResponse { prime_factor })
                    .await?
            }
            Division::Searching => tokio::task::yield_now().await,
            Division::Done => return Ok(()),
        }
    }
}

async fn compute_average(
    mut call: ServerCall<ComputeAverageRequest, ComputeAverageResponse>,
) -> Result<(), Status> {
    let mut numbers = Vec::new();
    while let Some(request) = call.recv().await? {
        numbers.push(request.number);
    }
    debug!(count = numbers.len(), "ComputeAverage stream complete");
    call.send(ComputeAverageResponse {
        average: average(&numbers)?,
    })
    .await
}

async fn find_maximum(
    mut call: ServerCall<FindMaximumRequest, FindMaximumResponse>,
) -> Result<(), Status> {
    let mut maximum: Option<i32> = None;
    while let Some(request) = call.recv().await? {
        if maximum.map_or(true, |m| request.number > m) {
            maximum = Some(request.number);
            call.send(FindMaximumResponse {
                maximum: request.number,
            })
            .await?;
        }
    }
    Ok(())
}

async fn square_root_handler(
    mut call: ServerCall<SquareRootRequest, SquareRootResponse>,
) -> Result<(), Status> {
    let request = call.request().await?;
    let number_root = square_root(request.number)?;
    call.send(SquareRootResponse { number_root }).await
}

/// In-memory calculator transport: one route table per method.
pub struct CalculatorTransport {
    sum: MemTransport<SumRequest, SumResponse>,
    primes: MemTransport<PrimeNumberDecompositionRequest, PrimeNumberDecompositionResponse>,
    average: MemTransport<ComputeAverageRequest, ComputeAverageResponse>,
    maximum: MemTransport<FindMaximumRequest, FindMaximumResponse>,
    square_root: MemTransport<SquareRootRequest, SquareRootResponse>,
}

impl CalculatorTransport {
    /// Builds all calculator routes.
    pub fn new(config: MemTransportConfig) -> Self {
        Self {
            sum: MemTransport::new(config.clone()).route(SUM, sum),
            primes: MemTransport::new(config.clone())
                .route(PRIME_NUMBER_DECOMPOSITION, prime_number_decomposition),
            average: MemTransport::new(config.clone()).route(COMPUTE_AVERAGE, compute_average),
            maximum: MemTransport::new(config.clone()).route(FIND_MAXIMUM, find_maximum),
            square_root: MemTransport::new(config).route(SQUARE_ROOT, square_root_handler),
        }
    }
}

#[async_trait]
impl Transport<SumRequest, SumResponse> for CalculatorTransport {
    async fn open_stream(
        &self,
        meta: CallMeta,
    ) -> duplexrpc_transport::Result<StreamHandle<SumRequest, SumResponse>> {
        self.sum.open_stream(meta).await
    }
}

#[async_trait]
impl Transport<PrimeNumberDecompositionRequest, PrimeNumberDecompositionResponse>
    for CalculatorTransport
{
    async fn open_stream(
        &self,
        meta: CallMeta,
    ) -> duplexrpc_transport::Result<
        StreamHandle<PrimeNumberDecompositionRequest, PrimeNumberDecompositionResponse>,
    > {
        self.primes.open_stream(meta).await
    }
}

#[async_trait]
impl Transport<ComputeAverageRequest, ComputeAverageResponse> for CalculatorTransport {
    async fn open_stream(
        &self,
        meta: CallMeta,
    ) -> duplexrpc_transport::Result<StreamHandle<ComputeAverageRequest, ComputeAverageResponse>>
    {
        self.average.open_stream(meta).await
    }
}

#[async_trait]
impl Transport<FindMaximumRequest, FindMaximumResponse> for CalculatorTransport {
    async fn open_stream(
        &self,
        meta: CallMeta,
    ) -> duplexrpc_transport::Result<StreamHandle<FindMaximumRequest, FindMaximumResponse>> {
        self.maximum.open_stream(meta).await
    }
}

#[async_trait]
impl Transport<SquareRootRequest, SquareRootResponse> for CalculatorTransport {
    async fn open_stream(
        &self,
        meta: CallMeta,
    ) -> duplexrpc_transport::Result<StreamHandle<SquareRootRequest, SquareRootResponse>> {
        self.square_root.open_stream(meta).await
    }
}

/// Typed client for the calculator.
pub struct CalculatorClient {
    rpc: RpcClient<CalculatorTransport>,
}

impl CalculatorClient {
    /// Wraps an RPC client bound to the calculator transport.
    pub fn new(rpc: RpcClient<CalculatorTransport>) -> Self {
        Self { rpc }
    }

    /// `first + second`.
    pub async fn sum(&self, first: i32, second: i32, options: CallOptions) -> Result<i64, Status> {
        let request = SumRequest {
            first_number: first,
            second_number: second,
        };
        let response: SumResponse = self.rpc.unary(SUM, request, options).await?;
        Ok(response.sum_result)
    }

    /// Stream of prime factors of `number`.
    pub async fn prime_number_decomposition(
        &self,
        number: i64,
        options: CallOptions,
    ) -> Result<ServerStreaming<PrimeNumberDecompositionResponse>, Status> {
        self.rpc
            .server_streaming(
                PRIME_NUMBER_DECOMPOSITION,
                PrimeNumberDecompositionRequest { number },
                options,
            )
            .await
    }

    /// Mean of the streamed numbers.
    pub async fn compute_average(
        &self,
        numbers: impl IntoIterator<Item = i32>,
        options: CallOptions,
    ) -> Result<f64, Status> {
        let mut call = self
            .rpc
            .client_streaming::<ComputeAverageRequest, ComputeAverageResponse>(
                COMPUTE_AVERAGE,
                options,
            )
            .await?;
        for number in numbers {
            call.send(ComputeAverageRequest { number }).await?;
        }
        Ok(call.close_and_recv().await?.average)
    }

    /// Streams `numbers` and collects every new maximum the server reports.
    /// Sending and receiving run concurrently.
    pub async fn find_maximum(
        &self,
        numbers: Vec<i32>,
        options: CallOptions,
    ) -> Result<Vec<i32>, Status> {
        let session = self
            .rpc
            .duplex::<FindMaximumRequest, FindMaximumResponse>(FIND_MAXIMUM, options)
            .await?;
        let (mut tx, mut rx, completion) = session.split();
        let sender = tokio::spawn(async move {
            for number in numbers {
                tx.send(FindMaximumRequest { number }).await?;
            }
            tx.close_send().await
        });

        let mut maxima = Vec::new();
        let received = loop {
            match rx.receive().await {
                Ok(Some(response)) => maxima.push(response.maximum),
                Ok(None) => break Ok(()),
                Err(status) => break Err(status),
            }
        };
        let sent = sender
            .await
            .unwrap_or_else(|err| Err(Status::internal(format!("send task failed: {err}"))));

        let local = received.and(sent);
        if local.is_err() {
            completion.cancel();
        }
        let outcome = completion.join().await;
        match local {
            Err(local) => Err(local.worst(outcome)),
            Ok(()) if outcome.is_ok() => Ok(maxima),
            Ok(()) => Err(outcome),
        }
    }

    /// Square root of `number`; negative input fails with `InvalidArgument`.
    pub async fn square_root(&self, number: i32, options: CallOptions) -> Result<f64, Status> {
        let response: SquareRootResponse = self
            .rpc
            .unary(SQUARE_ROOT, SquareRootRequest { number }, options)
            .await?;
        Ok(response.number_root)
    }
}
