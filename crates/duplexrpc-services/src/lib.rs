#![warn(missing_docs)]

//! duplexrpc services: a greeter and a calculator exercising every call
//! shape over the in-memory transport.

pub mod calculator;
pub mod greet;

pub use calculator::{CalculatorClient, CalculatorTransport};
pub use greet::{greeter_transport, GreeterClient, GreeterConfig, Greeting};
