//! ModeloMan: control-plane hub for AI-agent orchestration.
//!
//! Semi-trusted agent processes submit telemetry about runs, prompt attempts,
//! and benchmarks through a single RPC surface; operators configure global
//! policy and per-(provider_type, provider, model) override caps. The request
//! pipeline (recovery, auth, rate limiting, logging, error mapping, write
//! idempotency) lives in [`rpc`], the run lifecycle and policy gate in
//! [`service`], and the persistence capability surface in [`db`].

pub mod clock;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod rpc;
pub mod service;
