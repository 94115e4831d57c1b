//! Turnstile - Tiered Request Throttling
//!
//! This crate protects an HTTP API from abusive or excessive traffic by
//! applying tiered, time-windowed admission limits before a request reaches
//! business logic. Clients are identified by normalized network address and
//! counted per tier in fixed windows; a tier may exempt successful requests
//! so that only failures (such as bad logins) consume quota.
//!
//! It can be embedded in an axum application as middleware or run as a
//! standalone decision service that routers query over HTTP.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
