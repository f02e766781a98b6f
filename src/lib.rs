//! ADF Lead Ingest Library
//!
//! This library provides the ingestion pipeline for Automotive Data Format
//! (ADF) lead documents: admission control, XXE-safe XML parsing, schema
//! validation, Postgres persistence, and Prometheus metrics.
//!
//! # Modules
//!
//! - `adf_handler`: HTTP handlers for lead ingestion and read-back.
//! - `adf_models`: Lead data models and the JSON envelope.
//! - `adf_parser`: XML parser adapter (DOCTYPE/ENTITY refused).
//! - `adf_validator`: ADF structure validation and normalization.
//! - `auth`: Vendor HMAC signatures, source allowlist, read-endpoint tokens.
//! - `circuit_breaker`: Circuit breaker for storage writes.
//! - `config`: Configuration management.
//! - `db`: Database connection pool and migrations.
//! - `errors`: Error handling types.
//! - `guard`: Payload size and per-IP sliding-window rate limiting.
//! - `handlers`: Application state, router, health and metrics endpoints.
//! - `lead_storage`: Lead repositories (Postgres and in-memory).
//! - `metrics`: Ingest counters, duration histogram, and tracking middleware.
//! - `submission`: Content-type dispatch between raw XML and JSON envelopes.

pub mod adf_handler;
pub mod adf_models;
pub mod adf_parser;
pub mod adf_validator;
pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod errors;
pub mod guard;
pub mod handlers;
pub mod lead_storage;
pub mod metrics;
pub mod submission;
