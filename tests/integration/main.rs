//! Integration tests for Siphon
//!
//! These tests run real components end-to-end: the HTTP browser backend
//! against wiremock servers, the Ollama embedder against a mocked embedding
//! endpoint, and the SQLite store in a temporary directory.

mod common;
mod crawl_tests;
mod pipeline_tests;
