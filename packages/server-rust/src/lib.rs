//! Handoff Server — staged request pipelines over bounded per-resource worker
//! pools, with an axum transport and an in-memory session store.

pub mod network;
pub mod service;
pub mod storage;
