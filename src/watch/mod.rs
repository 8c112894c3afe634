//! Real-time watch pipeline (§4.8-§4.11): subscriptions, coalescing, batch
//! emission, and the bridge that fans batches out to WebSocket connections.

pub mod batch;
pub mod bridge;
pub mod coalescer;
pub mod subscription;
